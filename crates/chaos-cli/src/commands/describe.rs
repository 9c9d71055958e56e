use clap::Args;
use kube::api::{Api, ListParams};
use kube::ResourceExt;

use chaos_core::experiment::ChaosExperiment;
use chaos_core::report::ExperimentReport;
use chaos_k8s::client::create_client;
use chaos_k8s::config::KubeConnection;

#[derive(Args)]
pub struct DescribeArgs {
    /// Experiment name; lists every experiment in the namespace when omitted
    pub name: Option<String>,
    #[arg(short, long, default_value = "default")]
    pub namespace: String,
    /// Path to kubeconfig
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,
}

fn age(experiment: &ChaosExperiment) -> String {
    let Some(created) = experiment.creation_timestamp() else {
        return "-".to_string();
    };
    let secs = (chrono::Utc::now() - created.0).num_seconds().max(0);
    match secs {
        s if s >= 86_400 => format!("{}d", s / 86_400),
        s if s >= 3_600 => format!("{}h", s / 3_600),
        s if s >= 60 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

pub async fn execute(args: DescribeArgs) -> anyhow::Result<()> {
    let client = create_client(&KubeConnection {
        kubeconfig: args.kubeconfig,
        watch_namespace: None,
    })
    .await?;
    let experiments: Api<ChaosExperiment> = Api::namespaced(client, &args.namespace);

    match args.name {
        Some(name) => {
            let experiment = experiments.get(&name).await?;
            print!("{}", ExperimentReport::from_experiment(&experiment));
        }
        None => {
            let list = experiments.list(&ListParams::default()).await?;
            println!(
                "{:<30} {:<20} {:<20} {:<10} {}",
                "NAME", "TYPE", "TARGET", "PHASE", "AGE"
            );
            for exp in &list.items {
                let report = ExperimentReport::from_experiment(exp);
                let target = exp
                    .spec
                    .target
                    .name
                    .clone()
                    .unwrap_or_else(|| "<selector>".to_string());
                println!(
                    "{:<30} {:<20} {:<20} {:<10} {}",
                    report.name,
                    report.chaos_type,
                    target,
                    report.phase,
                    age(exp)
                );
            }
            if list.items.is_empty() {
                println!("No experiments in namespace {}", args.namespace);
            }
        }
    }
    Ok(())
}
