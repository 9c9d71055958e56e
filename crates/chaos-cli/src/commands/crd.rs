use clap::Args;
use kube::CustomResourceExt;

use chaos_core::experiment::ChaosExperiment;

#[derive(Args)]
pub struct CrdArgs {
    /// Print JSON instead of YAML
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: CrdArgs) -> anyhow::Result<()> {
    let crd = ChaosExperiment::crd();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&crd)?);
    } else {
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
