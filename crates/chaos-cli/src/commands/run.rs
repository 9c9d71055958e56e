use std::path::PathBuf;

use clap::Args;

use chaos_k8s::config::OperatorConfig;
use chaos_k8s::controller;

#[derive(Args)]
pub struct RunArgs {
    /// Operator config file; defaults apply when omitted
    #[arg(short, long, env = "CHAOS_CONFIG")]
    pub config: Option<PathBuf>,
    /// Only watch experiments in this namespace
    #[arg(short, long)]
    pub namespace: Option<String>,
    /// Path to kubeconfig
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,
    /// Experiments reconciled in parallel
    #[arg(long)]
    pub max_concurrent: Option<u16>,
}

pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    let mut config = OperatorConfig::load(args.config.as_deref())?;
    if args.namespace.is_some() {
        config.kubernetes.watch_namespace = args.namespace;
    }
    if args.kubeconfig.is_some() {
        config.kubernetes.kubeconfig = args.kubeconfig;
    }
    if let Some(n) = args.max_concurrent {
        config.settings.max_concurrent = n;
    }

    tracing::info!(
        config = ?args.config,
        monitor_interval = ?config.settings.monitor_interval,
        default_duration = ?config.settings.default_duration,
        "Loaded configuration"
    );

    controller::run(config).await
}
