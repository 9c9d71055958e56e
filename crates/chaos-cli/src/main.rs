use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(
    name = "chaos",
    about = "Chaos Agents - declarative chaos experiments for Kubernetes",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true, env = "CHAOS_LOG_FORMAT")]
    log_format: LogFormat,
}

fn init_tracing(verbose: u8, format: LogFormat) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match cli.command {
        commands::Commands::Run(args) => commands::run::execute(args).await,
        commands::Commands::Crd(args) => commands::crd::execute(args),
        commands::Commands::Validate(args) => commands::validate::execute(args),
        commands::Commands::ListInjectors(args) => commands::list_injectors::execute(args),
        commands::Commands::Describe(args) => commands::describe::execute(args).await,
    }
}
