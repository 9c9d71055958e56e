use clap::Subcommand;

pub mod crd;
pub mod describe;
pub mod list_injectors;
pub mod run;
pub mod validate;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the ChaosExperiment controller against the current cluster
    Run(run::RunArgs),
    /// Print the ChaosExperiment CustomResourceDefinition
    Crd(crd::CrdArgs),
    /// Validate experiment manifests without touching a cluster
    Validate(validate::ValidateArgs),
    /// List the registered chaos types and their parameters
    ListInjectors(list_injectors::ListInjectorsArgs),
    /// Show the status report of experiments in a namespace
    Describe(describe::DescribeArgs),
}
