use std::sync::Arc;

use clap::Args;

use chaos_core::experiment::ChaosType;
use chaos_core::fake::FakeCluster;
use chaos_k8s::injectors::default_registry;

#[derive(Args)]
pub struct ListInjectorsArgs {
    /// Only show this chaos type
    #[arg(long)]
    pub chaos_type: Option<ChaosType>,
    /// Include parameter details
    #[arg(short, long)]
    pub parameters: bool,
}

pub fn execute(args: ListInjectorsArgs) -> anyhow::Result<()> {
    let registry = default_registry(Arc::new(FakeCluster::new()), None);

    println!("{:<22} {:<34} {}", "CHAOS TYPE", "TARGETS", "DESCRIPTION");
    println!("{}", "-".repeat(90));

    for desc in registry.descriptors() {
        if args.chaos_type.is_some_and(|t| t != desc.chaos_type) {
            continue;
        }
        let kinds: Vec<&str> = desc.target_kinds.iter().map(|k| k.as_str()).collect();
        println!(
            "{:<22} {:<34} {}",
            desc.chaos_type,
            kinds.join(","),
            desc.description
        );
        if args.parameters {
            for p in &desc.parameters {
                let default = match (&p.default, p.required) {
                    (_, true) => "required".to_string(),
                    (Some(d), false) => format!("default {d}"),
                    (None, false) => "optional".to_string(),
                };
                println!("    {:<20} {:<16} {}", p.name, default, p.description);
            }
        }
    }

    let unimplemented: Vec<&str> = ChaosType::ALL
        .iter()
        .filter(|t| registry.lookup(**t).is_err())
        .map(|t| t.as_str())
        .collect();
    if !unimplemented.is_empty() {
        println!("\nDeclared without an injector: {}", unimplemented.join(", "));
    }
    Ok(())
}
