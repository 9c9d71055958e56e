use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use serde::Deserialize;

use chaos_core::experiment::{parse_duration, ChaosExperiment};
use chaos_core::fake::FakeCluster;
use chaos_core::injector::InjectorRegistry;
use chaos_k8s::injectors::default_registry;

#[derive(Args)]
pub struct ValidateArgs {
    /// Manifest files; multi-document YAML is accepted
    #[arg(required = true)]
    pub manifests: Vec<PathBuf>,
}

/// Checks one experiment the way the controller would before injecting.
fn check(experiment: &ChaosExperiment, registry: &InjectorRegistry) -> Result<Vec<String>, String> {
    let spec = &experiment.spec;
    spec.validate().map_err(|e| e.to_string())?;
    let chaos_type = spec.chaos_type().map_err(|e| e.to_string())?;
    registry
        .lookup(chaos_type)
        .and_then(|injector| injector.validate_params(&spec.parameters))
        .map_err(|e| e.to_string())?;

    let mut warnings = Vec::new();
    if let Err(e) = parse_duration(&spec.duration) {
        warnings.push(format!("{e}; the default window will be used"));
    }
    Ok(warnings)
}

fn documents(text: &str) -> Result<Vec<ChaosExperiment>, serde_yaml::Error> {
    let mut experiments = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        experiments.push(serde_yaml::from_value(value)?);
    }
    Ok(experiments)
}

pub fn execute(args: ValidateArgs) -> anyhow::Result<()> {
    let registry = default_registry(Arc::new(FakeCluster::new()), None);
    let mut errors = Vec::new();

    for path in &args.manifests {
        println!("Validating {}...", path.display());
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                println!("  INVALID - cannot read: {e}");
                errors.push(format!("{}: {e}", path.display()));
                continue;
            }
        };
        let experiments = match documents(&text) {
            Ok(experiments) => experiments,
            Err(e) => {
                println!("  YAML parsing: INVALID - {e}");
                errors.push(format!("{}: {e}", path.display()));
                continue;
            }
        };
        println!("  YAML parsing: OK");
        println!("  Experiments found: {}", experiments.len());

        for experiment in &experiments {
            let key = experiment.key();
            println!("\n  Experiment '{key}'");
            println!("    Type: {}", experiment.spec.chaos_type);
            println!("    Duration: {}", experiment.spec.duration);
            match check(experiment, &registry) {
                Ok(warnings) => {
                    for w in &warnings {
                        println!("    WARNING - {w}");
                    }
                    println!("    OK");
                }
                Err(e) => {
                    println!("    INVALID - {e}");
                    errors.push(format!("{}: experiment '{key}': {e}", path.display()));
                }
            }
        }
        println!();
    }

    if errors.is_empty() {
        println!("Validation PASSED");
    } else {
        println!("Validation FAILED with {} error(s):", errors.len());
        for err in &errors {
            eprintln!("  - {err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFESTS: &str = r#"
apiVersion: chaos-agents.io/v1alpha1
kind: ChaosExperiment
metadata:
  name: shrink
  namespace: db
spec:
  target:
    name: pg
  chaosType: StatefulSetScaling
  duration: 5m
---
apiVersion: chaos-agents.io/v1alpha1
kind: ChaosExperiment
metadata:
  name: disk
  namespace: db
spec:
  target:
    name: pg-0
    targetType: Pod
  chaosType: DiskFailure
  duration: soon
  parameters:
    failureMode: readonly
    mountPath: /data
---
apiVersion: chaos-agents.io/v1alpha1
kind: ChaosExperiment
metadata:
  name: pressure
  namespace: db
spec:
  target:
    name: pg
  chaosType: ResourcePressure
  duration: 1m
"#;

    #[test]
    fn multi_document_manifests_are_checked_individually() {
        let registry = default_registry(Arc::new(FakeCluster::new()), None);
        let experiments = documents(MANIFESTS).unwrap();
        assert_eq!(experiments.len(), 3);

        assert_eq!(check(&experiments[0], &registry), Ok(vec![]));

        let warnings = check(&experiments[1], &registry).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("default window"));

        let err = check(&experiments[2], &registry).unwrap_err();
        assert!(err.contains("No injector registered"), "{err}");
    }

    #[test]
    fn bad_parameters_are_reported() {
        let registry = default_registry(Arc::new(FakeCluster::new()), None);
        let mut experiments = documents(MANIFESTS).unwrap();
        let mut exp = experiments.remove(0);
        exp.spec.parameters.insert("scaleMode".into(), "sideways".into());
        let err = check(&exp, &registry).unwrap_err();
        assert!(err.contains("scaleMode"), "{err}");
    }
}
