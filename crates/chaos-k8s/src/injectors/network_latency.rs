use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use chaos_core::api::ClusterApi;
use chaos_core::error::{ChaosError, ChaosResult};
use chaos_core::experiment::{ChaosExperiment, ChaosType, TargetKind, TargetResourceRecord};
use chaos_core::injector::{
    annotation_key, duration_param, param_or, Injector, InjectorDescriptor, ParameterDescriptor,
};

use super::{edit_target, strip_annotations};

const NETWORK_LATENCY: &str = "network-latency";
const LATENCY_VALUE: &str = "network-latency-value";
const JITTER_VALUE: &str = "network-jitter-value";
const CORRELATION_VALUE: &str = "network-correlation-value";
const PORTS: &str = "network-ports";

#[derive(Debug, Clone, PartialEq)]
struct NetworkLatencyParams {
    latency: String,
    jitter: String,
    correlation: String,
    ports: Option<String>,
}

impl NetworkLatencyParams {
    fn parse(params: &BTreeMap<String, String>) -> ChaosResult<Self> {
        duration_param(params, "latency", "100ms")?;
        duration_param(params, "jitter", "10ms")?;

        let correlation = param_or(params, "correlation", "75")
            .trim()
            .trim_end_matches('%')
            .to_string();
        let value: f64 = correlation.parse().map_err(|_| {
            ChaosError::Validation(format!("correlation must be a percentage, got '{correlation}'"))
        })?;
        if !(0.0..=100.0).contains(&value) {
            return Err(ChaosError::Validation(format!(
                "correlation must be between 0 and 100, got {value}"
            )));
        }

        let ports = match params.get("ports").map(|p| p.trim()).filter(|p| !p.is_empty()) {
            Some(raw) => {
                let ports = raw
                    .split(',')
                    .map(|p| {
                        p.trim().parse::<u16>().map_err(|_| {
                            ChaosError::Validation(format!("ports must be a comma separated list of port numbers, got '{raw}'"))
                        })
                    })
                    .collect::<ChaosResult<Vec<u16>>>()?;
                Some(
                    ports
                        .iter()
                        .map(u16::to_string)
                        .collect::<Vec<_>>()
                        .join(","),
                )
            }
            None => None,
        };

        Ok(Self {
            latency: param_or(params, "latency", "100ms").trim().to_string(),
            jitter: param_or(params, "jitter", "10ms").trim().to_string(),
            correlation,
            ports,
        })
    }
}

fn keys() -> Vec<String> {
    [NETWORK_LATENCY, LATENCY_VALUE, JITTER_VALUE, CORRELATION_VALUE, PORTS]
        .into_iter()
        .map(annotation_key)
        .collect()
}

/// Records latency settings on target pods for the traffic-shaping sidecar.
pub struct NetworkLatencyInjector {
    api: Arc<dyn ClusterApi>,
}

impl NetworkLatencyInjector {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Injector for NetworkLatencyInjector {
    fn descriptor(&self) -> InjectorDescriptor {
        InjectorDescriptor {
            chaos_type: ChaosType::NetworkLatency,
            description: "Add latency to traffic of target pods".into(),
            target_kinds: vec![TargetKind::Pod],
            parameters: vec![
                ParameterDescriptor::optional("latency", Some("100ms"), "Added delay"),
                ParameterDescriptor::optional("jitter", Some("10ms"), "Delay variation"),
                ParameterDescriptor::optional(
                    "correlation",
                    Some("75"),
                    "Correlation with the previous packet, in percent",
                ),
                ParameterDescriptor::optional(
                    "ports",
                    None,
                    "Comma separated ports to affect, all when unset",
                ),
            ],
        }
    }

    fn validate_params(&self, params: &BTreeMap<String, String>) -> ChaosResult<()> {
        NetworkLatencyParams::parse(params).map(|_| ())
    }

    async fn inject(
        &self,
        experiment: &ChaosExperiment,
        targets: &[TargetResourceRecord],
    ) -> ChaosResult<()> {
        let params = NetworkLatencyParams::parse(&experiment.spec.parameters)?;

        for target in targets {
            if target.kind != TargetKind::Pod {
                tracing::warn!(
                    kind = %target.kind,
                    name = %target.name,
                    "NetworkLatency only applies to pods, skipping"
                );
                continue;
            }
            let edited = edit_target(self.api.as_ref(), target, |pod| {
                pod.set_annotation(&annotation_key(NETWORK_LATENCY), "true");
                pod.set_annotation(&annotation_key(LATENCY_VALUE), &params.latency);
                pod.set_annotation(&annotation_key(JITTER_VALUE), &params.jitter);
                pod.set_annotation(&annotation_key(CORRELATION_VALUE), &params.correlation);
                match params.ports {
                    Some(ref ports) => pod.set_annotation(&annotation_key(PORTS), ports),
                    None => {
                        pod.remove_annotation(&annotation_key(PORTS));
                    }
                }
                true
            })
            .await?;
            if edited.is_none() {
                return Err(ChaosError::not_found(
                    target.kind.as_str(),
                    target.namespace(),
                    &target.name,
                ));
            }
            tracing::info!(
                pod = %target.name,
                namespace = %target.namespace(),
                latency = %params.latency,
                jitter = %params.jitter,
                correlation = %params.correlation,
                "Applied network latency"
            );
        }
        Ok(())
    }

    async fn cleanup(
        &self,
        _experiment: &ChaosExperiment,
        targets: &[TargetResourceRecord],
    ) -> ChaosResult<()> {
        let keys = keys();
        for target in targets.iter().filter(|t| t.kind == TargetKind::Pod) {
            strip_annotations(self.api.as_ref(), target, &keys).await?;
        }
        Ok(())
    }
}
