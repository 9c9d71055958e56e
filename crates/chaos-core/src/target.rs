use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::api::{ClusterApi, ClusterObject};
use crate::error::{ChaosError, ChaosResult};
use crate::experiment::{Selection, TargetResourceRecord, TargetSpec, TargetState};
use crate::selector::LabelQuery;

/// Build the RNG for one selection decision. Seeded generators repeat.
pub fn selection_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Turns a declarative target into the concrete resources to break.
pub struct TargetResolver {
    api: Arc<dyn ClusterApi>,
    seed: Option<u64>,
}

impl TargetResolver {
    pub fn new(api: Arc<dyn ClusterApi>, seed: Option<u64>) -> Self {
        Self { api, seed }
    }

    pub async fn resolve(
        &self,
        target: &TargetSpec,
        experiment_namespace: &str,
    ) -> ChaosResult<Vec<TargetResourceRecord>> {
        let kind = target.target_kind()?;
        let namespace = target.namespace_or(experiment_namespace);

        if let Some(name) = target.exact_name() {
            let object = self
                .api
                .get(kind, namespace, name)
                .await?
                .ok_or_else(|| ChaosError::not_found(kind.as_str(), namespace, name))?;
            return Ok(vec![record(&object)]);
        }

        let query = match &target.selector {
            Some(selector) => LabelQuery::from_selector(selector)?,
            None => LabelQuery::everything(),
        };
        let selection = target.selection()?;

        let matched = self.api.list(kind, namespace, &query).await?;
        if matched.is_empty() {
            return Err(ChaosError::NoMatch(format!(
                "{kind} in namespace {namespace} with selector '{query}'"
            )));
        }
        debug!(%kind, namespace, matched = matched.len(), "Selector matched resources");

        let picked = self.apply_selection(matched, selection);
        Ok(picked.iter().map(record).collect())
    }

    fn apply_selection(&self, mut matched: Vec<ClusterObject>, selection: Selection) -> Vec<ClusterObject> {
        match selection {
            Selection::All => matched,
            Selection::One => {
                matched.truncate(1);
                matched
            }
            Selection::Random => {
                let index = selection_rng(self.seed).gen_range(0..matched.len());
                vec![matched.swap_remove(index)]
            }
            Selection::Percentage(pct) => {
                let keep = (matched.len() as f64 * pct / 100.0).ceil() as usize;
                matched.truncate(keep.max(1));
                matched
            }
            Selection::Fixed(count) => {
                matched.truncate(count);
                matched
            }
        }
    }
}

fn record(object: &ClusterObject) -> TargetResourceRecord {
    TargetResourceRecord {
        kind: object.kind,
        name: object.name().to_string(),
        namespace: object.metadata.namespace.clone(),
        uid: object.metadata.uid.clone(),
        status: Some(TargetState::Targeted),
    }
}
