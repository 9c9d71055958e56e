use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;

#[cfg(test)]
use mockall::automock;

/// Answers metric queries used by pause conditions.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn query(&self, query: &str) -> anyhow::Result<f64>;
}

/// Fixed values, keyed by query string.
#[derive(Debug, Clone, Default)]
pub struct StaticMetricSource {
    values: BTreeMap<String, f64>,
}

impl StaticMetricSource {
    pub fn new(values: BTreeMap<String, f64>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl MetricSource for StaticMetricSource {
    async fn query(&self, query: &str) -> anyhow::Result<f64> {
        self.values
            .get(query)
            .copied()
            .ok_or_else(|| anyhow!("no static value configured for '{query}'"))
    }
}

/// Prometheus instant queries; the first sample of the result vector wins.
pub struct PrometheusMetricSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<Sample>,
}

#[derive(Deserialize)]
struct Sample {
    /// `[timestamp, "value"]`
    value: (f64, String),
}

impl PrometheusMetricSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

fn first_sample(body: QueryResponse) -> anyhow::Result<f64> {
    if body.status != "success" {
        return Err(anyhow!(
            "query failed: {}",
            body.error.unwrap_or_else(|| body.status.clone())
        ));
    }
    let sample = body
        .data
        .and_then(|d| d.result.into_iter().next())
        .ok_or_else(|| anyhow!("query returned no samples"))?;
    sample
        .value
        .1
        .parse::<f64>()
        .with_context(|| format!("sample value '{}' is not a number", sample.value.1))
}

#[async_trait]
impl MetricSource for PrometheusMetricSource {
    async fn query(&self, query: &str) -> anyhow::Result<f64> {
        let url = format!("{}/api/v1/query", self.base_url);
        let body: QueryResponse = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .context("decoding Prometheus response")?;
        first_sample(body)
    }
}
