use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::AsyncReadExt;

use chaos_core::safety::probe::PodExecutor;

/// Runs `exec` health checks through the pods/exec websocket.
pub struct KubePodExecutor {
    client: Client,
}

impl KubePodExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExecutor for KubePodExecutor {
    async fn exec(&self, namespace: &str, pod: &str, command: &[String]) -> anyhow::Result<i32> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default().stdout(true).stderr(false);
        let mut attached = pods
            .exec(pod, command.to_vec(), &params)
            .await
            .with_context(|| format!("exec into {namespace}/{pod}"))?;

        let status = attached
            .take_status()
            .context("exec session carries no status channel")?;
        let mut output = Vec::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout.read_to_end(&mut output).await?;
        }
        let status = status.await;
        attached.join().await?;

        let code = exit_code(status.as_ref());
        tracing::debug!(
            namespace,
            pod,
            code,
            output = %String::from_utf8_lossy(&output).trim(),
            "exec finished"
        );
        Ok(code)
    }
}

/// The API server reports success as `status: Success` and a non-zero exit
/// as an `ExitCode` cause.
fn exit_code(status: Option<&Status>) -> i32 {
    let Some(status) = status else {
        return 1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .into_iter()
        .flatten()
        .find(|c| c.reason.as_deref() == Some("ExitCode"))
        .and_then(|c| c.message.as_deref()?.parse().ok())
        .unwrap_or(1)
}
