use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Runs a command inside a pod and reports its exit code.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodExecutor: Send + Sync {
    async fn exec(&self, namespace: &str, pod: &str, command: &[String]) -> anyhow::Result<i32>;
}

/// One probe attempt per call; `true` means healthy.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthProber: Send + Sync {
    async fn http_get(&self, url: &str) -> bool;

    async fn tcp_connect(&self, host: &str, port: u16) -> bool;

    async fn exec(&self, namespace: &str, pod: &str, command: &[String]) -> bool;
}

/// Probes over the network with a bounded timeout. Exec probes need an
/// executor; without one they report unhealthy.
pub struct NetworkProber {
    http: reqwest::Client,
    timeout: Duration,
    executor: Option<Arc<dyn PodExecutor>>,
}

impl NetworkProber {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            timeout,
            executor: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn PodExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }
}

#[async_trait]
impl HealthProber for NetworkProber {
    async fn http_get(&self, url: &str) -> bool {
        match self.http.get(url).send().await {
            Ok(resp) => {
                debug!(url, status = %resp.status(), "HTTP probe answered");
                resp.status().is_success()
            }
            Err(e) => {
                debug!(url, error = %e, "HTTP probe failed");
                false
            }
        }
    }

    async fn tcp_connect(&self, host: &str, port: u16) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(host, port, error = %e, "TCP probe refused");
                false
            }
            Err(_) => {
                debug!(host, port, "TCP probe timed out");
                false
            }
        }
    }

    async fn exec(&self, namespace: &str, pod: &str, command: &[String]) -> bool {
        let Some(executor) = &self.executor else {
            debug!(namespace, pod, "No pod executor configured for exec probe");
            return false;
        };
        match tokio::time::timeout(self.timeout, executor.exec(namespace, pod, command)).await {
            Ok(Ok(code)) => code == 0,
            Ok(Err(e)) => {
                debug!(namespace, pod, error = %e, "Exec probe failed");
                false
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_probe_reports_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = NetworkProber::new(Duration::from_secs(1));
        assert!(prober.tcp_connect("127.0.0.1", port).await);

        drop(listener);
        assert!(!prober.tcp_connect("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn exec_probe_uses_exit_code() {
        let mut executor = MockPodExecutor::new();
        executor
            .expect_exec()
            .returning(|_, pod, _| Ok(if pod == "healthy" { 0 } else { 1 }));
        let prober = NetworkProber::new(Duration::from_secs(1)).with_executor(Arc::new(executor));
        let cmd = vec!["pg_isready".to_string()];
        assert!(prober.exec("db", "healthy", &cmd).await);
        assert!(!prober.exec("db", "sick", &cmd).await);
    }

    #[tokio::test]
    async fn exec_probe_without_executor_is_unhealthy() {
        let prober = NetworkProber::new(Duration::from_secs(1));
        assert!(!prober.exec("db", "p", &["true".to_string()]).await);
    }
}
