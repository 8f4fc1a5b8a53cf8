//! One-shot liveness checks for a provisioned topology
//!
//! Backends are probed on their secure health path, the proxy on its
//! metrics path (plain-text listener first, then the secure one). Each
//! request is bounded by the configured timeout and never retried here.

use crate::error::{HarnessError, Result};
use crate::topology::{Instance, Topology};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Timeout for each request
    pub timeout: Duration,
    /// Backend liveness path
    pub health_path: String,
    /// Proxy metrics path
    pub metrics_path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            health_path: "/health".to_string(),
            metrics_path: "/__metrics".to_string(),
        }
    }
}

/// Result of checking a whole topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthReport {
    Healthy,
    Unhealthy { instance: String, reason: String },
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthReport::Healthy)
    }

    /// `HealthCheck` error for an unhealthy report
    pub fn into_result(self) -> Result<()> {
        match self {
            HealthReport::Healthy => Ok(()),
            HealthReport::Unhealthy { instance, reason } => {
                Err(HarnessError::HealthCheck { instance, reason })
            }
        }
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthReport::Healthy => f.write_str("healthy"),
            HealthReport::Unhealthy { instance, reason } => {
                write!(f, "unhealthy ({}: {})", instance, reason)
            }
        }
    }
}

pub struct HealthChecker {
    client: reqwest::Client,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig) -> Result<Self> {
        // Fixture certificates are self-signed
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(true)
            .no_proxy()
            .build()
            .map_err(|e| HarnessError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Check every backend, then the proxy; the first failure wins
    pub async fn check(&self, topology: &Topology) -> HealthReport {
        for backend in topology.backends() {
            if let Err(reason) = self.check_backend(backend).await {
                warn!(instance = %backend.name, %reason, "Backend health check failed");
                return HealthReport::Unhealthy {
                    instance: backend.name.clone(),
                    reason,
                };
            }
        }

        let proxy = topology.proxy();
        if let Err(reason) = self.check_proxy(proxy).await {
            warn!(instance = %proxy.name, %reason, "Proxy health check failed");
            return HealthReport::Unhealthy {
                instance: proxy.name.clone(),
                reason,
            };
        }

        info!("All instances healthy");
        HealthReport::Healthy
    }

    pub async fn check_backend(&self, backend: &Instance) -> std::result::Result<(), String> {
        let url = format!("https://{}{}", backend.listen, self.config.health_path);
        self.probe(&url).await
    }

    pub async fn check_proxy(&self, proxy: &Instance) -> std::result::Result<(), String> {
        let secure = format!("https://{}{}", proxy.listen, self.config.metrics_path);

        let Some(plain) = proxy.plain_listen else {
            return self.probe(&secure).await;
        };
        let plain = format!("http://{}{}", plain, self.config.metrics_path);

        match self.probe(&plain).await {
            Ok(()) => Ok(()),
            Err(plain_reason) => {
                debug!(url = %plain, reason = %plain_reason, "Plain metrics probe failed, trying secure port");
                self.probe(&secure)
                    .await
                    .map_err(|secure_reason| format!("{}; {}", plain_reason, secure_reason))
            }
        }
    }

    async fn probe(&self, url: &str) -> std::result::Result<(), String> {
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url, status = %response.status(), "Health probe passed");
                Ok(())
            }
            Ok(response) => Err(format!("{} returned {}", url, response.status())),
            Err(e) if e.is_timeout() => Err(format!(
                "{} timed out after {}ms",
                url,
                self.config.timeout.as_millis()
            )),
            Err(e) => Err(format!("{}: {}", url, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Plain HTTP responder answering every request with `status`
    async fn responder(status: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    /// An address nothing listens on
    async fn closed_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn checker() -> HealthChecker {
        HealthChecker::new(HealthCheckConfig {
            timeout: Duration::from_millis(500),
            ..HealthCheckConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_proxy_plain_metrics_ok() {
        let plain = responder("200 OK").await;
        let secure = closed_addr().await;
        let proxy = Instance::proxy("proxy", secure, plain);

        assert!(checker().check_proxy(&proxy).await.is_ok());
    }

    #[tokio::test]
    async fn test_proxy_non_success_falls_back_and_fails() {
        let plain = responder("503 Service Unavailable").await;
        let secure = closed_addr().await;
        let proxy = Instance::proxy("proxy", secure, plain);

        let reason = checker().check_proxy(&proxy).await.unwrap_err();
        assert!(reason.contains("503"));
    }

    #[tokio::test]
    async fn test_unreachable_backend_short_circuits() {
        let backend1 = closed_addr().await;
        let backend2 = closed_addr().await;
        let plain = responder("200 OK").await;
        let topology = Topology::new(
            vec![
                Instance::backend("backend1", backend1),
                Instance::backend("backend2", backend2),
                Instance::proxy("proxy", closed_addr().await, plain),
            ],
            "pool",
        )
        .unwrap();

        let report = checker().check(&topology).await;
        match &report {
            HealthReport::Unhealthy { instance, .. } => assert_eq!(instance, "backend1"),
            other => panic!("expected unhealthy, got {:?}", other),
        }
        assert!(!report.is_healthy());

        let err = report.into_result().unwrap_err();
        assert_eq!(err.phase(), "health");
    }

    #[test]
    fn test_report_display() {
        assert_eq!(HealthReport::Healthy.to_string(), "healthy");
        let report = HealthReport::Unhealthy {
            instance: "backend2".into(),
            reason: "refused".into(),
        };
        assert_eq!(report.to_string(), "unhealthy (backend2: refused)");
        assert!(HealthReport::Healthy.into_result().is_ok());
    }
}
