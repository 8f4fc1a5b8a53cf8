//! Shared helpers for the lifecycle tests
//!
//! Instances are stand-in shell scripts that just stay alive; the listening
//! side of each instance is played by in-test responders bound to the same
//! ports, so health checks see a realistic topology.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use proxyrig::capability::CapabilityProbe;
use proxyrig::config::{BackendEntry, HarnessConfig, TimingConfig};
use proxyrig::fixtures::{issue_certificate, CERT_SUBJECT_ALT_NAMES};
use proxyrig::process::pid_alive;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Instance stand-in: ignores `-c <config>` and stays alive
pub const STUB_SCRIPT: &str = "#!/bin/sh\nwhile :; do sleep 1; done\n";

/// Probe that always reports kernel TLS support
pub struct KtlsAvailable;

impl CapabilityProbe for KtlsAvailable {
    fn accelerated_tls_supported(&self) -> bool {
        true
    }
}

pub fn write_stub(dir: &Path) -> PathBuf {
    let path = dir.join("veil");
    std::fs::write(&path, STUB_SCRIPT).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A port nothing listens on
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn http_response(status: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK",
        status
    )
}

/// HTTPS responder answering every request with 200, using a fixture
/// certificate
pub async fn tls_responder() -> (u16, JoinHandle<()>) {
    let (cert_pem, key_pem) = issue_certificate(CERT_SUBJECT_ALT_NAMES).unwrap();
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<_, _>>()
        .unwrap();
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .unwrap()
        .expect("private key in PEM");

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut buf = [0u8; 2048];
                let _ = tls.read(&mut buf).await;
                let _ = tls.write_all(http_response("200 OK").as_bytes()).await;
                let _ = tls.shutdown().await;
            });
        }
    });
    (port, handle)
}

/// Plain HTTP responder answering every request with 200
pub async fn plain_responder() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(http_response("200 OK").as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (port, handle)
}

/// Responders standing in for two backends and the proxy's plain listener
pub struct LiveTopology {
    pub backend1: (u16, JoinHandle<()>),
    pub backend2: (u16, JoinHandle<()>),
    pub proxy_http: (u16, JoinHandle<()>),
    pub proxy_https: u16,
}

impl LiveTopology {
    pub async fn start() -> Self {
        Self {
            backend1: tls_responder().await,
            backend2: tls_responder().await,
            proxy_http: plain_responder().await,
            proxy_https: free_port(),
        }
    }

    pub fn ports(&self) -> (u16, u16, u16, u16) {
        (
            self.backend1.0,
            self.backend2.0,
            self.proxy_https,
            self.proxy_http.0,
        )
    }
}

pub fn harness_config(dir: &Path, ports: (u16, u16, u16, u16)) -> HarnessConfig {
    let (backend1, backend2, https, http) = ports;
    let mut config = HarnessConfig::default();

    config.project.root = dir.to_path_buf();
    config.project.candidates = vec![write_stub(dir)];
    config.project.workspace = dir.join("e2e");

    config.topology.backends = vec![
        BackendEntry {
            name: "backend1".to_string(),
            port: backend1,
        },
        BackendEntry {
            name: "backend2".to_string(),
            port: backend2,
        },
    ];
    config.topology.proxy_https_port = https;
    config.topology.proxy_http_port = http;

    config.timing = TimingConfig {
        settle_delay_ms: 10,
        startup_wait_ms: 100,
        health_timeout_ms: 1000,
        shutdown_poll_interval_ms: 50,
        shutdown_max_polls: 10,
    };
    config.runner.working_dir = Some(dir.to_path_buf());
    config
}

/// Live, non-zombie processes whose command line mentions `path`
#[cfg(target_os = "linux")]
pub fn processes_mentioning(path: &Path) -> Vec<i32> {
    let needle = path.to_string_lossy().to_string();
    procfs::process::all_processes()
        .unwrap()
        .filter_map(|p| p.ok())
        .filter(|p| {
            p.cmdline()
                .map(|args| args.iter().any(|a| a.contains(&needle)))
                .unwrap_or(false)
        })
        .filter(|p| p.stat().map(|s| s.state != 'Z').unwrap_or(false))
        .map(|p| p.pid())
        .collect()
}

pub fn assert_no_instances_left(workspace: &Path, pids: &[u32]) {
    for &pid in pids {
        assert!(!pid_alive(pid), "pid {} still alive", pid);
    }
    #[cfg(target_os = "linux")]
    assert!(
        processes_mentioning(workspace).is_empty(),
        "processes still reference {}",
        workspace.display()
    );
    assert!(!workspace.join("e2e.pids").exists());
}

/// Close `responder` once the instance process it stands in for is gone
pub fn tie_to_process(pid: u32, responder: JoinHandle<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while pid_alive(pid) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        responder.abort();
    })
}

/// SIGKILL an instance and its process group behind the harness's back
pub fn kill_out_of_band(pid: u32) {
    let pid = libc::pid_t::try_from(pid).unwrap();
    assert!(pid > 1);
    // SAFETY: kill(2) takes no pointers
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
        libc::kill(pid, libc::SIGKILL);
    }
}
