//! Per-instance proxy configuration rendering
//!
//! Every map is a `BTreeMap`, so rendering the same topology twice yields
//! byte-identical files.

use crate::capability::{Feature, FeatureSet};
use crate::config::ProxySettings;
use crate::error::{HarnessError, Result};
use crate::fixtures::{
    write_file, FixtureWorkspace, TlsMaterial, HEALTH_DOCUMENT, INDEX_DOCUMENT,
};
use crate::topology::{Instance, Topology};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Header identifying which backend served a response
pub const SERVER_ID_HEADER: &str = "X-Server-Id";

const COMPRESSION_ENCODINGS: &[&str] = &["zstd", "br", "gzip"];
const COMPRESSION_MIN_SIZE: u64 = 1024;

/// Config files written for one run, backends first and the proxy last
#[derive(Debug, Clone, Default)]
pub struct GeneratedConfigs {
    files: Vec<(String, PathBuf)>,
}

impl GeneratedConfigs {
    pub fn path_for(&self, instance: &str) -> Option<&Path> {
        self.files
            .iter()
            .find(|(n, _)| n == instance)
            .map(|(_, p)| p.as_path())
    }
}

#[cfg(test)]
impl GeneratedConfigs {
    fn names(&self) -> Vec<&str> {
        self.files.iter().map(|(n, _)| n.as_str()).collect()
    }
}

#[derive(Debug, Serialize)]
struct InstanceFile {
    server: ServerSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    http3: Option<Http3Section>,
    tls: TlsSection,
    logging: LoggingSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    prometheus: Option<PrometheusSection>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    upstreams: BTreeMap<String, UpstreamSection>,
    path_routes: BTreeMap<String, BTreeMap<String, RouteSection>>,
}

#[derive(Debug, Serialize)]
struct ServerSection {
    listen: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    http: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_redirect: Option<bool>,
    http2_enabled: bool,
    http3_enabled: bool,
}

#[derive(Debug, Serialize)]
struct Http3Section {
    listen: String,
}

#[derive(Debug, Serialize)]
struct TlsSection {
    cert_path: String,
    key_path: String,
    ktls_enabled: bool,
}

#[derive(Debug, Serialize)]
struct LoggingSection {
    level: String,
}

#[derive(Debug, Serialize)]
struct PrometheusSection {
    enabled: bool,
    path: String,
}

#[derive(Debug, Serialize)]
struct UpstreamSection {
    algorithm: String,
    servers: Vec<String>,
    tls_insecure: bool,
}

#[derive(Debug, Clone, Serialize)]
struct RouteSection {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    upstream: Option<String>,
    security: SecuritySection,
    #[serde(skip_serializing_if = "Option::is_none")]
    compression: Option<CompressionSection>,
}

#[derive(Debug, Clone, Serialize, Default)]
struct SecuritySection {
    add_response_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    remove_response_headers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct CompressionSection {
    enabled: bool,
    preferred_encodings: Vec<String>,
    min_size: u64,
}

/// Render configs for every instance into the workspace.
///
/// Existing files are overwritten; nothing from a previous run is merged.
pub fn generate(
    workspace: &FixtureWorkspace,
    topology: &Topology,
    tls: &TlsMaterial,
    features: &FeatureSet,
    settings: &ProxySettings,
) -> Result<GeneratedConfigs> {
    let mut generated = GeneratedConfigs::default();

    let ordered = topology
        .backends()
        .chain(std::iter::once(topology.proxy()));
    for instance in ordered {
        let file = if instance.is_proxy() {
            proxy_file(instance, topology, tls, features, settings)
        } else {
            backend_file(instance, workspace, topology, tls, features, settings)
        };
        let rendered = render(&file)?;
        let path = workspace.config_path(&instance.name);
        write_file(&path, rendered.as_bytes())?;
        debug!(instance = %instance.name, path = %path.display(), "Config written");
        generated.files.push((instance.name.clone(), path));
    }

    Ok(generated)
}

fn render(file: &InstanceFile) -> Result<String> {
    toml::to_string(file).map_err(|e| HarnessError::Config(e.to_string()))
}

fn backend_file(
    instance: &Instance,
    workspace: &FixtureWorkspace,
    topology: &Topology,
    tls: &TlsMaterial,
    features: &FeatureSet,
    settings: &ProxySettings,
) -> InstanceFile {
    let static_root = workspace.static_dir();
    let security = || SecuritySection {
        add_response_headers: BTreeMap::from([(
            SERVER_ID_HEADER.to_string(),
            instance.name.clone(),
        )]),
        remove_response_headers: Vec::new(),
    };

    let mut routes = BTreeMap::new();
    routes.insert(
        "/".to_string(),
        RouteSection {
            kind: "File",
            path: Some(path_string(&static_root)),
            mode: Some("sendfile".to_string()),
            index: Some(INDEX_DOCUMENT.to_string()),
            upstream: None,
            security: security(),
            compression: None,
        },
    );
    routes.insert(
        settings.health_path.clone(),
        RouteSection {
            kind: "File",
            path: Some(path_string(&static_root.join(HEALTH_DOCUMENT))),
            mode: Some("sendfile".to_string()),
            index: None,
            upstream: None,
            security: security(),
            compression: None,
        },
    );

    InstanceFile {
        server: ServerSection {
            listen: instance.listen.to_string(),
            http: None,
            http_redirect: None,
            http2_enabled: features.contains(Feature::Http2),
            http3_enabled: false,
        },
        http3: None,
        tls: tls_section(tls, features),
        logging: LoggingSection {
            level: settings.log_level.clone(),
        },
        prometheus: None,
        upstreams: BTreeMap::new(),
        path_routes: per_host(topology, routes),
    }
}

fn proxy_file(
    instance: &Instance,
    topology: &Topology,
    tls: &TlsMaterial,
    features: &FeatureSet,
    settings: &ProxySettings,
) -> InstanceFile {
    let http3 = features.contains(Feature::Http3);

    let servers = topology
        .backends()
        .map(|b| format!("https://{}", b.listen))
        .collect();
    let mut upstreams = BTreeMap::new();
    upstreams.insert(
        topology.upstream().to_string(),
        UpstreamSection {
            algorithm: "round_robin".to_string(),
            servers,
            tls_insecure: true,
        },
    );

    let mut routes = BTreeMap::new();
    routes.insert(
        "/".to_string(),
        RouteSection {
            kind: "Proxy",
            path: None,
            mode: None,
            index: None,
            upstream: Some(topology.upstream().to_string()),
            security: SecuritySection {
                add_response_headers: BTreeMap::from([
                    ("X-Proxy".to_string(), "veil".to_string()),
                    ("X-Proxied-By".to_string(), instance.name.clone()),
                ]),
                remove_response_headers: vec!["Server".to_string()],
            },
            compression: Some(CompressionSection {
                enabled: true,
                preferred_encodings: COMPRESSION_ENCODINGS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                min_size: COMPRESSION_MIN_SIZE,
            }),
        },
    );

    InstanceFile {
        server: ServerSection {
            listen: instance.listen.to_string(),
            http: instance.plain_listen.map(|a| a.to_string()),
            http_redirect: Some(false),
            http2_enabled: features.contains(Feature::Http2),
            http3_enabled: http3,
        },
        http3: http3.then(|| Http3Section {
            listen: instance.listen.to_string(),
        }),
        tls: tls_section(tls, features),
        logging: LoggingSection {
            level: settings.log_level.clone(),
        },
        prometheus: Some(PrometheusSection {
            enabled: true,
            path: settings.metrics_path.clone(),
        }),
        upstreams,
        path_routes: per_host(topology, routes),
    }
}

fn tls_section(tls: &TlsMaterial, features: &FeatureSet) -> TlsSection {
    TlsSection {
        cert_path: path_string(&tls.cert_path),
        key_path: path_string(&tls.key_path),
        ktls_enabled: features.contains(Feature::AcceleratedTls),
    }
}

/// Repeat the route table under every route host
fn per_host(
    topology: &Topology,
    routes: BTreeMap<String, RouteSection>,
) -> BTreeMap<String, BTreeMap<String, RouteSection>> {
    topology
        .route_hosts()
        .into_iter()
        .map(|host| (host, routes.clone()))
        .collect()
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
