//! Fixture workspace: certificates, generated configs, static content
//!
//! Layout under the workspace root:
//!
//! ```text
//! certs/server.crt, certs/server.key   created once, reused across runs
//! configs/<instance>.toml              regenerated on every start
//! www/                                 regenerated on every start
//! logs/<instance>.log                  instance stdout/stderr
//! e2e.pids                             managed process registry
//! ```

use crate::error::{HarnessError, Result};
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Names the certificate must be valid for
pub const CERT_SUBJECT_ALT_NAMES: &[&str] = &["localhost", "127.0.0.1"];

/// Index document served by backends
pub const INDEX_DOCUMENT: &str = "index.html";

/// Large compressible document used by compression and memory benchmarks
pub const LARGE_DOCUMENT: &str = "large.txt";

/// Body returned by the backend liveness endpoint
pub const HEALTH_DOCUMENT: &str = "health.txt";

const LARGE_DOCUMENT_LINES: usize = 4096;

/// Paths of the certificate and key every instance serves
#[derive(Debug, Clone, PartialEq)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FixtureWorkspace {
    root: PathBuf,
}

impl FixtureWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.root.join("certs")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn static_dir(&self) -> PathBuf {
        self.root.join("www")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join("e2e.pids")
    }

    pub fn config_path(&self, instance: &str) -> PathBuf {
        self.configs_dir().join(format!("{}.toml", instance))
    }

    pub fn tls_material(&self) -> TlsMaterial {
        TlsMaterial {
            cert_path: self.certs_dir().join("server.crt"),
            key_path: self.certs_dir().join("server.key"),
        }
    }

    /// Create directories, issue certificates if missing and regenerate
    /// static content
    pub fn prepare(&self) -> Result<TlsMaterial> {
        for dir in [self.configs_dir(), self.logs_dir()] {
            create_dir(&dir)?;
        }
        let tls = self.ensure_certificates()?;
        self.write_static_content()?;
        Ok(tls)
    }

    /// Issue the fixture certificate unless both files already exist
    pub fn ensure_certificates(&self) -> Result<TlsMaterial> {
        let tls = self.tls_material();
        if tls.cert_path.is_file() && tls.key_path.is_file() {
            debug!(cert = %tls.cert_path.display(), "Reusing existing certificate");
            return Ok(tls);
        }

        create_dir(&self.certs_dir())?;
        let (cert_pem, key_pem) = issue_certificate(CERT_SUBJECT_ALT_NAMES)?;
        write_file(&tls.cert_path, cert_pem.as_bytes())?;
        write_file(&tls.key_path, key_pem.as_bytes())?;
        restrict_permissions(&tls.key_path);

        info!(
            cert = %tls.cert_path.display(),
            key = %tls.key_path.display(),
            "Generated fixture certificate"
        );
        Ok(tls)
    }

    /// Rewrite the static content root from scratch
    pub fn write_static_content(&self) -> Result<()> {
        let dir = self.static_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| HarnessError::config_write(&dir, e))?;
        }
        create_dir(&dir)?;

        write_file(&dir.join(INDEX_DOCUMENT), index_document().as_bytes())?;
        write_file(&dir.join(LARGE_DOCUMENT), large_document().as_bytes())?;
        write_file(&dir.join(HEALTH_DOCUMENT), b"OK\n")?;
        Ok(())
    }

    /// Remove everything except certificates
    pub fn clean(&self) -> Result<()> {
        for dir in [self.configs_dir(), self.static_dir(), self.logs_dir()] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!(path = %dir.display(), "Removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        match std::fs::remove_file(self.registry_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(root = %self.root.display(), "Workspace cleaned (certificates kept)");
        Ok(())
    }
}

/// Issue a self-signed end-entity server certificate.
///
/// Strict clients reject CA certificates presented as server certificates
/// and certificates without key usage, so both are set explicitly.
pub fn issue_certificate(subject_alt_names: &[&str]) -> Result<(String, String)> {
    let names = subject_alt_names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    let mut params = CertificateParams::new(names)
        .map_err(|e| HarnessError::CertificateGeneration(e.to_string()))?;

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    if let Some(cn) = subject_alt_names.first() {
        params.distinguished_name.push(DnType::CommonName, *cn);
    }

    let key_pair =
        KeyPair::generate().map_err(|e| HarnessError::CertificateGeneration(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| HarnessError::CertificateGeneration(e.to_string()))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn index_document() -> String {
    "<!DOCTYPE html>\n<html>\n<head><title>proxyrig</title></head>\n\
     <body><h1>proxyrig fixture</h1></body>\n</html>\n"
        .to_string()
}

fn large_document() -> String {
    let mut body = String::with_capacity(LARGE_DOCUMENT_LINES * 64);
    for i in 0..LARGE_DOCUMENT_LINES {
        body.push_str(&format!(
            "{:05} The quick brown fox jumps over the lazy dog.\n",
            i
        ));
    }
    body
}

fn create_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| HarnessError::config_write(dir, e))
}

pub(crate) fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents).map_err(|e| HarnessError::config_write(path, e))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        debug!(path = %path.display(), error = %e, "Could not restrict key permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

/// `path` made absolute against the current directory, with `.` and `..`
/// resolved lexically so the same workspace always yields the same prefix
pub fn absolute_path(path: &Path) -> io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::extensions::GeneralName;
    use x509_parser::prelude::*;

    #[test]
    fn test_absolute_path() {
        assert_eq!(
            absolute_path(Path::new("/work/./e2e/../fixtures")).unwrap(),
            PathBuf::from("/work/fixtures")
        );

        let cwd = std::env::current_dir().unwrap();
        assert_eq!(
            absolute_path(Path::new("./tests/e2e_fixtures")).unwrap(),
            cwd.join("tests").join("e2e_fixtures")
        );
    }

    #[test]
    fn test_layout() {
        let ws = FixtureWorkspace::new("/work");
        assert_eq!(ws.config_path("proxy"), PathBuf::from("/work/configs/proxy.toml"));
        assert_eq!(ws.logs_dir(), PathBuf::from("/work/logs"));
        assert_eq!(ws.registry_path(), PathBuf::from("/work/e2e.pids"));
        assert_eq!(
            ws.tls_material().cert_path,
            PathBuf::from("/work/certs/server.crt")
        );
    }

    #[test]
    fn test_certificate_is_end_entity_with_usages() {
        let (cert_pem, key_pem) = issue_certificate(CERT_SUBJECT_ALT_NAMES).unwrap();
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));

        let (_, pem) = parse_x509_pem(cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();

        let bc = cert.basic_constraints().unwrap().expect("basic constraints");
        assert!(!bc.value.ca);

        let ku = cert.key_usage().unwrap().expect("key usage");
        assert!(ku.value.digital_signature());
        assert!(ku.value.key_encipherment());

        let eku = cert.extended_key_usage().unwrap().expect("extended key usage");
        assert!(eku.value.server_auth);

        let san = cert.subject_alternative_name().unwrap().expect("SAN");
        let mut has_dns = false;
        let mut has_ip = false;
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => has_dns |= *dns == "localhost",
                GeneralName::IPAddress(ip) => has_ip |= *ip == [127, 0, 0, 1],
                _ => {}
            }
        }
        assert!(has_dns, "SAN must include localhost");
        assert!(has_ip, "SAN must include 127.0.0.1");
    }

    #[test]
    fn test_certificates_are_not_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let ws = FixtureWorkspace::new(dir.path());

        let tls = ws.ensure_certificates().unwrap();
        let first = std::fs::read_to_string(&tls.cert_path).unwrap();

        let again = ws.ensure_certificates().unwrap();
        assert_eq!(tls, again);
        assert_eq!(std::fs::read_to_string(&again.cert_path).unwrap(), first);
    }

    #[test]
    fn test_prepare_writes_static_content() {
        let dir = tempfile::tempdir().unwrap();
        let ws = FixtureWorkspace::new(dir.path());

        ws.prepare().unwrap();
        std::fs::write(ws.static_dir().join("stale.txt"), "old").unwrap();
        ws.prepare().unwrap();

        assert!(ws.static_dir().join(INDEX_DOCUMENT).is_file());
        assert!(ws.static_dir().join(HEALTH_DOCUMENT).is_file());
        assert!(!ws.static_dir().join("stale.txt").exists());

        let large = std::fs::metadata(ws.static_dir().join(LARGE_DOCUMENT)).unwrap();
        assert!(large.len() > 64 * 1024);
        assert!(ws.configs_dir().is_dir());
        assert!(ws.logs_dir().is_dir());
    }

    #[test]
    fn test_clean_keeps_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let ws = FixtureWorkspace::new(dir.path());
        let tls = ws.prepare().unwrap();
        std::fs::write(ws.config_path("proxy"), "x").unwrap();
        std::fs::write(ws.registry_path(), "123\n").unwrap();

        ws.clean().unwrap();

        assert!(tls.cert_path.is_file());
        assert!(tls.key_path.is_file());
        assert!(!ws.configs_dir().exists());
        assert!(!ws.static_dir().exists());
        assert!(!ws.logs_dir().exists());
        assert!(!ws.registry_path().exists());

        // cleaning twice is fine
        ws.clean().unwrap();
    }

    #[test]
    fn test_unwritable_workspace_is_config_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();

        let ws = FixtureWorkspace::new(blocker.join("nested"));
        let err = ws.prepare().unwrap_err();
        assert!(matches!(err, HarnessError::ConfigWrite { .. }));
    }
}
