//! Host capability detection and feature selection
//!
//! Kernel TLS offload is only worth building in when the kernel exposes the
//! `tls` upper-layer protocol. The resulting [`FeatureSet`] is computed once
//! per invocation and used for both the build and every run.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

/// Kernel list of available TCP upper-layer protocols
pub const TCP_AVAILABLE_ULP: &str = "/proc/sys/net/ipv4/tcp_available_ulp";

/// Marker for kernel TLS in the ULP list
const KTLS_ULP_MARKER: &str = "tls";

/// An optional capability the proxy can be built with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    Http2,
    Http3,
    /// Kernel TLS offload; attaches to a byte stream, so never used with QUIC
    AcceleratedTls,
}

impl Feature {
    /// Cargo feature name in the proxy crate
    pub fn cargo_name(&self) -> &'static str {
        match self {
            Feature::Http2 => "http2",
            Feature::Http3 => "http3",
            Feature::AcceleratedTls => "ktls",
        }
    }
}

/// Immutable set of capabilities selected for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSet {
    features: BTreeSet<Feature>,
}

impl FeatureSet {
    /// Protocol features every run is built with
    pub fn base() -> Self {
        Self {
            features: [Feature::Http2, Feature::Http3].into_iter().collect(),
        }
    }

    /// Base features plus kernel TLS when supported
    pub fn with_accelerated_tls(supported: bool) -> Self {
        let mut set = Self::base();
        if supported {
            set.features.insert(Feature::AcceleratedTls);
        }
        set
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.features.iter().copied()
    }

    /// Features for executing against a single target.
    ///
    /// An HTTP/3-only target never carries kernel TLS, since QUIC runs over
    /// datagrams. Every other target gets the build feature set unchanged.
    pub fn for_target(&self, http3_only: bool) -> Self {
        if !http3_only {
            return self.clone();
        }
        let mut features = self.features.clone();
        features.remove(&Feature::AcceleratedTls);
        features.insert(Feature::Http3);
        Self { features }
    }

    /// Comma-separated cargo feature list, e.g. `http2,http3,ktls`
    pub fn cargo_list(&self) -> String {
        self.features
            .iter()
            .map(Feature::cargo_name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cargo_list())
    }
}

/// Platform-specific detection of optional acceleration
pub trait CapabilityProbe {
    /// Whether kernel TLS offload is usable on this host
    fn accelerated_tls_supported(&self) -> bool;

    /// Feature selection for this host
    fn probe(&self) -> FeatureSet {
        let supported = self.accelerated_tls_supported();
        let features = FeatureSet::with_accelerated_tls(supported);
        info!(features = %features, ktls = supported, "Feature set selected");
        features
    }
}

/// Reads a whitespace-separated list of available ULPs
#[derive(Debug, Clone)]
pub struct UlpProbe {
    source: PathBuf,
}

impl UlpProbe {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl Default for UlpProbe {
    fn default() -> Self {
        Self::new(TCP_AVAILABLE_ULP)
    }
}

impl CapabilityProbe for UlpProbe {
    fn accelerated_tls_supported(&self) -> bool {
        match std::fs::read_to_string(&self.source) {
            Ok(list) => list.split_whitespace().any(|ulp| ulp == KTLS_ULP_MARKER),
            Err(e) => {
                debug!(
                    source = %self.source.display(),
                    error = %e,
                    "ULP list unavailable, assuming no kernel TLS"
                );
                false
            }
        }
    }
}

/// Probe for platforms without kernel TLS
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAcceleration;

impl CapabilityProbe for NoAcceleration {
    fn accelerated_tls_supported(&self) -> bool {
        false
    }
}

/// The probe matching the current platform
pub fn host_probe() -> Box<dyn CapabilityProbe> {
    if cfg!(target_os = "linux") {
        Box::new(UlpProbe::default())
    } else {
        Box::new(NoAcceleration)
    }
}
