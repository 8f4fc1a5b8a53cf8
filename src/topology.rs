//! Instances provisioned for one run and their network roles

use crate::config::TopologyConfig;
use crate::error::{HarnessError, Result};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

/// Network role of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Backend,
    Proxy,
}

/// One copy of the proxy binary with its own configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub name: String,
    pub role: Role,
    /// Secure listener
    pub listen: SocketAddr,
    /// Plain-text companion listener (proxy only)
    pub plain_listen: Option<SocketAddr>,
}

impl Instance {
    pub fn backend(name: impl Into<String>, listen: SocketAddr) -> Self {
        Self {
            name: name.into(),
            role: Role::Backend,
            listen,
            plain_listen: None,
        }
    }

    pub fn proxy(name: impl Into<String>, listen: SocketAddr, plain_listen: SocketAddr) -> Self {
        Self {
            name: name.into(),
            role: Role::Proxy,
            listen,
            plain_listen: Some(plain_listen),
        }
    }

    pub fn is_proxy(&self) -> bool {
        self.role == Role::Proxy
    }

    fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.listen.port()).chain(self.plain_listen.map(|a| a.port()))
    }
}

/// Validated, ordered set of instances
#[derive(Debug, Clone)]
pub struct Topology {
    instances: Vec<Instance>,
    proxy_index: usize,
    upstream: String,
    route_hosts: Vec<String>,
}

impl Topology {
    /// Build a topology, rejecting duplicate names, overlapping ports and
    /// anything other than exactly one proxy with at least one backend
    pub fn new(instances: Vec<Instance>, upstream: impl Into<String>) -> Result<Self> {
        let mut names = HashSet::new();
        for instance in &instances {
            if !names.insert(instance.name.as_str()) {
                return Err(HarnessError::Topology(format!(
                    "duplicate instance name '{}'",
                    instance.name
                )));
            }
        }

        let proxies = instances.iter().filter(|i| i.is_proxy()).count();
        let proxy_index = match instances.iter().position(|i| i.is_proxy()) {
            Some(index) if proxies == 1 => index,
            _ => {
                return Err(HarnessError::Topology(format!(
                    "expected exactly one proxy instance, found {}",
                    proxies
                )))
            }
        };
        if !instances.iter().any(|i| i.role == Role::Backend) {
            return Err(HarnessError::Topology("no backend instances".to_string()));
        }

        let mut ports = HashSet::new();
        for instance in &instances {
            for port in instance.ports() {
                if !ports.insert(port) {
                    return Err(HarnessError::Topology(format!(
                        "port {} is used more than once (instance '{}')",
                        port, instance.name
                    )));
                }
            }
        }

        Ok(Self {
            instances,
            proxy_index,
            upstream: upstream.into(),
            route_hosts: Vec::new(),
        })
    }

    /// Topology described by the `[topology]` config section
    pub fn from_config(config: &TopologyConfig) -> Result<Self> {
        let ip: IpAddr = config.host.parse().map_err(|e| {
            HarnessError::Topology(format!("invalid bind host '{}': {}", config.host, e))
        })?;
        let addr = |port: u16| SocketAddr::new(ip, port);

        let mut instances = Vec::with_capacity(config.backends.len() + 1);
        for backend in &config.backends {
            instances.push(Instance::backend(&backend.name, addr(backend.port)));
        }
        instances.push(Instance::proxy(
            &config.proxy_name,
            addr(config.proxy_https_port),
            addr(config.proxy_http_port),
        ));

        let mut topology = Self::new(instances, &config.upstream)?;
        topology.route_hosts = config.route_hosts.clone();
        Ok(topology)
    }

    #[cfg(test)]
    pub fn with_route_hosts(mut self, hosts: Vec<String>) -> Self {
        self.route_hosts = hosts;
        self
    }

    /// Backends in declaration order
    pub fn backends(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(|i| i.role == Role::Backend)
    }

    pub fn proxy(&self) -> &Instance {
        &self.instances[self.proxy_index]
    }

    /// Name of the upstream group the proxy forwards to
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Host headers matched by generated routes (the bind host when unset)
    pub fn route_hosts(&self) -> Vec<String> {
        if self.route_hosts.is_empty() {
            vec![self.proxy().listen.ip().to_string()]
        } else {
            self.route_hosts.clone()
        }
    }
}
