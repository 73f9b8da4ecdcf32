//! Trusted peers - addresses exempt from authentication
//!
//! The registry is the union of three sources: the statically configured
//! `trusted-hosts`, the cluster node list when clustering is enabled, and
//! the presence server host when the presence module is enabled. It is
//! rebuilt as a whole and published atomically, so request processing
//! always sees either the previous or the new set.

use super::binary_ip::BinaryIp;
use super::shared::SipUri;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Inputs of a registry rebuild
#[derive(Debug, Clone, Default)]
pub struct TrustedHostSources {
    /// Statically configured hosts (IP literals or resolvable names)
    pub static_hosts: Vec<String>,
    /// Cluster node addresses, `None` when clustering is disabled
    pub cluster_nodes: Option<Vec<String>>,
    /// Presence server URI, `None` when the presence module is disabled
    pub presence_server: Option<String>,
}

/// Set of trusted peer addresses
pub struct TrustedPeerRegistry {
    hosts: ArcSwap<Vec<BinaryIp>>,
}

impl TrustedPeerRegistry {
    pub fn new() -> Self {
        Self {
            hosts: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Build a registry and populate it from `sources`.
    pub fn from_sources(sources: &TrustedHostSources) -> Self {
        let registry = Self::new();
        registry.rebuild(sources);
        registry
    }

    /// Recompute the trusted set from scratch and publish it.
    /// Returns the number of distinct trusted addresses.
    pub fn rebuild(&self, sources: &TrustedHostSources) -> usize {
        let mut hosts: Vec<BinaryIp> = Vec::new();

        for host in &sources.static_hosts {
            match BinaryIp::resolve(host) {
                Ok(ip) => push_unique(&mut hosts, ip),
                Err(e) => warn!("Ignoring trusted host '{}': {}", host, e),
            }
        }

        if let Some(nodes) = &sources.cluster_nodes {
            for node in nodes {
                match BinaryIp::resolve(node) {
                    Ok(ip) => push_unique(&mut hosts, ip),
                    Err(e) => warn!("Ignoring cluster node '{}': {}", node, e),
                }
            }
        }

        if let Some(presence_server) = &sources.presence_server {
            match presence_host(presence_server) {
                Some(host) => match BinaryIp::resolve(&host) {
                    Ok(ip) => {
                        if !hosts.contains(&ip) {
                            info!("Adding presence server '{}' to trusted hosts", host);
                            hosts.push(ip);
                        }
                    }
                    Err(e) => warn!(
                        "Could not resolve presence server '{}', cannot be added to trusted hosts: {}",
                        host, e
                    ),
                },
                None => warn!(
                    "Could not parse presence server URL '{}', cannot be added to trusted hosts!",
                    presence_server
                ),
            }
        }

        let count = hosts.len();
        self.hosts.store(Arc::new(hosts));
        debug!("Trusted hosts rebuilt: {} entries", count);
        count
    }

    /// Check an already normalized address.
    pub fn is_trusted(&self, ip: &BinaryIp) -> bool {
        self.hosts.load().iter().any(|trusted| trusted == ip)
    }

    /// Check a printable address as found in a Via header. Anything that
    /// is not an IP literal is never trusted.
    pub fn is_trusted_host(&self, printable: &str) -> bool {
        match BinaryIp::parse(printable) {
            Ok(ip) => self.is_trusted(&ip),
            Err(_) => false,
        }
    }

    /// Current trusted set
    pub fn snapshot(&self) -> Arc<Vec<BinaryIp>> {
        self.hosts.load_full()
    }

    pub fn len(&self) -> usize {
        self.hosts.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.load().is_empty()
    }
}

impl Default for TrustedPeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn push_unique(hosts: &mut Vec<BinaryIp>, ip: BinaryIp) {
    if !hosts.contains(&ip) {
        hosts.push(ip);
    }
}

/// Host part of a presence server address such as
/// `<sip:127.0.0.1:5065;transport=tcp>`.
fn presence_host(presence_server: &str) -> Option<String> {
    let trimmed = presence_server.trim();
    let uri = trimmed
        .find('<')
        .and_then(|start| {
            trimmed[start + 1..]
                .find('>')
                .map(|end| &trimmed[start + 1..start + 1 + end])
        })
        .unwrap_or(trimmed);

    SipUri::parse(uri).ok().map(|uri| uri.host().to_string())
}
