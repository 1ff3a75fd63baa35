use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::Result;
use futures::prelude::*;
use std::{collections::BTreeMap, net::IpAddr, pin::Pin};

/// Uniquely identifies an address within an endpoint set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddrKey {
    pub ip: IpAddr,
    pub port: u16,
}

/// A single backing address for an authority, with the metadata a proxy needs
/// to dial it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
    pub weight: u32,

    /// The mesh identity of the backing workload. `None` when the workload is
    /// not meshed.
    pub identity: Option<String>,

    pub protocol_hint: ProtocolHint,

    /// The workload's inbound proxy port, set when transported opaquely to a
    /// meshed peer.
    pub opaque_transport_port: Option<u16>,

    /// Allow-listed metric labels for this address.
    pub labels: BTreeMap<String, String>,

    /// The endpoint's hostname, set for named (headless/stateful-set)
    /// endpoints.
    pub hostname: Option<String>,

    pub zone: Option<String>,

    /// Set when the address stands in for a weighted destination override.
    pub authority_override: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ProtocolHint {
    /// No hint: the proxy detects the protocol.
    #[default]
    Unknown,

    /// The destination is meshed and can be upgraded to HTTP/2.
    Http2,

    /// The destination's port is opaque; traffic is passed through as TCP.
    Opaque,
}

/// The materialized set of addresses for an authority, keyed by `(ip, port)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AddressSet {
    pub addresses: HashMap<AddrKey, Address>,

    /// Set-level metric labels (service, namespace).
    pub labels: BTreeMap<String, String>,
}

/// An incremental change to an endpoint set.
///
/// Per subscriber, updates are totally ordered; the first update is always
/// either an `Add` of the current snapshot or `NoEndpoints`.
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    Add(AddressSet),
    Remove(HashSet<AddrKey>),

    /// The authority has no addresses: `exists` distinguishes a service with
    /// no ready endpoints (`true`) from an unresolvable or external-name
    /// authority (`false`).
    NoEndpoints { exists: bool },
}

pub type EndpointsStream = Pin<Box<dyn Stream<Item = Update> + Send + Sync + 'static>>;

/// Models endpoint discovery for `(service, port)` authorities.
#[async_trait::async_trait]
pub trait DiscoverEndpoints<T> {
    /// Subscribes to the authority's endpoint diffs. Returns `None` when the
    /// target cannot be resolved to a watchable authority.
    async fn watch_endpoints(&self, target: T) -> Result<Option<EndpointsStream>>;

    /// Resolves an IP-literal authority directly against the pod reverse
    /// index.
    fn lookup_ip(&self, ip: IpAddr, port: u16) -> Option<Address>;
}

// === impl AddressSet ===

impl AddressSet {
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Applies an update to this set, as a subscriber materializing the
    /// stream would.
    pub fn apply(&mut self, update: &Update) {
        match update {
            Update::Add(set) => {
                self.labels.clone_from(&set.labels);
                for (key, addr) in &set.addresses {
                    self.addresses.insert(*key, addr.clone());
                }
            }
            Update::Remove(keys) => {
                for key in keys {
                    self.addresses.remove(key);
                }
            }
            Update::NoEndpoints { .. } => self.addresses.clear(),
        }
    }
}

// === impl Address ===

impl Address {
    pub fn key(&self) -> AddrKey {
        AddrKey {
            ip: self.ip,
            port: self.port,
        }
    }
}
