//! The endpoint index maintains one publisher per subscribed `(service,
//! port)`. Every input change recomputes the affected address sets, diffs
//! them against the previously published state, and fans the resulting
//! `Add`/`Remove` updates out to each subscriber's bounded channel.
//!
//! A subscriber that cannot drain its channel is evicted; eviction is the
//! only watcher-initiated stream termination, so the gRPC layer reports it as
//! a send timeout.

use crate::{
    ports::{ports_annotation, PortSet},
    ClusterInfo,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::prelude::*;
use linkerd_destination_controller_core::endpoints::{
    AddrKey, Address, AddressSet, ProtocolHint, Update,
};
use linkerd_destination_controller_k8s_api::{self as k8s, ResourceExt};
use parking_lot::RwLock;
use prometheus_client::metrics::counter::Counter;
use std::{collections::BTreeMap, net::IpAddr, num::NonZeroU16, sync::Arc};
use tokio::sync::mpsc;
use tracing::info_span;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Per-subscriber update buffer. At typical diff rates this holds well over
/// ten seconds of backlog, so overflow indicates a client that has stopped
/// reading.
const SUBSCRIPTION_BUFFER_CAPACITY: usize = 128;

const DEFAULT_WEIGHT: u32 = 10_000;
const DEFAULT_PROXY_INBOUND_PORT: u16 = 4143;

const MESHED_LABEL: &str = "linkerd.io/control-plane-ns";
const PROXY_DEPLOYMENT_LABEL: &str = "linkerd.io/proxy-deployment";
const WORKLOAD_NS_LABEL: &str = "linkerd.io/workload-ns";
const MIRROR_SERVICE_LABEL: &str = "mirror.linkerd.io/mirrored-service";
const MIRROR_GATEWAY_IDENTITY_ANNOTATION: &str = "mirror.linkerd.io/remote-gateway-identity";
const OPAQUE_PORTS_ANNOTATION: &str = "config.linkerd.io/opaque-ports";
const SLICE_SERVICE_LABEL: &str = "kubernetes.io/service-name";
const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
const PROXY_CONTAINER_NAME: &str = "linkerd-proxy";

/// Holds all endpoint-indexing state. Owned and updated by the per-kind
/// dispatch tasks; read by the gRPC layer via `subscribe` and `lookup_ip`.
#[derive(Debug)]
pub struct Index {
    cluster_info: Arc<ClusterInfo>,
    namespaces: HashMap<String, Namespace>,
    nodes: HashMap<String, NodeMeta>,
    pods_by_ip: HashMap<IpAddr, PodRef>,
    next_subscriber_id: u64,
    metrics: IndexMetrics,
}

#[derive(Clone, Debug, Default)]
pub(super) struct IndexMetrics {
    /// Counts subscribers evicted because their update buffer overflowed.
    pub(super) evictions: Counter,
}

/// Identifies a watched authority within a namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServicePort {
    pub service: String,
    pub port: NonZeroU16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct PodRef {
    namespace: String,
    name: String,
}

#[derive(Debug, Default)]
struct NodeMeta {
    zone: Option<String>,
}

#[derive(Debug)]
struct Namespace {
    namespace: Arc<String>,

    /// Namespace-level opaque-ports annotation.
    opaque_ports: Option<PortSet>,

    services: HashMap<String, ServiceMeta>,
    slices: HashMap<String, SliceMeta>,
    endpoints: HashMap<String, Vec<LegacySubset>>,
    pods: HashMap<String, PodMeta>,
    servers: HashMap<String, ServerMeta>,

    publishers: HashMap<ServicePort, Publisher>,
}

#[derive(Debug, PartialEq)]
struct ServiceMeta {
    ports: Vec<PortSpec>,
    external_name: bool,
    publish_not_ready: bool,
    opaque_ports: Option<PortSet>,

    /// Set on mirror services; addresses take this identity instead of pod
    /// enrichment.
    mirror_gateway_identity: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
struct PortSpec {
    port: NonZeroU16,
    name: Option<String>,
}

#[derive(Debug, Default)]
struct SliceMeta {
    service: Option<String>,
    ports: Vec<BackingPort>,
    endpoints: Vec<EndpointMeta>,
}

#[derive(Debug)]
struct LegacySubset {
    ports: Vec<BackingPort>,
    endpoints: Vec<EndpointMeta>,
}

#[derive(Debug, PartialEq, Eq)]
struct BackingPort {
    name: Option<String>,
    port: NonZeroU16,
}

#[derive(Debug, Default)]
struct EndpointMeta {
    addresses: Vec<IpAddr>,
    ready: bool,
    hostname: Option<String>,
    node: Option<String>,
    zone: Option<String>,
    pod: Option<String>,
}

#[derive(Debug)]
struct PodMeta {
    labels: k8s::Labels,
    ips: Vec<IpAddr>,
    service_account: Option<String>,
    node: Option<String>,
    meshed: bool,
    opaque_ports: Option<PortSet>,
    port_names: HashMap<String, PortSet>,
    proxy_inbound_port: Option<u16>,
}

#[derive(Debug)]
struct ServerMeta {
    selector: k8s::labels::Selector,
    port: k8s::policy::server::Port,
    opaque: bool,
}

#[derive(Debug)]
struct Publisher {
    state: State,
    subscribers: HashMap<u64, mpsc::Sender<Update>>,
}

/// The last-published state of an authority.
#[derive(Clone, Debug, PartialEq)]
enum State {
    NoEndpoints { exists: bool },
    Set(AddressSet),
}

/// Classifies a `(service, port)` target for the gRPC layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TargetState {
    /// The service is not (yet) known; a watch converges if it appears.
    Unknown,

    /// The service exists but does not declare the requested port.
    UnknownPort,

    Watchable,
}

/// A live endpoint subscription. The first item is always `Add(snapshot)` or
/// `NoEndpoints`; dropping the subscription releases the watcher-side entry.
pub struct Subscription {
    rx: tokio_stream::wrappers::ReceiverStream<Update>,
    _guard: SubscriberGuard,
}

struct SubscriberGuard {
    index: SharedIndex,
    namespace: String,
    key: ServicePort,
    id: u64,
}

// === impl Index ===

impl Index {
    pub fn shared(cluster_info: impl Into<Arc<ClusterInfo>>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            cluster_info: cluster_info.into(),
            namespaces: HashMap::default(),
            nodes: HashMap::default(),
            pods_by_ip: HashMap::default(),
            next_subscriber_id: 0,
            metrics: IndexMetrics::default(),
        }))
    }

    pub(super) fn metrics(&self) -> &IndexMetrics {
        &self.metrics
    }

    pub(super) fn namespace_stats(&self) -> impl Iterator<Item = (&str, usize, usize)> + '_ {
        self.namespaces.iter().map(|(name, ns)| {
            let subscribers = ns.publishers.values().map(|p| p.subscribers.len()).sum();
            (name.as_str(), ns.publishers.len(), subscribers)
        })
    }

    /// Subscribes to the authority's endpoint diffs. The current snapshot is
    /// queued as the subscription's first update before this call returns, so
    /// a subscriber joining mid-stream never observes history.
    pub fn subscribe(
        index: &SharedIndex,
        namespace: &str,
        service: &str,
        port: NonZeroU16,
    ) -> Subscription {
        let (id, rx) = index.write().subscribe_inner(namespace, service, port);
        Subscription {
            rx: tokio_stream::wrappers::ReceiverStream::new(rx),
            _guard: SubscriberGuard {
                index: index.clone(),
                namespace: namespace.to_string(),
                key: ServicePort {
                    service: service.to_string(),
                    port,
                },
                id,
            },
        }
    }

    pub fn target_state(&self, namespace: &str, service: &str, port: NonZeroU16) -> TargetState {
        match self
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.services.get(service))
        {
            None => TargetState::Unknown,
            Some(svc) if svc.external_name => TargetState::Watchable,
            Some(svc) if svc.ports.iter().any(|p| p.port == port) => TargetState::Watchable,
            Some(_) => TargetState::UnknownPort,
        }
    }

    /// Resolves an IP-literal authority against the pod reverse index.
    pub fn lookup_ip(&self, ip: IpAddr, port: u16) -> Option<Address> {
        let pod_ref = self.pods_by_ip.get(&ip)?;
        let ns = self.namespaces.get(&pod_ref.namespace)?;
        let pod = ns.pods.get(&pod_ref.name)?;

        let mut labels = BTreeMap::new();
        labels.insert("pod".to_string(), pod_ref.name.clone());
        labels.insert("namespace".to_string(), pod_ref.namespace.clone());
        if let Some(sa) = &pod.service_account {
            labels.insert("serviceaccount".to_string(), sa.clone());
        }
        if let Some(node) = &pod.node {
            labels.insert("node".to_string(), node.clone());
        }

        let identity = if pod.meshed {
            pod.service_account
                .as_ref()
                .map(|sa| self.cluster_info.service_account_identity(&pod_ref.namespace, sa))
        } else {
            None
        };

        let zone = pod
            .node
            .as_ref()
            .and_then(|n| self.nodes.get(n))
            .and_then(|n| n.zone.clone());

        Some(Address {
            ip,
            port,
            weight: DEFAULT_WEIGHT,
            identity,
            protocol_hint: ProtocolHint::Unknown,
            opaque_transport_port: None,
            labels,
            hostname: None,
            zone,
            authority_override: None,
        })
    }

    // Nodes and Namespaces are cluster-scoped, so the runtime drives these
    // from plain watcher streams rather than `kubert::index` dispatch.

    pub fn apply_node(&mut self, node: k8s::Node) {
        let name = node.name_unchecked();
        let zone = node
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(ZONE_LABEL))
            .cloned();
        let prev = self.nodes.insert(name, NodeMeta { zone: zone.clone() });
        if prev.map(|p| p.zone) != Some(zone) {
            // Zone changes are rare; recompute everything that may reference
            // this node.
            self.reindex_all();
        }
    }

    pub fn delete_node(&mut self, name: &str) {
        if self.nodes.remove(name).is_some() {
            self.reindex_all();
        }
    }

    pub fn reset_nodes(&mut self, nodes: Vec<k8s::Node>) {
        self.nodes.clear();
        for node in nodes {
            let name = node.name_unchecked();
            let zone = node
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(ZONE_LABEL))
                .cloned();
            self.nodes.insert(name, NodeMeta { zone });
        }
        self.reindex_all();
    }

    pub fn apply_namespace_meta(&mut self, ns_obj: k8s::Namespace) {
        let name = ns_obj.name_unchecked();
        let opaque = ns_obj
            .metadata
            .annotations
            .as_ref()
            .and_then(|anns| ports_annotation(anns, OPAQUE_PORTS_ANNOTATION));
        let ns = self.ns_entry(name.clone());
        if ns.opaque_ports != opaque {
            ns.opaque_ports = opaque;
            self.reindex_namespace(&name);
        }
    }

    pub fn delete_namespace_meta(&mut self, name: &str) {
        let changed = self
            .namespaces
            .get_mut(name)
            .is_some_and(|ns| ns.opaque_ports.take().is_some());
        if changed {
            self.reindex_namespace(name);
        }
    }

    fn subscribe_inner(
        &mut self,
        namespace: &str,
        service: &str,
        port: NonZeroU16,
    ) -> (u64, mpsc::Receiver<Update>) {
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;

        let key = ServicePort {
            service: service.to_string(),
            port,
        };
        let state = self.materialize(namespace, service, port);

        let ns = self.ns_entry(namespace.to_string());
        let publisher = ns.publishers.entry(key).or_insert_with(|| Publisher {
            state,
            subscribers: HashMap::default(),
        });

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER_CAPACITY);
        let initial = match &publisher.state {
            State::Set(set) => Update::Add(set.clone()),
            State::NoEndpoints { exists } => Update::NoEndpoints { exists: *exists },
        };
        tx.try_send(initial)
            .expect("a fresh subscription channel must have capacity");
        publisher.subscribers.insert(id, tx);

        (id, rx)
    }

    fn unsubscribe(&mut self, namespace: &str, key: &ServicePort, id: u64) {
        let Some(ns) = self.namespaces.get_mut(namespace) else {
            return;
        };
        if let Some(publisher) = ns.publishers.get_mut(key) {
            publisher.subscribers.remove(&id);
            // Publishers with a live backing service are retained so that
            // subscribe/unsubscribe churn does not rebuild state.
            if publisher.subscribers.is_empty() && !ns.services.contains_key(&key.service) {
                ns.publishers.remove(key);
            }
        }
        if ns.is_empty() {
            self.namespaces.remove(namespace);
        }
    }

    fn ns_entry(&mut self, namespace: String) -> &mut Namespace {
        self.namespaces
            .entry(namespace.clone())
            .or_insert_with(|| Namespace {
                namespace: Arc::new(namespace),
                opaque_ports: None,
                services: HashMap::default(),
                slices: HashMap::default(),
                endpoints: HashMap::default(),
                pods: HashMap::default(),
                servers: HashMap::default(),
                publishers: HashMap::default(),
            })
    }

    fn reindex_all(&mut self) {
        let namespaces: Vec<String> = self.namespaces.keys().cloned().collect();
        for ns in namespaces {
            self.reindex_namespace(&ns);
        }
    }

    fn reindex_namespace(&mut self, namespace: &str) {
        let keys: Vec<ServicePort> = match self.namespaces.get(namespace) {
            Some(ns) => ns.publishers.keys().cloned().collect(),
            None => return,
        };
        for key in keys {
            self.reindex_publisher(namespace, &key);
        }
    }

    fn reindex_service(&mut self, namespace: &str, service: &str) {
        let keys: Vec<ServicePort> = match self.namespaces.get(namespace) {
            Some(ns) => ns
                .publishers
                .keys()
                .filter(|k| k.service == service)
                .cloned()
                .collect(),
            None => return,
        };
        for key in keys {
            self.reindex_publisher(namespace, &key);
        }
    }

    fn reindex_publisher(&mut self, namespace: &str, key: &ServicePort) {
        let next = self.materialize(namespace, &key.service, key.port);

        let evictions = self.metrics.evictions.clone();
        let Some(ns) = self.namespaces.get_mut(namespace) else {
            return;
        };
        let Some(publisher) = ns.publishers.get_mut(key) else {
            return;
        };

        let updates = diff(&publisher.state, &next);
        if updates.is_empty() {
            return;
        }
        publisher.state = next;

        publisher.subscribers.retain(|_, tx| {
            for update in &updates {
                match tx.try_send(update.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        evictions.inc();
                        return false;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
    }

    /// Computes the current address set for a `(service, port)`.
    fn materialize(&self, namespace: &str, service: &str, port: NonZeroU16) -> State {
        let Some(ns) = self.namespaces.get(namespace) else {
            return State::NoEndpoints { exists: false };
        };
        let Some(svc) = ns.services.get(service) else {
            return State::NoEndpoints { exists: false };
        };
        if svc.external_name {
            // The control plane does not resolve external names; proxies fall
            // back to DNS.
            return State::NoEndpoints { exists: false };
        }
        let Some(port_spec) = svc.ports.iter().find(|p| p.port == port) else {
            return State::NoEndpoints { exists: true };
        };

        let mut addresses: HashMap<AddrKey, Address> = HashMap::default();

        let slice_groups = ns
            .slices
            .values()
            .filter(|slice| slice.service.as_deref() == Some(service))
            .map(|slice| (&slice.ports, &slice.endpoints));
        let legacy_groups = ns
            .endpoints
            .get(service)
            .into_iter()
            .flatten()
            .map(|subset| (&subset.ports, &subset.endpoints));

        for (ports, endpoints) in slice_groups.chain(legacy_groups) {
            let Some(backing_port) = resolve_backing_port(ports, port_spec) else {
                continue;
            };
            for ep in endpoints {
                if !(ep.ready || svc.publish_not_ready) {
                    continue;
                }
                for ip in &ep.addresses {
                    let addr = self.mk_address(ns, svc, port_spec, *ip, backing_port, ep);
                    addresses.insert(addr.key(), addr);
                }
            }
        }

        if addresses.is_empty() {
            return State::NoEndpoints { exists: true };
        }

        let mut labels = BTreeMap::new();
        labels.insert("service".to_string(), service.to_string());
        labels.insert("namespace".to_string(), namespace.to_string());
        State::Set(AddressSet { addresses, labels })
    }

    fn mk_address(
        &self,
        ns: &Namespace,
        svc: &ServiceMeta,
        port_spec: &PortSpec,
        ip: IpAddr,
        backing_port: NonZeroU16,
        ep: &EndpointMeta,
    ) -> Address {
        let mut labels = BTreeMap::new();
        let mut identity = None;
        let mut protocol_hint = ProtocolHint::Unknown;
        let mut opaque_transport_port = None;

        let mut zone = ep.zone.clone();
        if zone.is_none() {
            zone = ep
                .node
                .as_ref()
                .and_then(|n| self.nodes.get(n))
                .and_then(|n| n.zone.clone());
        }
        if let Some(node) = &ep.node {
            labels.insert("node".to_string(), node.clone());
        }

        if let Some(gateway_identity) = &svc.mirror_gateway_identity {
            // Mirror endpoints address a remote gateway, not local pods.
            identity = Some(gateway_identity.clone());
        } else if let Some(pod) = ep.pod.as_ref().and_then(|name| ns.pods.get(name)) {
            labels.insert("pod".to_string(), ep.pod.clone().unwrap_or_default());
            if let Some(sa) = &pod.service_account {
                labels.insert("serviceaccount".to_string(), sa.clone());
            }
            // Pod labels are projected to the wire through a fixed allow-list
            // rather than copied wholesale.
            if let Some(deployment) = pod.labels.as_ref().get(PROXY_DEPLOYMENT_LABEL) {
                labels.insert("deployment".to_string(), deployment.clone());
            }
            if let Some(workload_ns) = pod.labels.as_ref().get(WORKLOAD_NS_LABEL) {
                labels.insert("workload_ns".to_string(), workload_ns.clone());
            }

            let opaque = self.is_opaque(ns, svc, pod, port_spec.port, backing_port);
            if pod.meshed {
                identity = pod
                    .service_account
                    .as_ref()
                    .map(|sa| self.cluster_info.service_account_identity(&ns.namespace, sa));
                if opaque {
                    protocol_hint = ProtocolHint::Opaque;
                    opaque_transport_port =
                        Some(pod.proxy_inbound_port.unwrap_or(DEFAULT_PROXY_INBOUND_PORT));
                } else if self.cluster_info.enable_h2_upgrade {
                    protocol_hint = ProtocolHint::Http2;
                }
            } else if opaque {
                protocol_hint = ProtocolHint::Opaque;
            }
        }

        Address {
            ip,
            port: backing_port.get(),
            weight: DEFAULT_WEIGHT,
            identity,
            protocol_hint,
            opaque_transport_port,
            labels,
            hostname: ep.hostname.clone(),
            zone,
            authority_override: None,
        }
    }

    /// A port is opaque if declared so at any of: the namespace annotation,
    /// the service annotation, the pod annotation, the cluster default set,
    /// or a `Server` with an opaque proxy protocol selecting the pod's port.
    fn is_opaque(
        &self,
        ns: &Namespace,
        svc: &ServiceMeta,
        pod: &PodMeta,
        svc_port: NonZeroU16,
        backing_port: NonZeroU16,
    ) -> bool {
        if ns
            .opaque_ports
            .as_ref()
            .is_some_and(|ports| ports.contains(&backing_port))
        {
            return true;
        }
        if svc
            .opaque_ports
            .as_ref()
            .is_some_and(|ports| ports.contains(&svc_port))
        {
            return true;
        }
        if pod
            .opaque_ports
            .as_ref()
            .is_some_and(|ports| ports.contains(&backing_port))
        {
            return true;
        }
        if self.cluster_info.default_opaque_ports.contains(&backing_port) {
            return true;
        }
        ns.servers.values().any(|srv| {
            srv.opaque
                && srv.selector.matches(&pod.labels)
                && server_selects_port(&srv.port, pod, backing_port)
        })
    }
}

// === Resource indexing ===

impl kubert::index::IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, svc: k8s::Service) {
        let namespace = svc.namespace().unwrap();
        let name = svc.name_unchecked();
        let _span = info_span!("apply", ns = %namespace, %name).entered();

        let meta = service_meta(&svc);
        let ns = self.ns_entry(namespace.clone());
        if ns.services.get(&name) != Some(&meta) {
            ns.services.insert(name.clone(), meta);
            self.reindex_service(&namespace, &name);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        tracing::debug!(%namespace, %name, "delete");
        if let Some(ns) = self.namespaces.get_mut(&namespace) {
            if ns.services.remove(&name).is_some() {
                self.reindex_service(&namespace, &name);
                // Publishers without subscribers have nothing left to hold
                // them open.
                if let Some(ns) = self.namespaces.get_mut(&namespace) {
                    ns.publishers
                        .retain(|k, p| k.service != name || !p.subscribers.is_empty());
                    if ns.is_empty() {
                        self.namespaces.remove(&namespace);
                    }
                }
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::EndpointSlice> for Index {
    fn apply(&mut self, slice: k8s::EndpointSlice) {
        let namespace = slice.namespace().unwrap();
        let name = slice.name_unchecked();
        let _span = info_span!("apply", ns = %namespace, %name).entered();

        let meta = slice_meta(&slice);
        let service = meta.service.clone();
        let ns = self.ns_entry(namespace.clone());
        let prev_service = ns
            .slices
            .insert(name, meta)
            .and_then(|prev| prev.service);

        if let Some(service) = prev_service.filter(|prev| Some(prev) != service.as_ref()) {
            self.reindex_service(&namespace, &service);
        }
        if let Some(service) = service {
            self.reindex_service(&namespace, &service);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        tracing::debug!(%namespace, %name, "delete");
        if let Some(ns) = self.namespaces.get_mut(&namespace) {
            if let Some(service) = ns.slices.remove(&name).and_then(|s| s.service) {
                self.reindex_service(&namespace, &service);
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Endpoints> for Index {
    fn apply(&mut self, endpoints: k8s::Endpoints) {
        let namespace = endpoints.namespace().unwrap();
        // An `Endpoints` object is named after its service.
        let name = endpoints.name_unchecked();
        let _span = info_span!("apply", ns = %namespace, %name).entered();

        let subsets = legacy_subsets(&endpoints);
        let ns = self.ns_entry(namespace.clone());
        ns.endpoints.insert(name.clone(), subsets);
        self.reindex_service(&namespace, &name);
    }

    fn delete(&mut self, namespace: String, name: String) {
        tracing::debug!(%namespace, %name, "delete");
        if let Some(ns) = self.namespaces.get_mut(&namespace) {
            if ns.endpoints.remove(&name).is_some() {
                self.reindex_service(&namespace, &name);
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let namespace = pod.namespace().unwrap();
        let name = pod.name_unchecked();
        let _span = info_span!("apply", ns = %namespace, %name).entered();

        let meta = pod_meta(&pod);
        let ips = meta.ips.clone();
        let pod_ref = PodRef {
            namespace: namespace.clone(),
            name: name.clone(),
        };

        let ns = self.ns_entry(namespace.clone());
        let prev = ns.pods.insert(name, meta);
        if let Some(prev) = prev {
            for ip in prev.ips {
                if self.pods_by_ip.get(&ip) == Some(&pod_ref) {
                    self.pods_by_ip.remove(&ip);
                }
            }
        }
        for ip in ips {
            self.pods_by_ip.insert(ip, pod_ref.clone());
        }

        self.reindex_namespace(&namespace);
    }

    fn delete(&mut self, namespace: String, name: String) {
        tracing::debug!(%namespace, %name, "delete");
        let pod_ref = PodRef {
            namespace: namespace.clone(),
            name: name.clone(),
        };
        if let Some(ns) = self.namespaces.get_mut(&namespace) {
            if let Some(prev) = ns.pods.remove(&name) {
                for ip in prev.ips {
                    if self.pods_by_ip.get(&ip) == Some(&pod_ref) {
                        self.pods_by_ip.remove(&ip);
                    }
                }
                self.reindex_namespace(&namespace);
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::policy::Server> for Index {
    fn apply(&mut self, srv: k8s::policy::Server) {
        let namespace = srv.namespace().unwrap();
        let name = srv.name_unchecked();
        let _span = info_span!("apply", ns = %namespace, %name).entered();

        let meta = ServerMeta {
            selector: srv.spec.pod_selector,
            port: srv.spec.port,
            opaque: matches!(
                srv.spec.proxy_protocol,
                Some(k8s::policy::server::ProxyProtocol::Opaque)
            ),
        };
        let ns = self.ns_entry(namespace.clone());
        ns.servers.insert(name, meta);
        self.reindex_namespace(&namespace);
    }

    fn delete(&mut self, namespace: String, name: String) {
        tracing::debug!(%namespace, %name, "delete");
        if let Some(ns) = self.namespaces.get_mut(&namespace) {
            if ns.servers.remove(&name).is_some() {
                self.reindex_namespace(&namespace);
            }
        }
    }
}

// === impl Namespace ===

impl Namespace {
    fn is_empty(&self) -> bool {
        self.services.is_empty()
            && self.slices.is_empty()
            && self.endpoints.is_empty()
            && self.pods.is_empty()
            && self.servers.is_empty()
            && self.publishers.is_empty()
            && self.opaque_ports.is_none()
    }
}

// === impl Subscription ===

impl Stream for Subscription {
    type Item = Update;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Update>> {
        std::pin::Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.index
            .write()
            .unsubscribe(&self.namespace, &self.key, self.id);
    }
}

// === Conversions ===

fn service_meta(svc: &k8s::Service) -> ServiceMeta {
    let spec = svc.spec.clone().unwrap_or_default();
    let annotations = svc.metadata.annotations.clone().unwrap_or_default();
    let is_mirror = svc
        .metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.contains_key(MIRROR_SERVICE_LABEL));

    let ports = spec
        .ports
        .iter()
        .flatten()
        .filter_map(|p| {
            let port = u16::try_from(p.port).ok().and_then(NonZeroU16::new)?;
            Some(PortSpec {
                port,
                name: p.name.clone(),
            })
        })
        .collect();

    ServiceMeta {
        ports,
        external_name: spec.type_.as_deref() == Some("ExternalName"),
        publish_not_ready: spec.publish_not_ready_addresses.unwrap_or(false),
        opaque_ports: ports_annotation(&annotations, OPAQUE_PORTS_ANNOTATION),
        mirror_gateway_identity: if is_mirror {
            annotations.get(MIRROR_GATEWAY_IDENTITY_ANNOTATION).cloned()
        } else {
            None
        },
    }
}

fn slice_meta(slice: &k8s::EndpointSlice) -> SliceMeta {
    let service = slice
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(SLICE_SERVICE_LABEL))
        .cloned();

    let ports = slice
        .ports
        .iter()
        .flatten()
        .filter_map(|p| {
            let port = p
                .port
                .and_then(|p| u16::try_from(p).ok())
                .and_then(NonZeroU16::new)?;
            Some(BackingPort {
                name: p.name.clone(),
                port,
            })
        })
        .collect();

    let endpoints = slice
        .endpoints
        .iter()
        .map(|ep| EndpointMeta {
            addresses: ep
                .addresses
                .iter()
                .filter_map(|a| a.parse().ok())
                .collect(),
            ready: ep
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true),
            hostname: ep.hostname.clone(),
            node: ep.node_name.clone(),
            zone: ep.zone.clone(),
            pod: ep
                .target_ref
                .as_ref()
                .filter(|t| t.kind.as_deref() == Some("Pod"))
                .and_then(|t| t.name.clone()),
        })
        .collect();

    SliceMeta {
        service,
        ports,
        endpoints,
    }
}

fn legacy_subsets(endpoints: &k8s::Endpoints) -> Vec<LegacySubset> {
    let mut subsets = Vec::new();
    for subset in endpoints.subsets.iter().flatten() {
        let ports = subset
            .ports
            .iter()
            .flatten()
            .filter_map(|p| {
                let port = u16::try_from(p.port).ok().and_then(NonZeroU16::new)?;
                Some(BackingPort {
                    name: p.name.clone(),
                    port,
                })
            })
            .collect();

        let mut eps = Vec::new();
        let mut push = |addrs: &Option<Vec<k8s::EndpointAddress>>, ready: bool| {
            for addr in addrs.iter().flatten() {
                let Ok(ip) = addr.ip.parse() else { continue };
                eps.push(EndpointMeta {
                    addresses: vec![ip],
                    ready,
                    hostname: addr.hostname.clone(),
                    node: addr.node_name.clone(),
                    zone: None,
                    pod: addr
                        .target_ref
                        .as_ref()
                        .filter(|t| t.kind.as_deref() == Some("Pod"))
                        .and_then(|t| t.name.clone()),
                });
            }
        };
        push(&subset.addresses, true);
        push(&subset.not_ready_addresses, false);

        subsets.push(LegacySubset {
            ports,
            endpoints: eps,
        });
    }
    subsets
}

fn pod_meta(pod: &k8s::Pod) -> PodMeta {
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();

    let mut ips: Vec<IpAddr> = status
        .and_then(|s| s.pod_ips.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|p| p.ip.parse().ok())
        .collect();
    if ips.is_empty() {
        if let Some(ip) = status.and_then(|s| s.pod_ip.as_ref()).and_then(|ip| ip.parse().ok()) {
            ips.push(ip);
        }
    }

    let mut port_names: HashMap<String, PortSet> = HashMap::default();
    let mut proxy_inbound_port = None;
    for container in spec.map(|s| s.containers.as_slice()).unwrap_or_default() {
        for port in container.ports.iter().flatten() {
            if let None | Some("TCP") = port.protocol.as_deref() {
                let Some(number) =
                    u16::try_from(port.container_port).ok().and_then(NonZeroU16::new)
                else {
                    continue;
                };
                if let Some(name) = &port.name {
                    if container.name == PROXY_CONTAINER_NAME && name == PROXY_CONTAINER_NAME {
                        proxy_inbound_port = Some(number.get());
                    }
                    port_names.entry(name.clone()).or_default().insert(number);
                }
            }
        }
    }

    let meshed = pod
        .metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.contains_key(MESHED_LABEL));

    PodMeta {
        labels: pod.metadata.labels.clone().into(),
        ips,
        service_account: spec.and_then(|s| s.service_account_name.clone()),
        node: spec.and_then(|s| s.node_name.clone()),
        meshed,
        opaque_ports: pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|anns| ports_annotation(anns, OPAQUE_PORTS_ANNOTATION)),
        port_names,
        proxy_inbound_port,
    }
}

fn resolve_backing_port(ports: &[BackingPort], port_spec: &PortSpec) -> Option<NonZeroU16> {
    if ports.is_empty() {
        return None;
    }
    // An unnamed service port can only correspond to an unnamed backing port
    // (a service with a single port); otherwise names must agree.
    ports
        .iter()
        .find(|p| p.name == port_spec.name)
        .map(|p| p.port)
}

fn server_selects_port(port: &k8s::policy::server::Port, pod: &PodMeta, backing: NonZeroU16) -> bool {
    match port {
        k8s::policy::server::Port::Number(n) => *n == backing,
        k8s::policy::server::Port::Name(name) => pod
            .port_names
            .get(name)
            .is_some_and(|ports| ports.contains(&backing)),
    }
}

/// Produces the updates that transform `prev` into `next`.
///
/// Pure additions precede removals; an address whose metadata changed is
/// republished as a removal followed by an addition so that subscribers never
/// observe a silent mutation.
fn diff(prev: &State, next: &State) -> Vec<Update> {
    match (prev, next) {
        (State::NoEndpoints { exists: a }, State::NoEndpoints { exists: b }) => {
            if a == b {
                vec![]
            } else {
                vec![Update::NoEndpoints { exists: *b }]
            }
        }
        (State::NoEndpoints { .. }, State::Set(set)) => vec![Update::Add(set.clone())],
        (State::Set(_), State::NoEndpoints { exists }) => {
            vec![Update::NoEndpoints { exists: *exists }]
        }
        (State::Set(prev), State::Set(next)) => {
            let mut added = HashMap::default();
            let mut changed = HashMap::default();
            for (key, addr) in &next.addresses {
                match prev.addresses.get(key) {
                    None => {
                        added.insert(*key, addr.clone());
                    }
                    Some(prev_addr) if prev_addr != addr => {
                        changed.insert(*key, addr.clone());
                    }
                    Some(_) => {}
                }
            }
            let removed: HashSet<AddrKey> = prev
                .addresses
                .keys()
                .filter(|key| !next.addresses.contains_key(*key))
                .copied()
                .collect();

            let mut updates = Vec::new();
            if !added.is_empty() {
                updates.push(Update::Add(AddressSet {
                    addresses: added,
                    labels: next.labels.clone(),
                }));
            }
            if !removed.is_empty() || !changed.is_empty() {
                let mut keys = removed;
                keys.extend(changed.keys().copied());
                updates.push(Update::Remove(keys));
            }
            if !changed.is_empty() {
                updates.push(Update::Add(AddressSet {
                    addresses: changed,
                    labels: next.labels.clone(),
                }));
            }
            updates
        }
    }
}
