//! The inbound index exposes a single public lookup, `Index::pod_server_rx`,
//! which obtains the watch for a pod port's effective `InboundServer`.
//! Otherwise it implements `kubert::index::IndexNamespacedResource` for the
//! indexed resources.

use super::{
    server, server_authorization,
    workload::{self, PortMap},
};
use crate::{ports::PortSet, ClusterInfo};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{anyhow, Result};
use linkerd_destination_controller_core::inbound::{
    AuthorizationRef, ClientAuthorization, InboundServer, ProxyProtocol, ServerRef,
};
use linkerd_destination_controller_k8s_api::{self as k8s, ResourceExt};
use parking_lot::RwLock;
use std::{collections::hash_map::Entry, num::NonZeroU16, sync::Arc};
use tokio::sync::watch;
use tracing::info_span;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds all indexing state. Owned and updated by the per-kind dispatch
/// tasks; read by the gRPC layer via `pod_server_rx`.
#[derive(Debug)]
pub struct Index {
    cluster_info: Arc<ClusterInfo>,
    namespaces: NamespaceIndex,
}

/// Holds all `Pod`, `Server`, and `ServerAuthorization` indices by-namespace.
#[derive(Debug)]
struct NamespaceIndex {
    cluster_info: Arc<ClusterInfo>,
    by_ns: HashMap<String, Namespace>,
}

#[derive(Debug)]
struct Namespace {
    pods: PodIndex,
    policy: PolicyIndex,
}

/// Holds all pod data for a single namespace.
#[derive(Debug)]
struct PodIndex {
    namespace: String,
    by_name: HashMap<String, Pod>,
}

/// Holds a single pod's data with the server watches for all known ports.
///
/// The set of ports/servers is updated as clients discover server
/// configuration or as `Server` resources select a port.
#[derive(Debug)]
struct Pod {
    meta: workload::Meta,

    /// The pod's named container ports. Used by `Server` port selectors.
    ///
    /// A pod may have multiple ports with the same name. E.g., each container
    /// may have its own `admin-http` port.
    port_names: HashMap<String, PortSet>,

    /// All known TCP server ports. This may be updated by
    /// `Namespace::reindex`--when a port is selected by a `Server`--or by
    /// `Index::pod_server_rx` when a client discovers a port that has no
    /// configured server (and i.e. uses the default policy).
    port_servers: PortMap<PodPortServer>,
}

/// Holds the state of a single port on a pod.
#[derive(Debug)]
struct PodPortServer {
    /// The name of the server resource that matches this port. Unset when no
    /// server resources match this pod/port (and, i.e., the default policy is
    /// used).
    name: Option<String>,

    /// A sender used to broadcast pod port server updates.
    watch: watch::Sender<InboundServer>,
}

/// Holds the state of policy resources for a single namespace.
#[derive(Debug)]
struct PolicyIndex {
    namespace: String,
    cluster_info: Arc<ClusterInfo>,

    servers: HashMap<String, server::Server>,
    server_authorizations: HashMap<String, server_authorization::ServerAuthz>,
}

// === impl Index ===

impl Index {
    pub fn shared(cluster_info: impl Into<Arc<ClusterInfo>>) -> SharedIndex {
        let cluster_info = cluster_info.into();
        Arc::new(RwLock::new(Self {
            cluster_info: cluster_info.clone(),
            namespaces: NamespaceIndex {
                cluster_info,
                by_ns: HashMap::default(),
            },
        }))
    }

    /// Obtains a pod:port's server receiver.
    ///
    /// An error is returned if the pod is not found. If the port is not
    /// found, a default server is created.
    pub fn pod_server_rx(
        &mut self,
        namespace: &str,
        pod: &str,
        port: NonZeroU16,
    ) -> Result<watch::Receiver<InboundServer>> {
        let ns = self
            .namespaces
            .by_ns
            .get_mut(namespace)
            .ok_or_else(|| anyhow!("namespace not found: {namespace}"))?;
        let pod = ns
            .pods
            .by_name
            .get_mut(pod)
            .ok_or_else(|| anyhow!("pod {pod}.{namespace} not found"))?;
        Ok(pod.port_server_or_default(port, &ns.policy).watch.subscribe())
    }

    pub(super) fn namespace_stats(&self) -> impl Iterator<Item = (&str, usize, usize, usize)> + '_ {
        self.namespaces.by_ns.iter().map(|(name, ns)| {
            (
                name.as_str(),
                ns.pods.by_name.len(),
                ns.policy.servers.len(),
                ns.policy.server_authorizations.len(),
            )
        })
    }

    fn ns_with_reindex(&mut self, namespace: String, f: impl FnOnce(&mut Namespace) -> bool) {
        if let Entry::Occupied(mut entry) = self.namespaces.by_ns.entry(namespace) {
            if f(entry.get_mut()) {
                if entry.get().is_empty() {
                    entry.remove();
                } else {
                    entry.get_mut().reindex();
                }
            }
        }
    }

    fn ns_or_default_with_reindex(
        &mut self,
        namespace: String,
        f: impl FnOnce(&mut Namespace) -> bool,
    ) {
        let ns = self
            .namespaces
            .by_ns
            .entry(namespace.clone())
            .or_insert_with(|| Namespace::new(namespace, self.namespaces.cluster_info.clone()));
        if f(ns) {
            ns.reindex();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let namespace = pod.namespace().unwrap();
        let name = pod.name_unchecked();
        let _span = info_span!("apply", ns = %namespace, %name).entered();

        let port_names = pod
            .spec
            .as_ref()
            .map(workload::tcp_ports_by_name)
            .unwrap_or_default();
        let meta = workload::Meta::from_metadata(pod.metadata);

        let ns = self
            .namespaces
            .by_ns
            .entry(namespace.clone())
            .or_insert_with(|| Namespace::new(namespace, self.namespaces.cluster_info.clone()));
        match ns.pods.update(name, meta, port_names) {
            Ok(None) => {}
            Ok(Some(pod)) => pod.reindex_servers(&ns.policy),
            Err(error) => {
                tracing::error!(%error, "Illegal pod update");
            }
        }
    }

    fn delete(&mut self, ns: String, name: String) {
        tracing::debug!(%ns, %name, "delete");
        if let Entry::Occupied(mut entry) = self.namespaces.by_ns.entry(ns) {
            // Once the pod is removed, there's nothing else to update. Any
            // open watches will complete.
            if entry.get_mut().pods.by_name.remove(&name).is_some() && entry.get().is_empty() {
                entry.remove();
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::policy::Server> for Index {
    fn apply(&mut self, srv: k8s::policy::Server) {
        let namespace = srv.namespace().expect("Server must be namespaced");
        let name = srv.name_unchecked();
        let _span = info_span!("apply", ns = %namespace, %name).entered();

        let server = server::Server::from_resource(srv, &self.cluster_info);
        self.ns_or_default_with_reindex(namespace, |ns| ns.policy.update_server(name, server))
    }

    fn delete(&mut self, ns: String, name: String) {
        let _span = info_span!("delete", %ns, %name).entered();
        self.ns_with_reindex(ns, |ns| ns.policy.servers.remove(&name).is_some())
    }

    fn reset(
        &mut self,
        srvs: Vec<k8s::policy::Server>,
        deleted: kubert::index::NamespacedRemoved,
    ) {
        let _span = info_span!("reset").entered();

        // Aggregate all of the updates by namespace so that we only reindex
        // once per namespace.
        struct Ns {
            added: Vec<(String, server::Server)>,
            removed: HashSet<String>,
        }
        let mut updates_by_ns = HashMap::<String, Ns>::default();
        for srv in srvs.into_iter() {
            let namespace = srv.namespace().expect("Server must be namespaced");
            let name = srv.name_unchecked();
            let server = server::Server::from_resource(srv, &self.cluster_info);
            updates_by_ns
                .entry(namespace)
                .or_insert_with(|| Ns {
                    added: vec![],
                    removed: HashSet::default(),
                })
                .added
                .push((name, server));
        }
        for (ns, names) in deleted.into_iter() {
            updates_by_ns
                .entry(ns)
                .or_insert_with(|| Ns {
                    added: vec![],
                    removed: HashSet::default(),
                })
                .removed = names.into_iter().collect();
        }

        for (namespace, Ns { added, removed }) in updates_by_ns.into_iter() {
            if added.is_empty() {
                self.ns_with_reindex(namespace, |ns| {
                    ns.policy.servers.clear();
                    true
                });
            } else {
                self.ns_or_default_with_reindex(namespace, |ns| {
                    let mut changed = !removed.is_empty();
                    for name in removed.into_iter() {
                        ns.policy.servers.remove(&name);
                    }
                    for (name, server) in added.into_iter() {
                        changed = ns.policy.update_server(name, server) || changed;
                    }
                    changed
                });
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::policy::ServerAuthorization> for Index {
    fn apply(&mut self, saz: k8s::policy::ServerAuthorization) {
        let namespace = saz
            .namespace()
            .expect("ServerAuthorization must be namespaced");
        let name = saz.name_unchecked();
        let _span = info_span!("apply", ns = %namespace, %name).entered();

        match server_authorization::ServerAuthz::from_resource(saz, &self.cluster_info) {
            Ok(meta) => self.ns_or_default_with_reindex(namespace, move |ns| {
                ns.policy.update_server_authz(name, meta)
            }),
            Err(error) => tracing::warn!(%error, "Ignoring invalid server authorization"),
        }
    }

    fn delete(&mut self, ns: String, name: String) {
        let _span = info_span!("delete", %ns, %name).entered();
        self.ns_with_reindex(ns, |ns| {
            ns.policy.server_authorizations.remove(&name).is_some()
        })
    }
}

// === impl Namespace ===

impl Namespace {
    fn new(namespace: String, cluster_info: Arc<ClusterInfo>) -> Self {
        Self {
            pods: PodIndex {
                namespace: namespace.clone(),
                by_name: HashMap::default(),
            },
            policy: PolicyIndex {
                namespace,
                cluster_info,
                servers: HashMap::default(),
                server_authorizations: HashMap::default(),
            },
        }
    }

    /// Returns true if the index does not include any resources.
    fn is_empty(&self) -> bool {
        self.pods.is_empty() && self.policy.is_empty()
    }

    fn reindex(&mut self) {
        for pod in self.pods.by_name.values_mut() {
            pod.reindex_servers(&self.policy);
        }
    }
}

// === impl PodIndex ===

impl PodIndex {
    fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    fn update(
        &mut self,
        name: String,
        meta: workload::Meta,
        port_names: HashMap<String, PortSet>,
    ) -> Result<Option<&mut Pod>> {
        match self.by_name.entry(name.clone()) {
            Entry::Vacant(entry) => {
                let pod = entry.insert(Pod {
                    meta,
                    port_names,
                    port_servers: PortMap::default(),
                });
                Ok(Some(pod))
            }
            Entry::Occupied(entry) => {
                let pod = entry.into_mut();

                // Pod labels and annotations may change at runtime, but the
                // port list may not.
                if pod.port_names != port_names {
                    anyhow::bail!("pod {name} port names must not change");
                }

                if pod.meta == meta {
                    tracing::debug!(ns = %self.namespace, %name, "no changes");
                    return Ok(None);
                }
                tracing::debug!(ns = %self.namespace, %name, "updating");
                pod.meta = meta;
                Ok(Some(pod))
            }
        }
    }
}

// === impl Pod ===

impl Pod {
    /// Determines the policies for ports which have been described by clients
    /// or which are selected by a `Server`, and updates the port's watch.
    fn reindex_servers(&mut self, policy: &PolicyIndex) {
        // Keep track of the ports which are selected by a server so that we
        // can ensure that ports selected for the first time get watches.
        let mut selected = PortMap::<String>::default();
        for (srvname, server) in &policy.servers {
            if server.pod_selector.matches(&self.meta.labels) {
                for port in self.select_ports(&server.port_ref) {
                    match selected.entry(port) {
                        Entry::Vacant(entry) => {
                            entry.insert(srvname.clone());
                        }
                        Entry::Occupied(mut entry) => {
                            // Overlapping servers resolve to the oldest
                            // resource; ties break by name.
                            let incumbent = &policy.servers[entry.get()];
                            if (server.created_at.as_ref(), srvname)
                                < (incumbent.created_at.as_ref(), entry.get())
                            {
                                tracing::warn!(
                                    ns = %policy.namespace,
                                    port = %port,
                                    server = %entry.get(),
                                    "Multiple servers select the same port; ignoring the younger"
                                );
                                entry.insert(srvname.clone());
                            } else {
                                tracing::warn!(
                                    ns = %policy.namespace,
                                    port = %port,
                                    server = %srvname,
                                    "Multiple servers select the same port; ignoring the younger"
                                );
                            }
                        }
                    }
                }
            }
        }

        // Ensure that every selected port has a watch.
        for (port, srvname) in &selected {
            let server = &policy.servers[srvname];
            let inbound = policy.inbound_server(srvname.clone(), server);
            match self.port_servers.entry(*port) {
                Entry::Vacant(entry) => {
                    entry.insert(PodPortServer {
                        name: Some(srvname.clone()),
                        watch: watch::channel(inbound).0,
                    });
                }
                Entry::Occupied(mut entry) => {
                    let ps = entry.get_mut();
                    ps.name = Some(srvname.clone());
                    ps.watch.send_if_modified(|current| {
                        if *current == inbound {
                            false
                        } else {
                            *current = inbound.clone();
                            true
                        }
                    });
                }
            }
        }

        // Ports that are no longer selected fall back to the default policy.
        // The default is recomputed unconditionally since the pod's own
        // default-policy annotation may have changed.
        for (port, ps) in self.port_servers.iter_mut() {
            if !selected.contains_key(port) {
                ps.name = None;
                let default = policy.default_inbound_server(&self.meta);
                ps.watch.send_if_modified(|current| {
                    if *current == default {
                        false
                    } else {
                        *current = default.clone();
                        true
                    }
                });
            }
        }
    }

    /// Obtains the watch for the given port, creating one with the default
    /// policy if no server selects the port.
    fn port_server_or_default(&mut self, port: NonZeroU16, policy: &PolicyIndex) -> &mut PodPortServer {
        self.port_servers.entry(port).or_insert_with(|| {
            let default = policy.default_inbound_server(&self.meta);
            PodPortServer {
                name: None,
                watch: watch::channel(default).0,
            }
        })
    }

    /// Enumerates the pod's ports selected by a `Server` port reference.
    fn select_ports(&self, port_ref: &k8s::policy::server::Port) -> Vec<NonZeroU16> {
        match port_ref {
            k8s::policy::server::Port::Number(port) => vec![*port],
            k8s::policy::server::Port::Name(name) => self
                .port_names
                .get(name)
                .into_iter()
                .flat_map(|ports| ports.iter().copied())
                .collect(),
        }
    }
}

// === impl PolicyIndex ===

impl PolicyIndex {
    fn is_empty(&self) -> bool {
        self.servers.is_empty() && self.server_authorizations.is_empty()
    }

    fn update_server(&mut self, name: String, server: server::Server) -> bool {
        match self.servers.entry(name) {
            Entry::Vacant(entry) => {
                entry.insert(server);
            }
            Entry::Occupied(mut entry) => {
                if *entry.get() == server {
                    return false;
                }
                entry.insert(server);
            }
        }
        true
    }

    fn update_server_authz(
        &mut self,
        name: String,
        authz: server_authorization::ServerAuthz,
    ) -> bool {
        match self.server_authorizations.entry(name) {
            Entry::Vacant(entry) => {
                entry.insert(authz);
            }
            Entry::Occupied(mut entry) => {
                if *entry.get() == authz {
                    return false;
                }
                entry.insert(authz);
            }
        }
        true
    }

    fn inbound_server(&self, name: String, server: &server::Server) -> InboundServer {
        let authorizations = self.client_authzs(&name, server);
        InboundServer {
            reference: ServerRef::Server(name),
            protocol: server.protocol.clone(),
            authorizations,
        }
    }

    fn default_inbound_server(&self, meta: &workload::Meta) -> InboundServer {
        let policy = meta
            .default_policy
            .unwrap_or(self.cluster_info.default_policy);
        InboundServer {
            reference: ServerRef::Default(policy.as_str()),
            protocol: ProxyProtocol::Detect {
                timeout: self.cluster_info.default_detect_timeout,
            },
            authorizations: policy.default_authzs(&self.cluster_info),
        }
    }

    fn client_authzs(
        &self,
        server_name: &str,
        server: &server::Server,
    ) -> HashMap<AuthorizationRef, ClientAuthorization> {
        self.server_authorizations
            .iter()
            .filter_map(|(name, saz)| {
                if saz.server_selector.selects(server_name, &server.labels) {
                    Some((
                        AuthorizationRef::ServerAuthorization(name.clone()),
                        saz.authz.clone(),
                    ))
                } else {
                    None
                }
            })
            .collect()
    }
}
