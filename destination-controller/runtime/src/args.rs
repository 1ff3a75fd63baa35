use crate::{
    core::IpNet,
    grpc,
    index::{self, ports::parse_portset, ClusterInfo, DefaultPolicy},
    index_list::IndexList,
    k8s, EndpointsDiscover, InboundDiscover, ProfilesDiscover,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::{watcher, WatchStreamExt};
use prometheus_client::registry::Registry;
use std::{
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::Arc,
};
use tokio::{sync::watch, time::Duration};
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};

const DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const ISSUER_SECRET_NAME: &str = "linkerd-identity-issuer";

#[derive(Debug, Parser)]
#[clap(name = "destination", about = "The destination service controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "linkerd=info,warn",
        env = "LINKERD_DESTINATION_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:8086")]
    grpc_addr: SocketAddr,

    /// Network CIDRs of pod IPs.
    ///
    /// The default includes all private networks.
    #[clap(
        long,
        default_value = "10.0.0.0/8,100.64.0.0/10,172.16.0.0/12,192.168.0.0/16"
    )]
    cluster_networks: IpNets,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    #[clap(long, default_value = "cluster.local")]
    identity_trust_domain: String,

    #[clap(long, default_value = "all-unauthenticated")]
    default_policy: DefaultPolicy,

    #[clap(long, default_value = "linkerd")]
    control_plane_namespace: String,

    /// This pod's IP, used for self-identification in logs and diagnostics.
    #[clap(long, env = "LINKERD_POD_IP")]
    pod_ip: Option<std::net::IpAddr>,

    #[clap(long, default_value = "")]
    default_opaque_ports: String,

    /// Reads endpoints from EndpointSlice resources rather than legacy
    /// Endpoints.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_endpoint_slices: bool,

    /// Hints HTTP/2 upgrades for HTTP/1.1 destinations on meshed pods.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_h2_upgrade: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            grpc_addr,
            cluster_networks: IpNets(cluster_networks),
            cluster_domain,
            identity_trust_domain,
            default_policy,
            control_plane_namespace,
            pod_ip,
            default_opaque_ports,
            enable_endpoint_slices,
            enable_h2_upgrade,
        } = self;

        let default_opaque_ports = parse_portset(&default_opaque_ports)?;
        let cluster_info = Arc::new(ClusterInfo {
            networks: cluster_networks.clone(),
            control_plane_ns: control_plane_namespace.clone(),
            dns_domain: cluster_domain.clone(),
            identity_trust_domain,
            default_policy,
            default_detect_timeout: DETECT_TIMEOUT,
            default_opaque_ports,
            enable_h2_upgrade,
        });

        // Build the index data structures which will maintain the state
        // necessary for serving the destination and inbound policy gRPC APIs.
        let endpoints_index = index::endpoints::Index::shared(cluster_info.clone());
        let profiles_index = index::profiles::Index::shared(cluster_info.clone());
        let inbound_index = index::inbound::Index::shared(cluster_info.clone());

        let mut prom = <Registry>::default();
        index::endpoints::metrics::register(
            prom.sub_registry_with_prefix("endpoint_index"),
            endpoints_index.clone(),
        );
        index::inbound::metrics::register(
            prom.sub_registry_with_prefix("inbound_index"),
            inbound_index.clone(),
        );
        let grpc_metrics =
            grpc::destination::Metrics::register(prom.sub_registry_with_prefix("grpc_server"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        if let Some(pod_ip) = pod_ip {
            info!(%pod_ip, "destination controller starting");
        }

        // Spawn resource watches.

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(endpoints_index.clone(), services)
                .instrument(info_span!("services")),
        );

        if enable_endpoint_slices {
            let slices = runtime.watch_all::<k8s::EndpointSlice>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(endpoints_index.clone(), slices)
                    .instrument(info_span!("endpointslices")),
            );
        } else {
            let endpoints = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(endpoints_index.clone(), endpoints)
                    .instrument(info_span!("endpoints")),
            );
        }

        // All pods are indexed: unmeshed pods still back services and carry
        // the labels and node placement that endpoint metadata needs.
        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        let pods_indexes = IndexList::new(endpoints_index.clone())
            .push(inbound_index.clone())
            .shared();
        tokio::spawn(
            kubert::index::namespaced(pods_indexes, pods).instrument(info_span!("pods")),
        );

        let servers = runtime.watch_all::<k8s::policy::Server>(watcher::Config::default());
        let servers_indexes = IndexList::new(endpoints_index.clone())
            .push(inbound_index.clone())
            .shared();
        tokio::spawn(
            kubert::index::namespaced(servers_indexes, servers).instrument(info_span!("servers")),
        );

        let server_authzs =
            runtime.watch_all::<k8s::policy::ServerAuthorization>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(inbound_index.clone(), server_authzs)
                .instrument(info_span!("serverauthorizations")),
        );

        let profiles = runtime.watch_all::<k8s::profile::ServiceProfile>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(profiles_index.clone(), profiles)
                .instrument(info_span!("serviceprofiles")),
        );

        // Nodes and Namespaces are cluster-scoped; drive them into the
        // endpoint index directly.
        let nodes = runtime.watch_all::<k8s::Node>(watcher::Config::default());
        tokio::spawn(
            node_watch(endpoints_index.clone(), nodes).instrument(info_span!("nodes")),
        );

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            namespace_watch(endpoints_index.clone(), namespaces)
                .instrument(info_span!("namespaces")),
        );

        // Watch the issuer credentials so that identity-bearing endpoint
        // streams can republish on rotation.
        let issuer_secrets = watcher(
            k8s::Api::<k8s::Secret>::namespaced(runtime.client(), &control_plane_namespace),
            watcher::Config::default().fields(&format!("metadata.name={ISSUER_SECRET_NAME}")),
        )
        .default_backoff();
        let (issuer_tx, issuer_rx) = watch::channel(0u64);
        tokio::spawn(issuer_watch(issuer_tx, issuer_secrets).instrument(info_span!("issuer")));

        // Run the gRPC server, serving results by looking up against the
        // index handles.
        tokio::spawn(serve_grpc(
            grpc_addr,
            cluster_domain,
            cluster_networks,
            endpoints_index,
            profiles_index,
            inbound_index,
            issuer_rx,
            grpc_metrics,
            runtime.shutdown_handle(),
        ));

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
struct IpNets(Vec<IpNet>);

impl std::str::FromStr for IpNets {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(|n| n.parse().map_err(Into::into))
            .collect::<Result<Vec<IpNet>>>()
            .map(Self)
    }
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(port = %addr.port()))]
async fn serve_grpc(
    addr: SocketAddr,
    cluster_domain: String,
    cluster_networks: Vec<IpNet>,
    endpoints_index: index::endpoints::SharedIndex,
    profiles_index: index::profiles::SharedIndex,
    inbound_index: index::inbound::SharedIndex,
    issuer_rx: watch::Receiver<u64>,
    metrics: grpc::destination::Metrics,
    drain: drain::Watch,
) -> Result<()> {
    let destination_svc = grpc::destination::DestinationApiServer::new(
        EndpointsDiscover::new(endpoints_index),
        ProfilesDiscover::new(profiles_index),
        cluster_domain,
        issuer_rx,
        drain.clone(),
        metrics,
    )
    .svc();

    let inbound_svc = grpc::inbound::InboundPolicyServer::new(
        InboundDiscover::new(inbound_index),
        cluster_networks,
        drain.clone(),
    )
    .svc();

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_service(destination_svc)
            .add_service(inbound_svc)
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "destination gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

async fn node_watch(
    index: index::endpoints::SharedIndex,
    events: impl Stream<Item = watcher::Event<k8s::Node>>,
) {
    tokio::pin!(events);
    let mut synced = Vec::new();
    while let Some(event) = events.next().await {
        match event {
            watcher::Event::Init => synced.clear(),
            watcher::Event::InitApply(node) => synced.push(node),
            watcher::Event::InitDone => index.write().reset_nodes(std::mem::take(&mut synced)),
            watcher::Event::Apply(node) => index.write().apply_node(node),
            watcher::Event::Delete(node) => {
                index.write().delete_node(&k8s::ResourceExt::name_unchecked(&node))
            }
        }
    }
}

async fn namespace_watch(
    index: index::endpoints::SharedIndex,
    events: impl Stream<Item = watcher::Event<k8s::Namespace>>,
) {
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            watcher::Event::Init | watcher::Event::InitDone => {}
            watcher::Event::InitApply(ns) | watcher::Event::Apply(ns) => {
                index.write().apply_namespace_meta(ns)
            }
            watcher::Event::Delete(ns) => index
                .write()
                .delete_namespace_meta(&k8s::ResourceExt::name_unchecked(&ns)),
        }
    }
}

/// Bumps the identity epoch whenever the issuer certificate changes. The
/// initial observation records the fingerprint without signaling rotation.
async fn issuer_watch(
    tx: watch::Sender<u64>,
    events: impl Stream<Item = Result<watcher::Event<k8s::Secret>, watcher::Error>>,
) {
    tokio::pin!(events);
    let mut fingerprint: Option<u64> = None;
    while let Some(event) = events.next().await {
        let secret = match event {
            Ok(watcher::Event::InitApply(secret)) | Ok(watcher::Event::Apply(secret)) => secret,
            Ok(_) => continue,
            Err(error) => {
                tracing::warn!(%error, "issuer secret watch failed");
                continue;
            }
        };
        let fp = issuer_fingerprint(&secret);
        match fingerprint.replace(fp) {
            Some(prev) if prev != fp => {
                tx.send_modify(|epoch| *epoch += 1);
                info!("issuer certificate rotated");
            }
            // The first observation records the fingerprint without
            // signaling rotation.
            _ => {}
        }
    }
}

fn issuer_fingerprint(secret: &k8s::Secret) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    if let Some(data) = &secret.data {
        for (key, value) in data {
            key.hash(&mut hasher);
            value.0.hash(&mut hasher);
        }
    }
    hasher.finish()
}
