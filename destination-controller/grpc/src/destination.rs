use crate::{
    metrics::{GrpcServerMetricsFamily, GrpcServerRPCMetrics, ResponseObserver},
    workload::ContextToken,
};
use futures::prelude::*;
use linkerd2_proxy_api::destination::{
    self as pb,
    destination_server::{Destination, DestinationServer},
};
use linkerd_destination_controller_core::endpoints::{AddressSet, DiscoverEndpoints};
use linkerd_destination_controller_core::profiles::DiscoverProfile;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{net::IpAddr, num::NonZeroU16, sync::Arc};
use tokio::sync::watch;
use tracing::trace;

mod endpoints;
mod profiles;

/// Identifies a `(service, port)` authority for endpoint discovery.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointsTarget {
    pub namespace: String,
    pub service: String,
    pub port: NonZeroU16,
}

/// Identifies an authority for profile discovery.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProfileTarget {
    pub fqdn: String,
    pub client_ns: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DestinationApiServer<E, P> {
    endpoints: E,
    profiles: P,
    cluster_domain: Arc<str>,
    identity_epoch: watch::Receiver<u64>,
    drain: drain::Watch,
    metrics: Metrics,
}

#[derive(Clone, Debug)]
pub struct Metrics {
    get: GrpcServerRPCMetrics,
    get_profile: GrpcServerRPCMetrics,
    send_timeouts: Counter,
}

/// An authority as dialed by a proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Authority {
    Ip(IpAddr, u16),
    Name { host: String, port: NonZeroU16 },
}

#[derive(Debug, thiserror::Error)]
#[error("invalid authority: {0}")]
struct InvalidAuthority(String);

// === impl Metrics ===

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let family = GrpcServerMetricsFamily::register(reg);
        let send_timeouts = Counter::default();
        reg.register(
            "send_timeouts",
            "Total number of streams closed because the client could not keep up",
            send_timeouts.clone(),
        );
        Self {
            get: family.server_stream_rpc("io.linkerd.proxy.destination.Destination", "Get"),
            get_profile: family
                .server_stream_rpc("io.linkerd.proxy.destination.Destination", "GetProfile"),
            send_timeouts,
        }
    }
}

// === impl DestinationApiServer ===

impl<E, P> DestinationApiServer<E, P>
where
    E: DiscoverEndpoints<EndpointsTarget> + Clone + Send + Sync + 'static,
    P: DiscoverProfile<ProfileTarget> + Clone + Send + Sync + 'static,
{
    pub fn new(
        endpoints: E,
        profiles: P,
        cluster_domain: String,
        identity_epoch: watch::Receiver<u64>,
        drain: drain::Watch,
        metrics: Metrics,
    ) -> Self {
        Self {
            endpoints,
            profiles,
            cluster_domain: cluster_domain.into(),
            identity_epoch,
            drain,
            metrics,
        }
    }

    pub fn svc(self) -> DestinationServer<Self> {
        DestinationServer::new(self)
    }

    /// Splits a cluster-local FQDN into `(service, namespace)`.
    fn parse_cluster_name(&self, host: &str) -> Option<(String, String)> {
        let host = host.strip_suffix('.').unwrap_or(host);
        let rest = host
            .strip_suffix(&*self.cluster_domain)?
            .strip_suffix('.')?
            .strip_suffix("svc")?
            .strip_suffix('.')?;
        let (svc, ns) = rest.split_once('.')?;
        if svc.is_empty() || ns.is_empty() || ns.contains('.') {
            return None;
        }
        Some((svc.to_string(), ns.to_string()))
    }
}

type BoxUpdateStream =
    std::pin::Pin<Box<dyn Stream<Item = Result<pb::Update, tonic::Status>> + Send + Sync>>;
type BoxProfileStream = std::pin::Pin<
    Box<dyn Stream<Item = Result<pb::DestinationProfile, tonic::Status>> + Send + Sync>,
>;

#[async_trait::async_trait]
impl<E, P> Destination for DestinationApiServer<E, P>
where
    E: DiscoverEndpoints<EndpointsTarget> + Clone + Send + Sync + 'static,
    P: DiscoverProfile<ProfileTarget> + Clone + Send + Sync + 'static,
{
    type GetStream = BoxUpdateStream;

    async fn get(
        &self,
        req: tonic::Request<pb::GetDestination>,
    ) -> Result<tonic::Response<BoxUpdateStream>, tonic::Status> {
        let obs = self.metrics.get.start();
        match self.get_inner(req.into_inner(), obs).await {
            Ok(rsp) => Ok(rsp),
            Err((obs, status)) => {
                obs.end(status.code());
                Err(status)
            }
        }
    }

    type GetProfileStream = BoxProfileStream;

    async fn get_profile(
        &self,
        req: tonic::Request<pb::GetDestination>,
    ) -> Result<tonic::Response<BoxProfileStream>, tonic::Status> {
        let obs = self.metrics.get_profile.start();
        match self.get_profile_inner(req.into_inner(), obs).await {
            Ok(rsp) => Ok(rsp),
            Err((obs, status)) => {
                obs.end(status.code());
                Err(status)
            }
        }
    }
}

impl<E, P> DestinationApiServer<E, P>
where
    E: DiscoverEndpoints<EndpointsTarget> + Clone + Send + Sync + 'static,
    P: DiscoverProfile<ProfileTarget> + Clone + Send + Sync + 'static,
{
    async fn get_inner(
        &self,
        get: pb::GetDestination,
        obs: ResponseObserver,
    ) -> Result<tonic::Response<BoxUpdateStream>, (ResponseObserver, tonic::Status)> {
        trace!(path = %get.path, "Get");

        let authority = match parse_authority(&get.path) {
            Ok(authority) => authority,
            Err(_) => {
                return Err((obs, tonic::Status::invalid_argument("Invalid authority")));
            }
        };

        match authority {
            Authority::Ip(ip, port) => {
                // IP literals short-circuit through the pod reverse index:
                // the stream carries a single snapshot and then idles.
                let update = match self.endpoints.lookup_ip(ip, port) {
                    Some(addr) => endpoints::to_add_update(&AddressSet {
                        addresses: [(addr.key(), addr)].into_iter().collect(),
                        labels: Default::default(),
                    }),
                    None => endpoints::to_add_update(&endpoints::unmeshed_set(ip, port)),
                };
                Ok(tonic::Response::new(single_update_stream(
                    update,
                    self.drain.clone(),
                    obs,
                )))
            }

            Authority::Name { host, port } => {
                let Some((service, namespace)) = self.parse_cluster_name(&host) else {
                    return Err((obs, tonic::Status::invalid_argument("Invalid authority")));
                };
                let target = EndpointsTarget {
                    namespace,
                    service,
                    port,
                };
                let rx = match self.endpoints.watch_endpoints(target).await {
                    Ok(Some(rx)) => rx,
                    Ok(None) => {
                        return Err((obs, tonic::Status::invalid_argument("Unknown port")));
                    }
                    Err(e) => {
                        return Err((
                            obs,
                            tonic::Status::internal(format!("lookup failed: {e}")),
                        ));
                    }
                };
                Ok(tonic::Response::new(endpoints_stream(
                    rx,
                    self.identity_epoch.clone(),
                    self.drain.clone(),
                    obs,
                    self.metrics.send_timeouts.clone(),
                )))
            }
        }
    }

    async fn get_profile_inner(
        &self,
        get: pb::GetDestination,
        obs: ResponseObserver,
    ) -> Result<tonic::Response<BoxProfileStream>, (ResponseObserver, tonic::Status)> {
        trace!(path = %get.path, "GetProfile");

        let authority = match parse_authority(&get.path) {
            Ok(authority) => authority,
            Err(_) => {
                return Err((obs, tonic::Status::invalid_argument("Invalid authority")));
            }
        };

        match authority {
            Authority::Ip(ip, port) => {
                // IP-literal profile lookups carry the endpoint inline so the
                // proxy can route without a further Get.
                let endpoint = self
                    .endpoints
                    .lookup_ip(ip, port)
                    .map(|addr| endpoints::to_weighted_addr(&addr))
                    .unwrap_or_else(|| endpoints::to_bare_weighted_addr(ip, port));
                let profile = pb::DestinationProfile {
                    endpoint: Some(endpoint),
                    ..Default::default()
                };
                Ok(tonic::Response::new(single_profile_stream(
                    profile,
                    self.drain.clone(),
                    obs,
                )))
            }

            Authority::Name { host, port: _ } => {
                let client_ns = ContextToken::parse(&get.context_token).namespace;
                let target = ProfileTarget {
                    fqdn: host,
                    client_ns,
                };
                let rx = match self.profiles.watch_profile(target).await {
                    Ok(Some(rx)) => rx,
                    Ok(None) => {
                        return Err((obs, tonic::Status::invalid_argument("Invalid authority")));
                    }
                    Err(e) => {
                        return Err((
                            obs,
                            tonic::Status::internal(format!("lookup failed: {e}")),
                        ));
                    }
                };
                Ok(tonic::Response::new(profile_stream(
                    rx,
                    self.drain.clone(),
                    obs,
                )))
            }
        }
    }
}

fn endpoints_stream(
    mut rx: linkerd_destination_controller_core::endpoints::EndpointsStream,
    mut identity_epoch: watch::Receiver<u64>,
    drain: drain::Watch,
    obs: ResponseObserver,
    send_timeouts: Counter,
) -> BoxUpdateStream {
    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        // A local materialization of the published diffs, retained so that
        // identity rotation can republish the identity-bearing snapshot.
        let mut snapshot = AddressSet::default();
        #[allow(unused_assignments)]
        let mut evicted = false;
        let mut identity_open = true;

        loop {
            tokio::select! {
                res = rx.next() => match res {
                    Some(update) => {
                        snapshot.apply(&update);
                        let msg = endpoints::to_update(&update);
                        obs.msg_sent();
                        yield msg;
                    }
                    None => {
                        // The watcher only closes a subscription to evict a
                        // subscriber that cannot drain its buffer.
                        evicted = true;
                        break;
                    }
                },

                res = identity_epoch.changed(), if identity_open => match res {
                    Ok(()) => {
                        if let Some(msg) = endpoints::to_identity_refresh(&snapshot) {
                            obs.msg_sent();
                            yield msg;
                        }
                    }
                    Err(_) => {
                        identity_open = false;
                    }
                },

                _ = (&mut shutdown) => {
                    return;
                }
            }
        }

        if evicted {
            send_timeouts.inc();
            obs.end(tonic::Code::DeadlineExceeded);
            Err(tonic::Status::deadline_exceeded("send timeout"))?;
        }
    })
}

fn single_update_stream(
    update: pb::Update,
    drain: drain::Watch,
    obs: ResponseObserver,
) -> BoxUpdateStream {
    Box::pin(async_stream::try_stream! {
        obs.msg_sent();
        yield update;
        // Hold the stream open until the client goes away or we shut down.
        let _ = drain.signaled().await;
    })
}

fn profile_stream(
    mut rx: linkerd_destination_controller_core::profiles::ProfileStream,
    drain: drain::Watch,
    obs: ResponseObserver,
) -> BoxProfileStream {
    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        loop {
            tokio::select! {
                res = rx.next() => match res {
                    Some(profile) => {
                        let msg = profiles::to_profile(&profile);
                        obs.msg_sent();
                        yield msg;
                    }
                    None => return,
                },

                _ = (&mut shutdown) => {
                    return;
                }
            }
        }
    })
}

fn single_profile_stream(
    profile: pb::DestinationProfile,
    drain: drain::Watch,
    obs: ResponseObserver,
) -> BoxProfileStream {
    Box::pin(async_stream::try_stream! {
        obs.msg_sent();
        yield profile;
        let _ = drain.signaled().await;
    })
}

/// Parses a `host:port` authority. Hosts may be DNS names, IPv4 literals, or
/// bracketed IPv6 literals.
fn parse_authority(path: &str) -> Result<Authority, InvalidAuthority> {
    let authority = path
        .parse::<http::uri::Authority>()
        .map_err(|_| InvalidAuthority(path.to_string()))?;
    let port = authority
        .port_u16()
        .ok_or_else(|| InvalidAuthority(path.to_string()))?;

    let host = authority.host();
    if let Some(host) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        let ip = host
            .parse::<IpAddr>()
            .map_err(|_| InvalidAuthority(path.to_string()))?;
        return Ok(Authority::Ip(ip, port));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(Authority::Ip(ip, port));
    }

    let port = NonZeroU16::new(port).ok_or_else(|| InvalidAuthority(path.to_string()))?;
    Ok(Authority::Name {
        host: host.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_authorities() {
        assert_eq!(
            parse_authority("web.emojivoto.svc.cluster.local:8080").unwrap(),
            Authority::Name {
                host: "web.emojivoto.svc.cluster.local".to_string(),
                port: 8080.try_into().unwrap(),
            }
        );
        assert_eq!(
            parse_authority("10.0.0.1:8080").unwrap(),
            Authority::Ip("10.0.0.1".parse().unwrap(), 8080)
        );
        assert_eq!(
            parse_authority("[2001:db8::1]:8080").unwrap(),
            Authority::Ip("2001:db8::1".parse().unwrap(), 8080)
        );
        assert!(parse_authority("").is_err());
        assert!(parse_authority("no-port").is_err());
        assert!(parse_authority("web.ns:not-a-port").is_err());
    }
}
