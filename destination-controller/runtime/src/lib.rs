pub use linkerd_destination_controller_core as core;
pub use linkerd_destination_controller_grpc as grpc;
pub use linkerd_destination_controller_k8s_api as k8s;
pub use linkerd_destination_controller_k8s_index as index;

mod args;
mod index_list;

pub use self::args::Args;

use self::grpc::destination::{EndpointsTarget, ProfileTarget};
use self::grpc::workload::Workload;
use std::{net::IpAddr, num::NonZeroU16};

/// Serves endpoint discovery from the shared endpoint index.
#[derive(Clone, Debug)]
struct EndpointsDiscover(index::endpoints::SharedIndex);

#[derive(Clone, Debug)]
struct ProfilesDiscover(index::profiles::SharedIndex);

#[derive(Clone, Debug)]
struct InboundDiscover(index::inbound::SharedIndex);

impl EndpointsDiscover {
    fn new(index: index::endpoints::SharedIndex) -> Self {
        Self(index)
    }
}

impl ProfilesDiscover {
    fn new(index: index::profiles::SharedIndex) -> Self {
        Self(index)
    }
}

impl InboundDiscover {
    fn new(index: index::inbound::SharedIndex) -> Self {
        Self(index)
    }
}

#[async_trait::async_trait]
impl core::endpoints::DiscoverEndpoints<EndpointsTarget> for EndpointsDiscover {
    async fn watch_endpoints(
        &self,
        EndpointsTarget {
            namespace,
            service,
            port,
        }: EndpointsTarget,
    ) -> anyhow::Result<Option<core::endpoints::EndpointsStream>> {
        // A port the service declares nothing about is a client error; an
        // unknown service is watchable since it may appear later.
        let state = self.0.read().target_state(&namespace, &service, port);
        if state == index::endpoints::TargetState::UnknownPort {
            return Ok(None);
        }
        let subscription = index::endpoints::Index::subscribe(&self.0, &namespace, &service, port);
        Ok(Some(Box::pin(subscription)))
    }

    fn lookup_ip(&self, ip: IpAddr, port: u16) -> Option<core::endpoints::Address> {
        self.0.read().lookup_ip(ip, port)
    }
}

#[async_trait::async_trait]
impl core::profiles::DiscoverProfile<ProfileTarget> for ProfilesDiscover {
    async fn watch_profile(
        &self,
        ProfileTarget { fqdn, client_ns }: ProfileTarget,
    ) -> anyhow::Result<Option<core::profiles::ProfileStream>> {
        let rx = self.0.write().profile_rx(&fqdn, client_ns);
        Ok(Some(Box::pin(
            tokio_stream::wrappers::WatchStream::new(rx),
        )))
    }
}

#[async_trait::async_trait]
impl core::inbound::DiscoverInboundServer<(Workload, NonZeroU16)> for InboundDiscover {
    async fn get_inbound_server(
        &self,
        (workload, port): (Workload, NonZeroU16),
    ) -> anyhow::Result<Option<core::inbound::InboundServer>> {
        let rx = self
            .0
            .write()
            .pod_server_rx(&workload.namespace, &workload.pod, port);

        if let Ok(rx) = rx {
            let server = (*rx.borrow()).clone();
            Ok(Some(server))
        } else {
            Ok(None)
        }
    }

    async fn watch_inbound_server(
        &self,
        (workload, port): (Workload, NonZeroU16),
    ) -> anyhow::Result<Option<core::inbound::InboundServerStream>> {
        let rx = self
            .0
            .write()
            .pod_server_rx(&workload.namespace, &workload.pod, port);

        if let Ok(rx) = rx {
            Ok(Some(Box::pin(tokio_stream::wrappers::WatchStream::new(rx))))
        } else {
            Ok(None)
        }
    }
}
