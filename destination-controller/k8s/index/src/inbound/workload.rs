use crate::{
    ports::{PortHasher, PortSet},
    DefaultPolicy,
};
use ahash::AHashMap as HashMap;
use linkerd_destination_controller_k8s_api as k8s;
use std::num::NonZeroU16;

/// Holds pod metadata/config that can change.
#[derive(Debug, PartialEq)]
pub(crate) struct Meta {
    /// The pod's labels. Used by `Server` pod selectors.
    pub labels: k8s::Labels,

    /// The pod's default policy, as overridden by annotation.
    pub default_policy: Option<DefaultPolicy>,
}

/// A `HashMap` specialized for ports.
pub(crate) type PortMap<V> =
    std::collections::HashMap<NonZeroU16, V, std::hash::BuildHasherDefault<PortHasher>>;

/// Gets the set of named TCP ports from a pod spec.
pub(crate) fn tcp_ports_by_name(spec: &k8s::PodSpec) -> HashMap<String, PortSet> {
    let mut port_names = HashMap::<String, PortSet>::default();
    for container in &spec.containers {
        for port in container.ports.iter().flatten() {
            if let None | Some("TCP") = port.protocol.as_deref() {
                if let Some(name) = &port.name {
                    if let Some(port) = u16::try_from(port.container_port)
                        .ok()
                        .and_then(NonZeroU16::new)
                    {
                        port_names.entry(name.clone()).or_default().insert(port);
                    }
                }
            }
        }
    }
    port_names
}

impl Meta {
    pub(crate) fn from_metadata(meta: k8s::ObjectMeta) -> Self {
        let default_policy = meta
            .annotations
            .as_ref()
            .and_then(|anns| anns.get("config.linkerd.io/default-inbound-policy"))
            .and_then(|value| {
                value
                    .parse()
                    .map_err(
                        |error| tracing::warn!(%error, "invalid default policy annotation value"),
                    )
                    .ok()
            });
        Self {
            labels: meta.labels.into(),
            default_policy,
        }
    }
}
