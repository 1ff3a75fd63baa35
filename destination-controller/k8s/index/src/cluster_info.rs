use crate::{ports::PortSet, DefaultPolicy};
use linkerd_destination_controller_core::IpNet;
use std::num::NonZeroU16;
use tokio::time;

/// Holds cluster metadata captured at boot.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// Networks including PodIPs in this cluster.
    ///
    /// Unfortunately, there's no way to discover this at runtime.
    pub networks: Vec<IpNet>,

    /// The namespace where the linkerd control plane is deployed.
    pub control_plane_ns: String,

    /// E.g. "cluster.local"
    pub dns_domain: String,

    /// The cluster's mesh identity trust domain.
    pub identity_trust_domain: String,

    /// The cluster-wide default inbound policy.
    pub default_policy: DefaultPolicy,

    /// The cluster-wide default protocol detection timeout.
    pub default_detect_timeout: time::Duration,

    /// The default set of ports to be marked opaque.
    pub default_opaque_ports: PortSet,

    /// Whether HTTP/1.1 destinations on meshed pods are hinted as
    /// HTTP/2-upgradable.
    pub enable_h2_upgrade: bool,
}

impl ClusterInfo {
    pub(crate) fn service_account_identity(&self, ns: &str, sa: &str) -> String {
        format!(
            "{}.{}.serviceaccount.identity.{}.{}",
            sa, ns, self.control_plane_ns, self.identity_trust_domain
        )
    }

    #[allow(dead_code)]
    pub(crate) fn service_dns_name(&self, ns: &str, svc: &str) -> String {
        format!("{}.{}.svc.{}", svc, ns, self.dns_domain)
    }

    /// Splits a fully-qualified in-cluster service name into its service and
    /// namespace parts. Returns `None` for authorities outside this cluster's
    /// DNS domain.
    pub fn parse_service_dns_name(&self, fqdn: &str) -> Option<(String, String)> {
        let rest = fqdn.strip_suffix(&self.dns_domain)?.strip_suffix('.')?;
        let rest = rest.strip_suffix("svc")?.strip_suffix('.')?;
        let (svc, ns) = rest.split_once('.')?;
        if svc.is_empty() || ns.is_empty() || ns.contains('.') {
            return None;
        }
        Some((svc.to_string(), ns.to_string()))
    }

    #[allow(dead_code)]
    pub(crate) fn service_authority(&self, ns: &str, svc: &str, port: NonZeroU16) -> String {
        format!("{}:{}", self.service_dns_name(ns, svc), port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> ClusterInfo {
        ClusterInfo {
            networks: vec![],
            control_plane_ns: "linkerd".to_string(),
            dns_domain: "cluster.local".to_string(),
            identity_trust_domain: "cluster.local".to_string(),
            default_policy: DefaultPolicy::Allow {
                authenticated_only: false,
                cluster_only: false,
            },
            default_detect_timeout: time::Duration::from_secs(10),
            default_opaque_ports: Default::default(),
            enable_h2_upgrade: true,
        }
    }

    #[test]
    fn parses_cluster_local_names() {
        let c = cluster();
        assert_eq!(
            c.parse_service_dns_name("web.emojivoto.svc.cluster.local"),
            Some(("web".to_string(), "emojivoto".to_string()))
        );
        assert_eq!(c.parse_service_dns_name("web.emojivoto.svc.other.domain"), None);
        assert_eq!(c.parse_service_dns_name("example.com"), None);
        assert_eq!(c.parse_service_dns_name("web.emojivoto.pod.cluster.local"), None);
    }

    #[test]
    fn derives_identity() {
        let c = cluster();
        assert_eq!(
            c.service_account_identity("emojivoto", "web"),
            "web.emojivoto.serviceaccount.identity.linkerd.cluster.local"
        );
    }
}
