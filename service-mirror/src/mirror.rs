//! Pure construction and naming rules for mirror resources. Everything here
//! is deterministic so the reconciler's decisions can be tested without an
//! API server.

use crate::link::{
    Link, CLUSTER_NAME_LABEL, MIRRORED_SERVICE_LABEL, REMOTE_CLUSTER_ANNOTATION,
    REMOTE_GATEWAY_IDENTITY_ANNOTATION, REMOTE_RESOURCE_VERSION_ANNOTATION,
};
use linkerd_destination_controller_k8s_api::{self as k8s, ResourceExt};
use std::{collections::BTreeMap, net::IpAddr};

/// Derives the local mirror name for an exported remote service.
pub(crate) fn mirror_name(remote_name: &str, link_name: &str, prefix_strip: Option<&str>) -> String {
    let base = match prefix_strip {
        Some(prefix) => remote_name.strip_prefix(prefix).unwrap_or(remote_name),
        None => remote_name,
    };
    format!("{base}-{link_name}")
}

/// Builds the local mirror `Service` for an exported remote service.
pub(crate) fn mirror_service(
    remote: &k8s::Service,
    link: &Link,
    prefix_strip: Option<&str>,
) -> k8s::Service {
    let namespace = remote.namespace().unwrap_or_default();
    let name = mirror_name(&remote.name_unchecked(), &link.name, prefix_strip);

    let mut labels: BTreeMap<String, String> = remote.labels().clone();
    labels.insert(MIRRORED_SERVICE_LABEL.to_string(), "true".to_string());
    labels.insert(CLUSTER_NAME_LABEL.to_string(), link.name.clone());

    let annotations: BTreeMap<String, String> = [
        (
            REMOTE_CLUSTER_ANNOTATION.to_string(),
            link.target_cluster_name.clone(),
        ),
        (
            REMOTE_RESOURCE_VERSION_ANNOTATION.to_string(),
            remote.resource_version().unwrap_or_default(),
        ),
        (
            REMOTE_GATEWAY_IDENTITY_ANNOTATION.to_string(),
            link.gateway_identity.clone(),
        ),
    ]
    .into_iter()
    .collect();

    // Remote ports are preserved; the gateway terminates the connection and
    // forwards by SNI, so target ports are meaningless locally.
    let ports = remote
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.clone())
        .map(|ports| {
            ports
                .into_iter()
                .map(|port| k8s::ServicePort {
                    name: port.name,
                    port: port.port,
                    protocol: port.protocol,
                    ..Default::default()
                })
                .collect()
        });

    k8s::Service {
        metadata: k8s::ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(k8s::ServiceSpec {
            ports,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds the mirror's `Endpoints`, whose sole subset addresses the link's
/// gateway.
pub(crate) fn mirror_endpoints(
    mirror: &k8s::Service,
    link: &Link,
    gateway_ips: &[IpAddr],
) -> k8s::Endpoints {
    let ports = mirror
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|port| k8s::api::core::v1::EndpointPort {
                    name: port.name.clone(),
                    port: link.gateway_port.get().into(),
                    protocol: port.protocol.clone(),
                    ..Default::default()
                })
                .collect()
        });

    let addresses: Vec<k8s::EndpointAddress> = gateway_ips
        .iter()
        .map(|ip| k8s::EndpointAddress {
            ip: ip.to_string(),
            ..Default::default()
        })
        .collect();

    let subsets = if addresses.is_empty() {
        None
    } else {
        Some(vec![k8s::EndpointSubset {
            addresses: Some(addresses),
            ports,
            ..Default::default()
        }])
    };

    k8s::Endpoints {
        metadata: k8s::ObjectMeta {
            name: mirror.metadata.name.clone(),
            namespace: mirror.metadata.namespace.clone(),
            labels: mirror.metadata.labels.clone(),
            annotations: mirror.metadata.annotations.clone(),
            ..Default::default()
        },
        subsets,
    }
}

/// Whether the local mirror is already up to date with the observed remote
/// resource version.
pub(crate) fn is_current(local: &k8s::Service, remote_version: Option<&str>) -> bool {
    let Some(remote_version) = remote_version else {
        return false;
    };
    local
        .annotations()
        .get(REMOTE_RESOURCE_VERSION_ANNOTATION)
        .is_some_and(|observed| observed == remote_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::DEFAULT_EXPORT_SELECTOR;
    use std::time::Duration;

    pub(crate) fn mk_link() -> Link {
        Link {
            name: "east".to_string(),
            namespace: "linkerd-multicluster".to_string(),
            target_cluster_name: "east".to_string(),
            credentials_secret: "cluster-credentials-east".to_string(),
            gateway_address: "203.0.113.10".to_string(),
            gateway_port: 4143.try_into().unwrap(),
            gateway_identity:
                "linkerd-gateway.linkerd-multicluster.serviceaccount.identity.linkerd.cluster.local"
                    .to_string(),
            probe_path: "/ready".to_string(),
            probe_port: 4191.try_into().unwrap(),
            probe_period: Duration::from_secs(10),
            export_selector: DEFAULT_EXPORT_SELECTOR.to_string(),
        }
    }

    fn mk_remote(ns: &str, name: &str, version: &str, port: i32) -> k8s::Service {
        k8s::Service {
            metadata: k8s::ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                resource_version: Some(version.to_string()),
                labels: Some(
                    [("mirror.linkerd.io/exported".to_string(), "true".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(k8s::ServiceSpec {
                ports: Some(vec![k8s::ServicePort {
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn derives_mirror_names() {
        assert_eq!(mirror_name("web", "east", None), "web-east");
        assert_eq!(
            mirror_name("prod-web", "east", Some("prod-")),
            "web-east"
        );
        // A name that does not carry the prefix is left intact.
        assert_eq!(mirror_name("web", "east", Some("prod-")), "web-east");
    }

    #[test]
    fn builds_mirror_service() {
        let link = mk_link();
        let remote = mk_remote("web-ns", "web", "42", 8080);

        let mirror = mirror_service(&remote, &link, None);
        assert_eq!(mirror.name_unchecked(), "web-east");
        assert_eq!(mirror.namespace().as_deref(), Some("web-ns"));
        assert_eq!(mirror.labels()[MIRRORED_SERVICE_LABEL], "true");
        assert_eq!(mirror.labels()[CLUSTER_NAME_LABEL], "east");
        assert_eq!(mirror.annotations()[REMOTE_RESOURCE_VERSION_ANNOTATION], "42");
        assert_eq!(
            mirror.annotations()[REMOTE_GATEWAY_IDENTITY_ANNOTATION],
            link.gateway_identity
        );
        let ports = mirror.spec.unwrap().ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 8080);
    }

    #[test]
    fn builds_gateway_endpoints() {
        let link = mk_link();
        let remote = mk_remote("web-ns", "web", "42", 8080);
        let mirror = mirror_service(&remote, &link, None);

        let endpoints = mirror_endpoints(&mirror, &link, &["203.0.113.10".parse().unwrap()]);
        let subsets = endpoints.subsets.expect("one subset");
        assert_eq!(subsets.len(), 1);
        assert_eq!(subsets[0].addresses.as_ref().unwrap()[0].ip, "203.0.113.10");
        assert_eq!(subsets[0].ports.as_ref().unwrap()[0].port, 4143);
    }

    #[test]
    fn unresolved_gateway_empties_endpoints() {
        let link = mk_link();
        let remote = mk_remote("web-ns", "web", "42", 8080);
        let mirror = mirror_service(&remote, &link, None);

        let endpoints = mirror_endpoints(&mirror, &link, &[]);
        assert!(endpoints.subsets.is_none());
    }

    #[test]
    fn version_skip_is_detected() {
        let link = mk_link();
        let remote = mk_remote("web-ns", "web", "42", 8080);
        let mirror = mirror_service(&remote, &link, None);

        assert!(is_current(&mirror, Some("42")));
        assert!(!is_current(&mirror, Some("43")));
        assert!(!is_current(&mirror, None));
    }
}
