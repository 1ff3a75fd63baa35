use super::index::{Index, SharedIndex, TargetState};
use crate::{ClusterInfo, DefaultPolicy};
use futures::prelude::*;
use kubert::index::IndexNamespacedResource;
use linkerd_destination_controller_core::endpoints::{AddressSet, ProtocolHint, Update};
use linkerd_destination_controller_k8s_api::{
    self as k8s,
    api::core::v1::{ObjectReference, PodIP},
    api::discovery::v1 as discovery,
};
use std::{net::IpAddr, num::NonZeroU16, sync::Arc};
use tokio::time;

fn cluster_info() -> ClusterInfo {
    ClusterInfo {
        networks: vec![
            "10.0.0.0/8".parse().unwrap(),
            "192.168.0.0/16".parse().unwrap(),
        ],
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

fn mk_index() -> SharedIndex {
    Index::shared(Arc::new(cluster_info()))
}

fn port(p: u16) -> NonZeroU16 {
    p.try_into().unwrap()
}

fn mk_service(ns: &str, name: &str, p: u16) -> k8s::Service {
    k8s::Service {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(k8s::ServiceSpec {
            ports: Some(vec![k8s::ServicePort {
                port: p as i32,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mk_external_name_service(ns: &str, name: &str) -> k8s::Service {
    k8s::Service {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(k8s::ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some("example.com".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mk_slice(
    ns: &str,
    name: &str,
    svc: &str,
    p: u16,
    endpoints: impl IntoIterator<Item = (&'static str, &'static str, bool)>,
) -> k8s::EndpointSlice {
    k8s::EndpointSlice {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(
                [(
                    "kubernetes.io/service-name".to_string(),
                    svc.to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        ports: Some(vec![discovery::EndpointPort {
            port: Some(p as i32),
            ..Default::default()
        }]),
        endpoints: endpoints
            .into_iter()
            .map(|(ip, pod, ready)| discovery::Endpoint {
                addresses: vec![ip.to_string()],
                conditions: Some(discovery::EndpointConditions {
                    ready: Some(ready),
                    ..Default::default()
                }),
                target_ref: Some(ObjectReference {
                    kind: Some("Pod".to_string()),
                    name: Some(pod.to_string()),
                    namespace: Some(ns.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
    }
}

fn mk_pod(ns: &str, name: &str, ip: &str, sa: &str, meshed: bool) -> k8s::Pod {
    let labels = if meshed {
        Some(
            [("linkerd.io/control-plane-ns".to_string(), "linkerd".to_string())]
                .into_iter()
                .collect(),
        )
    } else {
        None
    };
    k8s::Pod {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels,
            ..Default::default()
        },
        spec: Some(k8s::PodSpec {
            service_account_name: Some(sa.to_string()),
            ..Default::default()
        }),
        status: Some(k8s::PodStatus {
            pod_ips: Some(vec![PodIP {
                ip: ip.to_string(),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn addrs_of(set: &AddressSet) -> Vec<(IpAddr, u16)> {
    let mut addrs: Vec<_> = set.addresses.keys().map(|k| (k.ip, k.port)).collect();
    addrs.sort();
    addrs
}

#[tokio::test]
async fn snapshot_then_remove() {
    let index = mk_index();
    index.write().apply(mk_service("ns-0", "nginx", 8080));
    index.write().apply(mk_pod("ns-0", "pod-a", "10.0.0.1", "nginx", true));
    index.write().apply(mk_pod("ns-0", "pod-b", "10.0.0.2", "nginx", true));
    index.write().apply(mk_slice(
        "ns-0",
        "nginx-1",
        "nginx",
        8080,
        vec![("10.0.0.1", "pod-a", true), ("10.0.0.2", "pod-b", true)],
    ));

    let mut sub = Index::subscribe(&index, "ns-0", "nginx", port(8080));

    match sub.next().await.expect("initial update") {
        Update::Add(set) => {
            assert_eq!(
                addrs_of(&set),
                vec![
                    ("10.0.0.1".parse().unwrap(), 8080),
                    ("10.0.0.2".parse().unwrap(), 8080),
                ]
            );
            assert_eq!(set.labels["service"], "nginx");
            assert_eq!(set.labels["namespace"], "ns-0");
        }
        up => panic!("expected initial Add, got {up:?}"),
    }

    // Removing pod-b's endpoint produces a Remove for exactly that address.
    index.write().apply(mk_slice(
        "ns-0",
        "nginx-1",
        "nginx",
        8080,
        vec![("10.0.0.1", "pod-a", true)],
    ));
    match sub.next().await.expect("removal") {
        Update::Remove(keys) => {
            assert_eq!(keys.len(), 1);
            assert!(keys
                .iter()
                .any(|k| k.ip == "10.0.0.2".parse::<IpAddr>().unwrap() && k.port == 8080));
        }
        up => panic!("expected Remove, got {up:?}"),
    }

    assert!(sub.next().now_or_never().is_none(), "no spurious updates");
}

#[tokio::test]
async fn unknown_service_converges() {
    let index = mk_index();
    let mut sub = Index::subscribe(&index, "ns-0", "web", port(80));

    assert_eq!(
        sub.next().await,
        Some(Update::NoEndpoints { exists: false })
    );

    index.write().apply(mk_service("ns-0", "web", 80));
    assert_eq!(sub.next().await, Some(Update::NoEndpoints { exists: true }));

    index.write().apply(mk_pod("ns-0", "web-0", "10.0.0.9", "web", false));
    index.write().apply(mk_slice(
        "ns-0",
        "web-1",
        "web",
        80,
        vec![("10.0.0.9", "web-0", true)],
    ));
    match sub.next().await.expect("add") {
        Update::Add(set) => assert_eq!(addrs_of(&set), vec![("10.0.0.9".parse().unwrap(), 80)]),
        up => panic!("expected Add, got {up:?}"),
    }
}

#[tokio::test]
async fn identity_rotation_republishes() {
    let index = mk_index();
    index.write().apply(mk_service("ns-0", "web", 80));
    index.write().apply(mk_pod("ns-0", "web-0", "10.0.0.9", "sa-1", true));
    index.write().apply(mk_slice(
        "ns-0",
        "web-1",
        "web",
        80,
        vec![("10.0.0.9", "web-0", true)],
    ));

    let mut sub = Index::subscribe(&index, "ns-0", "web", port(80));
    match sub.next().await.expect("initial") {
        Update::Add(set) => {
            let addr = set.addresses.values().next().unwrap();
            assert_eq!(
                addr.identity.as_deref(),
                Some("sa-1.ns-0.serviceaccount.identity.linkerd.cluster.local")
            );
        }
        up => panic!("expected Add, got {up:?}"),
    }

    // A ServiceAccount change must republish the address as a removal
    // followed by an addition, never a silent mutation.
    index.write().apply(mk_pod("ns-0", "web-0", "10.0.0.9", "sa-2", true));

    match sub.next().await.expect("remove") {
        Update::Remove(keys) => assert_eq!(keys.len(), 1),
        up => panic!("expected Remove, got {up:?}"),
    }
    match sub.next().await.expect("add") {
        Update::Add(set) => {
            let addr = set.addresses.values().next().unwrap();
            assert_eq!(
                addr.identity.as_deref(),
                Some("sa-2.ns-0.serviceaccount.identity.linkerd.cluster.local")
            );
        }
        up => panic!("expected Add, got {up:?}"),
    }
}

#[tokio::test]
async fn external_name_is_unresolvable() {
    let index = mk_index();
    index
        .write()
        .apply(mk_external_name_service("ns-0", "external"));

    let mut sub = Index::subscribe(&index, "ns-0", "external", port(443));
    assert_eq!(
        sub.next().await,
        Some(Update::NoEndpoints { exists: false })
    );
}

#[tokio::test]
async fn not_ready_addresses_are_skipped() {
    let index = mk_index();
    index.write().apply(mk_service("ns-0", "web", 80));
    index.write().apply(mk_slice(
        "ns-0",
        "web-1",
        "web",
        80,
        vec![("10.0.0.1", "web-0", true), ("10.0.0.2", "web-1", false)],
    ));

    let mut sub = Index::subscribe(&index, "ns-0", "web", port(80));
    match sub.next().await.expect("initial") {
        Update::Add(set) => assert_eq!(addrs_of(&set), vec![("10.0.0.1".parse().unwrap(), 80)]),
        up => panic!("expected Add, got {up:?}"),
    }
}

#[tokio::test]
async fn meshed_pod_gets_h2_hint_and_opaque_override() {
    let index = mk_index();

    let mut svc = mk_service("ns-0", "web", 80);
    svc.metadata.annotations = Some(
        [("config.linkerd.io/opaque-ports".to_string(), "80".to_string())]
            .into_iter()
            .collect(),
    );

    index.write().apply(mk_service("ns-0", "plain", 80));
    index.write().apply(svc);
    index.write().apply(mk_pod("ns-0", "web-0", "10.0.0.9", "web", true));
    index.write().apply(mk_slice(
        "ns-0",
        "web-1",
        "web",
        80,
        vec![("10.0.0.9", "web-0", true)],
    ));
    index.write().apply(mk_slice(
        "ns-0",
        "plain-1",
        "plain",
        80,
        vec![("10.0.0.9", "web-0", true)],
    ));

    let mut sub = Index::subscribe(&index, "ns-0", "web", port(80));
    match sub.next().await.expect("initial") {
        Update::Add(set) => {
            let addr = set.addresses.values().next().unwrap();
            assert_eq!(addr.protocol_hint, ProtocolHint::Opaque);
            assert_eq!(addr.opaque_transport_port, Some(4143));
        }
        up => panic!("expected Add, got {up:?}"),
    }

    let mut sub = Index::subscribe(&index, "ns-0", "plain", port(80));
    match sub.next().await.expect("initial") {
        Update::Add(set) => {
            let addr = set.addresses.values().next().unwrap();
            assert_eq!(addr.protocol_hint, ProtocolHint::Http2);
            assert_eq!(addr.opaque_transport_port, None);
        }
        up => panic!("expected Add, got {up:?}"),
    }
}

#[tokio::test]
async fn diffs_materialize_current_set() {
    let index = mk_index();
    index.write().apply(mk_service("ns-0", "web", 80));

    let mut sub = Index::subscribe(&index, "ns-0", "web", port(80));
    let mut materialized = AddressSet::default();

    index.write().apply(mk_slice(
        "ns-0",
        "web-1",
        "web",
        80,
        vec![("10.0.0.1", "web-0", true), ("10.0.0.2", "web-1", true)],
    ));
    index.write().apply(mk_pod("ns-0", "web-0", "10.0.0.1", "sa", true));
    index.write().apply(mk_slice(
        "ns-0",
        "web-1",
        "web",
        80,
        vec![("10.0.0.1", "web-0", true), ("10.0.0.3", "web-2", true)],
    ));

    while let Some(Some(update)) = sub.next().now_or_never() {
        materialized.apply(&update);
    }

    let mut addrs = addrs_of(&materialized);
    addrs.sort();
    assert_eq!(
        addrs,
        vec![
            ("10.0.0.1".parse().unwrap(), 80),
            ("10.0.0.3".parse().unwrap(), 80),
        ]
    );
}

#[tokio::test]
async fn slow_subscriber_is_evicted() {
    let index = mk_index();
    index.write().apply(mk_service("ns-0", "web", 80));
    index.write().apply(mk_slice(
        "ns-0",
        "web-1",
        "web",
        80,
        vec![("10.0.0.1", "web-0", true)],
    ));

    let mut sub = Index::subscribe(&index, "ns-0", "web", port(80));

    // Churn the backing pod's metadata without draining the subscription
    // until the buffer overflows.
    for i in 0..200 {
        let sa = format!("sa-{i}");
        index.write().apply(mk_pod("ns-0", "web-0", "10.0.0.1", &sa, true));
    }

    let mut terminated = false;
    for _ in 0..1000 {
        match sub.next().now_or_never() {
            Some(Some(_)) => {}
            Some(None) => {
                terminated = true;
                break;
            }
            None => break,
        }
    }
    assert!(terminated, "overflowing subscriber must be evicted");
}

#[tokio::test]
async fn target_states() {
    let index = mk_index();
    index.write().apply(mk_service("ns-0", "web", 80));

    let idx = index.read();
    assert_eq!(idx.target_state("ns-0", "web", port(80)), TargetState::Watchable);
    assert_eq!(
        idx.target_state("ns-0", "web", port(9999)),
        TargetState::UnknownPort
    );
    assert_eq!(idx.target_state("ns-0", "nope", port(80)), TargetState::Unknown);
}

#[tokio::test]
async fn lookup_by_ip() {
    let index = mk_index();
    index.write().apply(mk_pod("ns-0", "web-0", "10.0.0.9", "web", true));

    let addr = index
        .read()
        .lookup_ip("10.0.0.9".parse().unwrap(), 8080)
        .expect("pod must be found by IP");
    assert_eq!(addr.port, 8080);
    assert_eq!(
        addr.identity.as_deref(),
        Some("web.ns-0.serviceaccount.identity.linkerd.cluster.local")
    );
    assert_eq!(addr.labels["pod"], "web-0");

    assert!(index
        .read()
        .lookup_ip("10.0.0.10".parse().unwrap(), 8080)
        .is_none());
}
