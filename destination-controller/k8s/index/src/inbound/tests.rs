use super::index::{Index, SharedIndex};
use crate::{ClusterInfo, DefaultPolicy};
use kubert::index::IndexNamespacedResource;
use linkerd_destination_controller_core::inbound::{
    AuthorizationRef, ClientAuthentication, ClientAuthorization, ProxyProtocol, ServerRef,
};
use linkerd_destination_controller_core::{IdentityMatch, IpNet, NetworkMatch};
use linkerd_destination_controller_k8s_api::{
    self as k8s,
    api::core::v1::{Container, ContainerPort},
    policy::server::Port,
};
use std::sync::Arc;
use tokio::time;

fn cluster_info() -> ClusterInfo {
    ClusterInfo {
        networks: vec!["10.0.0.0/8".parse().unwrap()],
        control_plane_ns: "linkerd".to_string(),
        dns_domain: "cluster.local".to_string(),
        identity_trust_domain: "cluster.local".to_string(),
        default_policy: DefaultPolicy::Allow {
            authenticated_only: false,
            cluster_only: false,
        },
        default_detect_timeout: time::Duration::from_secs(10),
        default_opaque_ports: Default::default(),
        enable_h2_upgrade: false,
    }
}

fn mk_index() -> SharedIndex {
    Index::shared(Arc::new(cluster_info()))
}

fn mk_pod(
    ns: impl ToString,
    name: impl ToString,
    containers: impl IntoIterator<Item = (impl ToString, impl IntoIterator<Item = ContainerPort>)>,
) -> k8s::Pod {
    k8s::Pod {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(
                [("app".to_string(), name.to_string())].into_iter().collect(),
            ),
            ..Default::default()
        },
        spec: Some(k8s::PodSpec {
            containers: containers
                .into_iter()
                .map(|(name, ports)| Container {
                    name: name.to_string(),
                    ports: Some(ports.into_iter().collect()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
        ..k8s::Pod::default()
    }
}

fn mk_server(
    ns: impl ToString,
    name: impl ToString,
    port: Port,
    srv_labels: impl IntoIterator<Item = (&'static str, &'static str)>,
    pod_labels: impl IntoIterator<Item = (&'static str, &'static str)>,
    proxy_protocol: Option<k8s::policy::server::ProxyProtocol>,
) -> k8s::policy::Server {
    k8s::policy::Server {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(
                srv_labels
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: k8s::policy::ServerSpec {
            port,
            pod_selector: pod_labels.into_iter().collect(),
            proxy_protocol,
        },
    }
}

fn mk_server_authz(
    ns: impl ToString,
    name: impl ToString,
    server: k8s::policy::server_authorization::Server,
    client: k8s::policy::server_authorization::Client,
) -> k8s::policy::ServerAuthorization {
    k8s::policy::ServerAuthorization {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: k8s::policy::ServerAuthorizationSpec { server, client },
    }
}

fn port_8080() -> ContainerPort {
    ContainerPort {
        container_port: 8080,
        name: Some("admin-http".to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

#[test]
fn pod_must_exist_for_lookup() {
    let index = mk_index();
    index
        .write()
        .pod_server_rx("ns-0", "pod-0", 8080.try_into().unwrap())
        .expect_err("pod-0.ns-0 must not exist");
}

#[test]
fn unselected_port_gets_default_policy() {
    let index = mk_index();
    index
        .write()
        .apply(mk_pod("ns-0", "pod-0", Some(("container-0", Some(port_8080())))));

    let rx = index
        .write()
        .pod_server_rx("ns-0", "pod-0", 8080.try_into().unwrap())
        .expect("pod must exist");
    let server = rx.borrow().clone();

    assert_eq!(
        server.reference,
        ServerRef::Default("all-unauthenticated")
    );
    assert!(matches!(server.protocol, ProxyProtocol::Detect { .. }));
    assert!(server
        .authorizations
        .contains_key(&AuthorizationRef::Default("all-unauthenticated")));
}

#[test]
fn server_selects_pod_port_by_name() {
    let index = mk_index();
    index
        .write()
        .apply(mk_pod("ns-0", "pod-0", Some(("container-0", Some(port_8080())))));

    let mut rx = index
        .write()
        .pod_server_rx("ns-0", "pod-0", 8080.try_into().unwrap())
        .expect("pod must exist");
    rx.borrow_and_update();

    index.write().apply(mk_server(
        "ns-0",
        "srv-admin",
        Port::Name("admin-http".to_string()),
        Some(("srv", "admin")),
        Some(("app", "pod-0")),
        Some(k8s::policy::server::ProxyProtocol::Http1),
    ));

    assert!(rx.has_changed().unwrap());
    let server = rx.borrow_and_update().clone();
    assert_eq!(server.reference, ServerRef::Server("srv-admin".to_string()));
    assert_eq!(server.protocol, ProxyProtocol::Http1);
    assert!(server.authorizations.is_empty());
}

#[test]
fn server_deletion_restores_default() {
    let index = mk_index();
    index
        .write()
        .apply(mk_pod("ns-0", "pod-0", Some(("container-0", Some(port_8080())))));
    index.write().apply(mk_server(
        "ns-0",
        "srv-admin",
        Port::Number(8080.try_into().unwrap()),
        Option::<(&str, &str)>::None,
        Some(("app", "pod-0")),
        None,
    ));

    let mut rx = index
        .write()
        .pod_server_rx("ns-0", "pod-0", 8080.try_into().unwrap())
        .expect("pod must exist");
    assert_eq!(
        rx.borrow_and_update().reference,
        ServerRef::Server("srv-admin".to_string())
    );

    <Index as IndexNamespacedResource<k8s::policy::Server>>::delete(
        &mut index.write(),
        "ns-0".to_string(),
        "srv-admin".to_string(),
    );

    assert!(rx.has_changed().unwrap());
    assert_eq!(
        rx.borrow().reference,
        ServerRef::Default("all-unauthenticated")
    );
}

#[test]
fn authorizations_apply_to_matching_server() {
    let index = mk_index();
    index
        .write()
        .apply(mk_pod("ns-0", "pod-0", Some(("container-0", Some(port_8080())))));
    index.write().apply(mk_server(
        "ns-0",
        "srv-admin",
        Port::Number(8080.try_into().unwrap()),
        Some(("srv", "admin")),
        Some(("app", "pod-0")),
        None,
    ));
    index.write().apply(mk_server_authz(
        "ns-0",
        "authz-by-name",
        k8s::policy::server_authorization::Server {
            name: Some("srv-admin".to_string()),
            selector: None,
        },
        k8s::policy::server_authorization::Client {
            networks: Some(vec![k8s::policy::server_authorization::Network {
                cidr: "10.0.0.0/8".parse().unwrap(),
                except: None,
            }]),
            unauthenticated: true,
            mesh_tls: None,
        },
    ));

    let rx = index
        .write()
        .pod_server_rx("ns-0", "pod-0", 8080.try_into().unwrap())
        .expect("pod must exist");
    let server = rx.borrow().clone();

    let authz = server
        .authorizations
        .get(&AuthorizationRef::ServerAuthorization(
            "authz-by-name".to_string(),
        ))
        .expect("authorization must apply");
    assert_eq!(
        *authz,
        ClientAuthorization {
            networks: vec![NetworkMatch {
                net: "10.0.0.0/8".parse::<IpNet>().unwrap(),
                except: vec![],
            }],
            authentication: ClientAuthentication::Unauthenticated,
        }
    );
}

#[test]
fn mesh_tls_authorization_derives_identities() {
    let index = mk_index();
    index
        .write()
        .apply(mk_pod("ns-0", "pod-0", Some(("container-0", Some(port_8080())))));
    index.write().apply(mk_server(
        "ns-0",
        "srv-admin",
        Port::Number(8080.try_into().unwrap()),
        Some(("srv", "admin")),
        Some(("app", "pod-0")),
        None,
    ));
    index.write().apply(mk_server_authz(
        "ns-0",
        "authz-mtls",
        k8s::policy::server_authorization::Server {
            name: None,
            selector: Some([("srv", "admin")].into_iter().collect()),
        },
        k8s::policy::server_authorization::Client {
            networks: None,
            unauthenticated: false,
            mesh_tls: Some(k8s::policy::server_authorization::MeshTls {
                unauthenticated_tls: false,
                identities: None,
                service_accounts: Some(vec![
                    k8s::policy::server_authorization::ServiceAccountRef {
                        namespace: None,
                        name: "api".to_string(),
                    },
                ]),
            }),
        },
    ));

    let rx = index
        .write()
        .pod_server_rx("ns-0", "pod-0", 8080.try_into().unwrap())
        .expect("pod must exist");
    let server = rx.borrow().clone();

    let authz = server
        .authorizations
        .get(&AuthorizationRef::ServerAuthorization("authz-mtls".to_string()))
        .expect("authorization must apply");
    assert_eq!(
        authz.authentication,
        ClientAuthentication::TlsAuthenticated(vec![IdentityMatch::Exact(
            "api.ns-0.serviceaccount.identity.linkerd.cluster.local".to_string()
        )])
    );
}

#[test]
fn overlapping_servers_resolve_to_oldest() {
    let index = mk_index();
    index
        .write()
        .apply(mk_pod("ns-0", "pod-0", Some(("container-0", Some(port_8080())))));

    let mut older = mk_server(
        "ns-0",
        "srv-older",
        Port::Number(8080.try_into().unwrap()),
        Option::<(&str, &str)>::None,
        Some(("app", "pod-0")),
        Some(k8s::policy::server::ProxyProtocol::Http1),
    );
    older.metadata.creation_timestamp = Some(k8s::Time(
        chrono::DateTime::from_timestamp(1000, 0).unwrap(),
    ));

    let mut younger = mk_server(
        "ns-0",
        "srv-younger",
        Port::Number(8080.try_into().unwrap()),
        Option::<(&str, &str)>::None,
        Some(("app", "pod-0")),
        Some(k8s::policy::server::ProxyProtocol::Http2),
    );
    younger.metadata.creation_timestamp = Some(k8s::Time(
        chrono::DateTime::from_timestamp(2000, 0).unwrap(),
    ));

    index.write().apply(younger);
    index.write().apply(older);

    let rx = index
        .write()
        .pod_server_rx("ns-0", "pod-0", 8080.try_into().unwrap())
        .expect("pod must exist");
    let server = rx.borrow().clone();
    assert_eq!(server.reference, ServerRef::Server("srv-older".to_string()));
    assert_eq!(server.protocol, ProxyProtocol::Http1);
}

#[test]
fn pod_default_policy_annotation_overrides_cluster_default() {
    let index = mk_index();

    let mut pod = mk_pod("ns-0", "pod-0", Some(("container-0", Some(port_8080()))));
    pod.metadata.annotations = Some(
        [(
            "config.linkerd.io/default-inbound-policy".to_string(),
            "deny".to_string(),
        )]
        .into_iter()
        .collect(),
    );
    index.write().apply(pod);

    let rx = index
        .write()
        .pod_server_rx("ns-0", "pod-0", 8080.try_into().unwrap())
        .expect("pod must exist");
    let server = rx.borrow().clone();
    assert_eq!(server.reference, ServerRef::Default("deny"));
    assert!(server.authorizations.is_empty());
}
