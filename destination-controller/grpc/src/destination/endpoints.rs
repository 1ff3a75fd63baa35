use linkerd2_proxy_api::{destination as pb, net};
use linkerd_destination_controller_core::endpoints::{
    Address, AddressSet, ProtocolHint, Update,
};
use std::net::IpAddr;

/// Translates a watcher diff to its wire form.
pub(super) fn to_update(update: &Update) -> pb::Update {
    match update {
        Update::Add(set) => to_add_update(set),
        Update::Remove(keys) => pb::Update {
            update: Some(pb::update::Update::Remove(pb::AddrSet {
                addrs: keys.iter().map(|key| to_tcp_address(key.ip, key.port)).collect(),
            })),
        },
        Update::NoEndpoints { exists } => pb::Update {
            update: Some(pb::update::Update::NoEndpoints(pb::NoEndpoints {
                exists: *exists,
            })),
        },
    }
}

pub(super) fn to_add_update(set: &AddressSet) -> pb::Update {
    pb::Update {
        update: Some(pb::update::Update::Add(pb::WeightedAddrSet {
            addrs: set.addresses.values().map(to_weighted_addr).collect(),
            metric_labels: set.labels.clone().into_iter().collect(),
        })),
    }
}

/// Republishes the identity-bearing addresses of a snapshot, as sent when the
/// issuer rotates. Returns `None` when no address carries an identity.
pub(super) fn to_identity_refresh(snapshot: &AddressSet) -> Option<pb::Update> {
    let addrs: Vec<pb::WeightedAddr> = snapshot
        .addresses
        .values()
        .filter(|addr| addr.identity.is_some())
        .map(to_weighted_addr)
        .collect();
    if addrs.is_empty() {
        return None;
    }
    Some(pb::Update {
        update: Some(pb::update::Update::Add(pb::WeightedAddrSet {
            addrs,
            metric_labels: snapshot.labels.clone().into_iter().collect(),
        })),
    })
}

/// An anonymous address set for an IP literal that resolves to no known pod.
pub(super) fn unmeshed_set(ip: IpAddr, port: u16) -> AddressSet {
    let addr = Address {
        ip,
        port,
        weight: 1,
        identity: None,
        protocol_hint: ProtocolHint::Unknown,
        opaque_transport_port: None,
        labels: Default::default(),
        hostname: None,
        zone: None,
        authority_override: None,
    };
    AddressSet {
        addresses: [(addr.key(), addr)].into_iter().collect(),
        labels: Default::default(),
    }
}

pub(super) fn to_weighted_addr(addr: &Address) -> pb::WeightedAddr {
    let mut metric_labels: std::collections::HashMap<String, String> =
        addr.labels.clone().into_iter().collect();
    if let Some(zone) = &addr.zone {
        metric_labels.insert("zone".to_string(), zone.clone());
    }
    if let Some(hostname) = &addr.hostname {
        metric_labels.insert("hostname".to_string(), hostname.clone());
    }

    let tls_identity = addr.identity.as_ref().map(|identity| {
        let name = pb::tls_identity::DnsLikeIdentity {
            name: identity.clone(),
        };
        pb::TlsIdentity {
            strategy: Some(pb::tls_identity::Strategy::DnsLikeIdentity(name.clone())),
            server_name: Some(name),
        }
    });

    let protocol_hint = match addr.protocol_hint {
        ProtocolHint::Unknown => None,
        ProtocolHint::Http2 => Some(pb::ProtocolHint {
            protocol: Some(pb::protocol_hint::Protocol::H2(pb::protocol_hint::H2 {})),
            opaque_transport: None,
        }),
        ProtocolHint::Opaque => Some(pb::ProtocolHint {
            protocol: Some(pb::protocol_hint::Protocol::Opaque(
                pb::protocol_hint::Opaque {},
            )),
            opaque_transport: addr.opaque_transport_port.map(|port| {
                pb::protocol_hint::OpaqueTransport {
                    inbound_port: port.into(),
                }
            }),
        }),
    };

    pb::WeightedAddr {
        addr: Some(to_tcp_address(addr.ip, addr.port)),
        weight: addr.weight,
        metric_labels,
        tls_identity,
        protocol_hint,
        authority_override: addr
            .authority_override
            .as_ref()
            .map(|authority| pb::AuthorityOverride {
                authority_override: authority.clone(),
            }),
        ..Default::default()
    }
}

pub(super) fn to_bare_weighted_addr(ip: IpAddr, port: u16) -> pb::WeightedAddr {
    pb::WeightedAddr {
        addr: Some(to_tcp_address(ip, port)),
        weight: 1,
        ..Default::default()
    }
}

fn to_tcp_address(ip: IpAddr, port: u16) -> net::TcpAddress {
    net::TcpAddress {
        ip: Some(to_ip_address(ip)),
        port: port.into(),
    }
}

fn to_ip_address(ip: IpAddr) -> net::IpAddress {
    let ip = match ip {
        IpAddr::V4(v4) => net::ip_address::Ip::Ipv4(u32::from(v4)),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let first = u64::from_be_bytes(octets[..8].try_into().unwrap());
            let last = u64::from_be_bytes(octets[8..].try_into().unwrap());
            net::ip_address::Ip::Ipv6(net::IPv6 { first, last })
        }
    };
    net::IpAddress { ip: Some(ip) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn from_tcp_address(addr: &net::TcpAddress) -> (IpAddr, u16) {
        let ip = match addr.ip.as_ref().and_then(|ip| ip.ip.as_ref()).unwrap() {
            net::ip_address::Ip::Ipv4(v4) => IpAddr::V4((*v4).into()),
            net::ip_address::Ip::Ipv6(v6) => {
                let mut octets = [0u8; 16];
                octets[..8].copy_from_slice(&v6.first.to_be_bytes());
                octets[8..].copy_from_slice(&v6.last.to_be_bytes());
                IpAddr::V6(octets.into())
            }
        };
        (ip, addr.port as u16)
    }

    /// Decoding a translated address yields the original
    /// `(ip, port, identity, protocol_hint, opaque)` tuple.
    #[test]
    fn weighted_addr_round_trips() {
        for ip in ["10.1.2.3", "2001:db8::42"] {
            let addr = Address {
                ip: ip.parse().unwrap(),
                port: 8080,
                weight: 10_000,
                identity: Some(
                    "web.emojivoto.serviceaccount.identity.linkerd.cluster.local".to_string(),
                ),
                protocol_hint: ProtocolHint::Opaque,
                opaque_transport_port: Some(4143),
                labels: BTreeMap::from([("pod".to_string(), "web-0".to_string())]),
                hostname: None,
                zone: Some("zone-a".to_string()),
                authority_override: None,
            };

            let wire = to_weighted_addr(&addr);

            assert_eq!(
                from_tcp_address(wire.addr.as_ref().unwrap()),
                (addr.ip, addr.port)
            );
            assert_eq!(wire.weight, 10_000);
            assert_eq!(
                wire.tls_identity
                    .as_ref()
                    .and_then(|id| id.server_name.as_ref())
                    .map(|name| name.name.as_str()),
                addr.identity.as_deref()
            );
            let hint = wire.protocol_hint.as_ref().unwrap();
            assert!(matches!(
                hint.protocol,
                Some(pb::protocol_hint::Protocol::Opaque(_))
            ));
            assert_eq!(
                hint.opaque_transport.as_ref().map(|t| t.inbound_port),
                Some(4143)
            );
            assert_eq!(wire.metric_labels["pod"], "web-0");
            assert_eq!(wire.metric_labels["zone"], "zone-a");
        }
    }

    #[test]
    fn unmeshed_addr_has_no_identity() {
        let addr = to_bare_weighted_addr("192.168.1.1".parse().unwrap(), 9000);
        assert!(addr.tls_identity.is_none());
        assert!(addr.protocol_hint.is_none());
        assert_eq!(
            from_tcp_address(addr.addr.as_ref().unwrap()),
            ("192.168.1.1".parse().unwrap(), 9000)
        );
    }

    #[test]
    fn no_endpoints_carries_existence() {
        for exists in [true, false] {
            let update = to_update(&Update::NoEndpoints { exists });
            match update.update {
                Some(pb::update::Update::NoEndpoints(ne)) => assert_eq!(ne.exists, exists),
                up => panic!("unexpected update: {up:?}"),
            }
        }
    }

    #[test]
    fn remove_translates_keys() {
        let keys = [AddrKey {
            ip: "10.0.0.1".parse().unwrap(),
            port: 8080,
        }]
        .into_iter()
        .collect();
        let update = to_update(&Update::Remove(keys));
        match update.update {
            Some(pb::update::Update::Remove(set)) => {
                assert_eq!(set.addrs.len(), 1);
                assert_eq!(
                    from_tcp_address(&set.addrs[0]),
                    ("10.0.0.1".parse().unwrap(), 8080)
                );
            }
            up => panic!("unexpected update: {up:?}"),
        }
    }

    #[test]
    fn identity_refresh_skips_unmeshed() {
        let meshed = Address {
            identity: Some("id".to_string()),
            ..unmeshed_set("10.0.0.1".parse().unwrap(), 80)
                .addresses
                .into_values()
                .next()
                .unwrap()
        };
        let unmeshed = unmeshed_set("10.0.0.2".parse().unwrap(), 80)
            .addresses
            .into_values()
            .next()
            .unwrap();

        let set = AddressSet {
            addresses: [(meshed.key(), meshed), (unmeshed.key(), unmeshed)]
                .into_iter()
                .collect(),
            labels: Default::default(),
        };

        match to_identity_refresh(&set).unwrap().update {
            Some(pb::update::Update::Add(add)) => assert_eq!(add.addrs.len(), 1),
            up => panic!("unexpected update: {up:?}"),
        }

        assert!(to_identity_refresh(&AddressSet::default()).is_none());
    }
}
