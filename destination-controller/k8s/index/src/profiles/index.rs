//! One publisher exists per `(authority, client-namespace)` subscription key.
//! Publishers carry complete profiles over `watch` channels: a subscriber
//! that lags simply observes the latest effective profile, which is always
//! correct for full-state feeds.
//!
//! Resolution precedence, highest first: a profile in the client's namespace
//! (from the stream's context token), then a profile in the destination's
//! namespace, then the default empty profile. External authorities have no
//! destination namespace and resolve through the client namespace only.

use crate::ClusterInfo;
use ahash::AHashMap as HashMap;
use linkerd_destination_controller_core::profiles::{
    Profile, RequestMatch, ResponseClass, ResponseMatch, RetryBudget, Route, WeightedDst,
};
use linkerd_destination_controller_k8s_api::{profile as api, ResourceExt};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::info_span;

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Debug)]
pub struct Index {
    cluster_info: Arc<ClusterInfo>,

    /// Converted profiles by `(namespace, fully-qualified name)`.
    profiles: HashMap<(String, String), Profile>,

    publishers: HashMap<SubKey, watch::Sender<Profile>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SubKey {
    fqdn: String,
    client_ns: Option<String>,
}

// === impl Index ===

impl Index {
    pub fn shared(cluster_info: impl Into<Arc<ClusterInfo>>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            cluster_info: cluster_info.into(),
            profiles: HashMap::default(),
            publishers: HashMap::default(),
        }))
    }

    /// Obtains a receiver for the authority's effective profile. The current
    /// value is always available for immediate consumption.
    pub fn profile_rx(
        &mut self,
        fqdn: &str,
        client_ns: Option<String>,
    ) -> watch::Receiver<Profile> {
        let key = SubKey {
            fqdn: fqdn.to_string(),
            client_ns,
        };
        let profile = self.effective(&key);
        self.publishers
            .entry(key)
            .or_insert_with(|| watch::channel(profile).0)
            .subscribe()
    }

    fn effective(&self, key: &SubKey) -> Profile {
        if let Some(client_ns) = &key.client_ns {
            if let Some(profile) = self.profiles.get(&(client_ns.clone(), key.fqdn.clone())) {
                return profile.clone();
            }
        }
        if let Some((_, dst_ns)) = self.cluster_info.parse_service_dns_name(&key.fqdn) {
            if let Some(profile) = self.profiles.get(&(dst_ns, key.fqdn.clone())) {
                return profile.clone();
            }
        }
        Profile {
            fully_qualified_name: key.fqdn.clone(),
            ..Default::default()
        }
    }

    fn republish(&mut self, fqdn: &str) {
        let keys: Vec<SubKey> = self
            .publishers
            .keys()
            .filter(|key| key.fqdn == fqdn)
            .cloned()
            .collect();
        for key in keys {
            let profile = self.effective(&key);
            if let Some(tx) = self.publishers.get(&key) {
                tx.send_if_modified(|current| {
                    if *current == profile {
                        false
                    } else {
                        *current = profile.clone();
                        true
                    }
                });
            }
        }
        self.gc();
    }

    /// Drops publishers that have neither subscribers nor a backing resource.
    fn gc(&mut self) {
        let profiles = &self.profiles;
        self.publishers.retain(|key, tx| {
            tx.receiver_count() > 0
                || profiles
                    .keys()
                    .any(|(_, name)| *name == key.fqdn)
        });
    }
}

impl kubert::index::IndexNamespacedResource<api::ServiceProfile> for Index {
    fn apply(&mut self, sp: api::ServiceProfile) {
        let namespace = sp.namespace().unwrap();
        let name = sp.name_unchecked();
        let _span = info_span!("apply", ns = %namespace, %name).entered();

        let profile = convert_profile(&name, sp.spec);
        self.profiles.insert((namespace, name.clone()), profile);
        self.republish(&name);
    }

    fn delete(&mut self, namespace: String, name: String) {
        tracing::debug!(%namespace, %name, "delete");
        if self.profiles.remove(&(namespace, name.clone())).is_some() {
            self.republish(&name);
        }
    }
}

// === Conversions ===

fn convert_profile(fqdn: &str, spec: api::ServiceProfileSpec) -> Profile {
    let routes = spec
        .routes
        .into_iter()
        .flatten()
        .filter_map(|route| match convert_route(&route) {
            Ok(route) => Some(route),
            Err(error) => {
                tracing::info!(%error, "Ignoring invalid route");
                None
            }
        })
        .collect();

    Profile {
        fully_qualified_name: fqdn.to_string(),
        routes,
        retry_budget: spec.retry_budget.map(|rb| RetryBudget {
            ratio: rb.retry_ratio,
            min_retries_per_second: rb.min_retries_per_second,
            ttl: rb.ttl.into(),
        }),
        dst_overrides: spec
            .dst_overrides
            .into_iter()
            .flatten()
            .map(|dst| WeightedDst {
                authority: dst.authority,
                weight: dst.weight,
            })
            .collect(),
        opaque_protocol: spec.opaque_protocol,
    }
}

fn convert_route(route: &api::RouteSpec) -> anyhow::Result<Route> {
    let mut labels = BTreeMap::new();
    if let Some(name) = &route.name {
        labels.insert("route".to_string(), name.clone());
    }

    Ok(Route {
        condition: convert_request_match(&route.condition)?,
        response_classes: route
            .response_classes
            .iter()
            .flatten()
            .map(|class| {
                Ok(ResponseClass {
                    condition: convert_response_match(&class.condition)?,
                    is_failure: class.is_failure,
                })
            })
            .collect::<anyhow::Result<_>>()?,
        retryable: route.is_retryable,
        timeout: route.timeout.map(Into::into),
        labels,
    })
}

fn convert_request_match(m: &api::RequestMatch) -> anyhow::Result<RequestMatch> {
    let mut matches = Vec::new();
    if let Some(regex) = &m.path_regex {
        matches.push(RequestMatch::Path(regex.clone()));
    }
    if let Some(method) = &m.method {
        let method = http::Method::from_bytes(method.as_bytes())
            .map_err(|_| anyhow::anyhow!("invalid method: {method}"))?;
        matches.push(RequestMatch::Method(method));
    }
    if let Some(all) = &m.all {
        matches.push(RequestMatch::All(
            all.iter()
                .map(convert_request_match)
                .collect::<anyhow::Result<_>>()?,
        ));
    }
    if let Some(any) = &m.any {
        matches.push(RequestMatch::Any(
            any.iter()
                .map(convert_request_match)
                .collect::<anyhow::Result<_>>()?,
        ));
    }
    if let Some(not) = &m.not {
        matches.push(RequestMatch::Not(Box::new(convert_request_match(not)?)));
    }

    match matches.len() {
        0 => anyhow::bail!("request match has no condition"),
        1 => Ok(matches.into_iter().next().unwrap()),
        _ => Ok(RequestMatch::All(matches)),
    }
}

fn convert_response_match(m: &api::ResponseMatch) -> anyhow::Result<ResponseMatch> {
    let mut matches = Vec::new();
    if let Some(status) = &m.status {
        let min = status.min.unwrap_or(100);
        let max = status.max.unwrap_or(599);
        let min = u16::try_from(min).map_err(|_| anyhow::anyhow!("invalid status: {min}"))?;
        let max = u16::try_from(max).map_err(|_| anyhow::anyhow!("invalid status: {max}"))?;
        matches.push(ResponseMatch::Status { min, max });
    }
    if let Some(all) = &m.all {
        matches.push(ResponseMatch::All(
            all.iter()
                .map(convert_response_match)
                .collect::<anyhow::Result<_>>()?,
        ));
    }
    if let Some(any) = &m.any {
        matches.push(ResponseMatch::Any(
            any.iter()
                .map(convert_response_match)
                .collect::<anyhow::Result<_>>()?,
        ));
    }
    if let Some(not) = &m.not {
        matches.push(ResponseMatch::Not(Box::new(convert_response_match(not)?)));
    }

    match matches.len() {
        0 => anyhow::bail!("response match has no condition"),
        1 => Ok(matches.into_iter().next().unwrap()),
        _ => Ok(ResponseMatch::All(matches)),
    }
}
