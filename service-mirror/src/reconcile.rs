//! The reconciliation worker: a single task that drains the event queue and
//! converges local mirror state. Processing is at-least-once; failures
//! re-enqueue with backoff and surface as Kubernetes Events on the `Link`.

use crate::{
    link::{Link, CLUSTER_NAME_LABEL, MIRRORED_SERVICE_LABEL},
    metrics::Metrics,
    mirror,
    queue::{Event, Queue, Receiver},
};
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event as ClusterEvent, EventType, Recorder};
use linkerd_destination_controller_k8s_api::{self as k8s, ResourceExt};
use std::{collections::HashMap, net::IpAddr};
use tracing::{debug, info, warn};

pub(crate) struct Reconciler {
    local: k8s::Client,
    remote: k8s::Client,
    link: Link,
    prefix_strip: Option<String>,
    metrics: Metrics,
    recorder: Recorder,
    link_ref: ObjectReference,

    /// Tracks which remote service holds each local mirror name. Collisions
    /// (possible when a stripped prefix makes two remote names coincide)
    /// resolve to the older remote resource.
    claims: HashMap<(String, String), Claim>,
}

#[derive(Clone, Debug, PartialEq)]
struct Claim {
    remote_name: String,
    created_at: Option<k8s::Time>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local: k8s::Client,
        remote: k8s::Client,
        link: Link,
        prefix_strip: Option<String>,
        metrics: Metrics,
        recorder: Recorder,
        link_ref: ObjectReference,
    ) -> Self {
        Self {
            local,
            remote,
            link,
            prefix_strip,
            metrics,
            recorder,
            link_ref,
            claims: HashMap::new(),
        }
    }

    /// Drains the queue until teardown. `ClusterUnregistered` garbage-collects
    /// every mirror for this link and terminates the worker.
    pub(crate) async fn run(mut self, mut rx: Receiver, queue: Queue) {
        while let Some((event, attempt)) = rx.recv().await {
            let terminal = matches!(event, Event::ClusterUnregistered);
            debug!(?event, attempt, "processing");
            match self.process(event.clone(), attempt).await {
                Ok(()) => {
                    if terminal {
                        info!("link unregistered; worker stopping");
                        return;
                    }
                }
                Err(error) => {
                    warn!(%error, "reconciliation failed");
                    self.metrics.retried(&self.link.target_cluster_name);
                    self.record(EventType::Warning, "ReconcileFailed", format!("{error:#}"))
                        .await;
                    queue.retry(event, attempt + 1);
                }
            }
        }
    }

    async fn process(&mut self, event: Event, attempt: u32) -> Result<()> {
        match event {
            Event::RemoteServiceCreated(svc) | Event::RemoteServiceUpdated(svc) => {
                self.apply_remote(svc, attempt).await
            }
            Event::RemoteServiceDeleted { namespace, name } => {
                self.remove_remote(&namespace, &name).await
            }
            Event::GcOrphanedServices => self.gc_orphans().await,
            Event::RepairEndpoints => self.repair_endpoints().await,
            Event::ClusterUnregistered => self.unregister().await,
        }
    }

    async fn apply_remote(&mut self, remote: k8s::Service, attempt: u32) -> Result<()> {
        let namespace = remote.namespace().context("service must be namespaced")?;
        let remote_name = remote.name_unchecked();

        // A retried payload may be stale: the remote service can change or
        // disappear while the event backs off. Reconcile retries against the
        // remote's current state instead of replaying the cached object.
        let remote = if attempt == 0 {
            remote
        } else {
            match self.fetch_exported(&namespace, &remote_name).await? {
                Some(current) => current,
                None => {
                    debug!(%namespace, %remote_name, "remote service no longer exported");
                    return self.remove_remote(&namespace, &remote_name).await;
                }
            }
        };

        let mirror_name = mirror::mirror_name(
            &remote_name,
            &self.link.name,
            self.prefix_strip.as_deref(),
        );

        // Resolve mirror-name collisions to the older remote resource.
        let claim = Claim {
            remote_name: remote_name.clone(),
            created_at: remote.metadata.creation_timestamp.clone(),
        };
        let claim_key = (namespace.clone(), mirror_name.clone());
        if let Some(existing) = self.claims.get(&claim_key) {
            if existing.remote_name != claim.remote_name && !yields_to(existing, &claim) {
                warn!(
                    %namespace,
                    %mirror_name,
                    holder = %existing.remote_name,
                    ignored = %claim.remote_name,
                    "mirror name collision; older resource wins"
                );
                self.record(
                    EventType::Warning,
                    "MirrorNameCollision",
                    format!(
                        "{namespace}/{remote_name} is ignored: mirror name {mirror_name} is held by {namespace}/{}",
                        existing.remote_name
                    ),
                )
                .await;
                return Ok(());
            }
        }
        self.claims.insert(claim_key, claim);

        let services = k8s::Api::<k8s::Service>::namespaced(self.local.clone(), &namespace);
        if let Some(local) = services.get_opt(&mirror_name).await? {
            if !local.labels().contains_key(MIRRORED_SERVICE_LABEL) {
                // Mirrors are created by this controller, never by users; do
                // not clobber an unrelated service.
                self.record(
                    EventType::Warning,
                    "MirrorNameTaken",
                    format!("{namespace}/{mirror_name} exists and is not a mirror"),
                )
                .await;
                anyhow::bail!("{namespace}/{mirror_name} exists and is not a mirror");
            }
            if mirror::is_current(&local, remote.resource_version().as_deref()) {
                debug!(%namespace, %mirror_name, "mirror is current");
                return Ok(());
            }
        }

        let svc = mirror::mirror_service(&remote, &self.link, self.prefix_strip.as_deref());
        let gateway_ips = self.resolve_gateway().await?;
        let endpoints = mirror::mirror_endpoints(&svc, &self.link, &gateway_ips);

        create_or_patch(&services, &mirror_name, &svc).await?;
        let endpoints_api =
            k8s::Api::<k8s::Endpoints>::namespaced(self.local.clone(), &namespace);
        create_or_patch(&endpoints_api, &mirror_name, &endpoints).await?;

        info!(%namespace, %mirror_name, "mirror reconciled");
        Ok(())
    }

    async fn remove_remote(&mut self, namespace: &str, remote_name: &str) -> Result<()> {
        let mirror_name =
            mirror::mirror_name(remote_name, &self.link.name, self.prefix_strip.as_deref());
        let claim_key = (namespace.to_string(), mirror_name.clone());
        if let Some(claim) = self.claims.get(&claim_key) {
            if claim.remote_name == remote_name {
                self.claims.remove(&claim_key);
            }
        }

        // Deleting the Service cascades to its Endpoints.
        self.delete_mirror(namespace, &mirror_name).await
    }

    async fn delete_mirror(&self, namespace: &str, mirror_name: &str) -> Result<()> {
        let services = k8s::Api::<k8s::Service>::namespaced(self.local.clone(), namespace);
        match services
            .delete(mirror_name, &k8s::DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(%namespace, %mirror_name, "mirror deleted");
                Ok(())
            }
            Err(k8s::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(error).context("failed to delete mirror"),
        }
    }

    /// Deletes every local mirror whose exported counterpart is gone.
    async fn gc_orphans(&mut self) -> Result<()> {
        let local_mirrors = self.list_local_mirrors().await?;

        let remote = k8s::Api::<k8s::Service>::all(self.remote.clone())
            .list(&k8s::ListParams::default().labels(&self.link.export_selector))
            .await
            .context("failed to list exported services")?;
        let exported: std::collections::HashSet<(String, String)> = remote
            .items
            .iter()
            .map(|svc| {
                (
                    svc.namespace().unwrap_or_default(),
                    mirror::mirror_name(
                        &svc.name_unchecked(),
                        &self.link.name,
                        self.prefix_strip.as_deref(),
                    ),
                )
            })
            .collect();

        for svc in local_mirrors {
            let namespace = svc.namespace().unwrap_or_default();
            let name = svc.name_unchecked();
            if !exported.contains(&(namespace.clone(), name.clone())) {
                info!(%namespace, %name, "deleting orphaned mirror");
                self.delete_mirror(&namespace, &name).await?;
                self.claims.remove(&(namespace, name));
            }
        }
        Ok(())
    }

    /// Rewrites every mirror's endpoints to the link's current gateway
    /// addresses.
    async fn repair_endpoints(&mut self) -> Result<()> {
        let gateway_ips = self.resolve_gateway().await?;
        for svc in self.list_local_mirrors().await? {
            let namespace = svc.namespace().unwrap_or_default();
            let name = svc.name_unchecked();
            let endpoints = mirror::mirror_endpoints(&svc, &self.link, &gateway_ips);
            let api = k8s::Api::<k8s::Endpoints>::namespaced(self.local.clone(), &namespace);
            create_or_patch(&api, &name, &endpoints).await?;
        }
        self.metrics.repaired(&self.link.target_cluster_name);
        Ok(())
    }

    async fn unregister(&mut self) -> Result<()> {
        for svc in self.list_local_mirrors().await? {
            let namespace = svc.namespace().unwrap_or_default();
            let name = svc.name_unchecked();
            self.delete_mirror(&namespace, &name).await?;
        }
        self.claims.clear();
        Ok(())
    }

    /// Fetches a remote service by name, filtered to the link's export
    /// selector. `None` means the service is gone or no longer exported.
    async fn fetch_exported(&self, namespace: &str, name: &str) -> Result<Option<k8s::Service>> {
        let list = k8s::Api::<k8s::Service>::namespaced(self.remote.clone(), namespace)
            .list(
                &k8s::ListParams::default()
                    .labels(&self.link.export_selector)
                    .fields(&format!("metadata.name={name}")),
            )
            .await
            .context("failed to fetch remote service")?;
        Ok(list.items.into_iter().next())
    }

    async fn list_local_mirrors(&self) -> Result<Vec<k8s::Service>> {
        let list = k8s::Api::<k8s::Service>::all(self.local.clone())
            .list(
                &k8s::ListParams::default()
                    .labels(&format!("{}={}", CLUSTER_NAME_LABEL, self.link.name)),
            )
            .await
            .context("failed to list local mirrors")?;
        Ok(list.items)
    }

    async fn resolve_gateway(&self) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = self.link.gateway_address.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let addrs = tokio::net::lookup_host((
            self.link.gateway_address.as_str(),
            self.link.gateway_port.get(),
        ))
        .await
        .context("failed to resolve gateway address")?;
        let mut ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        ips.sort();
        ips.dedup();
        Ok(ips)
    }

    async fn record(&self, type_: EventType, reason: &str, note: String) {
        let event = ClusterEvent {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(error) = self.recorder.publish(&event, &self.link_ref).await {
            debug!(%error, "failed to record event");
        }
    }
}

/// Whether an existing claim yields the mirror name to a candidate: only when
/// the candidate is strictly older (name-tiebroken for equal timestamps).
fn yields_to(existing: &Claim, candidate: &Claim) -> bool {
    let existing_key = (existing.created_at.as_ref(), &existing.remote_name);
    let candidate_key = (candidate.created_at.as_ref(), &candidate.remote_name);
    candidate_key < existing_key
}

async fn create_or_patch<T>(api: &k8s::Api<T>, name: &str, resource: &T) -> Result<()>
where
    T: kube::Resource + Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned,
{
    match api.get_opt(name).await? {
        None => {
            api.create(&kube::api::PostParams::default(), resource)
                .await
                .context("failed to create mirror resource")?;
        }
        Some(_) => {
            api.patch(
                name,
                &k8s::PatchParams::default(),
                &k8s::Patch::Merge(resource),
            )
            .await
            .context("failed to patch mirror resource")?;
        }
    }
    Ok(())
}
