use crate::{
    link::{Link, ProbeDefaults},
    metrics::{LinkState, Metrics},
    probe::ProbeWorker,
    queue::{self, Event, Queue},
    reconcile::Reconciler,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::{
    events::{Recorder, Reporter},
    watcher, WatchStreamExt,
};
use linkerd_destination_controller_k8s_api::{
    self as k8s, duration::GoDuration, multicluster, ResourceExt,
};
use prometheus_client::registry::Registry;
use std::time::Duration;
use tokio::time;
use tracing::{info, info_span, warn, Instrument};

const CONNECT_BACKOFF: Duration = Duration::from_secs(10);

/// How long queued work may drain after a link is deleted before workers are
/// hard-stopped.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[clap(
    name = "service-mirror",
    about = "Mirrors exported services from a linked remote cluster"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "linkerd=info,warn",
        env = "LINKERD_SERVICE_MIRROR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The name of the Link resource to operate on.
    #[clap(long)]
    link_name: String,

    /// The namespace holding the Link and its credentials secret.
    #[clap(long, default_value = "linkerd-multicluster")]
    namespace: String,

    /// Default probe period, applied when the Link does not specify one.
    #[clap(long, default_value = "10s")]
    probe_period: GoDuration,

    /// Default probe path, applied when the Link does not specify one.
    #[clap(long, default_value = "/ready")]
    probe_path: String,

    /// Default probe port, applied when the Link does not specify one.
    #[clap(long, default_value = "4191")]
    probe_port: std::num::NonZeroU16,

    /// How often every mirror's endpoints are rewritten against the gateway.
    #[clap(long, default_value = "1m")]
    repair_period: GoDuration,

    /// A prefix stripped from remote service names before the link suffix is
    /// appended.
    #[clap(long)]
    local_mirror_prefix_strip: Option<String>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            link_name,
            namespace,
            probe_period,
            probe_path,
            probe_port,
            repair_period,
            local_mirror_prefix_strip,
        } = self;

        let probe_defaults = ProbeDefaults {
            path: probe_path,
            port: probe_port,
            period: probe_period.into(),
        };

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("service_mirror"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let local = runtime.client();
        let recorder = Recorder::new(
            local.clone(),
            Reporter {
                controller: "linkerd-service-mirror".into(),
                instance: None,
            },
        );
        let links = k8s::Api::<multicluster::Link>::namespaced(local.clone(), &namespace);

        // A link whose credentials are unusable at startup is a deployment
        // error; exit non-zero rather than supervising a dead link.
        if let Some(resource) = links.get_opt(&link_name).await? {
            let link = Link::from_resource(resource, &probe_defaults)?;
            if let Err(error) = link.remote_client(local.clone()).await {
                bail!("link {link_name} credentials are unusable: {error:#}");
            }
        } else {
            info!(%link_name, "link not found; waiting for it to be created");
        }

        let supervisor = supervise_link(
            local,
            links,
            link_name,
            probe_defaults,
            repair_period.into(),
            local_mirror_prefix_strip,
            metrics,
            recorder,
        );
        tokio::spawn(supervisor.instrument(info_span!("link")));

        if runtime.run().await.is_err() {
            bail!("Aborted");
        }
        Ok(())
    }
}

/// Watches the Link resource and runs one mirror pipeline per observed spec.
/// Spec changes restart the pipeline in place; deletion garbage-collects all
/// mirrors before stopping.
#[allow(clippy::too_many_arguments)]
async fn supervise_link(
    local: k8s::Client,
    links: k8s::Api<multicluster::Link>,
    link_name: String,
    probe_defaults: ProbeDefaults,
    repair_period: Duration,
    prefix_strip: Option<String>,
    metrics: Metrics,
    recorder: Recorder,
) {
    let stream = watcher(
        links,
        watcher::Config::default().fields(&format!("metadata.name={link_name}")),
    )
    .default_backoff();
    tokio::pin!(stream);

    let mut active: Option<ActiveLink> = None;

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(resource))
            | Ok(watcher::Event::InitApply(resource)) => {
                let link_ref = kube::Resource::object_ref(&resource, &());
                let link = match Link::from_resource(resource, &probe_defaults) {
                    Ok(link) => link,
                    Err(error) => {
                        warn!(%error, "ignoring invalid link");
                        continue;
                    }
                };
                if active.as_ref().is_some_and(|a| a.spec == link) {
                    continue;
                }

                // A spec change restarts the pipeline; mirrors stay in place
                // and are reconciled by the new pipeline's initial sync.
                if let Some(prev) = active.take() {
                    prev.stop(false).await;
                }

                active = Some(spawn_link(
                    local.clone(),
                    link,
                    link_ref,
                    repair_period,
                    prefix_strip.clone(),
                    metrics.clone(),
                    recorder.clone(),
                ));
            }
            Ok(watcher::Event::Delete(_)) => {
                if let Some(prev) = active.take() {
                    info!("link deleted; tearing down");
                    prev.stop(true).await;
                }
            }
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "link watch failed");
            }
        }
    }
}

struct ActiveLink {
    spec: Link,
    queue: Queue,
    shutdown: drain::Signal,
    driver: tokio::task::JoinHandle<()>,
}

impl ActiveLink {
    /// Stops the pipeline. When `unregister` is set, every mirror for this
    /// link is deleted first; the queue drains within a bounded deadline.
    async fn stop(self, unregister: bool) {
        if unregister {
            self.queue.push(Event::ClusterUnregistered);
        }
        drop(self.queue);
        self.shutdown.drain().await;
        if time::timeout(SHUTDOWN_DEADLINE, self.driver).await.is_err() {
            warn!("link pipeline did not stop within the shutdown deadline");
        }
    }
}

fn spawn_link(
    local: k8s::Client,
    link: Link,
    link_ref: ObjectReference,
    repair_period: Duration,
    prefix_strip: Option<String>,
    metrics: Metrics,
    recorder: Recorder,
) -> ActiveLink {
    let (queue, rx) = queue::channel();
    let (shutdown, watch) = drain::channel();

    metrics.set_state(&link.target_cluster_name, LinkState::Init);

    let driver = tokio::spawn(
        drive_link(
            local,
            link.clone(),
            link_ref,
            repair_period,
            prefix_strip,
            metrics,
            recorder,
            queue.clone(),
            rx,
            watch,
        )
        .instrument(info_span!("driver", link = %link.name)),
    );

    ActiveLink {
        spec: link,
        queue,
        shutdown,
        driver,
    }
}

/// Connects to the remote cluster and drives the mirror pipeline: the remote
/// service watch, the probe worker, the repair tick, and the reconciliation
/// worker.
#[allow(clippy::too_many_arguments)]
async fn drive_link(
    local: k8s::Client,
    link: Link,
    link_ref: ObjectReference,
    repair_period: Duration,
    prefix_strip: Option<String>,
    metrics: Metrics,
    recorder: Recorder,
    queue: Queue,
    rx: queue::Receiver,
    shutdown: drain::Watch,
) {
    let target = link.target_cluster_name.clone();
    metrics.set_state(&target, LinkState::Connecting);

    tokio::pin! {
        let signaled = shutdown.clone().signaled();
    }

    // Keep retrying the remote connection; a link with bad credentials stays
    // Connecting until its secret is fixed.
    let remote = loop {
        tokio::select! {
            res = link.remote_client(local.clone()) => match res {
                Ok(client) => break client,
                Err(error) => {
                    warn!(%error, "failed to connect to remote cluster");
                    publish_warning(&recorder, &link_ref, "RemoteClusterUnreachable", format!("{error:#}")).await;
                    time::sleep(CONNECT_BACKOFF).await;
                }
            },
            _ = &mut signaled => return,
        }
    };

    let reconciler = Reconciler::new(
        local,
        remote.clone(),
        link.clone(),
        prefix_strip,
        metrics.clone(),
        recorder.clone(),
        link_ref,
    );
    let worker = tokio::spawn(
        reconciler
            .run(rx, queue.clone())
            .instrument(info_span!("worker")),
    );

    tokio::spawn(
        ProbeWorker::new(link.clone(), metrics.clone())
            .run(shutdown.clone())
            .instrument(info_span!("probe")),
    );

    let services = k8s::Api::<k8s::Service>::all(remote);
    let stream = watcher(
        services,
        watcher::Config::default().labels(&link.export_selector),
    )
    .default_backoff();
    tokio::pin!(stream);

    let mut repair = time::interval(repair_period);
    repair.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    repair.reset();

    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(Ok(watcher::Event::Init)) => {
                    metrics.set_state(&target, LinkState::Syncing);
                }
                Some(Ok(watcher::Event::InitApply(svc))) => {
                    queue.push(Event::RemoteServiceCreated(svc));
                }
                Some(Ok(watcher::Event::InitDone)) => {
                    // The initial list has been enqueued; anything local that
                    // the list no longer covers is an orphan.
                    queue.push(Event::GcOrphanedServices);
                    metrics.set_state(&target, LinkState::Active);
                }
                Some(Ok(watcher::Event::Apply(svc))) => {
                    queue.push(Event::RemoteServiceUpdated(svc));
                }
                Some(Ok(watcher::Event::Delete(svc))) => {
                    queue.push(Event::RemoteServiceDeleted {
                        namespace: svc.namespace().unwrap_or_default(),
                        name: svc.name_unchecked(),
                    });
                }
                Some(Err(error)) => {
                    warn!(%error, "remote service watch failed");
                }
                None => break,
            },

            _ = repair.tick() => {
                queue.push(Event::RepairEndpoints);
            }

            _ = &mut signaled => break,
        }
    }

    drop(queue);
    if time::timeout(SHUTDOWN_DEADLINE, worker).await.is_err() {
        warn!("reconciliation worker did not drain within the shutdown deadline");
    }
    metrics.set_state(&target, LinkState::TearingDown);
}

async fn publish_warning(
    recorder: &Recorder,
    link_ref: &ObjectReference,
    reason: &str,
    note: String,
) {
    let event = kube::runtime::events::Event {
        type_: kube::runtime::events::EventType::Warning,
        reason: reason.to_string(),
        note: Some(note),
        action: "Connect".to_string(),
        secondary: None,
    };
    if let Err(error) = recorder.publish(&event, link_ref).await {
        tracing::debug!(%error, "failed to record event");
    }
}
