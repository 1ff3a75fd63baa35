//! A rate-limited work queue with at-least-once delivery.
//!
//! Events are deduplicated by resource key: while a key is pending, a newer
//! event for the same key replaces the pending payload instead of growing the
//! queue. Failed events are re-enqueued with exponential backoff.

use linkerd_destination_controller_k8s_api as k8s;
use parking_lot::Mutex;
use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// The events the reconciliation worker processes.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Event {
    RemoteServiceCreated(k8s::Service),
    RemoteServiceUpdated(k8s::Service),
    RemoteServiceDeleted { namespace: String, name: String },
    ClusterUnregistered,
    GcOrphanedServices,
    RepairEndpoints,
}

/// Deduplication key for pending events.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum EventKey {
    Remote { namespace: String, name: String },
    ClusterUnregistered,
    Gc,
    Repair,
}

impl Event {
    pub(crate) fn key(&self) -> EventKey {
        use k8s::ResourceExt;
        match self {
            Event::RemoteServiceCreated(svc) | Event::RemoteServiceUpdated(svc) => {
                EventKey::Remote {
                    namespace: svc.namespace().unwrap_or_default(),
                    name: svc.name_unchecked(),
                }
            }
            Event::RemoteServiceDeleted { namespace, name } => EventKey::Remote {
                namespace: namespace.clone(),
                name: name.clone(),
            },
            Event::ClusterUnregistered => EventKey::ClusterUnregistered,
            Event::GcOrphanedServices => EventKey::Gc,
            Event::RepairEndpoints => EventKey::Repair,
        }
    }
}

#[derive(Clone)]
pub(crate) struct Queue {
    keys: mpsc::UnboundedSender<EventKey>,
    pending: Arc<Mutex<HashMap<EventKey, Pending>>>,
}

pub(crate) struct Receiver {
    keys: mpsc::UnboundedReceiver<EventKey>,
    pending: Arc<Mutex<HashMap<EventKey, Pending>>>,
}

struct Pending {
    event: Event,
    attempt: u32,
}

pub(crate) fn channel() -> (Queue, Receiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(Mutex::new(HashMap::default()));
    (
        Queue {
            keys: tx,
            pending: pending.clone(),
        },
        Receiver { keys: rx, pending },
    )
}

impl Queue {
    /// Enqueues an event. Coalesces with any pending event for the same key,
    /// keeping the newest payload.
    pub(crate) fn push(&self, event: Event) {
        let key = event.key();
        let newly_queued = {
            let mut pending = self.pending.lock();
            pending
                .insert(key.clone(), Pending { event, attempt: 0 })
                .is_none()
        };
        if newly_queued {
            // The receiver half only closes at teardown, when losing the
            // event is fine.
            let _ = self.keys.send(key);
        }
    }

    /// Re-enqueues a failed event after an exponential backoff. A newer event
    /// that arrives for the same key during the backoff supersedes the retry:
    /// the retried payload never clobbers it.
    pub(crate) fn retry(&self, event: Event, attempt: u32) {
        let queue = self.clone();
        let delay = backoff(attempt);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let key = event.key();
            let newly_queued = {
                let mut pending = queue.pending.lock();
                match pending.entry(key.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(Pending { event, attempt });
                        true
                    }
                    Entry::Occupied(_) => false,
                }
            };
            if newly_queued {
                let _ = queue.keys.send(key);
            }
        });
    }
}

impl Receiver {
    /// Awaits the next pending event. Returns the event and its attempt
    /// count, or `None` when the queue has been dropped.
    pub(crate) async fn recv(&mut self) -> Option<(Event, u32)> {
        loop {
            let key = self.keys.recv().await?;
            // The payload may have been coalesced away by a newer event that
            // re-used this key's slot.
            if let Some(Pending { event, attempt }) = self.pending.lock().remove(&key) {
                return Some((event, attempt));
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt));
    exp.min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_remote_service(ns: &str, name: &str, version: &str) -> k8s::Service {
        k8s::Service {
            metadata: k8s::ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let (queue, mut rx) = channel();
        queue.push(Event::GcOrphanedServices);
        queue.push(Event::RepairEndpoints);

        assert_eq!(rx.recv().await.unwrap().0, Event::GcOrphanedServices);
        assert_eq!(rx.recv().await.unwrap().0, Event::RepairEndpoints);
    }

    #[tokio::test]
    async fn coalesces_by_key() {
        let (queue, mut rx) = channel();
        queue.push(Event::RemoteServiceCreated(mk_remote_service(
            "ns-1", "web", "1",
        )));
        queue.push(Event::RemoteServiceUpdated(mk_remote_service(
            "ns-1", "web", "2",
        )));
        queue.push(Event::GcOrphanedServices);

        // The newer payload for the coalesced key is delivered once.
        match rx.recv().await.unwrap().0 {
            Event::RemoteServiceUpdated(svc) => {
                assert_eq!(svc.metadata.resource_version.as_deref(), Some("2"));
            }
            event => panic!("unexpected event: {event:?}"),
        }
        assert_eq!(rx.recv().await.unwrap().0, Event::GcOrphanedServices);
    }

    #[tokio::test]
    async fn retry_redelivers() {
        tokio::time::pause();
        let (queue, mut rx) = channel();
        queue.retry(Event::GcOrphanedServices, 3);

        // Let the retry task register its backoff timer before advancing.
        tokio::task::yield_now().await;
        tokio::time::advance(backoff(3)).await;

        let (event, attempt) = rx.recv().await.unwrap();
        assert_eq!(event, Event::GcOrphanedServices);
        assert_eq!(attempt, 3);
    }

    #[tokio::test]
    async fn retry_never_clobbers_a_newer_event() {
        use futures::FutureExt;

        tokio::time::pause();
        let (queue, mut rx) = channel();
        queue.retry(
            Event::RemoteServiceUpdated(mk_remote_service("ns-1", "web", "1")),
            2,
        );
        tokio::task::yield_now().await;

        // The service is deleted remotely while the update backs off.
        queue.push(Event::RemoteServiceDeleted {
            namespace: "ns-1".to_string(),
            name: "web".to_string(),
        });
        tokio::time::advance(backoff(2)).await;

        let (event, attempt) = rx.recv().await.unwrap();
        assert!(matches!(event, Event::RemoteServiceDeleted { .. }));
        assert_eq!(attempt, 0);

        // The stale retry was dropped rather than re-queued.
        assert!(rx.recv().now_or_never().is_none());
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff(0), Duration::from_millis(100));
        assert_eq!(backoff(1), Duration::from_millis(200));
        assert_eq!(backoff(32), BACKOFF_CAP);
    }
}
