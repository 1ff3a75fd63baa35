//! Probes the remote gateway's liveness endpoint on a jittered schedule.
//!
//! Three consecutive failures mark the link `Degraded`; a single success
//! restores `Active`. Degradation never pauses reconciliation, so mirrors
//! remain in place and recovery is immediate.

use crate::{
    link::Link,
    metrics::{LinkState, Metrics},
};
use http_body_util::Empty;
use hyper_util::{client::legacy::connect::HttpConnector, client::legacy::Client, rt::TokioExecutor};
use rand::Rng;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(50);
const FAILURES_TO_DEGRADE: u32 = 3;

pub(crate) struct ProbeWorker {
    link: Link,
    metrics: Metrics,
    client: Client<HttpConnector, Empty<bytes::Bytes>>,
    failures: u32,
    degraded: bool,
}

impl ProbeWorker {
    pub(crate) fn new(link: Link, metrics: Metrics) -> Self {
        Self {
            link,
            metrics,
            client: Client::builder(TokioExecutor::new()).build_http(),
            failures: 0,
            degraded: false,
        }
    }

    pub(crate) async fn run(mut self, shutdown: drain::Watch) {
        let uri = match self.probe_uri() {
            Ok(uri) => uri,
            Err(error) => {
                warn!(%error, "invalid probe target; gateway liveness will not be tracked");
                return;
            }
        };

        let probing = async {
            loop {
                time::sleep(jittered(self.link.probe_period)).await;
                self.probe_once(&uri).await;
            }
        };

        tokio::select! {
            _ = probing => {}
            _ = shutdown.signaled() => {
                debug!("probe worker stopped");
            }
        }
    }

    fn probe_uri(&self) -> anyhow::Result<http::Uri> {
        let path = if self.link.probe_path.starts_with('/') {
            self.link.probe_path.clone()
        } else {
            format!("/{}", self.link.probe_path)
        };
        format!(
            "http://{}:{}{}",
            self.link.gateway_address, self.link.probe_port, path
        )
        .parse()
        .map_err(Into::into)
    }

    async fn probe_once(&mut self, uri: &http::Uri) {
        let start = time::Instant::now();
        let success = match time::timeout(PROBE_TIMEOUT, self.client.get(uri.clone())).await {
            Ok(Ok(rsp)) => rsp.status().is_success(),
            Ok(Err(error)) => {
                debug!(%error, "gateway probe failed");
                false
            }
            Err(_) => {
                debug!("gateway probe timed out");
                false
            }
        };
        let latency = start.elapsed().as_secs_f64();
        self.metrics
            .observe_probe(&self.link.target_cluster_name, success, latency);
        self.observe(success);
    }

    fn observe(&mut self, success: bool) {
        if success {
            self.failures = 0;
            if self.degraded {
                self.degraded = false;
                info!(target = %self.link.target_cluster_name, "gateway recovered");
                self.metrics
                    .set_state(&self.link.target_cluster_name, LinkState::Active);
            }
        } else {
            self.failures += 1;
            if !self.degraded && self.failures >= FAILURES_TO_DEGRADE {
                self.degraded = true;
                warn!(target = %self.link.target_cluster_name, "gateway degraded");
                self.metrics
                    .set_state(&self.link.target_cluster_name, LinkState::Degraded);
            }
        }
    }
}

/// Applies ±10% jitter to the probe period so that linked clusters do not
/// probe in lockstep.
fn jittered(period: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    period.mul_f64(factor)
}
