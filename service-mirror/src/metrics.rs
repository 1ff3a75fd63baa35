use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub(crate) struct Metrics {
    gateway_alive: Family<TargetLabels, Gauge>,
    gateway_probes: Family<ProbeLabels, Counter>,
    gateway_probe_latency: Family<TargetLabels, Histogram>,
    endpoint_repairs: Family<TargetLabels, Counter>,
    reconcile_retries: Family<TargetLabels, Counter>,
    link_state: Family<StateLabels, Gauge>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TargetLabels {
    target: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ProbeLabels {
    target: String,
    success: bool,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct StateLabels {
    target: String,
    state: LinkState,
}

/// The per-link lifecycle states.
#[derive(Copy, Clone, Hash, PartialEq, Eq, EncodeLabelValue, Debug)]
pub(crate) enum LinkState {
    Init,
    Connecting,
    Syncing,
    Active,
    Degraded,
    TearingDown,
}

const STATES: [LinkState; 6] = [
    LinkState::Init,
    LinkState::Connecting,
    LinkState::Syncing,
    LinkState::Active,
    LinkState::Degraded,
    LinkState::TearingDown,
];

impl Metrics {
    pub(crate) fn register(reg: &mut Registry) -> Self {
        let gateway_alive = Family::<TargetLabels, Gauge>::default();
        reg.register(
            "gateway_alive",
            "Whether the remote gateway answered its most recent probe",
            gateway_alive.clone(),
        );

        let gateway_probes = Family::<ProbeLabels, Counter>::default();
        reg.register(
            "gateway_probes",
            "Total number of gateway probes, by outcome",
            gateway_probes.clone(),
        );

        let gateway_probe_latency = Family::<TargetLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0])
        });
        reg.register_with_unit(
            "gateway_probe_latency",
            "Histogram of gateway probe round-trip latency",
            prometheus_client::registry::Unit::Seconds,
            gateway_probe_latency.clone(),
        );

        let endpoint_repairs = Family::<TargetLabels, Counter>::default();
        reg.register(
            "endpoint_repairs",
            "Total number of mirror endpoint rewrites",
            endpoint_repairs.clone(),
        );

        let reconcile_retries = Family::<TargetLabels, Counter>::default();
        reg.register(
            "reconcile_retries",
            "Total number of reconciliation events re-enqueued after a failure",
            reconcile_retries.clone(),
        );

        let link_state = Family::<StateLabels, Gauge>::default();
        reg.register(
            "link_state",
            "The link's lifecycle state (1 for the current state, 0 otherwise)",
            link_state.clone(),
        );

        Self {
            gateway_alive,
            gateway_probes,
            gateway_probe_latency,
            endpoint_repairs,
            reconcile_retries,
            link_state,
        }
    }

    pub(crate) fn observe_probe(&self, target: &str, success: bool, latency_s: f64) {
        let labels = TargetLabels {
            target: target.to_string(),
        };
        self.gateway_alive
            .get_or_create(&labels)
            .set(i64::from(success));
        self.gateway_probes
            .get_or_create(&ProbeLabels {
                target: target.to_string(),
                success,
            })
            .inc();
        self.gateway_probe_latency
            .get_or_create(&labels)
            .observe(latency_s);
    }

    pub(crate) fn repaired(&self, target: &str) {
        self.endpoint_repairs
            .get_or_create(&TargetLabels {
                target: target.to_string(),
            })
            .inc();
    }

    pub(crate) fn retried(&self, target: &str) {
        self.reconcile_retries
            .get_or_create(&TargetLabels {
                target: target.to_string(),
            })
            .inc();
    }

    pub(crate) fn set_state(&self, target: &str, state: LinkState) {
        for s in STATES {
            self.link_state
                .get_or_create(&StateLabels {
                    target: target.to_string(),
                    state: s,
                })
                .set(i64::from(s == state));
        }
    }
}
