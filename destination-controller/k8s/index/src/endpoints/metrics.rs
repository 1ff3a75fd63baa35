use super::SharedIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register(
        "subscriber_evictions",
        "The number of subscribers evicted because their update buffer overflowed",
        index.read().metrics().evictions.clone(),
    );
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let mut publishers_encoder = encoder.encode_descriptor(
            "service_publishers",
            "The number of (service, port) authorities with active publishers",
            None,
            MetricType::Gauge,
        )?;
        for (ns, publishers, _) in this.namespace_stats() {
            let labels = [("namespace", ns)];
            let publishers = ConstGauge::new(publishers as u32);
            let publishers_encoder = publishers_encoder.encode_family(&labels)?;
            publishers.encode(publishers_encoder)?;
        }

        let mut subscribers_encoder = encoder.encode_descriptor(
            "endpoint_subscribers",
            "The number of live endpoint subscriptions",
            None,
            MetricType::Gauge,
        )?;
        for (ns, _, subscribers) in this.namespace_stats() {
            let labels = [("namespace", ns)];
            let subscribers = ConstGauge::new(subscribers as u32);
            let subscribers_encoder = subscribers_encoder.encode_family(&labels)?;
            subscribers.encode(subscribers_encoder)?;
        }

        Ok(())
    }
}
