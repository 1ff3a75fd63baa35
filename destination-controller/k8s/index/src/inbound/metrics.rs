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
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let mut pods_encoder = encoder.encode_descriptor(
            "pod_index_size",
            "The number of pods in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, pods, _, _) in this.namespace_stats() {
            let labels = [("namespace", ns)];
            let pods = ConstGauge::new(pods as u32);
            let pods_encoder = pods_encoder.encode_family(&labels)?;
            pods.encode(pods_encoder)?;
        }

        let mut servers_encoder = encoder.encode_descriptor(
            "server_index_size",
            "The number of servers in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, _, servers, _) in this.namespace_stats() {
            let labels = [("namespace", ns)];
            let servers = ConstGauge::new(servers as u32);
            let servers_encoder = servers_encoder.encode_family(&labels)?;
            servers.encode(servers_encoder)?;
        }

        let mut server_authz_encoder = encoder.encode_descriptor(
            "server_authorization_index_size",
            "The number of server authorizations in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, _, _, sazs) in this.namespace_stats() {
            let labels = [("namespace", ns)];
            let sazs = ConstGauge::new(sazs as u32);
            let server_authz_encoder = server_authz_encoder.encode_family(&labels)?;
            sazs.encode(server_authz_encoder)?;
        }

        Ok(())
    }
}
