use crate::{duration::GoDuration, labels};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Binds a remote cluster for service mirroring: where the remote API server
/// credentials live, how to reach the remote gateway, and which remote
/// services are exported.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "multicluster.linkerd.io",
    version = "v1alpha1",
    kind = "Link",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LinkSpec {
    /// Name of the remote cluster this link binds.
    pub target_cluster_name: String,

    /// DNS domain of the remote cluster (e.g. `cluster.local`).
    pub target_cluster_domain: String,

    /// Name of the Secret (in the link's namespace) holding a `kubeconfig`
    /// key with remote API server credentials.
    pub cluster_credentials_secret: String,

    /// Address (hostname or IP) of the remote gateway.
    pub gateway_address: String,

    /// Port on which the remote gateway accepts mirrored traffic.
    pub gateway_port: std::num::NonZeroU16,

    /// Mesh identity presented by the remote gateway.
    pub gateway_identity: String,

    pub probe_spec: ProbeSpec,

    /// Selects the remote services to mirror.
    pub selector: Option<labels::Selector>,
}

/// How to probe the gateway's liveness endpoint. Unset fields fall back to
/// the mirror controller's configured defaults.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    pub path: Option<String>,
    pub port: Option<std::num::NonZeroU16>,
    pub period: Option<GoDuration>,
}
