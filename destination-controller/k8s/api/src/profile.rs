use crate::duration::GoDuration;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Describes the routes, retry budget, and timeouts for a service authority.
///
/// The resource's name is the fully-qualified authority it applies to (e.g.
/// `web.emojivoto.svc.cluster.local`).
#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "linkerd.io",
    version = "v1alpha2",
    kind = "ServiceProfile",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceProfileSpec {
    pub routes: Option<Vec<RouteSpec>>,
    pub retry_budget: Option<RetryBudget>,
    pub dst_overrides: Option<Vec<WeightedDst>>,
    #[serde(default)]
    pub opaque_protocol: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub name: Option<String>,
    pub condition: RequestMatch,
    pub response_classes: Option<Vec<ResponseClass>>,
    #[serde(default)]
    pub is_retryable: bool,
    pub timeout: Option<GoDuration>,
}

/// A recursive boolean condition over request properties. Exactly one field
/// should be set per node.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestMatch {
    pub path_regex: Option<String>,
    pub method: Option<String>,
    pub all: Option<Vec<RequestMatch>>,
    pub any: Option<Vec<RequestMatch>>,
    pub not: Option<Box<RequestMatch>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResponseClass {
    pub condition: ResponseMatch,
    #[serde(default)]
    pub is_failure: bool,
}

/// A recursive boolean condition over response properties.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMatch {
    pub status: Option<StatusRange>,
    pub all: Option<Vec<ResponseMatch>>,
    pub any: Option<Vec<ResponseMatch>>,
    pub not: Option<Box<ResponseMatch>>,
}

/// An inclusive range of HTTP status codes.
#[derive(Copy, Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct StatusRange {
    pub min: Option<u32>,
    pub max: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryBudget {
    pub retry_ratio: f32,
    pub min_retries_per_second: u32,
    pub ttl: GoDuration,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct WeightedDst {
    pub authority: String,
    pub weight: u32,
}
