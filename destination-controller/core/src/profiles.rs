use anyhow::Result;
use futures::prelude::*;
use std::{collections::BTreeMap, pin::Pin, time::Duration};

/// The complete, effective profile for an authority. Every published value is
/// full state, never a patch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Profile {
    /// The authority's fully-qualified name, without the port.
    pub fully_qualified_name: String,

    pub routes: Vec<Route>,
    pub retry_budget: Option<RetryBudget>,
    pub dst_overrides: Vec<WeightedDst>,
    pub opaque_protocol: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub condition: RequestMatch,
    pub response_classes: Vec<ResponseClass>,
    pub retryable: bool,
    pub timeout: Option<Duration>,

    /// Metric labels identifying the route (e.g. its configured name).
    pub labels: BTreeMap<String, String>,
}

/// A recursive boolean condition over request properties.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestMatch {
    All(Vec<RequestMatch>),
    Any(Vec<RequestMatch>),
    Not(Box<RequestMatch>),
    Path(String),
    Method(http::Method),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResponseClass {
    pub condition: ResponseMatch,
    pub is_failure: bool,
}

/// A recursive boolean condition over response properties.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseMatch {
    All(Vec<ResponseMatch>),
    Any(Vec<ResponseMatch>),
    Not(Box<ResponseMatch>),

    /// An inclusive range of HTTP status codes.
    Status { min: u16, max: u16 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryBudget {
    pub ratio: f32,
    pub min_retries_per_second: u32,
    pub ttl: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedDst {
    pub authority: String,
    pub weight: u32,
}

pub type ProfileStream = Pin<Box<dyn Stream<Item = Profile> + Send + Sync + 'static>>;

/// Models service-profile discovery for an authority.
#[async_trait::async_trait]
pub trait DiscoverProfile<T> {
    async fn watch_profile(&self, target: T) -> Result<Option<ProfileStream>>;
}
