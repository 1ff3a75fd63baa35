//! Keeps track of `Service`, `EndpointSlice` (or legacy `Endpoints`), `Pod`,
//! `Node`, and `Server` resources to materialize the set of backing addresses
//! for every watched `(service, port)` authority.

pub mod metrics;

mod index;

#[cfg(test)]
mod tests;

pub use self::index::{Index, ServicePort, SharedIndex, Subscription, TargetState};
