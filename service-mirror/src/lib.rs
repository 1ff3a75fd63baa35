//! Mirrors exported services from linked remote clusters.
//!
//! For each `Link`, the controller watches the remote cluster for services
//! bearing the link's export selector and maintains local `Service` and
//! `Endpoints` mirrors whose endpoints address the remote gateway. A gateway
//! probe worker maintains the link's liveness signal; drift is repaired by a
//! rate-limited work queue.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
mod link;
mod metrics;
mod mirror;
mod probe;
mod queue;
mod reconcile;

pub use self::args::Args;
