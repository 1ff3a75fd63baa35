//! Watches cluster resources and materializes discovery state for the
//! destination gRPC API.
//!
//! Three indexes share this crate, one per discovery surface:
//!
//! - `endpoints`: per-`(service, port)` address sets published as ordered
//!   diff streams;
//! - `profiles`: per-authority effective `ServiceProfile`s;
//! - `inbound`: per-`(pod, port)` inbound server policies.
//!
//! Each index is driven by `kubert::index` dispatch tasks (one task per
//! resource kind) and read by the gRPC layer through subscription handles.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoints;
pub mod inbound;
pub mod profiles;

mod cluster_info;
mod defaults;
pub mod ports;

pub use self::{cluster_info::ClusterInfo, defaults::DefaultPolicy};
