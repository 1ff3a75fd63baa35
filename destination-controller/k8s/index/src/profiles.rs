//! Keeps track of `ServiceProfile` resources to serve the effective profile
//! for every watched authority.

mod index;


pub use self::index::{Index, SharedIndex};
