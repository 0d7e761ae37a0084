//! Top-level supervisor (§4.8): creates nodegroups locally or on spawned
//! worker processes, and tears everything down in reverse creation order.

pub mod manager;

pub use manager::{HostSelector, Manager, NodeGroupHandle};
