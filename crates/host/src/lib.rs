//! Per-machine bootstrap (§4.7): `Host`, the long-lived nodegroup factory
//! server, and `ProcessSpawner`, which starts one in a child process and
//! hands back a proxy to it.

pub mod host;
pub mod spawner;

pub use host::Host;
pub use spawner::{ChildHost, ProcessSpawner};
