//! Node lifecycle and grouping (§4.5, §4.6): the `Node` trait and its
//! `NodeHandle` FSM wrapper, plus `NodeGroup`, the per-process container a
//! `Host` binds one RPC server around.

pub mod group;
pub mod node;

pub use group::NodeGroup;
pub use node::{LifecycleState, Node, NodeHandle};
