//! Wire schema and native value representation shared by every crate that
//! crosses an RPC or stream-control boundary.
//!
//! `message_capnp` is generated from `schema/message.capnp` by `build.rs`.
//! The rest of this crate wraps the generated reader/builder API with a
//! plain Rust `Value` enum so callers never touch capnp directly.

#[allow(clippy::all)]
pub mod message_capnp {
    include!(concat!(env!("OUT_DIR"), "/message_capnp.rs"));
}

pub mod value;
pub mod envelope;

pub use value::{NDArray, ProxyRef, Value};
pub use envelope::{Action, RawRequest, Request, Response, ReturnType, StreamControl};
