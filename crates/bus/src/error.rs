//! Error kinds (§7). `CoreError` is the single error type returned by the
//! RPC substrate; it carries enough to reconstruct the wire `(type_name,
//! traceback)` pair a `Response::error` sends back to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// An exception raised inside a remote handler. `type_name` is the
    /// remote error's Rust type name; `traceback` is a human-readable
    /// description (the crate has no real unwind traceback to carry, so
    /// this is built from the `Display` chain of the source error).
    #[error("remote call failed: {type_name}: {traceback}")]
    RemoteCall { type_name: String, traceback: String },

    /// Malformed envelope, unknown action, or unknown `req_id`. The
    /// connection stays open; this is logged and, where possible, answered.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An RPC call or stream receive exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A lifecycle transition was attempted from an invalid state.
    #[error("invalid lifecycle transition: {0}")]
    Lifecycle(String),

    /// Stream spec mismatch at handshake, or mutation attempted after the
    /// per-sample shape/dtype were frozen by `initialize`.
    #[error("stream spec error: {0}")]
    StreamSpec(String),

    /// Duplicate node name, unknown node, or remove-while-running.
    #[error("registry error: {0}")]
    Registry(String),
}

impl CoreError {
    /// The `(type_name, traceback)` pair carried by a `Response::error`.
    pub fn to_wire(&self) -> (String, String) {
        let type_name = match self {
            CoreError::RemoteCall { type_name, .. } => type_name.clone(),
            CoreError::Protocol(_) => "ProtocolError".to_string(),
            CoreError::Timeout(_) => "TimeoutError".to_string(),
            CoreError::Lifecycle(_) => "LifecycleError".to_string(),
            CoreError::StreamSpec(_) => "StreamSpecError".to_string(),
            CoreError::Registry(_) => "RegistryError".to_string(),
        };
        (type_name, self.to_string())
    }

    pub fn from_wire(type_name: String, traceback: String) -> CoreError {
        CoreError::RemoteCall { type_name, traceback }
    }
}

impl From<capnp::Error> for CoreError {
    fn from(e: capnp::Error) -> Self {
        CoreError::Protocol(e.to_string())
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(e: anyhow::Error) -> Self {
        CoreError::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
