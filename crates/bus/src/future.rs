//! A pending RPC call (§4.2). `RpcClient::send` in async mode hands back
//! an `RpcFuture` immediately; the caller decides when, and for how long,
//! to wait on it. This mirrors pyacq's `RPCFuture`, which is likewise a
//! thin wrapper the caller can either block on or poll later.

use crate::error::{CoreError, Result};
use proto::Value;
use std::time::Duration;
use tokio::sync::oneshot;

pub struct RpcFuture {
    req_id: u64,
    receiver: oneshot::Receiver<Result<Value>>,
}

impl RpcFuture {
    pub(crate) fn new(req_id: u64, receiver: oneshot::Receiver<Result<Value>>) -> RpcFuture {
        RpcFuture { req_id, receiver }
    }

    pub fn req_id(&self) -> u64 {
        self.req_id
    }

    /// Awaits the response, failing with `CoreError::Timeout` if `timeout`
    /// elapses first. A `None` timeout waits indefinitely.
    pub async fn result(self, timeout: Option<Duration>) -> Result<Value> {
        let recv = self.receiver;
        let outcome = match timeout {
            Some(duration) => tokio::time::timeout(duration, recv)
                .await
                .map_err(|_| CoreError::Timeout(format!("request {} timed out", self.req_id)))?,
            None => recv.await,
        };
        outcome.map_err(|_| CoreError::Protocol("server dropped the request".into()))?
    }
}
