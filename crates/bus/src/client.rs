//! The client half of the RPC substrate (§4.2). Grounded in pyacq's
//! `RPCClient`/`RPCClient.get_client`: one client owns one duplex
//! connection per remote address, multiplexes many outstanding calls
//! over it keyed by `req_id`, and — when the caller happens to live in
//! the same process as the target server — skips the socket and calls
//! the server's dispatch path directly.

use crate::error::{CoreError, Result};
use crate::future::RpcFuture;
use crate::server::{dispatch_local, local_server};
use crate::transport::{self, Conn};
use crate::Address;
use proto::{Action, Request, Response, ReturnType, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// How a call's result is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Block until the response arrives (or the default timeout elapses).
    Sync,
    /// Return an `RpcFuture` immediately; the caller awaits it later.
    Async,
    /// Fire-and-forget: no `req_id` is assigned and no response is read.
    Off,
}

thread_local! {
    static CLIENT_CACHE: RefCell<HashMap<Address, Arc<RpcClient>>> = RefCell::new(HashMap::new());
}

/// Returns the cached client for `address` on the calling thread, opening
/// a new connection the first time this thread talks to that address.
pub async fn client_for(address: &Address) -> Result<Arc<RpcClient>> {
    let cached = CLIENT_CACHE.with(|cache| cache.borrow().get(address).cloned());
    if let Some(client) = cached {
        return Ok(client);
    }
    let client = RpcClient::connect(address.clone()).await?;
    CLIENT_CACHE.with(|cache| cache.borrow_mut().insert(address.clone(), client.clone()));
    Ok(client)
}

type Pending = Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>;

pub struct RpcClient {
    address: Address,
    next_req_id: AtomicU64,
    pending: Arc<Pending>,
    outbox: Option<mpsc::UnboundedSender<Vec<u8>>>,
    default_timeout: Duration,
    self_weak: Weak<RpcClient>,
}

impl RpcClient {
    pub async fn connect(address: Address) -> Result<Arc<RpcClient>> {
        // Same-process shortcut: no socket, no framing, no background task.
        if local_server(&address).is_some() {
            return Ok(Arc::new_cyclic(|weak| RpcClient {
                address,
                next_req_id: AtomicU64::new(1),
                pending: Arc::new(Mutex::new(HashMap::new())),
                outbox: None,
                default_timeout: default_timeout(),
                self_weak: weak.clone(),
            }));
        }

        let conn = transport::connect(&address).await?;
        let pending: Arc<Pending> = Arc::new(Mutex::new(HashMap::new()));
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(conn, pending.clone(), outbox_rx));

        let client = Arc::new_cyclic(|weak| RpcClient {
            address,
            next_req_id: AtomicU64::new(1),
            pending,
            outbox: Some(outbox_tx),
            default_timeout: default_timeout(),
            self_weak: weak.clone(),
        });
        client.ensure_connection().await?;
        Ok(client)
    }

    /// Pings the server, retrying a few times with a short backoff, so a
    /// client created right as its peer is starting up doesn't fail the
    /// first real call (pyacq's `ensure_connection`).
    pub async fn ensure_connection(&self) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..5 {
            match self.send(Action::Ping, Value::Null, ReturnType::Value, CallMode::Sync).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_millis(50 * (attempt + 1))).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::Timeout("ensure_connection failed".into())))
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Low-level send, used directly for calls that don't go through a
    /// `Proxy` (pings, top-level lookups) and internally by the
    /// `get_obj_attr`/`call_obj` helpers below.
    pub async fn send(
        &self,
        action: Action,
        opts: Value,
        return_type: ReturnType,
        mode: CallMode,
    ) -> Result<Value> {
        match mode {
            CallMode::Off => {
                self.dispatch_or_transmit(Request { req_id: None, action, return_type, opts }).await?;
                Ok(Value::Null)
            }
            // `send` always resolves the call before returning; `Sync` and
            // `Async` differ only in how a `Node` caller above this layer
            // is expected to schedule the wait (inline vs. not blocking a
            // processing loop). A caller that wants a detached `RpcFuture`
            // it can poll on its own schedule should call `send_async`
            // directly instead of going through `send`.
            CallMode::Sync | CallMode::Async => {
                let future = self.send_async(action, opts, return_type).await?;
                future.result(Some(self.default_timeout)).await
            }
        }
    }

    /// Sends a request expecting a response and returns an `RpcFuture` the
    /// caller can await on its own schedule.
    pub async fn send_async(&self, action: Action, opts: Value, return_type: ReturnType) -> Result<RpcFuture> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(req_id, tx);
        let request = Request { req_id: Some(req_id), action, return_type, opts };
        if let Err(err) = self.dispatch_or_transmit(request).await {
            self.pending.lock().unwrap().remove(&req_id);
            return Err(err);
        }
        Ok(RpcFuture::new(req_id, rx))
    }

    async fn dispatch_or_transmit(&self, request: Request) -> Result<()> {
        if let Some(server) = local_server(&self.address) {
            let req_id = request.req_id;
            // Same error shape a real response round-trip would produce,
            // so callers can't tell from the error alone whether the
            // direct-dispatch shortcut was taken.
            let result = dispatch_local(&server, request)
                .await
                .map_err(|err| CoreError::from_wire(err.to_wire().0, err.to_wire().1));
            if let Some(req_id) = req_id {
                if let Some(tx) = self.pending.lock().unwrap().remove(&req_id) {
                    let _ = tx.send(result);
                }
            }
            return Ok(());
        }
        let outbox = self
            .outbox
            .as_ref()
            .ok_or_else(|| CoreError::Protocol("client has no live connection".into()))?;
        let bytes = request.encode()?;
        outbox
            .send(bytes)
            .map_err(|_| CoreError::Protocol("connection task has exited".into()))
    }

    pub async fn get_obj_attr(&self, obj_id: u64, path: &Value, return_type: ReturnType) -> Result<Value> {
        let opts = Value::Map(vec![
            ("obj_id".to_string(), Value::Int(obj_id as i64)),
            ("path".to_string(), path.clone()),
        ]);
        self.send(Action::GetObjAttr, opts, return_type, CallMode::Sync).await
    }

    pub async fn call_obj(&self, obj_id: u64, path: &Value, method: &str, args: &[Value]) -> Result<Value> {
        let opts = Value::Map(vec![
            ("obj_id".to_string(), Value::Int(obj_id as i64)),
            ("path".to_string(), path.clone()),
            ("method".to_string(), Value::Text(method.to_string())),
            ("args".to_string(), Value::List(args.to_vec())),
        ]);
        self.send(Action::CallObj, opts, ReturnType::Auto, CallMode::Sync).await
    }

    pub async fn get_proxy(&self, name: &str) -> Result<crate::Proxy> {
        let opts = Value::Map(vec![("name".to_string(), Value::Text(name.to_string()))]);
        let value = self.send(Action::GetProxy, opts, ReturnType::Proxy, CallMode::Sync).await?;
        match value {
            Value::Proxy(reference) => {
                let handle = self.self_weak.upgrade().expect("client outlives its own proxies");
                Ok(crate::Proxy::new(handle, reference))
            }
            _ => Err(CoreError::Protocol("get_proxy did not return a proxy".into())),
        }
    }

    /// Hands `value` to the server (§4.2's `transfer` action) and returns a
    /// proxy to it, so a plain `Map`/`List` can be indexed the same way any
    /// other remote object is (`proxy.index(..).get()`), rather than only
    /// being usable as an inert argument.
    pub async fn transfer(&self, value: Value) -> Result<crate::Proxy> {
        let opts = Value::Map(vec![("value".to_string(), value)]);
        let result = self.send(Action::Transfer, opts, ReturnType::Proxy, CallMode::Sync).await?;
        match result {
            Value::Proxy(reference) => {
                let handle = self.self_weak.upgrade().expect("client outlives its own proxies");
                Ok(crate::Proxy::new(handle, reference))
            }
            _ => Err(CoreError::Protocol("transfer did not return a proxy".into())),
        }
    }
}

async fn run_connection(
    mut conn: Conn,
    pending: Arc<Pending>,
    mut outbox: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    loop {
        tokio::select! {
            outgoing = outbox.recv() => {
                match outgoing {
                    Some(bytes) => {
                        if conn.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = conn.recv() => {
                match incoming {
                    Ok(bytes) => {
                        match Response::decode(&bytes) {
                            Ok(response) => {
                                if let Some(tx) = pending.lock().unwrap().remove(&response.req_id) {
                                    let result = match response.error {
                                        Some((type_name, traceback)) => {
                                            Err(CoreError::from_wire(type_name, traceback))
                                        }
                                        None => Ok(response.rval.unwrap_or(Value::Null)),
                                    };
                                    let _ = tx.send(result);
                                }
                            }
                            Err(err) => warn!(%err, "dropping malformed response"),
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
    for (_, tx) in pending.lock().unwrap().drain() {
        let _ = tx.send(Err(CoreError::Protocol("connection closed".into())));
    }
}

fn default_timeout() -> Duration {
    std::env::var("PYACQ_RPC_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(5))
}
