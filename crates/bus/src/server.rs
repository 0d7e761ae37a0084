//! The server half of the RPC substrate (§4.2). One `RpcServer` owns one
//! `ObjectRegistry` and one bound `Listener`; each accepted connection is
//! served by its own task so a slow or silent client never blocks another.

use crate::error::{CoreError, Result};
use crate::registry::{ObjectRegistry, RemoteObject, ValueObject};
use crate::transport::{self, Conn};
use crate::Address;
use proto::{Action, RawRequest, Request, Response, ReturnType, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::Notify;
use tracing::{debug, warn};

static LOCAL_SERVERS: OnceLock<Mutex<HashMap<Address, Arc<RpcServer>>>> = OnceLock::new();

fn local_servers() -> &'static Mutex<HashMap<Address, Arc<RpcServer>>> {
    LOCAL_SERVERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The direct-dispatch shortcut (§4.2, grounded in pyacq's `RPCClient.get_client`:
/// a caller already in the server's own process skips the socket entirely).
/// Returns the server bound at `address` in this process, if any.
pub fn local_server(address: &Address) -> Option<Arc<RpcServer>> {
    local_servers().lock().unwrap().get(address).cloned()
}

/// Runs one request through the same dispatch path a remote peer's frame
/// would take, without touching a socket. There is no connection to tear
/// down afterwards, so acquired references aren't tracked across calls —
/// same as before this shortcut existed, direct dispatch never ran
/// connection-close cleanup either.
pub async fn dispatch_local(server: &RpcServer, request: Request) -> Result<Value> {
    let acquired = Mutex::new(HashSet::new());
    dispatch(server, request, &acquired).await
}

pub struct RpcServer {
    pub address: Address,
    registry: Arc<ObjectRegistry>,
    names: Mutex<HashMap<String, u64>>,
    shutdown: Arc<Notify>,
}

impl RpcServer {
    /// Binds `address` and starts serving in the background. Returns once
    /// the listener is bound (the resolved address is on the returned
    /// server), not once serving stops.
    pub async fn bind(address: &Address, refcounting_enabled: bool) -> Result<Arc<RpcServer>> {
        let (resolved, listener) = transport::bind(address).await?;
        let server = Arc::new(RpcServer {
            address: resolved,
            registry: Arc::new(ObjectRegistry::new(refcounting_enabled)),
            names: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        });
        tokio::spawn(accept_loop(server.clone(), listener));
        local_servers().lock().unwrap().insert(server.address.clone(), server.clone());
        Ok(server)
    }

    /// Registers `object` and gives it a process-wide name other peers can
    /// resolve through `Action::GetProxy`/`Action::Import` (pyacq's
    /// `with_name` registration at server construction).
    pub fn register_named(&self, name: &str, object: Arc<dyn RemoteObject>) -> u64 {
        let obj_id = self.registry.register(object);
        self.names.lock().unwrap().insert(name.to_string(), obj_id);
        obj_id
    }

    pub fn register(&self, object: Arc<dyn RemoteObject>) -> u64 {
        self.registry.register(object)
    }

    pub fn registry(&self) -> Arc<ObjectRegistry> {
        self.registry.clone()
    }

    pub fn close(&self) {
        self.shutdown.notify_waiters();
        local_servers().lock().unwrap().remove(&self.address);
    }
}

async fn accept_loop(server: Arc<RpcServer>, mut listener: crate::transport::Listener) {
    loop {
        tokio::select! {
            _ = server.shutdown.notified() => {
                debug!(address = %server.address, "rpc server closing");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok(conn) => {
                        tokio::spawn(serve_conn(server.clone(), conn));
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                        return;
                    }
                }
            }
        }
    }
}

async fn serve_conn(server: Arc<RpcServer>, mut conn: Conn) {
    // Ids this connection itself acquired (via get_proxy/import), so
    // disconnect only releases what this client held — the registry is
    // shared by every connection this server accepts, so releasing
    // everything here would free other clients' live objects (§9(b)).
    let acquired: Mutex<HashSet<u64>> = Mutex::new(HashSet::new());
    loop {
        let frame = match conn.recv().await {
            Ok(frame) => frame,
            Err(_) => break,
        };
        // The envelope itself (req_id/action/return_type) is parsed first
        // and separately from `opts`, so a corrupt `opts` payload doesn't
        // fail the whole frame: `req_id` is already known, so a
        // `ProtocolError` response can still be sent instead of the
        // caller hanging to its timeout.
        let raw = match RawRequest::decode(&frame) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%err, "dropping malformed envelope");
                continue;
            }
        };
        let req_id = raw.req_id;
        let response = match raw.opts() {
            Ok(opts) => {
                let request = Request { req_id, action: raw.action, return_type: raw.return_type, opts };
                dispatch(&server, request, &acquired).await
            }
            Err(err) => {
                warn!(%err, "malformed opts payload");
                Err(CoreError::Protocol(format!("malformed opts payload: {err}")))
            }
        };
        if let Some(req_id) = req_id {
            let response = match response {
                Ok(rval) => Response { req_id, rval: Some(rval), error: None },
                Err(err) => {
                    let (type_name, traceback) = err.to_wire();
                    Response { req_id, rval: None, error: Some((type_name, traceback)) }
                }
            };
            let bytes = match response.encode() {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(%err, "failed to encode response");
                    continue;
                }
            };
            if conn.send(bytes).await.is_err() {
                break;
            }
        }
    }
    let ids: Vec<u64> = acquired.lock().unwrap().drain().collect();
    server.registry.release_many(&ids);
}

fn field<'a>(opts: &'a Value, key: &str) -> Option<&'a Value> {
    match opts {
        Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
        _ => None,
    }
}

fn require_obj_id(opts: &Value) -> Result<u64> {
    match field(opts, "obj_id") {
        Some(Value::Int(id)) => Ok(*id as u64),
        _ => Err(CoreError::Protocol("missing obj_id".into())),
    }
}

fn path_segments(opts: &Value) -> Vec<Value> {
    match field(opts, "path") {
        Some(Value::List(items)) => items.clone(),
        _ => Vec::new(),
    }
}

async fn dispatch(server: &RpcServer, request: Request, acquired: &Mutex<HashSet<u64>>) -> Result<Value> {
    match request.action {
        Action::Ping => Ok(Value::Bool(true)),

        Action::GetObjAttr => {
            let obj_id = require_obj_id(&request.opts)?;
            let path = path_segments(&request.opts);
            resolve_path(server, obj_id, &path, request.return_type)
        }

        Action::GetItem => {
            let obj_id = require_obj_id(&request.opts)?;
            let index = field(&request.opts, "index").cloned().unwrap_or(Value::Null);
            server.registry().with_object(obj_id, |obj| obj.get_item(&index))?
        }

        Action::CallObj => {
            let obj_id = require_obj_id(&request.opts)?;
            let path = path_segments(&request.opts);
            let method = match field(&request.opts, "method") {
                Some(Value::Text(name)) => name.clone(),
                _ => return Err(CoreError::Protocol("missing method name".into())),
            };
            let args = match field(&request.opts, "args") {
                Some(Value::List(items)) => items.clone(),
                _ => Vec::new(),
            };
            let target = if path.is_empty() {
                obj_id
            } else {
                match resolve_path(server, obj_id, &path, ReturnType::Proxy)? {
                    Value::Proxy(reference) => reference.obj_id,
                    _ => return Err(CoreError::Protocol("call target is not an object".into())),
                }
            };
            server.registry().with_object(target, |obj| obj.call(&method, &args))?
        }

        Action::Transfer => {
            let value = field(&request.opts, "value").cloned().unwrap_or(Value::Null);
            let registry = server.registry();
            let obj_id = registry.register(Arc::new(ValueObject::new(
                value,
                &registry,
                server.address.to_string(),
            )));
            Ok(Value::Proxy(proto::ProxyRef {
                address: server.address.to_string(),
                obj_id,
                type_name: "Value".to_string(),
                attributes: Vec::new(),
            }))
        }

        Action::GetProxy | Action::Import => {
            let name = match field(&request.opts, "name") {
                Some(Value::Text(name)) => name.clone(),
                _ => return Err(CoreError::Protocol("missing name".into())),
            };
            let obj_id = *server
                .names
                .lock()
                .unwrap()
                .get(&name)
                .ok_or_else(|| CoreError::Registry(format!("no object registered as {name}")))?;
            server.registry().acquire(obj_id)?;
            acquired.lock().unwrap().insert(obj_id);
            Ok(Value::Proxy(proto::ProxyRef {
                address: server.address.to_string(),
                obj_id,
                type_name: name,
                attributes: Vec::new(),
            }))
        }

        Action::Delete => {
            let obj_id = require_obj_id(&request.opts)?;
            server.registry().delete(obj_id)?;
            acquired.lock().unwrap().remove(&obj_id);
            Ok(Value::Null)
        }

        Action::Release => {
            let obj_id = require_obj_id(&request.opts)?;
            server.registry().release(obj_id)?;
            acquired.lock().unwrap().remove(&obj_id);
            Ok(Value::Null)
        }

        Action::ReleaseAll => {
            let ids: Vec<u64> = acquired.lock().unwrap().drain().collect();
            server.registry().release_many(&ids);
            Ok(Value::Null)
        }

        Action::CloseServer => {
            server.close();
            Ok(Value::Null)
        }

        Action::Return => Err(CoreError::Protocol("Return is not a request action".into())),
    }
}

fn resolve_path(server: &RpcServer, obj_id: u64, path: &[Value], return_type: ReturnType) -> Result<Value> {
    let mut current = obj_id;
    let mut value = Value::Proxy(proto::ProxyRef {
        address: server.address.to_string(),
        obj_id: current,
        type_name: String::new(),
        attributes: Vec::new(),
    });
    for (i, step) in path.iter().enumerate() {
        let is_last = i == path.len() - 1;
        value = server.registry().with_object(current, |obj| match step {
            Value::Text(name) => obj.get_attr(name),
            index => obj.get_item(index),
        })??;
        if !is_last {
            current = match &value {
                Value::Proxy(reference) => reference.obj_id,
                _ => return Err(CoreError::Protocol("attribute path crosses a non-object value".into())),
            };
        }
    }
    match (return_type, &value) {
        (ReturnType::Value, Value::Proxy(_)) => {
            Err(CoreError::Protocol("caller requested a plain value but got a proxy".into()))
        }
        (ReturnType::None, _) => Ok(Value::Null),
        _ => Ok(value),
    }
}
