//! Client-side handle to a remote object (§4.1, §5). A `Proxy` has no
//! static per-class API — Rust has nothing like Python's `getattr` — so
//! attribute access and calls go through explicit `attr`/`call`/`get`
//! methods that build up an attribute path lazily and only round-trip to
//! the server when the caller asks for a value (`.get()`) or makes a call
//! (`.call()`).

use crate::client::RpcClient;
use crate::error::Result;
use proto::{ProxyRef, ReturnType, Value};
use std::sync::Arc;

/// A proxy addresses one remote object plus an optional dotted attribute
/// path under it (e.g. `node.inputs["audio"]` is `attributes = ["inputs"]`
/// plus an index step, represented here as a nested `Value::Text` path
/// segment appended by `attr`/`index`).
#[derive(Clone)]
pub struct Proxy {
    client: Arc<RpcClient>,
    obj_id: u64,
    type_name: String,
    path: Vec<PathStep>,
}

#[derive(Clone)]
enum PathStep {
    Attr(String),
    Index(Value),
}

impl Proxy {
    pub(crate) fn new(client: Arc<RpcClient>, reference: ProxyRef) -> Proxy {
        Proxy { client, obj_id: reference.obj_id, type_name: reference.type_name, path: Vec::new() }
    }

    /// Resolves a `ProxyRef` that arrived as a call/attr result (rather
    /// than through `RpcClient::get_proxy`) into a usable `Proxy`,
    /// connecting to whatever server address it names — which may not be
    /// the server the caller is already talking to (§8 property 2: a
    /// proxy transferred through a third server still resolves to the
    /// original object).
    pub async fn from_ref(reference: ProxyRef) -> Result<Proxy> {
        let address: crate::Address = reference.address.parse()?;
        let client = crate::client::client_for(&address).await?;
        Ok(Proxy::new(client, reference))
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Extends the path with an attribute name. Does not touch the
    /// network; the attribute is only resolved when `get`/`call` runs.
    pub fn attr(&self, name: &str) -> Proxy {
        let mut path = self.path.clone();
        path.push(PathStep::Attr(name.to_string()));
        Proxy { client: self.client.clone(), obj_id: self.obj_id, type_name: self.type_name.clone(), path }
    }

    /// Extends the path with an index step (`proxy[value]`).
    pub fn index(&self, value: Value) -> Proxy {
        let mut path = self.path.clone();
        path.push(PathStep::Index(value));
        Proxy { client: self.client.clone(), obj_id: self.obj_id, type_name: self.type_name.clone(), path }
    }

    /// Resolves the current path to a value, following the return-type
    /// policy negotiated with the server (plain value or a nested proxy).
    pub async fn get(&self) -> Result<Value> {
        self.client
            .get_obj_attr(self.obj_id, &self.path_value(), ReturnType::Auto)
            .await
    }

    /// Calls the method named by the current path, e.g.
    /// `proxy.attr("start").call(&[]).await`.
    pub async fn call(&self, args: &[Value]) -> Result<Value> {
        let (method, base_path) = self
            .path
            .split_last()
            .and_then(|(last, rest)| match last {
                PathStep::Attr(name) => Some((name.clone(), rest.to_vec())),
                PathStep::Index(_) => None,
            })
            .ok_or_else(|| {
                crate::error::CoreError::Protocol("call() requires a method name in the path".into())
            })?;
        self.client
            .call_obj(self.obj_id, &Self::encode_path(&base_path), &method, args)
            .await
    }

    fn path_value(&self) -> Value {
        Self::encode_path(&self.path)
    }

    fn encode_path(path: &[PathStep]) -> Value {
        Value::List(
            path.iter()
                .map(|step| match step {
                    PathStep::Attr(name) => Value::Text(name.clone()),
                    PathStep::Index(value) => value.clone(),
                })
                .collect(),
        )
    }
}
