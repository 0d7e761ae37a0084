//! Per-worker-process node container (§4.6). One `NodeGroup` is the RPC
//! target a remote `Manager`/`Host` drives: it holds the type registry
//! (constructor per node type name) and the node registry (name → live
//! node), and is itself registered in the owning `RpcServer`'s object
//! registry so each node it creates can be handed out as a proxy.

use crate::node::{Node, NodeHandle};
use bus::error::{CoreError, Result};
use bus::{ObjectRegistry, RemoteObject};
use proto::{ProxyRef, Value};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Constructor = Arc<dyn Fn() -> Box<dyn Node> + Send + Sync>;

pub struct NodeGroup {
    address: String,
    registry: Arc<ObjectRegistry>,
    constructors: Mutex<HashMap<String, Constructor>>,
    nodes: Mutex<HashMap<String, Arc<NodeHandle>>>,
}

impl NodeGroup {
    /// `address` is the owning server's resolved address, stamped into
    /// every `ProxyRef` this group hands out for a created node.
    /// `registry` must be that same server's registry, so node proxies
    /// resolve through `Action::GetObjAttr`/`Action::CallObj` like any
    /// other remote object.
    pub fn new(address: String, registry: Arc<ObjectRegistry>) -> Arc<NodeGroup> {
        Arc::new(NodeGroup {
            address,
            registry,
            constructors: Mutex::new(HashMap::new()),
            nodes: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a node type under a constructor closure. This stands in
    /// for pyacq's `register_node_from_module(module_path, class_name)`:
    /// Rust has no runtime module loader, so the "import" step is the
    /// caller linking the node's crate in and handing us a closure that
    /// builds one, rather than a module path string resolved at runtime.
    pub fn register_constructor(&self, type_name: &str, constructor: impl Fn() -> Box<dyn Node> + Send + Sync + 'static) {
        self.constructors.lock().unwrap().insert(type_name.to_string(), Arc::new(constructor));
    }

    pub fn register_builtin<N: Node + Default + 'static>(&self, type_name: &str) {
        self.register_constructor(type_name, || Box::new(N::default()));
    }

    pub fn create_node(&self, type_name: &str, name: &str) -> Result<Arc<NodeHandle>> {
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(name) {
            return Err(CoreError::Registry(format!("node name already in use: {name}")));
        }
        let constructor = self
            .constructors
            .lock()
            .unwrap()
            .get(type_name)
            .cloned()
            .ok_or_else(|| CoreError::Registry(format!("unknown node type: {type_name}")))?;
        let handle = NodeHandle::new(name.to_string(), constructor());
        nodes.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// §4.6(c): forbidden while the node is started.
    pub fn remove_node(&self, name: &str) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let handle = nodes
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::Registry(format!("unknown node: {name}")))?;
        if handle.is_running() {
            return Err(CoreError::Registry(format!("cannot remove running node: {name}")));
        }
        nodes.remove(name);
        Ok(())
    }

    pub fn any_node_running(&self) -> bool {
        self.nodes.lock().unwrap().values().any(|handle| handle.is_running())
    }

    pub fn list_node_types(&self) -> Vec<String> {
        self.constructors.lock().unwrap().keys().cloned().collect()
    }

    pub fn node(&self, name: &str) -> Option<Arc<NodeHandle>> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    /// Stops and drops every node, then forgets the type registry too —
    /// a closed group is not reused.
    pub fn close(&self) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        for (_, handle) in nodes.drain() {
            if handle.is_running() {
                handle.stop()?;
            }
            handle.close()?;
        }
        self.constructors.lock().unwrap().clear();
        Ok(())
    }

    fn proxy_for(&self, name: &str, handle: Arc<NodeHandle>) -> ProxyRef {
        let type_name = handle.type_name().to_string();
        let obj_id = self.registry.register(handle as Arc<dyn RemoteObject>);
        ProxyRef { address: self.address.clone(), obj_id, type_name, attributes: vec![name.to_string()] }
    }
}

impl RemoteObject for NodeGroup {
    fn get_attr(&self, name: &str) -> Result<Value> {
        match name {
            "any_node_running" => Ok(Value::Bool(self.any_node_running())),
            "list_node_types" => {
                Ok(Value::List(self.list_node_types().into_iter().map(Value::Text).collect()))
            }
            _ => Err(CoreError::Protocol(format!("no such attribute: {name}"))),
        }
    }

    fn call(&self, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "create_node" => {
                let type_name = text_arg(args, 0, "type_name")?;
                let name = text_arg(args, 1, "name")?;
                let handle = self.create_node(&type_name, &name)?;
                Ok(Value::Proxy(self.proxy_for(&name, handle)))
            }
            "remove_node" => {
                let name = text_arg(args, 0, "name")?;
                self.remove_node(&name)?;
                Ok(Value::Null)
            }
            "any_node_running" => Ok(Value::Bool(self.any_node_running())),
            "list_node_types" => {
                Ok(Value::List(self.list_node_types().into_iter().map(Value::Text).collect()))
            }
            "close" => {
                self.close()?;
                Ok(Value::Null)
            }
            _ => Err(CoreError::Protocol(format!("no such method: {method}"))),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn text_arg(args: &[Value], index: usize, name: &str) -> Result<String> {
    match args.get(index) {
        Some(Value::Text(text)) => Ok(text.clone()),
        _ => Err(CoreError::Protocol(format!("expected a text argument for {name}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LifecycleState;

    #[derive(Default)]
    struct Sink;

    impl Node for Sink {
        fn type_name(&self) -> &'static str {
            "Sink"
        }
    }

    fn group() -> Arc<NodeGroup> {
        let group = NodeGroup::new("inproc://group-test".to_string(), Arc::new(ObjectRegistry::new(false)));
        group.register_builtin::<Sink>("Sink");
        group
    }

    #[test]
    fn create_node_rejects_duplicate_names() {
        let group = group();
        group.create_node("Sink", "a").unwrap();
        let err = group.create_node("Sink", "a").unwrap_err();
        assert!(matches!(err, CoreError::Registry(_)));
    }

    #[test]
    fn create_node_rejects_unknown_type() {
        let group = group();
        let err = group.create_node("NoSuchType", "a").unwrap_err();
        assert!(matches!(err, CoreError::Registry(_)));
    }

    // S3: remove_node must fail while the node is started, and succeed
    // once it has been stopped.
    #[test]
    fn remove_node_is_forbidden_while_running() {
        let group = group();
        let handle = group.create_node("Sink", "a").unwrap();
        handle.configure(Value::Null).unwrap();
        // initialize() needs a tokio runtime since it binds output streams.
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(handle.initialize()).unwrap();
        handle.start().unwrap();
        assert_eq!(handle.state(), LifecycleState::Started);

        let err = group.remove_node("a").unwrap_err();
        assert!(matches!(err, CoreError::Registry(_)));

        handle.stop().unwrap();
        group.remove_node("a").unwrap();
    }

    #[test]
    fn any_node_running_reflects_started_nodes() {
        let group = group();
        let handle = group.create_node("Sink", "a").unwrap();
        assert!(!group.any_node_running());
        handle.configure(Value::Null).unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(handle.initialize()).unwrap();
        handle.start().unwrap();
        assert!(group.any_node_running());
    }
}
