//! The per-machine bootstrap server (§4.7). One `Host` owns one
//! `RpcServer` and a set of named `NodeGroup`s; a `Manager` (possibly in
//! another process) drives it entirely through `create_nodegroup`/
//! `close_nodegroup`/`close`.

use bus::error::{CoreError, Result};
use bus::{Address, RemoteObject, RpcServer};
use node::NodeGroup;
use proto::{ProxyRef, Value};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct Host {
    server: Arc<RpcServer>,
    nodegroups: Mutex<HashMap<String, Arc<NodeGroup>>>,
}

impl Host {
    /// Binds `address` and registers itself under the well-known name
    /// `"host"`, so a peer that only knows the address can
    /// `client.get_proxy("host")` without any other handshake.
    pub async fn bind(address: &Address) -> Result<Arc<Host>> {
        let server = RpcServer::bind(address, false).await?;
        let host = Arc::new(Host { server: server.clone(), nodegroups: Mutex::new(HashMap::new()) });
        server.register_named("host", host.clone() as Arc<dyn RemoteObject>);
        Ok(host)
    }

    pub fn address(&self) -> &Address {
        &self.server.address
    }

    pub fn create_nodegroup(&self, name: &str) -> Result<ProxyRef> {
        let mut nodegroups = self.nodegroups.lock().unwrap();
        if nodegroups.contains_key(name) {
            return Err(CoreError::Registry(format!("nodegroup name already in use: {name}")));
        }
        let group = NodeGroup::new(self.server.address.to_string(), self.server.registry());
        let obj_id = self.server.register(group.clone() as Arc<dyn RemoteObject>);
        nodegroups.insert(name.to_string(), group);
        Ok(ProxyRef {
            address: self.server.address.to_string(),
            obj_id,
            type_name: "NodeGroup".to_string(),
            attributes: Vec::new(),
        })
    }

    pub fn close_nodegroup(&self, name: &str) -> Result<()> {
        let group = self
            .nodegroups
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| CoreError::Registry(format!("unknown nodegroup: {name}")))?;
        group.close()
    }

    pub fn list_nodegroups(&self) -> Vec<String> {
        self.nodegroups.lock().unwrap().keys().cloned().collect()
    }

    /// Direct, typed access to a nodegroup this host owns — used by an
    /// in-process `Manager` to drive a local nodegroup without going
    /// through its own RPC server at all.
    pub fn nodegroup(&self, name: &str) -> Option<Arc<NodeGroup>> {
        self.nodegroups.lock().unwrap().get(name).cloned()
    }

    /// Closes every remaining nodegroup, then the RPC server itself.
    pub fn close(&self) -> Result<()> {
        let names: Vec<String> = self.nodegroups.lock().unwrap().keys().cloned().collect();
        for name in names {
            self.close_nodegroup(&name)?;
        }
        self.server.close();
        Ok(())
    }
}

impl RemoteObject for Host {
    fn get_attr(&self, name: &str) -> Result<Value> {
        match name {
            "list_nodegroups" => Ok(Value::List(self.list_nodegroups().into_iter().map(Value::Text).collect())),
            _ => Err(CoreError::Protocol(format!("no such attribute: {name}"))),
        }
    }

    fn call(&self, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "create_nodegroup" => {
                let name = text_arg(args, 0)?;
                Ok(Value::Proxy(self.create_nodegroup(&name)?))
            }
            "close_nodegroup" => {
                let name = text_arg(args, 0)?;
                self.close_nodegroup(&name)?;
                Ok(Value::Null)
            }
            "list_nodegroups" => Ok(Value::List(self.list_nodegroups().into_iter().map(Value::Text).collect())),
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

fn text_arg(args: &[Value], index: usize) -> Result<String> {
    match args.get(index) {
        Some(Value::Text(text)) => Ok(text.clone()),
        _ => Err(CoreError::Protocol("expected a text argument".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus::client_for;

    #[tokio::test]
    async fn create_and_close_nodegroup_over_rpc() {
        let address: Address = "inproc://host-test".parse().unwrap();
        let host = Host::bind(&address).await.unwrap();

        let client = client_for(&address).await.unwrap();
        let host_proxy = client.get_proxy("host").await.unwrap();

        let created = host_proxy.attr("create_nodegroup").call(&[Value::Text("group-a".to_string())]).await.unwrap();
        assert!(matches!(created, Value::Proxy(_)));
        assert_eq!(host.list_nodegroups(), vec!["group-a".to_string()]);

        host_proxy.attr("close_nodegroup").call(&[Value::Text("group-a".to_string())]).await.unwrap();
        assert!(host.list_nodegroups().is_empty());

        host.close().unwrap();
        bus::transport::unbind_inproc("host-test");
    }

    #[tokio::test]
    async fn duplicate_nodegroup_name_is_rejected() {
        let address: Address = "inproc://host-test-dup".parse().unwrap();
        let host = Host::bind(&address).await.unwrap();
        host.create_nodegroup("a").unwrap();
        let err = host.create_nodegroup("a").unwrap_err();
        assert!(matches!(err, CoreError::Registry(_)));
        host.close().unwrap();
        bus::transport::unbind_inproc("host-test-dup");
    }
}
