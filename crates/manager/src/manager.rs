//! Top-level supervisor (§4.8). A `Manager` never talks to the network by
//! itself for bookkeeping — it drives a local, in-process `Host` directly
//! and spawned ones through their RPC proxy — but it is the thing an
//! application constructs first and the thing whose `close` tears
//! everything down in the right order.

use bus::error::{CoreError, Result};
use bus::{Address, Proxy};
use host::{ChildHost, Host, ProcessSpawner};
use node::NodeGroup;
use proto::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Where a nodegroup should be created.
pub enum HostSelector<'a> {
    /// Reuse (creating if necessary) the manager's single in-process host.
    Local,
    /// Spawn a brand-new worker process and host the nodegroup there.
    Spawn,
    /// Host the nodegroup on a previously created host, named by the id
    /// returned from an earlier `create_nodegroup`/`list_hosts`.
    Existing(&'a str),
}

/// A created nodegroup, returned to the caller to drive directly —
/// `Manager` itself only needs enough to close it later.
pub enum NodeGroupHandle {
    Local(Arc<NodeGroup>),
    Remote(Proxy),
}

enum HostKind {
    Local(Arc<Host>),
    Remote(ChildHost),
}

struct HostEntry {
    id: String,
    kind: HostKind,
    nodegroup_names: Vec<String>,
}

/// Creation-ordered so `close` can unwind hosts in reverse order (§4.8).
pub struct Manager {
    hosts: Mutex<Vec<HostEntry>>,
    spawner: ProcessSpawner,
    next_host_id: AtomicU64,
}

impl Manager {
    pub fn new() -> Arc<Manager> {
        Arc::new(Manager { hosts: Mutex::new(Vec::new()), spawner: ProcessSpawner::new(), next_host_id: AtomicU64::new(1) })
    }

    pub fn with_spawner(spawner: ProcessSpawner) -> Arc<Manager> {
        Arc::new(Manager { hosts: Mutex::new(Vec::new()), spawner, next_host_id: AtomicU64::new(1) })
    }

    pub fn list_hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap().iter().map(|entry| entry.id.clone()).collect()
    }

    /// Spawns (or reuses, or finds) the target host, creates a nodegroup
    /// named `name` on it, and returns a handle to drive it.
    pub async fn create_nodegroup(&self, name: &str, host: HostSelector<'_>) -> Result<NodeGroupHandle> {
        match host {
            HostSelector::Local => {
                let existing = {
                    let hosts = self.hosts.lock().unwrap();
                    hosts.iter().find(|entry| matches!(entry.kind, HostKind::Local(_))).map(|entry| entry.id.clone())
                };
                let host_id = match existing {
                    Some(id) => id,
                    None => {
                        let address: Address = "inproc://manager-local-host".parse()?;
                        let host = Host::bind(&address).await?;
                        self.push_host(HostKind::Local(host))
                    }
                };
                self.create_on(&host_id, name).await
            }
            HostSelector::Spawn => {
                let requested: Address = "tcp://127.0.0.1:*".parse()?;
                let child = self.spawner.spawn(&requested).await?;
                let host_id = self.push_host(HostKind::Remote(child));
                self.create_on(&host_id, name).await
            }
            HostSelector::Existing(host_id) => self.create_on(host_id, name).await,
        }
    }

    fn push_host(&self, kind: HostKind) -> String {
        let id = format!("host-{}", self.next_host_id.fetch_add(1, Ordering::Relaxed));
        self.hosts.lock().unwrap().push(HostEntry { id: id.clone(), kind, nodegroup_names: Vec::new() });
        id
    }

    async fn create_on(&self, host_id: &str, name: &str) -> Result<NodeGroupHandle> {
        let kind_is_local = {
            let mut hosts = self.hosts.lock().unwrap();
            let entry = hosts
                .iter_mut()
                .find(|entry| entry.id == host_id)
                .ok_or_else(|| CoreError::Registry(format!("unknown host: {host_id}")))?;
            entry.nodegroup_names.push(name.to_string());
            matches!(entry.kind, HostKind::Local(_))
        };
        if kind_is_local {
            let hosts = self.hosts.lock().unwrap();
            let entry = hosts.iter().find(|entry| entry.id == host_id).unwrap();
            let HostKind::Local(local_host) = &entry.kind else { unreachable!() };
            local_host.create_nodegroup(name)?;
            let group = local_host
                .nodegroup(name)
                .ok_or_else(|| CoreError::Registry(format!("nodegroup vanished after creation: {name}")))?;
            Ok(NodeGroupHandle::Local(group))
        } else {
            let host_proxy = {
                let hosts = self.hosts.lock().unwrap();
                let entry = hosts.iter().find(|entry| entry.id == host_id).unwrap();
                let HostKind::Remote(child) = &entry.kind else { unreachable!() };
                child.host.clone()
            };
            let result = host_proxy.attr("create_nodegroup").call(&[Value::Text(name.to_string())]).await?;
            let reference = match result {
                Value::Proxy(reference) => reference,
                _ => return Err(CoreError::Protocol("create_nodegroup did not return a proxy".into())),
            };
            Ok(NodeGroupHandle::Remote(Proxy::from_ref(reference).await?))
        }
    }

    /// Stops every nodegroup on every host, then tears the hosts down in
    /// reverse creation order (§4.8).
    pub async fn close(&self) -> Result<()> {
        let entries: Vec<HostEntry> = self.hosts.lock().unwrap().drain(..).collect();
        for entry in entries.into_iter().rev() {
            match entry.kind {
                HostKind::Local(host) => {
                    host.close()?;
                }
                HostKind::Remote(child) => {
                    child.shutdown().await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_nodegroup_is_reused_across_calls() {
        let manager = Manager::new();
        let first = manager.create_nodegroup("alpha", HostSelector::Local).await.unwrap();
        assert!(matches!(first, NodeGroupHandle::Local(_)));
        let second = manager.create_nodegroup("beta", HostSelector::Local).await.unwrap();
        assert!(matches!(second, NodeGroupHandle::Local(_)));

        // Both nodegroups landed on the same (single) local host.
        assert_eq!(manager.list_hosts().len(), 1);

        manager.close().await.unwrap();
        bus::transport::unbind_inproc("manager-local-host");
    }

    #[tokio::test]
    async fn unknown_host_id_is_rejected() {
        let manager = Manager::new();
        let err = manager.create_nodegroup("a", HostSelector::Existing("no-such-host")).await.unwrap_err();
        assert!(matches!(err, CoreError::Registry(_)));
    }
}
