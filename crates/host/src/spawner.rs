//! `ProcessSpawner` (§4.7): forks a child process running the `host`
//! binary, synchronizes on its bound address over stdout, and hands back
//! both the child handle and a connected proxy to its `Host`.

use bus::error::{CoreError, Result};
use bus::{client_for, Address, Proxy};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::debug;

/// A spawned worker process plus a ready client proxy to its `Host`.
pub struct ChildHost {
    pub child: Child,
    pub address: Address,
    pub host: Proxy,
}

impl ChildHost {
    /// Sends SIGTERM-equivalent shutdown via the `Host`'s own `close`
    /// method rather than killing the process outright, so nodegroups and
    /// their nodes get a chance to stop cleanly; falls back to `kill` if
    /// the child hasn't exited after the call returns.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.host.attr("close").call(&[]).await;
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = self.child.kill().await;
        }
        Ok(())
    }
}

pub struct ProcessSpawner {
    /// Path to the worker binary (the `host` app). Defaults to the
    /// `PYACQ_HOST_BIN` env var, falling back to `"host"` so it resolves
    /// via `$PATH` in a normal cargo-installed deployment.
    binary: String,
}

impl ProcessSpawner {
    pub fn new() -> ProcessSpawner {
        let binary = std::env::var("PYACQ_HOST_BIN").unwrap_or_else(|_| "host".to_string());
        ProcessSpawner { binary }
    }

    pub fn with_binary(binary: impl Into<String>) -> ProcessSpawner {
        ProcessSpawner { binary: binary.into() }
    }

    /// Spawns a child process bound to `requested` (typically a wildcard
    /// `tcp://` or a fresh `ipc://` path), blocking until the child prints
    /// its resolved address as the first line of stdout.
    pub async fn spawn(&self, requested: &Address) -> Result<ChildHost> {
        let mut child = Command::new(&self.binary)
            .env("PYACQ_HOST_ADDRESS", requested.to_string())
            .stdout(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| CoreError::Protocol(format!("failed to spawn host process: {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Protocol("spawned host process has no stdout".into()))?;
        let mut lines = BufReader::new(stdout).lines();
        let line = lines
            .next_line()
            .await
            .map_err(|err| CoreError::Protocol(format!("failed reading host address: {err}")))?
            .ok_or_else(|| CoreError::Protocol("host process exited before reporting its address".into()))?;
        let address: Address = line.trim().parse()?;
        debug!(%address, "spawned host process");

        let client = client_for(&address).await?;
        let host = client.get_proxy("host").await?;
        Ok(ChildHost { child, address, host })
    }
}

impl Default for ProcessSpawner {
    fn default() -> Self {
        ProcessSpawner::new()
    }
}
