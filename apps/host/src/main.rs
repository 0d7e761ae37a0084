// Host worker entrypoint (Tokio)
//
// Spawned by `ProcessSpawner` (see crates/host/src/spawner.rs): binds a
// `Host` RPC server at the address named by `PYACQ_HOST_ADDRESS`, prints the
// resolved address as a single stdout line (the synchronizing handshake the
// spawner blocks on), then idles until it receives SIGINT/SIGTERM or a peer
// calls `close` on the `Host` proxy.
use anyhow::Result;
use bus::Address;
use host::Host;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let requested: Address = std::env::var("PYACQ_HOST_ADDRESS")
        .unwrap_or_else(|_| "tcp://127.0.0.1:*".to_string())
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid PYACQ_HOST_ADDRESS: {err:?}"))?;

    let host = Host::bind(&requested).await?;
    println!("{}", host.address());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("host received shutdown signal");
        }
        _ = terminate() => {
            tracing::info!("host received SIGTERM");
        }
    }

    host.close()?;
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
