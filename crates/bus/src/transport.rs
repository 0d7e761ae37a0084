//! The duplex, message-oriented point-to-point socket each RPC server binds
//! one of and each client holds one of per (thread, address) pair (§4.2,
//! §5). One connection carries many requests and many responses,
//! interleaved in send order; `req_id` is what lets a client match a
//! response to the call that produced it.
//!
//! Framing is a `u32` big-endian length prefix followed by payload bytes,
//! the same framing the `tcp`/`ipc`/`inproc` backends all share.

use crate::address::Address;
use crate::error::{CoreError, Result};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// One live connection. `send` pushes a whole message; `recv` returns the
/// next whole message or an error once the peer is gone.
pub enum Conn {
    Tcp(TcpStream),
    #[cfg(feature = "with-ipc")]
    Ipc(interprocess::local_socket::tokio::Stream),
    Inproc { tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>> },
}

impl Conn {
    pub async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        match self {
            Conn::Tcp(stream) => write_frame(stream, &bytes).await,
            #[cfg(feature = "with-ipc")]
            Conn::Ipc(stream) => write_frame(stream, &bytes).await,
            Conn::Inproc { tx, .. } => tx
                .send(bytes)
                .map_err(|_| CoreError::Protocol("inproc peer dropped".into())),
        }
    }

    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        match self {
            Conn::Tcp(stream) => read_frame(stream).await,
            #[cfg(feature = "with-ipc")]
            Conn::Ipc(stream) => read_frame(stream).await,
            Conn::Inproc { rx, .. } => {
                rx.recv().await.ok_or_else(|| CoreError::Protocol("inproc peer closed".into()))
            }
        }
    }
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> Result<()> {
    let len = bytes.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(bytes).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R: tokio::io::AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.map_err(|_| CoreError::Protocol("connection closed".into()))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Accepts new connections on a bound address.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(feature = "with-ipc")]
    Ipc(interprocess::local_socket::tokio::Listener),
    Inproc(mpsc::UnboundedReceiver<Conn>),
}

impl Listener {
    pub async fn accept(&mut self) -> Result<Conn> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Conn::Tcp(stream))
            }
            #[cfg(feature = "with-ipc")]
            Listener::Ipc(listener) => {
                let stream = listener.accept().await?;
                Ok(Conn::Ipc(stream))
            }
            Listener::Inproc(rx) => {
                rx.recv().await.ok_or_else(|| CoreError::Protocol("inproc listener closed".into()))
            }
        }
    }
}

static INPROC_REGISTRY: OnceLock<Mutex<HashMap<String, mpsc::UnboundedSender<Conn>>>> = OnceLock::new();

fn inproc_registry() -> &'static Mutex<HashMap<String, mpsc::UnboundedSender<Conn>>> {
    INPROC_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Bind `address`, returning the resolved address (wildcard ports become
/// concrete) and a `Listener` to accept connections on.
pub async fn bind(address: &Address) -> Result<(Address, Listener)> {
    match address {
        Address::Tcp { host, port } => {
            let listener = TcpListener::bind((host.as_str(), *port)).await?;
            let resolved_port = listener.local_addr()?.port();
            Ok((address.resolved(resolved_port), Listener::Tcp(listener)))
        }
        Address::TcpWildcard { host } => {
            let listener = TcpListener::bind((host.as_str(), 0)).await?;
            let resolved_port = listener.local_addr()?.port();
            Ok((address.resolved(resolved_port), Listener::Tcp(listener)))
        }
        Address::Ipc { path } => bind_ipc(address, path).await,
        Address::Inproc { name } => {
            let mut map = inproc_registry().lock().unwrap();
            if map.contains_key(name) {
                return Err(CoreError::Protocol(format!("address already bound: {address}")));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            map.insert(name.clone(), tx);
            Ok((address.clone(), Listener::Inproc(rx)))
        }
    }
}

#[cfg(feature = "with-ipc")]
async fn bind_ipc(address: &Address, path: &str) -> Result<(Address, Listener)> {
    use interprocess::local_socket::{GenericNamespaced, ListenerOptions, ToNsName};
    let name = path
        .to_string()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|e| CoreError::Protocol(e.to_string()))?;
    let listener = ListenerOptions::new()
        .name(name)
        .create_tokio()
        .map_err(|e| CoreError::Protocol(e.to_string()))?;
    Ok((address.clone(), Listener::Ipc(listener)))
}

#[cfg(not(feature = "with-ipc"))]
async fn bind_ipc(_address: &Address, _path: &str) -> Result<(Address, Listener)> {
    Err(CoreError::Protocol("ipc transport requires the with-ipc feature".into()))
}

/// Connect to a bound `address`.
pub async fn connect(address: &Address) -> Result<Conn> {
    match address {
        Address::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            Ok(Conn::Tcp(stream))
        }
        Address::TcpWildcard { .. } => {
            Err(CoreError::Protocol(format!("cannot connect to unresolved address: {address}")))
        }
        Address::Ipc { path } => connect_ipc(path).await,
        Address::Inproc { name } => {
            let sender = {
                let map = inproc_registry().lock().unwrap();
                map.get(name)
                    .cloned()
                    .ok_or_else(|| CoreError::Protocol(format!("no server bound at {address}")))?
            };
            let (client_tx, server_rx) = mpsc::unbounded_channel();
            let (server_tx, client_rx) = mpsc::unbounded_channel();
            sender
                .send(Conn::Inproc { tx: server_tx, rx: server_rx })
                .map_err(|_| CoreError::Protocol("inproc listener closed".into()))?;
            Ok(Conn::Inproc { tx: client_tx, rx: client_rx })
        }
    }
}

#[cfg(feature = "with-ipc")]
async fn connect_ipc(path: &str) -> Result<Conn> {
    use interprocess::local_socket::{tokio::Stream, GenericNamespaced, ToNsName};
    let name = path
        .to_string()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|e| CoreError::Protocol(e.to_string()))?;
    let stream = Stream::connect(name).await.map_err(|e| CoreError::Protocol(e.to_string()))?;
    Ok(Conn::Ipc(stream))
}

#[cfg(not(feature = "with-ipc"))]
async fn connect_ipc(_path: &str) -> Result<Conn> {
    Err(CoreError::Protocol("ipc transport requires the with-ipc feature".into()))
}

/// Removes an inproc binding so later tests / rebinds don't collide.
pub fn unbind_inproc(name: &str) {
    inproc_registry().lock().unwrap().remove(name);
}
