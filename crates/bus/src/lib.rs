//! The RPC substrate (§4.2): addresses, framed duplex connections, an
//! object registry servers publish proxies against, and a client that
//! caches one connection per (thread, address) pair and can skip the
//! network entirely when the target server lives in the same process.

pub mod address;
pub mod client;
pub mod error;
pub mod future;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod transport;

pub use address::Address;
pub use client::{client_for, CallMode, RpcClient};
pub use error::{CoreError, Result};
pub use future::RpcFuture;
pub use proxy::Proxy;
pub use registry::{ObjectRegistry, RemoteObject, ValueObject};
pub use server::RpcServer;

#[cfg(test)]
mod tests {
    use super::*;
    use proto::Value;
    use std::any::Any;
    use std::sync::Arc;

    struct Counter {
        value: std::sync::atomic::AtomicI64,
    }

    impl RemoteObject for Counter {
        fn get_attr(&self, name: &str) -> error::Result<Value> {
            match name {
                "value" => Ok(Value::Int(self.value.load(std::sync::atomic::Ordering::SeqCst))),
                _ => Err(CoreError::Protocol(format!("no such attribute: {name}"))),
            }
        }

        fn call(&self, method: &str, args: &[Value]) -> error::Result<Value> {
            match method {
                "increment" => {
                    let by = match args.first() {
                        Some(Value::Int(n)) => *n,
                        _ => 1,
                    };
                    let updated = self.value.fetch_add(by, std::sync::atomic::Ordering::SeqCst) + by;
                    Ok(Value::Int(updated))
                }
                _ => Err(CoreError::Protocol(format!("no such method: {method}"))),
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn direct_dispatch_round_trips_attr_and_call() {
        let address: Address = "inproc://bus-test-counter".parse().unwrap();
        let server = RpcServer::bind(&address, false).await.unwrap();
        server.register_named("counter", Arc::new(Counter { value: std::sync::atomic::AtomicI64::new(0) }));

        let client = client_for(&address).await.unwrap();
        let proxy = client.get_proxy("counter").await.unwrap();

        let incremented = proxy.attr("increment").call(&[Value::Int(5)]).await.unwrap();
        assert_eq!(incremented, Value::Int(5));

        let value = proxy.attr("value").get().await.unwrap();
        assert_eq!(value, Value::Int(5));

        server.close();
        transport::unbind_inproc("bus-test-counter");
    }

    // S4: a transferred map survives the round trip and supports
    // `p['v'][1]` → 2 over a real connection, not just through the
    // registry directly.
    #[tokio::test]
    async fn transfer_returns_an_indexable_proxy() {
        let address: Address = "inproc://bus-test-transfer".parse().unwrap();
        let server = RpcServer::bind(&address, false).await.unwrap();
        let client = client_for(&address).await.unwrap();

        let value = Value::Map(vec![(
            "v".to_string(),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        )]);
        let proxy = client.transfer(value).await.unwrap();

        let nested = proxy.index(Value::Text("v".to_string())).get().await.unwrap();
        let nested_proxy = match nested {
            Value::Proxy(reference) => Proxy::from_ref(reference).await.unwrap(),
            other => panic!("expected a nested proxy, got {other:?}"),
        };
        let item = nested_proxy.index(Value::Int(1)).get().await.unwrap();
        assert_eq!(item, Value::Int(2));

        server.close();
        transport::unbind_inproc("bus-test-transfer");
    }

    #[tokio::test]
    async fn unknown_method_surfaces_as_remote_call_error() {
        let address: Address = "inproc://bus-test-errors".parse().unwrap();
        let server = RpcServer::bind(&address, false).await.unwrap();
        server.register_named("counter", Arc::new(Counter { value: std::sync::atomic::AtomicI64::new(0) }));

        let client = client_for(&address).await.unwrap();
        let proxy = client.get_proxy("counter").await.unwrap();
        let err = proxy.attr("nope").call(&[]).await.unwrap_err();
        assert!(matches!(err, CoreError::RemoteCall { .. }));

        server.close();
        transport::unbind_inproc("bus-test-errors");
    }
}
