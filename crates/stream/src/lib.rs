//! Streams connect one `Node`'s output port to another's input port
//! (§4.4). A stream carries a sequence of same-shaped chunks in one of two
//! transfer modes: `PlainData`, where each chunk's bytes travel inline
//! over the control connection, or `SharedMem`, where chunks are written
//! into a [`ring::RingBuffer`] and only `(head, length)` travels over the
//! connection. A slow reader never blocks the writer: each input keeps a
//! bounded queue of unconsumed chunk notices and drops the oldest one
//! once full, the same backpressure policy pyacq's `InputStream` applies.

use bus::error::{CoreError, Result};
use bus::{transport, Address};
use proto::StreamControl;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    PlainData,
    SharedMem,
}

/// Per-sample shape and dtype are fixed for the stream's whole lifetime —
/// there is deliberately no setter here, so "frozen after the first
/// chunk" is just a consequence of ownership rather than a runtime check.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<u64>,
    pub transfer_mode: TransferMode,
    /// Max unconsumed chunk notices an `InputStream` holds before it
    /// starts dropping the oldest one to make room for a new arrival.
    pub fill_limit: usize,
}

impl StreamSpec {
    pub fn sample_bytes(&self, dtype_size: u64) -> u64 {
        self.shape.iter().product::<u64>() * dtype_size
    }
}

struct Subscriber {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

pub struct OutputStream {
    pub spec: StreamSpec,
    pub address: Address,
    ring: Option<Arc<ring::RingBuffer>>,
    next_head: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl OutputStream {
    /// Binds a `PlainData` output: each `send` ships its bytes inline to
    /// every connected subscriber.
    pub async fn bind(address: &Address, spec: StreamSpec) -> Result<Arc<OutputStream>> {
        Self::bind_inner(address, spec, None).await
    }

    /// Binds a `SharedMem` output, allocating its ring buffer. Readers in
    /// this implementation must live in the same process and connect via
    /// [`InputStream::connect_shared`] with the `ring()` handle below —
    /// passing ring-buffer file descriptors across a process boundary is
    /// out of scope here (see this crate's design notes).
    pub async fn bind_shared(
        address: &Address,
        spec: StreamSpec,
        ring_capacity: usize,
    ) -> Result<Arc<OutputStream>> {
        let ring = Arc::new(ring::RingBuffer::new(ring_capacity, &spec.name)?);
        Self::bind_inner(address, spec, Some(ring)).await
    }

    async fn bind_inner(
        address: &Address,
        spec: StreamSpec,
        ring: Option<Arc<ring::RingBuffer>>,
    ) -> Result<Arc<OutputStream>> {
        let (resolved, mut listener) = transport::bind(address).await?;
        let stream = Arc::new(OutputStream {
            spec,
            address: resolved,
            ring,
            next_head: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        });

        let accepting = stream.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => accepting.add_subscriber(conn),
                    Err(err) => {
                        warn!(%err, "stream output accept loop exiting");
                        return;
                    }
                }
            }
        });

        Ok(stream)
    }

    pub fn ring(&self) -> Option<Arc<ring::RingBuffer>> {
        self.ring.clone()
    }

    fn add_subscriber(&self, mut conn: transport::Conn) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.subscribers.lock().unwrap().push(Subscriber { tx });
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if conn.send(frame).await.is_err() {
                    return;
                }
            }
        });
    }

    /// Writes one chunk. In `SharedMem` mode the bytes land in the ring
    /// buffer and only the `(head, length)` pair is sent; in `PlainData`
    /// mode the bytes themselves are sent.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let control = match (&self.spec.transfer_mode, &self.ring) {
            (TransferMode::SharedMem, Some(ring)) => {
                let mut chunk = ring.new_chunk(data.len())?;
                chunk.bytes().copy_from_slice(data);
                let start = chunk.start();
                chunk.publish();
                StreamControl { head: start, length: data.len() as u32, meta: Vec::new(), payload: None }
            }
            (TransferMode::PlainData, _) => {
                // §8 property 1: head is a cumulative sample count, so it
                // must advance by the chunk's length, the same unit the
                // `SharedMem` arm above advances `ring`'s head by.
                let head = self.next_head.fetch_add(data.len() as u64, Ordering::Relaxed);
                StreamControl {
                    head,
                    length: data.len() as u32,
                    meta: Vec::new(),
                    payload: Some(data.to_vec()),
                }
            }
            (TransferMode::SharedMem, None) => {
                return Err(CoreError::StreamSpec(
                    "shared-mem stream has no ring buffer; bind with bind_shared".into(),
                ));
            }
        };
        let bytes = control.encode().map_err(CoreError::from)?;
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|subscriber| subscriber.tx.send(bytes.clone()).is_ok());
        Ok(())
    }
}

struct DropOldestQueue {
    queue: Mutex<VecDeque<StreamControl>>,
    capacity: usize,
    notify: Notify,
}

impl DropOldestQueue {
    fn new(capacity: usize) -> DropOldestQueue {
        DropOldestQueue { queue: Mutex::new(VecDeque::new()), capacity, notify: Notify::new() }
    }

    fn push(&self, item: StreamControl) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(item);
        drop(queue);
        self.notify.notify_one();
    }

    async fn pop(&self) -> StreamControl {
        loop {
            if let Some(item) = self.queue.lock().unwrap().pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}

pub struct InputStream {
    pub spec: StreamSpec,
    ring: Option<Arc<ring::RingBuffer>>,
    queue: Arc<DropOldestQueue>,
}

impl InputStream {
    /// Connects a `PlainData` input to an `OutputStream` bound at `address`.
    pub async fn connect(address: &Address, spec: StreamSpec) -> Result<InputStream> {
        Self::connect_inner(address, spec, None).await
    }

    /// Connects a `SharedMem` input, sharing the writer's ring buffer
    /// directly (see [`OutputStream::bind_shared`]).
    pub async fn connect_shared(
        address: &Address,
        spec: StreamSpec,
        ring: Arc<ring::RingBuffer>,
    ) -> Result<InputStream> {
        Self::connect_inner(address, spec, Some(ring)).await
    }

    async fn connect_inner(
        address: &Address,
        spec: StreamSpec,
        ring: Option<Arc<ring::RingBuffer>>,
    ) -> Result<InputStream> {
        let mut conn = transport::connect(address).await?;
        let queue = Arc::new(DropOldestQueue::new(spec.fill_limit.max(1)));
        let reader_queue = queue.clone();
        tokio::spawn(async move {
            loop {
                let frame = match conn.recv().await {
                    Ok(frame) => frame,
                    Err(_) => return,
                };
                match StreamControl::decode(&frame) {
                    Ok(control) => reader_queue.push(control),
                    Err(err) => warn!(%err, "dropping malformed stream control frame"),
                }
            }
        });
        Ok(InputStream { spec, ring, queue })
    }

    /// Waits for the next chunk and returns its bytes, copied out of the
    /// ring buffer for `SharedMem` streams so the caller doesn't hold a
    /// borrow across an await point.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        let control = self.queue.pop().await;
        match (&self.spec.transfer_mode, &self.ring, control.payload) {
            (TransferMode::PlainData, _, Some(payload)) => Ok(payload),
            (TransferMode::SharedMem, Some(ring), _) => {
                Ok(ring.get(control.head, control.length as usize)?.to_vec())
            }
            _ => Err(CoreError::StreamSpec("stream control frame missing payload".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_spec(name: &str) -> StreamSpec {
        StreamSpec {
            name: name.to_string(),
            dtype: "f32".to_string(),
            shape: vec![1],
            transfer_mode: TransferMode::PlainData,
            fill_limit: 4,
        }
    }

    // §8 property 1: head is a cumulative sample count, so two chunks
    // c1/c2 must satisfy c2.head - c1.head >= len(c2.payload), not just 1
    // per chunk.
    #[tokio::test]
    async fn plaindata_head_advances_by_chunk_length() {
        let address: Address = "inproc://stream-test-head-advance".parse().unwrap();
        let output = OutputStream::bind(&address, plain_spec("samples")).await.unwrap();

        let first_head = output.next_head.load(Ordering::Relaxed);
        output.send(&[1, 2, 3, 4]).unwrap();
        let second_head = output.next_head.load(Ordering::Relaxed);
        assert_eq!(second_head - first_head, 4);

        output.send(&[5, 6]).unwrap();
        let third_head = output.next_head.load(Ordering::Relaxed);
        assert_eq!(third_head - second_head, 2);

        bus::transport::unbind_inproc("stream-test-head-advance");
    }

    #[tokio::test]
    async fn plaindata_round_trips_a_chunk() {
        let address: Address = "inproc://stream-test-plaindata".parse().unwrap();
        let output = OutputStream::bind(&address, plain_spec("samples")).await.unwrap();
        let input = InputStream::connect(&address, plain_spec("samples")).await.unwrap();
        // Give the accept loop a tick to register the subscriber.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        output.send(&[1, 2, 3, 4]).unwrap();
        let received = input.recv().await.unwrap();
        assert_eq!(received, vec![1, 2, 3, 4]);
        bus::transport::unbind_inproc("stream-test-plaindata");
    }

    #[tokio::test]
    async fn sharedmem_round_trips_through_ring_buffer() {
        let address: Address = "inproc://stream-test-sharedmem".parse().unwrap();
        let spec = StreamSpec {
            transfer_mode: TransferMode::SharedMem,
            ..plain_spec("sharedmem-samples")
        };
        let output = OutputStream::bind_shared(&address, spec.clone(), 4096).await.unwrap();
        let ring = output.ring().unwrap();
        let input = InputStream::connect_shared(&address, spec, ring).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        output.send(&[9, 9, 9]).unwrap();
        let received = input.recv().await.unwrap();
        assert_eq!(received, vec![9, 9, 9]);
        bus::transport::unbind_inproc("stream-test-sharedmem");
    }

    #[tokio::test]
    async fn slow_reader_drops_oldest_chunk_instead_of_blocking() {
        let address: Address = "inproc://stream-test-backpressure".parse().unwrap();
        let spec = StreamSpec { fill_limit: 2, ..plain_spec("backpressure-samples") };
        let output = OutputStream::bind(&address, spec.clone()).await.unwrap();
        let input = InputStream::connect(&address, spec).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        for i in 0..5u8 {
            output.send(&[i]).unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // fill_limit is 2, so only the last two of five sends survive.
        let first = input.recv().await.unwrap();
        let second = input.recv().await.unwrap();
        assert_eq!(first, vec![3]);
        assert_eq!(second, vec![4]);
        bus::transport::unbind_inproc("stream-test-backpressure");
    }
}
