//! The node lifecycle state machine (§4.5). The FSM wrapper
//! ([`NodeHandle`]) is deliberately separate from the variant body
//! ([`Node`]): a node implementation only supplies the four lifecycle
//! hooks and its port specs, and `NodeHandle` is the only thing that
//! enforces which transition is legal from which state.

use bus::error::{CoreError, Result};
use bus::Address;
use proto::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use stream::{OutputStream, StreamSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Configured,
    Initialized,
    Started,
}

/// A node variant's behavior. Every method has a no-op default so a
/// simple node (a pure transform with fixed ports) only overrides what it
/// needs, the same shape as pyacq's node subclasses overriding only the
/// hooks relevant to them.
pub trait Node: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Output ports this node exposes once initialized, and the stream
    /// spec each binds with. Called after `_initialize` so a node can
    /// resolve shapes that were left unspecified at `configure` time.
    fn output_specs(&self) -> Vec<(String, StreamSpec)> {
        Vec::new()
    }

    fn input_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        let _ = params;
        Ok(())
    }

    /// Must leave the node ready to bind all of `output_specs`' streams;
    /// `NodeHandle::initialize` does the actual binding right after this
    /// returns.
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// `failures` is how a background thread/task this spawns reports an
    /// unexpected crash back into the owning `NodeHandle` (§7) — clone it
    /// into the thread and call `.report(..)` from wherever the thread's
    /// top-level panic/error handling lives. Most nodes run synchronously
    /// and never touch it.
    fn start(&mut self, failures: FailureSink) -> Result<()> {
        let _ = failures;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// No-op unless the node is a UI-bearing variant (pyacq's
    /// `WidgetNode.show`); most nodes never override this.
    fn show(&self) {}
}

/// A cloneable handle a node's background thread/task uses to report an
/// unexpected crash back into its owning `NodeHandle` (§7: a producer
/// thread crash sets the node to an error state, observable through
/// `any_node_running`/`last_error`, rather than leaving the handle stuck
/// reporting `Started` forever). `Weak` so a crashed or already-closed
/// handle never gets resurrected by a late report.
#[derive(Clone)]
pub struct FailureSink(Weak<NodeHandle>);

impl FailureSink {
    pub fn report(&self, error: impl Into<String>) {
        if let Some(handle) = self.0.upgrade() {
            handle.fail(error.into());
        }
    }
}

pub struct NodeHandle {
    name: String,
    node: Mutex<Box<dyn Node>>,
    state: Mutex<LifecycleState>,
    outputs: Mutex<HashMap<String, Arc<OutputStream>>>,
    inputs: Mutex<HashMap<String, stream::InputStream>>,
    last_error: Mutex<Option<String>>,
    self_weak: Weak<NodeHandle>,
}

impl NodeHandle {
    pub fn new(name: String, node: Box<dyn Node>) -> Arc<NodeHandle> {
        Arc::new_cyclic(|weak| NodeHandle {
            name,
            node: Mutex::new(node),
            state: Mutex::new(LifecycleState::Created),
            outputs: Mutex::new(HashMap::new()),
            inputs: Mutex::new(HashMap::new()),
            last_error: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    /// A handle this node's `start` implementation can clone into
    /// whatever background thread/task it spawns.
    pub fn failure_sink(&self) -> FailureSink {
        FailureSink(self.self_weak.clone())
    }

    /// Reports that this node's background work died unexpectedly.
    /// Moves a `Started` node back to `Initialized` immediately, without
    /// running `Node::stop`/`close` — the thread that would drive those
    /// is already gone — so `any_node_running` reflects the crash as
    /// soon as it's reported.
    pub fn fail(&self, error: String) {
        let mut state = self.state.lock().unwrap();
        *self.last_error.lock().unwrap() = Some(error);
        if *state == LifecycleState::Started {
            *state = LifecycleState::Initialized;
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.node.lock().unwrap().type_name()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Started
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn configure(&self, params: Value) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match *state {
            LifecycleState::Created | LifecycleState::Configured => {
                self.node.lock().unwrap().configure(&params)?;
                *state = LifecycleState::Configured;
                Ok(())
            }
            other => Err(CoreError::Lifecycle(format!("configure is invalid from {other:?}"))),
        }
    }

    /// Runs `_initialize`, then binds every output port's stream. Each
    /// port's address is `inproc://{node_name}-{port_name}`; a `NodeGroup`
    /// hosting this node in a separate process would instead give it a
    /// routable `tcp://`/`ipc://` base (left to the caller constructing
    /// the node, not this handle).
    pub async fn initialize(&self) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if *state != LifecycleState::Configured {
                return Err(CoreError::Lifecycle(format!("initialize is invalid from {:?}", *state)));
            }
        }
        self.node.lock().unwrap().initialize()?;
        let specs = self.node.lock().unwrap().output_specs();
        for (port_name, spec) in specs {
            let address: Address = format!("inproc://{}-{port_name}", self.name).parse()?;
            let output = OutputStream::bind(&address, spec).await?;
            self.outputs.lock().unwrap().insert(port_name, output);
        }
        *self.state.lock().unwrap() = LifecycleState::Initialized;
        Ok(())
    }

    /// Drops the state lock before running `Node::start`, since a node
    /// whose background thread reports synchronously (or crashes before
    /// `start` even returns) calls back into [`FailureSink::report`],
    /// which needs that same lock. The `Started` transition is skipped if
    /// a failure already landed while `start` was running, so a node that
    /// crashes instantly doesn't get reported as running anyway.
    pub fn start(&self) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if *state != LifecycleState::Initialized {
                return Err(CoreError::Lifecycle(format!("start is invalid from {:?}", *state)));
            }
        }
        self.node.lock().unwrap().start(self.failure_sink())?;
        let mut state = self.state.lock().unwrap();
        if *state == LifecycleState::Initialized {
            *state = LifecycleState::Started;
        }
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != LifecycleState::Started {
            return Err(CoreError::Lifecycle(format!("stop is invalid from {:?}", *state)));
        }
        self.node.lock().unwrap().stop()?;
        *state = LifecycleState::Initialized;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state == LifecycleState::Started {
            return Err(CoreError::Lifecycle("close is invalid while started".into()));
        }
        self.node.lock().unwrap().close()?;
        self.outputs.lock().unwrap().clear();
        self.inputs.lock().unwrap().clear();
        *state = LifecycleState::Created;
        Ok(())
    }

    pub fn output(&self, name: &str) -> Option<Arc<OutputStream>> {
        self.outputs.lock().unwrap().get(name).cloned()
    }

    /// Connects input port `name` to an already-bound `OutputStream`
    /// (§4.4 `inputs[name].connect(output_port_or_proxy)`).
    pub async fn connect_input(&self, name: &str, source: Arc<OutputStream>) -> Result<()> {
        let has_port = self.node.lock().unwrap().input_names().iter().any(|n| n == name);
        if !has_port {
            return Err(CoreError::StreamSpec(format!("no such input port: {name}")));
        }
        let input = stream::InputStream::connect(&source.address, source.spec.clone()).await?;
        self.inputs.lock().unwrap().insert(name.to_string(), input);
        Ok(())
    }

    pub fn show(&self) {
        self.node.lock().unwrap().show();
    }
}

impl bus::RemoteObject for NodeHandle {
    fn get_attr(&self, name: &str) -> Result<Value> {
        match name {
            "running" => Ok(Value::Bool(self.is_running())),
            "last_error" => Ok(self.last_error().map(Value::Text).unwrap_or(Value::Null)),
            "type_name" => Ok(Value::Text(self.type_name().to_string())),
            "name" => Ok(Value::Text(self.name.clone())),
            _ => Err(CoreError::Protocol(format!("no such attribute: {name}"))),
        }
    }

    fn call(&self, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "configure" => {
                self.configure(args.first().cloned().unwrap_or(Value::Null))?;
                Ok(Value::Null)
            }
            // `initialize` is the one lifecycle call with async work (it
            // binds sockets); bridging back to sync dispatch here mirrors
            // the teacher's own interprocess-transport code, which drives
            // async connect/accept calls from a synchronous RPC thread
            // via `Handle::current().block_on`.
            "initialize" => {
                tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(self.initialize()))?;
                Ok(Value::Null)
            }
            "start" => {
                self.start()?;
                Ok(Value::Null)
            }
            "stop" => {
                self.stop()?;
                Ok(Value::Null)
            }
            "close" => {
                self.close()?;
                Ok(Value::Null)
            }
            "show" => {
                self.show();
                Ok(Value::Null)
            }
            _ => Err(CoreError::Protocol(format!("no such method: {method}"))),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct PassThrough {
        started: bool,
    }

    impl Node for PassThrough {
        fn type_name(&self) -> &'static str {
            "PassThrough"
        }

        fn output_specs(&self) -> Vec<(String, StreamSpec)> {
            vec![(
                "out".to_string(),
                StreamSpec {
                    name: "out".to_string(),
                    dtype: "f32".to_string(),
                    shape: vec![1],
                    transfer_mode: stream::TransferMode::PlainData,
                    fill_limit: 16,
                },
            )]
        }

        fn input_names(&self) -> Vec<String> {
            vec!["in".to_string()]
        }

        fn start(&mut self, failures: FailureSink) -> Result<()> {
            self.started = true;
            let _ = failures;
            Ok(())
        }
    }

    struct Crashes;

    impl Node for Crashes {
        fn type_name(&self) -> &'static str {
            "Crashes"
        }

        fn start(&mut self, failures: FailureSink) -> Result<()> {
            std::thread::spawn(move || {
                failures.report("producer thread panicked");
            })
            .join()
            .unwrap();
            Ok(())
        }
    }

    #[tokio::test]
    async fn lifecycle_transitions_follow_the_state_machine() {
        let handle = NodeHandle::new("pt1".to_string(), Box::new(PassThrough::default()));
        assert_eq!(handle.state(), LifecycleState::Created);

        handle.configure(Value::Null).unwrap();
        assert_eq!(handle.state(), LifecycleState::Configured);

        handle.initialize().await.unwrap();
        assert_eq!(handle.state(), LifecycleState::Initialized);
        assert!(handle.output("out").is_some());

        handle.start().unwrap();
        assert_eq!(handle.state(), LifecycleState::Started);
        assert!(handle.is_running());

        handle.stop().unwrap();
        assert_eq!(handle.state(), LifecycleState::Initialized);

        handle.close().unwrap();
        assert_eq!(handle.state(), LifecycleState::Created);

        bus::transport::unbind_inproc("pt1-out");
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected_without_side_effects() {
        let handle = NodeHandle::new("pt2".to_string(), Box::new(PassThrough::default()));
        // start() before configure()/initialize() must fail.
        assert!(matches!(handle.start(), Err(CoreError::Lifecycle(_))));
        assert_eq!(handle.state(), LifecycleState::Created);

        handle.configure(Value::Null).unwrap();
        handle.initialize().await.unwrap();
        handle.start().unwrap();

        // close() while started is explicitly forbidden (§4.5 invariant).
        assert!(matches!(handle.close(), Err(CoreError::Lifecycle(_))));
        assert_eq!(handle.state(), LifecycleState::Started);

        handle.stop().unwrap();
        handle.close().unwrap();
        bus::transport::unbind_inproc("pt2-out");
    }

    /// §7: a producer thread reporting failure through its `FailureSink`
    /// must be observable as soon as it happens, without anything else
    /// polling for it.
    #[tokio::test]
    async fn a_reported_failure_is_observable_without_running_stop_or_close() {
        let handle = NodeHandle::new("crashes1".to_string(), Box::new(Crashes));
        handle.configure(Value::Null).unwrap();
        handle.initialize().await.unwrap();
        // Crashes::start reports failure synchronously before start()
        // gets to flip the state to Started, so it never observes Started.
        handle.start().unwrap();

        assert!(!handle.is_running());
        assert_eq!(handle.last_error(), Some("producer thread panicked".to_string()));
        assert_eq!(handle.state(), LifecycleState::Initialized);
    }
}
