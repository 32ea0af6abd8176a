//! Provider engine: exclusive ownership of actuator signals over one
//! persistent bidirectional stream.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected -> Connected -> Registered -> Streaming -> Stopping -> Stopped
//! ```
//!
//! `connect()` reaches Connected, `provide_actuators()` reaches Registered,
//! `start()` opens the stream, sends one ownership claim for every
//! registered path and blocks (bounded by the confirmation timeout) until
//! the databroker confirms - only then is the engine Streaming. Stopped is
//! terminal: stream loss is not retried, a fresh engine is the retry unit.
//!
//! ## Loop layout
//!
//! While Streaming, three loops run concurrently:
//!
//! - **reader/ack loop** - reads the stream; every inbound command is
//!   acknowledged immediately, before its `ActuationRequest` is queued.
//! - **actuation worker** - drains the queue strictly FIFO, one callback
//!   at a time (see [`crate::actuation`]).
//! - **publish pump** - drains values queued by `publish_actual()` and
//!   writes them on the stream.
//!
//! Acks and publishes funnel through one outbound mpsc whose single
//! consumer is the stream itself, so there is at most one writer at a time
//! while the reader proceeds concurrently. The ownership confirmation is a
//! oneshot fulfilled by the reader task - consumed on first use, and its
//! dropped sender doubles as the "stream ended without confirmation" signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::Streaming;
use tracing::{debug, error, info, warn};

use vss_proto::val_v2::open_provider_stream_request::Action as RequestAction;
use vss_proto::val_v2::open_provider_stream_response::Action as ResponseAction;
use vss_proto::val_v2::signal_id::Signal;
use vss_proto::val_v2::val_client::ValClient;
use vss_proto::val_v2::{
    BatchActuateStreamRequest, BatchActuateStreamResponse, ListMetadataRequest,
    OpenProviderStreamRequest, OpenProviderStreamResponse, ProvideActuationRequest,
    PublishValuesRequest,
};
use vss_proto::{numeric_identifier, path_identifier, SignalValue, Value};

use crate::actuation::{spawn_worker, ActuationRequest, CallbackSlot};
use crate::config::BrokerConfig;
use crate::connection::Connection;

/// Engine lifecycle state. Stopped is terminal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Disconnected = 0,
    Connected = 1,
    Registered = 2,
    Streaming = 3,
    Stopping = 4,
    Stopped = 5,
}

impl ProviderState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ProviderState::Connected,
            2 => ProviderState::Registered,
            3 => ProviderState::Streaming,
            4 => ProviderState::Stopping,
            5 => ProviderState::Stopped,
            _ => ProviderState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderState::Disconnected => "disconnected",
            ProviderState::Connected => "connected",
            ProviderState::Registered => "registered",
            ProviderState::Streaming => "streaming",
            ProviderState::Stopping => "stopping",
            ProviderState::Stopped => "stopped",
        }
    }
}

/// Path/id maps built at registration. Numeric ids are only stable for the
/// life of one databroker process, so they are never persisted.
#[derive(Default)]
struct SignalMaps {
    /// Registered paths in registration order - the ownership claim.
    claim_order: Vec<String>,
    path_to_id: HashMap<String, i32>,
    id_to_path: HashMap<i32, String>,
}

/// State shared between the public handle and the stream loops.
struct EngineCore {
    state: AtomicU8,
    running: AtomicBool,
    maps: Mutex<SignalMaps>,
}

impl EngineCore {
    fn state(&self) -> ProviderState {
        ProviderState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ProviderState) {
        debug!("Provider state: {}", state.as_str());
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Provider engine for actuator signals.
///
/// One engine owns one stream session. After `stop()` (or stream loss) the
/// engine stays Stopped; resilience means constructing a new engine.
pub struct ActuatorProvider {
    connection: Arc<Connection>,
    core: Arc<EngineCore>,
    callback: CallbackSlot,
    publish_tx: Mutex<Option<mpsc::Sender<(String, Value)>>>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ActuatorProvider {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            connection: Arc::new(Connection::new(config)),
            core: Arc::new(EngineCore {
                state: AtomicU8::new(ProviderState::Disconnected as u8),
                running: AtomicBool::new(false),
                maps: Mutex::new(SignalMaps::default()),
            }),
            callback: Arc::new(Mutex::new(None)),
            publish_tx: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connect to the databroker. Disconnected -> Connected on success.
    ///
    /// A stopped engine stays stopped; reconnecting means a new engine.
    pub async fn connect(&self) -> bool {
        if self.core.state() == ProviderState::Stopped {
            warn!("Provider is stopped; construct a new engine to reconnect");
            return false;
        }
        if self.connection.connect().await {
            self.core.set_state(ProviderState::Connected);
            true
        } else {
            false
        }
    }

    /// Stop the engine and drop the channel. Idempotent.
    pub async fn disconnect(&self) {
        self.stop().await;
        self.connection.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn state(&self) -> ProviderState {
        self.core.state()
    }

    /// Register the actuator paths this provider will claim.
    ///
    /// Resolves each path's numeric id via a metadata query. A path whose
    /// id cannot be resolved stays in the claim, but later traffic for it
    /// cannot be mapped back and will be dropped with a warning.
    pub async fn provide_actuators<I, S>(&self, paths: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let Some(mut stub) = self.connection.stub() else {
            error!("Cannot register actuators - not connected");
            return false;
        };
        match self.core.state() {
            ProviderState::Connected | ProviderState::Registered => {}
            other => {
                warn!("Cannot register actuators in state {}", other.as_str());
                return false;
            }
        }

        let mut registered = 0usize;
        for path in paths {
            let path = path.into();
            let resolved = query_signal_id(&mut stub, &path).await;
            let mut maps = self.core.maps.lock().expect("signal maps mutex poisoned");
            match resolved {
                Some(id) => {
                    info!("  - {} (id={})", path, id);
                    maps.path_to_id.insert(path.clone(), id);
                    maps.id_to_path.insert(id, path.clone());
                }
                None => warn!("  - {} (id unresolved, claim degraded)", path),
            }
            maps.claim_order.push(path);
            registered += 1;
        }

        info!("Registered provider for {} actuator(s)", registered);
        self.core.set_state(ProviderState::Registered);
        true
    }

    /// Install the callback invoked for each actuation command. Replaces
    /// any previously installed callback.
    pub fn on_actuate_request(&self, callback: impl Fn(&ActuationRequest) + Send + Sync + 'static) {
        *self
            .callback
            .lock()
            .expect("actuation callback mutex poisoned") = Some(Arc::new(callback));
    }

    /// Queue an actual-value publication. Returns immediately.
    ///
    /// Rejected (false) when the path has no resolved id or the engine is
    /// not Streaming - values are never queued across sessions.
    pub fn publish_actual<T: SignalValue>(&self, path: &str, value: T) -> bool {
        self.publish_actual_value(path, value.into_value())
    }

    /// Untyped variant of [`Self::publish_actual`].
    pub fn publish_actual_value(&self, path: &str, value: Value) -> bool {
        let known = self
            .core
            .maps
            .lock()
            .expect("signal maps mutex poisoned")
            .path_to_id
            .contains_key(path);
        if !known {
            warn!("Cannot publish {}: no signal id resolved", path);
            return false;
        }

        let guard = self.publish_tx.lock().expect("publish queue mutex poisoned");
        let Some(tx) = guard.as_ref() else {
            debug!("Ignoring publish for {}: provider not streaming", path);
            return false;
        };
        match tx.try_send((path.to_string(), value)) {
            Ok(()) => {
                debug!("Queued publish for {}", path);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Publish queue full, dropping value for {}", path);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Ignoring publish for {}: provider not streaming", path);
                false
            }
        }
    }

    /// Open the provider stream and claim ownership.
    ///
    /// Registered -> Streaming on confirmation. Blocks the caller until the
    /// databroker confirms the claim, the configurable confirmation timeout
    /// elapses, or the stream closes - the two failure cases shut the
    /// engine down (Stopped) and return false.
    pub async fn start(&self) -> bool {
        if self.core.state() != ProviderState::Registered {
            warn!(
                "Cannot start provider from state {}",
                self.core.state().as_str()
            );
            return false;
        }
        if self.core.running.swap(true, Ordering::SeqCst) {
            warn!("Provider already running");
            return false;
        }
        let Some(stub) = self.connection.stub() else {
            error!("Cannot start provider - not connected");
            self.core.running.store(false, Ordering::SeqCst);
            return false;
        };

        match self.open_stream(stub).await {
            Ok(()) => {
                info!("Provider started");
                true
            }
            Err(e) => {
                error!("Provider start failed: {:#}", e);
                self.stop().await;
                false
            }
        }
    }

    async fn open_stream(&self, mut stub: ValClient<Channel>) -> Result<()> {
        let config = self.connection.config().clone();

        // Outbound half of the stream. Acks and publishes both funnel
        // through this sender; its single consumer is the stream writer.
        let (out_tx, out_rx) =
            mpsc::channel::<OpenProviderStreamRequest>(config.publish_queue_depth);

        let inbound = stub
            .open_provider_stream(ReceiverStream::new(out_rx))
            .await
            .context("Failed to open provider stream")?
            .into_inner();

        // One claim listing every registered path, resolved or degraded.
        let claim: Vec<_> = {
            let maps = self.core.maps.lock().expect("signal maps mutex poisoned");
            maps.claim_order
                .iter()
                .map(|path| path_identifier(path.clone()))
                .collect()
        };
        info!("Sending ownership claim for {} actuator(s)", claim.len());
        out_tx
            .send(OpenProviderStreamRequest {
                action: Some(RequestAction::ProvideActuationRequest(
                    ProvideActuationRequest {
                        actuator_identifiers: claim,
                    },
                )),
            })
            .await
            .map_err(|_| anyhow::anyhow!("Provider stream closed before claim was sent"))?;

        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (shutdown_tx, _) = broadcast::channel(4);
        let (act_tx, act_rx) = mpsc::channel(config.actuation_queue_depth);

        // The reader must run before we wait: the confirmation is fulfilled
        // by the reader task, never by the waiter.
        let reader = tokio::spawn(reader_loop(
            inbound,
            out_tx.clone(),
            act_tx,
            confirm_tx,
            Arc::clone(&self.core),
            shutdown_tx.clone(),
            shutdown_tx.subscribe(),
        ));
        self.tasks.lock().expect("task list mutex poisoned").push(reader);
        *self
            .shutdown_tx
            .lock()
            .expect("shutdown sender mutex poisoned") = Some(shutdown_tx.clone());

        match tokio::time::timeout(config.confirm_timeout(), confirm_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => anyhow::bail!("Provider stream ended before ownership confirmation"),
            Err(_) => anyhow::bail!(
                "Timed out waiting for ownership confirmation ({:?})",
                config.confirm_timeout()
            ),
        }
        info!("Actuator ownership confirmed");

        // Streaming begins: commands dispatch and publishes flow.
        let (pub_tx, pub_rx) = mpsc::channel(config.publish_queue_depth);
        let pump = tokio::spawn(publish_pump(
            pub_rx,
            out_tx,
            Arc::clone(&self.core),
            shutdown_tx.subscribe(),
        ));
        let worker = spawn_worker(act_rx, Arc::clone(&self.callback));
        {
            let mut tasks = self.tasks.lock().expect("task list mutex poisoned");
            tasks.push(pump);
            tasks.push(worker);
        }
        *self.publish_tx.lock().expect("publish queue mutex poisoned") = Some(pub_tx);
        self.core.set_state(ProviderState::Streaming);
        Ok(())
    }

    /// Stop the engine: wake every blocked wait, join the loops, close the
    /// stream. Idempotent, callable from any thread.
    pub async fn stop(&self) {
        let was_running = self.core.running.swap(false, Ordering::SeqCst);
        if was_running {
            info!("Stopping provider");
        }
        if matches!(
            self.core.state(),
            ProviderState::Registered | ProviderState::Streaming
        ) {
            self.core.set_state(ProviderState::Stopping);
        }

        // Wake everything: the broadcast stops the reader and the pump;
        // dropping the publish sender closes the pump queue; the reader
        // exiting drops the actuation sender, which wakes the worker.
        if let Some(shutdown) = self
            .shutdown_tx
            .lock()
            .expect("shutdown sender mutex poisoned")
            .take()
        {
            let _ = shutdown.send(());
        }
        self.publish_tx
            .lock()
            .expect("publish queue mutex poisoned")
            .take();

        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().expect("task list mutex poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Provider task ended abnormally: {}", e);
            }
        }

        if matches!(
            self.core.state(),
            ProviderState::Registered | ProviderState::Streaming | ProviderState::Stopping
        ) {
            self.core.set_state(ProviderState::Stopped);
            info!("Provider stopped");
        }
    }
}

/// Resolve a path to its databroker-assigned numeric id.
async fn query_signal_id(stub: &mut ValClient<Channel>, path: &str) -> Option<i32> {
    let request = ListMetadataRequest {
        root: path.to_string(),
        filter: String::new(),
    };
    match stub.list_metadata(request).await {
        Ok(response) => {
            let found = response
                .into_inner()
                .metadata
                .into_iter()
                .find(|metadata| metadata.path == path)
                .map(|metadata| metadata.id);
            if found.is_none() {
                warn!("No metadata found for path {}", path);
            }
            found
        }
        Err(status) => {
            warn!("ListMetadata failed for {}: {}", path, status.message());
            None
        }
    }
}

/// Reader/ack loop: blocks on stream reads until shutdown or stream loss.
async fn reader_loop(
    mut inbound: Streaming<OpenProviderStreamResponse>,
    out_tx: mpsc::Sender<OpenProviderStreamRequest>,
    act_tx: mpsc::Sender<ActuationRequest>,
    confirm_tx: oneshot::Sender<()>,
    core: Arc<EngineCore>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("Provider reader loop started");
    let mut confirm_tx = Some(confirm_tx);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => break,

            message = inbound.message() => match message {
                Ok(Some(response)) => {
                    handle_response(response, &out_tx, &act_tx, &mut confirm_tx, &core).await;
                }
                Ok(None) => {
                    if core.running.load(Ordering::SeqCst) {
                        warn!("Provider stream closed by server");
                    }
                    break;
                }
                Err(status) => {
                    if core.running.load(Ordering::SeqCst) {
                        error!("Provider stream error: {}", status.message());
                    }
                    break;
                }
            }
        }
    }

    // An unfulfilled confirmation sender dropped here is the "stream ended
    // without confirmation" signal for the waiter in start().
    drop(confirm_tx);

    // Stream loss while running stops the engine as a whole. No reconnect.
    if core.running.swap(false, Ordering::SeqCst) {
        core.set_state(ProviderState::Stopped);
        let _ = shutdown_tx.send(());
    }
    debug!("Provider reader loop ended");
}

async fn handle_response(
    response: OpenProviderStreamResponse,
    out_tx: &mpsc::Sender<OpenProviderStreamRequest>,
    act_tx: &mpsc::Sender<ActuationRequest>,
    confirm_tx: &mut Option<oneshot::Sender<()>>,
    core: &EngineCore,
) {
    match response.action {
        Some(ResponseAction::ProvideActuationResponse(_)) => {
            info!("Ownership claim confirmed by databroker");
            match confirm_tx.take() {
                Some(tx) => {
                    let _ = tx.send(());
                }
                None => debug!("Duplicate ownership confirmation ignored"),
            }
        }
        Some(ResponseAction::BatchActuateStreamRequest(batch)) => {
            handle_actuation_batch(batch, out_tx, act_tx, core).await;
        }
        Some(ResponseAction::PublishValuesResponse(ack)) => {
            // Entries are only present for failed publishes.
            for (signal_id, error) in &ack.status {
                warn!(
                    "Publish error for signal {} (request {}): {}",
                    signal_id, ack.request_id, error.message
                );
            }
        }
        None => warn!("Received provider stream message with no action"),
    }
}

async fn handle_actuation_batch(
    batch: BatchActuateStreamRequest,
    out_tx: &mpsc::Sender<OpenProviderStreamRequest>,
    act_tx: &mpsc::Sender<ActuationRequest>,
    core: &EngineCore,
) {
    debug!(
        "Received actuation batch with {} command(s)",
        batch.actuate_requests.len()
    );

    for command in batch.actuate_requests {
        let identifier = command.signal_id.and_then(|sid| sid.signal);
        let resolved = {
            let maps = core.maps.lock().expect("signal maps mutex poisoned");
            match &identifier {
                Some(Signal::Id(id)) => maps.id_to_path.get(id).map(|path| (*id, path.clone())),
                Some(Signal::Path(path)) => {
                    maps.path_to_id.get(path).map(|id| (*id, path.clone()))
                }
                None => None,
            }
        };
        let Some((signal_id, path)) = resolved else {
            warn!("Dropping actuation for unknown signal {:?}", identifier);
            continue;
        };

        let value = match &command.value {
            Some(wire) => Value::from_wire(wire),
            None => Value::Bool(false),
        };
        info!("Actuation request for {} (id={})", path, signal_id);

        // Ack first, unconditionally: a slow callback must never look like
        // an unresponsive provider at the stream level.
        let ack = OpenProviderStreamRequest {
            action: Some(RequestAction::BatchActuateStreamResponse(
                BatchActuateStreamResponse {
                    signal_id: Some(numeric_identifier(signal_id)),
                    error: None,
                },
            )),
        };
        if out_tx.send(ack).await.is_err() {
            error!("Failed to send actuation ack for {}: stream closed", path);
            return;
        }

        let request = ActuationRequest {
            path,
            signal_id,
            value,
        };
        if act_tx.send(request).await.is_err() {
            debug!(
                "Actuation worker gone, dropping command for signal {}",
                signal_id
            );
        }
    }
}

/// Publish pump: drains values queued by `publish_actual()` onto the stream.
async fn publish_pump(
    mut queue: mpsc::Receiver<(String, Value)>,
    out_tx: mpsc::Sender<OpenProviderStreamRequest>,
    core: Arc<EngineCore>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("Provider publish loop started");
    let mut request_id: u32 = 0;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => break,

            item = queue.recv() => {
                let Some((path, value)) = item else { break };

                let signal_id = {
                    let maps = core.maps.lock().expect("signal maps mutex poisoned");
                    maps.path_to_id.get(&path).copied()
                };
                let Some(signal_id) = signal_id else {
                    warn!("Cannot publish {}: no signal id resolved", path);
                    continue;
                };

                request_id = request_id.wrapping_add(1);
                let mut data_points = HashMap::new();
                data_points.insert(signal_id, value.to_datapoint());
                let request = OpenProviderStreamRequest {
                    action: Some(RequestAction::PublishValuesRequest(PublishValuesRequest {
                        request_id,
                        data_points,
                    })),
                };

                debug!("Publishing value for {} (id={})", path, signal_id);
                if out_tx.send(request).await.is_err() {
                    error!("Failed to publish {}: stream closed", path);
                    break;
                }
            }
        }
    }
    debug!("Provider publish loop ended");
}
