//! In-process mock databroker for integration tests.
//!
//! Implements the generated VAL service trait over a real tonic server bound
//! to an ephemeral 127.0.0.1 port, so the SDK is exercised over the actual
//! transport. The mock records claims, acks, and publishes for assertions,
//! and can be told to withhold ownership confirmation or to drop the
//! provider stream on claim receipt.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status, Streaming};

use vss_proto::val_v2::open_provider_stream_request::Action as RequestAction;
use vss_proto::val_v2::open_provider_stream_response::Action as ResponseAction;
use vss_proto::val_v2::signal_id::Signal;
use vss_proto::val_v2::val_server::{Val, ValServer};
use vss_proto::val_v2::{
    ActuateRequest, ActuateResponse, BatchActuateStreamRequest, Datapoint, GetValueRequest,
    GetValueResponse, ListMetadataRequest, ListMetadataResponse, Metadata,
    OpenProviderStreamRequest, OpenProviderStreamResponse, ProvideActuationResponse,
    PublishValueRequest, PublishValueResponse, SubscribeRequest, SubscribeResponse,
};
use vss_proto::{numeric_identifier, path_identifier, Value};
use vss_sdk::BrokerConfig;

type CommandSender = mpsc::UnboundedSender<ActuateRequest>;
type SubscriberSender = mpsc::Sender<Result<SubscribeResponse, Status>>;

#[derive(Default)]
pub struct BrokerState {
    /// Current datapoint per path (point gets, publish, provider publishes).
    pub values: Mutex<HashMap<String, Datapoint>>,
    /// Known signals: path -> numeric id.
    pub metadata: Mutex<HashMap<String, i32>>,
    /// Reverse map: numeric id -> path.
    pub ids: Mutex<HashMap<i32, String>>,
    /// Paths with a confirmed owner, routed to that provider's stream.
    pub owners: Mutex<HashMap<String, CommandSender>>,
    /// Active subscription streams: (paths, sender).
    pub subscribers: Mutex<Vec<(Vec<String>, SubscriberSender)>>,
    /// Paths listed in received ownership claims, in claim order.
    pub claims: Mutex<Vec<String>>,
    /// Signal ids referenced by provider acknowledgments, in arrival order.
    pub acks: Mutex<Vec<i32>>,
    /// (signal id, datapoint) pairs published over the provider stream.
    pub published: Mutex<Vec<(i32, Datapoint)>>,
    /// Confirm ownership claims (true) or withhold confirmation (false).
    pub grant_ownership: bool,
    /// Drop the provider stream as soon as a claim arrives.
    pub close_on_claim: bool,
}

impl BrokerState {
    pub fn granting() -> Self {
        Self {
            grant_ownership: true,
            ..Self::default()
        }
    }

    pub fn withholding() -> Self {
        Self {
            grant_ownership: false,
            ..Self::default()
        }
    }

    pub fn closing_on_claim() -> Self {
        Self {
            close_on_claim: true,
            ..Self::default()
        }
    }

    /// Register a known signal (path and numeric id).
    pub fn with_signal(self, path: &str, id: i32) -> Self {
        self.metadata.lock().unwrap().insert(path.to_string(), id);
        self.ids.lock().unwrap().insert(id, path.to_string());
        self
    }

    /// Seed a current value for a path.
    pub fn with_value(self, path: &str, value: Value) -> Self {
        self.values
            .lock()
            .unwrap()
            .insert(path.to_string(), value.to_datapoint());
        self
    }

    fn path_for(&self, signal: &Option<Signal>) -> Option<String> {
        match signal {
            Some(Signal::Path(path)) => Some(path.clone()),
            Some(Signal::Id(id)) => self.ids.lock().unwrap().get(id).cloned(),
            None => None,
        }
    }
}

struct MockVal {
    state: Arc<BrokerState>,
}

#[tonic::async_trait]
impl Val for MockVal {
    async fn get_value(
        &self,
        request: Request<GetValueRequest>,
    ) -> Result<Response<GetValueResponse>, Status> {
        let request = request.into_inner();
        let signal = request.signal_id.and_then(|sid| sid.signal);
        let path = self
            .state
            .path_for(&signal)
            .ok_or_else(|| Status::invalid_argument("missing signal id"))?;

        let datapoint = self.state.values.lock().unwrap().get(&path).cloned();
        match datapoint {
            Some(datapoint) => Ok(Response::new(GetValueResponse {
                data_point: Some(datapoint),
            })),
            None => Err(Status::not_found(format!("no value for {}", path))),
        }
    }

    type SubscribeStream = ReceiverStream<Result<SubscribeResponse, Status>>;

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let paths = request.into_inner().signal_paths;
        let (tx, rx) = mpsc::channel(32);
        self.state.subscribers.lock().unwrap().push((paths, tx));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn actuate(
        &self,
        request: Request<ActuateRequest>,
    ) -> Result<Response<ActuateResponse>, Status> {
        let request = request.into_inner();
        let signal = request.signal_id.and_then(|sid| sid.signal);
        let path = self
            .state
            .path_for(&signal)
            .ok_or_else(|| Status::invalid_argument("missing signal id"))?;

        let owner = self.state.owners.lock().unwrap().get(&path).cloned();
        match owner {
            Some(sender) if !sender.is_closed() => {
                // Route by numeric id when the signal is known, as the real
                // broker does after resolving the path.
                let id = self.state.metadata.lock().unwrap().get(&path).copied();
                let routed = ActuateRequest {
                    signal_id: Some(match id {
                        Some(id) => numeric_identifier(id),
                        None => path_identifier(path.clone()),
                    }),
                    value: request.value,
                };
                sender
                    .send(routed)
                    .map_err(|_| Status::unavailable("provider stream gone"))?;
                Ok(Response::new(ActuateResponse {}))
            }
            _ => Err(Status::unavailable(format!(
                "no provider registered for {}",
                path
            ))),
        }
    }

    async fn publish_value(
        &self,
        request: Request<PublishValueRequest>,
    ) -> Result<Response<PublishValueResponse>, Status> {
        let request = request.into_inner();
        let signal = request.signal_id.and_then(|sid| sid.signal);
        let path = self
            .state
            .path_for(&signal)
            .ok_or_else(|| Status::invalid_argument("missing signal id"))?;
        let datapoint = request
            .data_point
            .ok_or_else(|| Status::invalid_argument("missing datapoint"))?;
        self.state.values.lock().unwrap().insert(path, datapoint);
        Ok(Response::new(PublishValueResponse {}))
    }

    async fn list_metadata(
        &self,
        request: Request<ListMetadataRequest>,
    ) -> Result<Response<ListMetadataResponse>, Status> {
        let root = request.into_inner().root;
        let id = self.state.metadata.lock().unwrap().get(&root).copied();
        match id {
            Some(id) => Ok(Response::new(ListMetadataResponse {
                metadata: vec![Metadata {
                    id,
                    path: root,
                    ..Default::default()
                }],
            })),
            None => Err(Status::not_found(format!("unknown path {}", root))),
        }
    }

    type OpenProviderStreamStream = ReceiverStream<Result<OpenProviderStreamResponse, Status>>;

    async fn open_provider_stream(
        &self,
        request: Request<Streaming<OpenProviderStreamRequest>>,
    ) -> Result<Response<Self::OpenProviderStreamStream>, Status> {
        let mut inbound = request.into_inner();
        let (out_tx, out_rx) = mpsc::channel(32);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ActuateRequest>();

            // Forward broker-routed commands onto this provider's stream.
            let forward_out = out_tx.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(command) = cmd_rx.recv().await {
                    let batch = OpenProviderStreamResponse {
                        action: Some(ResponseAction::BatchActuateStreamRequest(
                            BatchActuateStreamRequest {
                                actuate_requests: vec![command],
                            },
                        )),
                    };
                    if forward_out.send(Ok(batch)).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                let message = match inbound.message().await {
                    Ok(Some(message)) => message,
                    _ => break,
                };
                match message.action {
                    Some(RequestAction::ProvideActuationRequest(claim)) => {
                        let mut claimed = Vec::new();
                        for identifier in claim.actuator_identifiers {
                            if let Some(path) = state.path_for(&identifier.signal) {
                                claimed.push(path);
                            }
                        }
                        state.claims.lock().unwrap().extend(claimed.iter().cloned());

                        if state.close_on_claim {
                            break;
                        }
                        if state.grant_ownership {
                            {
                                let mut owners = state.owners.lock().unwrap();
                                for path in claimed {
                                    owners.insert(path, cmd_tx.clone());
                                }
                            }
                            let confirm = OpenProviderStreamResponse {
                                action: Some(ResponseAction::ProvideActuationResponse(
                                    ProvideActuationResponse {},
                                )),
                            };
                            if out_tx.send(Ok(confirm)).await.is_err() {
                                break;
                            }
                        }
                        // Withheld claims are recorded but never confirmed.
                    }
                    Some(RequestAction::BatchActuateStreamResponse(ack)) => {
                        let id = match ack.signal_id.and_then(|sid| sid.signal) {
                            Some(Signal::Id(id)) => id,
                            _ => -1,
                        };
                        state.acks.lock().unwrap().push(id);
                    }
                    Some(RequestAction::PublishValuesRequest(publish)) => {
                        for (id, datapoint) in publish.data_points {
                            state.published.lock().unwrap().push((id, datapoint.clone()));
                            let path = state.ids.lock().unwrap().get(&id).cloned();
                            if let Some(path) = path {
                                state.values.lock().unwrap().insert(path, datapoint);
                            }
                        }
                    }
                    None => {}
                }
            }
            forwarder.abort();
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

/// A mock databroker serving on an ephemeral local port.
pub struct MockBroker {
    pub state: Arc<BrokerState>,
    pub address: String,
    server: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start(state: BrokerState) -> Self {
        init_tracing();
        let state = Arc::new(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock broker");
        let address = format!("http://{}", listener.local_addr().expect("local addr"));

        let service = ValServer::new(MockVal {
            state: Arc::clone(&state),
        });
        let server = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .ok();
        });

        Self {
            state,
            address,
            server,
        }
    }

    /// SDK config pointed at this broker, with test-sized timeouts.
    pub fn config(&self) -> BrokerConfig {
        BrokerConfig::new(&self.address)
            .with_connect_timeout(Duration::from_millis(1_000))
            .with_confirm_timeout(Duration::from_millis(1_000))
    }

    /// Store a value and fan it out to matching subscription streams.
    pub async fn push_update(&self, path: &str, value: Value) {
        let datapoint = value.to_datapoint();
        self.state
            .values
            .lock()
            .unwrap()
            .insert(path.to_string(), datapoint.clone());

        let targets: Vec<SubscriberSender> = {
            let subscribers = self.state.subscribers.lock().unwrap();
            subscribers
                .iter()
                .filter(|(paths, _)| paths.iter().any(|p| p == path))
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for tx in targets {
            let mut entries = HashMap::new();
            entries.insert(path.to_string(), datapoint.clone());
            let _ = tx.send(Ok(SubscribeResponse { entries })).await;
        }
    }

    /// Inject a raw actuation command into the stream owning `path`.
    pub fn inject_command(&self, owner_path: &str, command: ActuateRequest) -> bool {
        let owner = self
            .state
            .owners
            .lock()
            .unwrap()
            .get(owner_path)
            .cloned();
        match owner {
            Some(sender) => sender.send(command).is_ok(),
            None => false,
        }
    }

    pub fn acks(&self) -> Vec<i32> {
        self.state.acks.lock().unwrap().clone()
    }

    pub fn claims(&self) -> Vec<String> {
        self.state.claims.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(i32, Datapoint)> {
        self.state.published.lock().unwrap().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.subscribers.lock().unwrap().len()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Opt-in test logging: `RUST_LOG=debug cargo test -- --nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
