//! Connection management for the databroker channel.
//!
//! Connecting means two things: the transport comes up within a bound, and
//! one cheap proof-of-life RPC gets *any* answer. A domain error from the
//! probe (e.g. NOT_FOUND for the probe path) still counts as connected -
//! only transport-level failure does not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tracing::{debug, error, info};

use vss_proto::path_identifier;
use vss_proto::val_v2::val_client::ValClient;
use vss_proto::val_v2::GetValueRequest;

use crate::config::BrokerConfig;

/// Status codes that mean "the broker did not answer", as opposed to "the
/// broker answered with an error".
fn is_transport_failure(code: Code) -> bool {
    matches!(code, Code::Unavailable | Code::DeadlineExceeded)
}

/// Shared connection state: the tonic channel plus a cheap connected flag.
///
/// Stubs are clones of one multiplexed channel, so handing one to each
/// in-flight operation is free.
pub struct Connection {
    config: BrokerConfig,
    stub: Mutex<Option<ValClient<Channel>>>,
    connected: AtomicBool,
}

impl Connection {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            stub: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Open the channel and verify the broker is alive.
    ///
    /// Returns false on transport failure or timeout; never panics.
    pub async fn connect(&self) -> bool {
        let address = self.config.address.clone();
        info!("Connecting to databroker at {}", address);

        let endpoint = match Endpoint::from_shared(address.clone()) {
            Ok(endpoint) => endpoint.connect_timeout(self.config.connect_timeout()),
            Err(e) => {
                error!("Invalid databroker address {}: {}", address, e);
                return false;
            }
        };

        let channel = match endpoint.connect().await {
            Ok(channel) => channel,
            Err(e) => {
                error!("Failed to connect to databroker at {}: {}", address, e);
                self.connected.store(false, Ordering::SeqCst);
                return false;
            }
        };

        let mut stub = ValClient::new(channel);

        // Proof of life: one cheap lookup. Any reply, including a domain
        // error, proves the broker is responding.
        let request = GetValueRequest {
            signal_id: Some(path_identifier(&self.config.probe_path)),
        };
        let probe = tokio::time::timeout(self.config.connect_timeout(), stub.get_value(request));

        match probe.await {
            Err(_) => {
                error!("Databroker at {} not responding: probe timed out", address);
                self.connected.store(false, Ordering::SeqCst);
                false
            }
            Ok(Err(status)) if is_transport_failure(status.code()) => {
                error!(
                    "Databroker at {} not responding: {}",
                    address,
                    status.message()
                );
                self.connected.store(false, Ordering::SeqCst);
                false
            }
            Ok(result) => {
                if let Err(status) = result {
                    debug!(
                        "Probe for {} answered with {:?} (broker alive)",
                        self.config.probe_path,
                        status.code()
                    );
                }
                *self.stub.lock().expect("connection stub mutex poisoned") = Some(stub);
                self.connected.store(true, Ordering::SeqCst);
                info!("Connected to databroker at {}", address);
                true
            }
        }
    }

    /// Drop the channel. Idempotent, safe before connect.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.stub
            .lock()
            .expect("connection stub mutex poisoned")
            .take();
    }

    /// Cheap non-blocking check.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Clone of the stub, if connected.
    pub(crate) fn stub(&self) -> Option<ValClient<Channel>> {
        self.stub
            .lock()
            .expect("connection stub mutex poisoned")
            .clone()
    }
}
