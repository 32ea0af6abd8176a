//! Consumer client: typed reads, one multiplexed update stream, actuation
//! commands, and one-shot value publication.
//!
//! Subscriptions are registered first and started together:
//! `start_subscriptions()` opens exactly one stream covering every
//! registered path, which avoids both duplicate streams and the
//! register/first-event race. Right after the stream opens, each path's
//! current value is fetched and delivered once; updates then arrive on a
//! dedicated task until disconnect.
//!
//! Callbacks run on the delivery task and must not block indefinitely.
//! Re-subscribing a path replaces its callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vss_proto::val_v2::{
    ActuateRequest, GetValueRequest, PublishValueRequest, SubscribeRequest,
};
use vss_proto::{path_identifier, Actuator, ReadableSignal, Sensor, SignalValue, Value};

use crate::config::BrokerConfig;
use crate::connection::Connection;

type UpdateCallback = Box<dyn Fn(Value) + Send + 'static>;
type SubscriptionMap = Arc<Mutex<HashMap<String, UpdateCallback>>>;

/// Typed consumer client for the databroker.
pub struct SignalClient {
    connection: Arc<Connection>,
    subscriptions: SubscriptionMap,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SignalClient {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            connection: Arc::new(Connection::new(config)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        }
    }

    /// Connect to the databroker.
    pub async fn connect(&self) -> bool {
        self.connection.connect().await
    }

    /// Stop update delivery and drop the channel. Idempotent.
    pub fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(reader) = self
            .reader
            .lock()
            .expect("subscription reader mutex poisoned")
            .take()
        {
            reader.abort();
        }
        self.connection.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Point lookup of a signal's current value. Empty on any failure.
    pub async fn get<S: ReadableSignal>(&self, signal: &S) -> Option<S::Value> {
        let value = self.get_value(signal.path()).await?;
        let typed = S::Value::from_value(&value);
        if typed.is_none() {
            debug!(
                "Value for {} has unexpected type {}",
                signal.path(),
                value.kind()
            );
        }
        typed
    }

    /// Register a sensor callback. Delivery starts with
    /// [`Self::start_subscriptions`], not here.
    pub fn subscribe<T: SignalValue>(
        &self,
        sensor: &Sensor<T>,
        callback: impl Fn(T) + Send + 'static,
    ) {
        let path = sensor.path().to_string();
        info!("Registering subscription to {}", path);

        let logged_path = path.clone();
        let wrapped: UpdateCallback = Box::new(move |value: Value| match T::from_value(&value) {
            Some(typed) => callback(typed),
            None => debug!(
                "Dropping update for {} with unexpected type {}",
                logged_path,
                value.kind()
            ),
        });

        self.subscriptions
            .lock()
            .expect("subscriptions mutex poisoned")
            .insert(path, wrapped);
    }

    /// Open the single multiplexed update stream over every registered path.
    ///
    /// Delivers each path's current value once, then keeps delivering
    /// stream events until disconnect. Idempotent once running.
    pub async fn start_subscriptions(&self) -> bool {
        if !self.is_connected() {
            warn!("Cannot start subscriptions - not connected");
            return false;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Subscriptions already running");
            return true;
        }

        let paths: Vec<String> = {
            let subscriptions = self
                .subscriptions
                .lock()
                .expect("subscriptions mutex poisoned");
            subscriptions.keys().cloned().collect()
        };
        if paths.is_empty() {
            warn!("No subscriptions registered");
            self.running.store(false, Ordering::SeqCst);
            return false;
        }

        let Some(mut stub) = self.connection.stub() else {
            error!("Cannot start subscriptions - not connected");
            self.running.store(false, Ordering::SeqCst);
            return false;
        };

        info!("Starting subscriptions for {} signal(s)", paths.len());
        let request = SubscribeRequest {
            signal_paths: paths.clone(),
            buffer_size: 0,
        };
        let mut stream = match stub.subscribe(request).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                error!("Failed to open subscription stream: {}", status.message());
                self.running.store(false, Ordering::SeqCst);
                return false;
            }
        };

        // Initial values: one delivery per path reflecting stream-open-time
        // state, even if no update ever arrives.
        for path in &paths {
            if let Some(value) = self.get_value(path).await {
                debug!("Delivering initial value for {}", path);
                deliver(&self.subscriptions, path, value);
            }
        }

        let subscriptions = Arc::clone(&self.subscriptions);
        let running = Arc::clone(&self.running);
        let reader = tokio::spawn(async move {
            debug!("Subscription stream task started");
            loop {
                match stream.message().await {
                    Ok(Some(update)) => {
                        debug!(
                            "Received {} update(s) from subscription stream",
                            update.entries.len()
                        );
                        for (path, datapoint) in &update.entries {
                            deliver(&subscriptions, path, Value::from_datapoint(datapoint));
                        }
                    }
                    Ok(None) => {
                        if running.load(Ordering::SeqCst) {
                            warn!("Subscription stream closed by server");
                        }
                        break;
                    }
                    Err(status) => {
                        if running.load(Ordering::SeqCst) {
                            error!("Subscription stream error: {}", status.message());
                        }
                        break;
                    }
                }
            }
            debug!("Subscription stream task ended");
        });
        *self
            .reader
            .lock()
            .expect("subscription reader mutex poisoned") = Some(reader);

        true
    }

    /// Send an actuation command. True means the databroker routed it to
    /// the owning provider, not that the hardware executed it. A path with
    /// no registered owner fails.
    pub async fn set_target<T: SignalValue>(&self, actuator: &Actuator<T>, value: T) -> bool {
        let Some(mut stub) = self.connection.stub() else {
            return false;
        };

        let request = ActuateRequest {
            signal_id: Some(path_identifier(actuator.path())),
            value: Some(value.into_value().to_wire()),
        };
        match stub.actuate(request).await {
            Ok(_) => {
                debug!("Actuated {}", actuator.path());
                true
            }
            Err(status) => {
                error!(
                    "Failed to actuate {}: {}",
                    actuator.path(),
                    status.message()
                );
                false
            }
        }
    }

    /// Publish a value via the standalone publish RPC. Works for any signal
    /// regardless of provider status, independent of any stream.
    pub async fn publish<T: SignalValue>(&self, sensor: &Sensor<T>, value: T) -> bool {
        let Some(mut stub) = self.connection.stub() else {
            return false;
        };

        let request = PublishValueRequest {
            signal_id: Some(path_identifier(sensor.path())),
            data_point: Some(value.into_value().to_datapoint()),
        };
        match stub.publish_value(request).await {
            Ok(_) => {
                debug!("Published {}", sensor.path());
                true
            }
            Err(status) => {
                error!(
                    "Failed to publish {}: {}",
                    sensor.path(),
                    status.message()
                );
                false
            }
        }
    }

    async fn get_value(&self, path: &str) -> Option<Value> {
        let mut stub = self.connection.stub()?;
        let request = GetValueRequest {
            signal_id: Some(path_identifier(path)),
        };
        match stub.get_value(request).await {
            Ok(response) => response
                .into_inner()
                .data_point
                .as_ref()
                .map(Value::from_datapoint),
            Err(status) => {
                debug!("GetValue failed for {}: {}", path, status.message());
                None
            }
        }
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn deliver(subscriptions: &SubscriptionMap, path: &str, value: Value) {
    let subscriptions = subscriptions.lock().expect("subscriptions mutex poisoned");
    if let Some(callback) = subscriptions.get(path) {
        callback(value);
    }
}
