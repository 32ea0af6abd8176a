//! Actuation dispatch queue.
//!
//! Inbound commands are acknowledged on the stream the moment they are read;
//! the actual side effect happens here, decoupled behind a bounded queue. A
//! single worker drains the queue in arrival order and invokes the user
//! callback one command at a time, so actuation side effects for one engine
//! are strictly serialized.
//!
//! The worker runs on a dedicated blocking thread: hardware-style callbacks
//! may sleep without stalling the runtime. Closing the queue (dropping the
//! sender) is the wake-on-stop primitive.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use vss_proto::Value;

/// One actuation command routed to this provider. Created when the command
/// is read off the stream, consumed by the dispatch worker, discarded after
/// the callback returns.
#[derive(Debug, Clone)]
pub struct ActuationRequest {
    /// Full VSS path of the actuator.
    pub path: String,
    /// Databroker-assigned numeric signal id.
    pub signal_id: i32,
    /// The commanded value.
    pub value: Value,
}

/// User callback invoked for each actuation command.
pub(crate) type ActuationCallback = Arc<dyn Fn(&ActuationRequest) + Send + Sync + 'static>;

/// Shared slot holding the installed callback, if any.
pub(crate) type CallbackSlot = Arc<Mutex<Option<ActuationCallback>>>;

/// Spawn the dispatch worker. Exits when the queue's sender side is dropped.
pub(crate) fn spawn_worker(
    mut queue: mpsc::Receiver<ActuationRequest>,
    callback: CallbackSlot,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        debug!("Actuation worker started");
        while let Some(request) = queue.blocking_recv() {
            let installed = callback
                .lock()
                .expect("actuation callback mutex poisoned")
                .clone();
            match installed {
                Some(callback) => callback(&request),
                None => debug!(
                    "No actuation callback installed, dropping command for {}",
                    request.path
                ),
            }
        }
        debug!("Actuation worker stopped");
    })
}
