//! vss-sdk - Consumer client and actuation provider for the VSS databroker
//!
//! This crate is the protocol layer between applications and the signal
//! databroker. It speaks the broker's `kuksa.val.v2` contract (consumed via
//! [`vss_proto`]) and exposes two entry points:
//!
//! - [`SignalClient`] - the consumer side: typed point reads, one
//!   multiplexed subscription stream, actuation commands, and one-shot
//!   value publication.
//! - [`ActuatorProvider`] - the provider side: claims exclusive ownership
//!   of actuator signals, receives and acknowledges commands over a
//!   persistent bidirectional stream, and publishes actual values back.
//!
//! ## Failure model
//!
//! Ordinary failures never cross the public boundary as panics or errors:
//! operations return booleans or options and log the cause. Stream loss
//! stops the affected engine; resilience means constructing a new one.
//!
//! ## Usage
//!
//! ```ignore
//! use vss_proto::{Actuator, Sensor};
//! use vss_sdk::{ActuatorProvider, BrokerConfig, SignalClient};
//!
//! let config = BrokerConfig::new("http://databroker:55555");
//!
//! // Provider side: own an actuator, mirror commands back as actual values.
//! let provider = ActuatorProvider::new(config.clone());
//! provider.connect().await;
//! provider.provide_actuators(["Vehicle.Cabin.HVAC.IsAirConditioningActive"]).await;
//! provider.on_actuate_request(|req| {
//!     // drive the hardware, then report what it did
//! });
//! provider.start().await;
//!
//! // Consumer side: command the actuator.
//! let client = SignalClient::new(config);
//! client.connect().await;
//! let ac = Actuator::<bool>::new("Vehicle.Cabin.HVAC.IsAirConditioningActive");
//! client.set_target(&ac, true).await;
//! ```

pub mod actuation;
pub mod client;
pub mod config;
pub mod connection;
pub mod provider;

pub use actuation::ActuationRequest;
pub use client::SignalClient;
pub use config::{BrokerConfig, ConfigError};
pub use connection::Connection;
pub use provider::{ActuatorProvider, ProviderState};

pub use vss_proto::{Actuator, Attribute, Sensor, SignalValue, Value};
