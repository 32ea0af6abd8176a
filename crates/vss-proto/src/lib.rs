//! vss-proto - Wire contract and value model for the VSS databroker SDK
//!
//! This crate consumes the databroker's `kuksa.val.v2` gRPC contract. The
//! proto files under `proto/` are vendored verbatim from the broker (the
//! subset of the VAL service this SDK exercises) and compiled by `build.rs`;
//! the broker owns the schema and nothing here redefines it.
//!
//! On top of the generated types it provides the SDK's value model:
//!
//! - [`Value`] - the closed variant over the eight scalar signal types,
//!   with a total codec to and from the wire `Value`/`Datapoint`.
//! - [`SignalValue`] - typed encode/decode for the scalar primitives.
//! - [`Sensor`], [`Actuator`], [`Attribute`] - typed signal markers. The
//!   value type of a signal is fixed once, where the signal is defined,
//!   so lookups never have to probe wire types at call sites.
//!
//! ## Decode policy
//!
//! The untyped codec is deliberately permissive: an unset wire value decodes
//! to the zero value (`false`) instead of an error, matching the broker's
//! treatment of empty datapoints. The typed [`SignalValue`] layer is strict
//! and returns `None` on any type mismatch.

// Generated kuksa.val.v2 modules (tonic-build output)
#[allow(clippy::all)]
pub mod val_v2 {
    tonic::include_proto!("kuksa.val.v2");
}

pub mod signal;
pub mod value;

pub use signal::{numeric_identifier, path_identifier, Actuator, Attribute, ReadableSignal, Sensor};
pub use value::{SignalValue, Value};
