//! Typed signal markers.
//!
//! A signal definition binds a VSS path to its value type once. Everything
//! downstream (get, subscribe, set_target, publish) is checked against that
//! type instead of probing the wire for whichever member happens to decode.

use std::marker::PhantomData;

use crate::val_v2;
use crate::value::SignalValue;

/// Wire identifier for a signal addressed by path.
pub fn path_identifier(path: impl Into<String>) -> val_v2::SignalId {
    val_v2::SignalId {
        signal: Some(val_v2::signal_id::Signal::Path(path.into())),
    }
}

/// Wire identifier for a signal addressed by databroker-assigned numeric id.
pub fn numeric_identifier(id: i32) -> val_v2::SignalId {
    val_v2::SignalId {
        signal: Some(val_v2::signal_id::Signal::Id(id)),
    }
}

/// A read-only signal with dynamic values (speed, temperature, ...).
#[derive(Debug, Clone)]
pub struct Sensor<T> {
    path: String,
    _ty: PhantomData<fn() -> T>,
}

impl<T: SignalValue> Sensor<T> {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            _ty: PhantomData,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A commandable signal owned by a provider. Consumers send target values;
/// the owning provider publishes the actual values it achieves.
#[derive(Debug, Clone)]
pub struct Actuator<T> {
    path: String,
    _ty: PhantomData<fn() -> T>,
}

impl<T: SignalValue> Actuator<T> {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            _ty: PhantomData,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Static or semi-static metadata (VIN, brand, door count).
#[derive(Debug, Clone)]
pub struct Attribute<T> {
    path: String,
    _ty: PhantomData<fn() -> T>,
}

impl<T: SignalValue> Attribute<T> {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            _ty: PhantomData,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Signals a consumer can read point values from.
pub trait ReadableSignal {
    type Value: SignalValue;
    fn path(&self) -> &str;
}

impl<T: SignalValue> ReadableSignal for Sensor<T> {
    type Value = T;
    fn path(&self) -> &str {
        &self.path
    }
}

impl<T: SignalValue> ReadableSignal for Attribute<T> {
    type Value = T;
    fn path(&self) -> &str {
        &self.path
    }
}
