//! The closed signal value variant and its wire codec.
//!
//! Both directions are total: encoding matches exhaustively on the variant,
//! and decoding maps every wire shape - including an unset value - to some
//! `Value`. Unset and non-scalar wire values decode to the zero value
//! (`Value::Bool(false)`); array signals are outside the SDK's value model.

use crate::val_v2;
use crate::val_v2::value::TypedValue;

/// A signal value: exactly one of the eight scalar members is active.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Float(f32),
    Double(f64),
    String(String),
}

impl Value {
    /// Short name of the active member, for log messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int32(_) => "int32",
            Value::Uint32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::Uint64(_) => "uint64",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
        }
    }

    /// Encode into the wire value.
    pub fn to_wire(&self) -> val_v2::Value {
        let typed_value = match self {
            Value::Bool(v) => TypedValue::Bool(*v),
            Value::Int32(v) => TypedValue::Int32(*v),
            Value::Uint32(v) => TypedValue::Uint32(*v),
            Value::Int64(v) => TypedValue::Int64(*v),
            Value::Uint64(v) => TypedValue::Uint64(*v),
            Value::Float(v) => TypedValue::Float(*v),
            Value::Double(v) => TypedValue::Double(*v),
            Value::String(v) => TypedValue::String(v.clone()),
        };
        val_v2::Value {
            typed_value: Some(typed_value),
        }
    }

    /// Decode from the wire value.
    ///
    /// Unset and array-typed wire values decode to `Value::Bool(false)`.
    pub fn from_wire(value: &val_v2::Value) -> Self {
        match &value.typed_value {
            Some(TypedValue::Bool(v)) => Value::Bool(*v),
            Some(TypedValue::Int32(v)) => Value::Int32(*v),
            Some(TypedValue::Uint32(v)) => Value::Uint32(*v),
            Some(TypedValue::Int64(v)) => Value::Int64(*v),
            Some(TypedValue::Uint64(v)) => Value::Uint64(*v),
            Some(TypedValue::Float(v)) => Value::Float(*v),
            Some(TypedValue::Double(v)) => Value::Double(*v),
            Some(TypedValue::String(v)) => Value::String(v.clone()),
            _ => Value::Bool(false),
        }
    }

    /// Decode the value carried by a datapoint. A datapoint without a value
    /// decodes to the zero value, like an unset wire value.
    pub fn from_datapoint(datapoint: &val_v2::Datapoint) -> Self {
        match &datapoint.value {
            Some(value) => Self::from_wire(value),
            None => Value::Bool(false),
        }
    }

    /// Wrap into a datapoint for publication. The timestamp is left unset;
    /// the databroker stamps datapoints on receipt.
    pub fn to_datapoint(&self) -> val_v2::Datapoint {
        val_v2::Datapoint {
            timestamp: None,
            value: Some(self.to_wire()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Uint32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Uint64(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
        }
    }
}

/// Typed encode/decode for the scalar primitives a signal can carry.
///
/// Decoding is strict: a `Value` holding a different member than the one
/// requested yields `None`. No cross-member coercion happens here - a
/// signal's type is fixed where the signal is defined.
pub trait SignalValue: Sized + Send + 'static {
    fn into_value(self) -> Value;
    fn from_value(value: &Value) -> Option<Self>;
}

impl SignalValue for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl SignalValue for i32 {
    fn into_value(self) -> Value {
        Value::Int32(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }
}

impl SignalValue for u32 {
    fn into_value(self) -> Value {
        Value::Uint32(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Uint32(v) => Some(*v),
            _ => None,
        }
    }
}

impl SignalValue for i64 {
    fn into_value(self) -> Value {
        Value::Int64(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl SignalValue for u64 {
    fn into_value(self) -> Value {
        Value::Uint64(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Uint64(v) => Some(*v),
            _ => None,
        }
    }
}

impl SignalValue for f32 {
    fn into_value(self) -> Value {
        Value::Float(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl SignalValue for f64 {
    fn into_value(self) -> Value {
        Value::Double(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl SignalValue for String {
    fn into_value(self) -> Value {
        Value::String(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(v) => Some(v.clone()),
            _ => None,
        }
    }
}
