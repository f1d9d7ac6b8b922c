use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::protocol::Marshaled;

/// Field name → value mapping making up an object's state.
pub type StateMap = BTreeMap<String, StateValue>;

/// The closed set of values a marshaled state may contain.
///
/// Every serializer must be able to represent each variant, so swapping codecs
/// never changes which objects can be persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    List(Vec<StateValue>),
    Map(StateMap),
    /// A nested marshaled object, e.g. a trigger inside a job.
    Object(Marshaled),
}

impl StateValue {
    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StateValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view that accepts both integers and floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Int(i) => Some(*i as f64),
            StateValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            StateValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[StateValue]> {
        match self {
            StateValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&StateMap> {
        match self {
            StateValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Bool(_) => "bool",
            StateValue::Int(_) => "int",
            StateValue::Float(_) => "float",
            StateValue::Str(_) => "string",
            StateValue::Bytes(_) => "bytes",
            StateValue::Timestamp(_) => "timestamp",
            StateValue::List(_) => "list",
            StateValue::Map(_) => "map",
            StateValue::Object(_) => "object",
        }
    }
}

impl From<bool> for StateValue {
    fn from(b: bool) -> Self {
        StateValue::Bool(b)
    }
}

impl From<i64> for StateValue {
    fn from(i: i64) -> Self {
        StateValue::Int(i)
    }
}

impl From<i32> for StateValue {
    fn from(i: i32) -> Self {
        StateValue::Int(i as i64)
    }
}

impl From<u32> for StateValue {
    fn from(i: u32) -> Self {
        StateValue::Int(i as i64)
    }
}

impl From<f64> for StateValue {
    fn from(f: f64) -> Self {
        StateValue::Float(f)
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        StateValue::Str(s.to_string())
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        StateValue::Str(s)
    }
}

impl From<Vec<u8>> for StateValue {
    fn from(b: Vec<u8>) -> Self {
        StateValue::Bytes(b)
    }
}

impl From<DateTime<Utc>> for StateValue {
    fn from(t: DateTime<Utc>) -> Self {
        StateValue::Timestamp(t)
    }
}

impl From<Vec<StateValue>> for StateValue {
    fn from(l: Vec<StateValue>) -> Self {
        StateValue::List(l)
    }
}

impl From<StateMap> for StateValue {
    fn from(m: StateMap) -> Self {
        StateValue::Map(m)
    }
}

impl From<Marshaled> for StateValue {
    fn from(m: Marshaled) -> Self {
        StateValue::Object(m)
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(o: Option<T>) -> Self {
        o.map_or(StateValue::Null, Into::into)
    }
}

/// Plain JSON data (e.g. job arguments from a config file) maps onto the
/// matching state variants. Integral numbers stay integers.
impl From<serde_json::Value> for StateValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => StateValue::Null,
            serde_json::Value::Bool(b) => StateValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => StateValue::Int(i),
                None => StateValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => StateValue::Str(s),
            serde_json::Value::Array(a) => {
                StateValue::List(a.into_iter().map(StateValue::from).collect())
            }
            serde_json::Value::Object(o) => StateValue::Map(
                o.into_iter()
                    .map(|(k, v)| (k, StateValue::from(v)))
                    .collect(),
            ),
        }
    }
}
