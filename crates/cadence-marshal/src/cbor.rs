use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use ciborium::value::{Integer, Value};

use crate::error::{MarshalError, Result};
use crate::protocol::Marshaled;
use crate::serializer::Serializer;
use crate::value::{StateMap, StateValue};

/// Tag wrapping a marshaled object as `[type_ref, state]`.
pub const DEFAULT_TYPE_TAG: u64 = 4664;

/// RFC 8949 standard date/time string.
const TAG_DATETIME_TEXT: u64 = 0;
/// RFC 8949 epoch-based date/time.
const TAG_DATETIME_EPOCH: u64 = 1;

/// Binary codec on top of `ciborium`.
///
/// Bytes use the native CBOR byte string and timestamps the standard
/// date/time tags, so no reserved map keys are needed. Marshaled objects are
/// written under `type_tag`.
#[derive(Debug, Clone)]
pub struct CborSerializer {
    type_tag: u64,
}

impl CborSerializer {
    pub fn with_type_tag(type_tag: u64) -> Self {
        Self { type_tag }
    }

    fn encode(&self, value: &StateValue) -> Value {
        match value {
            StateValue::Null => Value::Null,
            StateValue::Bool(b) => Value::Bool(*b),
            StateValue::Int(i) => Value::Integer(Integer::from(*i)),
            StateValue::Float(f) => Value::Float(*f),
            StateValue::Str(s) => Value::Text(s.clone()),
            StateValue::Bytes(b) => Value::Bytes(b.clone()),
            StateValue::Timestamp(t) => Value::Tag(
                TAG_DATETIME_TEXT,
                Box::new(Value::Text(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
            ),
            StateValue::List(items) => Value::Array(items.iter().map(|v| self.encode(v)).collect()),
            StateValue::Map(map) => self.encode_map(map),
            StateValue::Object(marshaled) => Value::Tag(
                self.type_tag,
                Box::new(Value::Array(vec![
                    Value::Text(marshaled.type_ref.clone()),
                    self.encode_map(&marshaled.state),
                ])),
            ),
        }
    }

    fn encode_map(&self, map: &StateMap) -> Value {
        Value::Map(
            map.iter()
                .map(|(k, v)| (Value::Text(k.clone()), self.encode(v)))
                .collect(),
        )
    }

    fn decode(&self, value: Value) -> Result<StateValue> {
        Ok(match value {
            Value::Null => StateValue::Null,
            Value::Bool(b) => StateValue::Bool(b),
            Value::Integer(i) => StateValue::Int(
                i64::try_from(i)
                    .map_err(|_| MarshalError::Codec("integer does not fit in 64 bits".into()))?,
            ),
            Value::Float(f) => StateValue::Float(f),
            Value::Text(s) => StateValue::Str(s),
            Value::Bytes(b) => StateValue::Bytes(b),
            Value::Array(items) => StateValue::List(
                items
                    .into_iter()
                    .map(|v| self.decode(v))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Map(entries) => StateValue::Map(self.decode_map(entries)?),
            Value::Tag(tag, inner) => self.decode_tagged(tag, *inner)?,
            other => {
                return Err(MarshalError::Codec(format!(
                    "unsupported CBOR item {other:?}"
                )))
            }
        })
    }

    fn decode_map(&self, entries: Vec<(Value, Value)>) -> Result<StateMap> {
        entries
            .into_iter()
            .map(|(k, v)| match k {
                Value::Text(key) => Ok((key, self.decode(v)?)),
                other => Err(MarshalError::Codec(format!(
                    "map keys must be text, found {other:?}"
                ))),
            })
            .collect()
    }

    fn decode_tagged(&self, tag: u64, inner: Value) -> Result<StateValue> {
        if tag == self.type_tag {
            let Value::Array(parts) = inner else {
                return Err(MarshalError::Codec("object tag without a [type, state] pair".into()));
            };
            let mut parts = parts.into_iter();
            let (Some(Value::Text(type_ref)), Some(Value::Map(state)), None) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(MarshalError::Codec("object tag without a [type, state] pair".into()));
            };
            return Ok(StateValue::Object(Marshaled::new(type_ref, self.decode_map(state)?)));
        }
        match (tag, inner) {
            (TAG_DATETIME_TEXT, Value::Text(raw)) => {
                let t = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| MarshalError::Codec(format!("invalid timestamp '{raw}': {e}")))?;
                Ok(StateValue::Timestamp(t.with_timezone(&Utc)))
            }
            (TAG_DATETIME_EPOCH, Value::Integer(secs)) => {
                let secs = i64::try_from(secs)
                    .map_err(|_| MarshalError::Codec("epoch timestamp out of range".into()))?;
                epoch_timestamp(secs, 0)
            }
            (TAG_DATETIME_EPOCH, Value::Float(secs)) if secs.is_finite() => {
                let micros = (secs * 1e6).round();
                let whole = micros.div_euclid(1e6);
                let frac = micros.rem_euclid(1e6);
                // Saturating casts; out-of-range values are rejected below.
                epoch_timestamp(whole as i64, frac as u32 * 1_000)
            }
            (tag, _) => Err(MarshalError::Codec(format!("unknown CBOR tag {tag}"))),
        }
    }
}

fn epoch_timestamp(secs: i64, nanos: u32) -> Result<StateValue> {
    Utc.timestamp_opt(secs, nanos)
        .single()
        .map(StateValue::Timestamp)
        .ok_or_else(|| MarshalError::Codec(format!("epoch timestamp {secs} out of range")))
}

impl Default for CborSerializer {
    fn default() -> Self {
        Self::with_type_tag(DEFAULT_TYPE_TAG)
    }
}

impl Serializer for CborSerializer {
    fn name(&self) -> &str {
        "cbor"
    }

    fn serialize(&self, value: &StateValue) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&self.encode(value), &mut bytes)
            .map_err(|e| MarshalError::Codec(format!("CBOR encoding failed: {e}")))?;
        Ok(bytes)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<StateValue> {
        let value: Value = ciborium::from_reader(bytes)
            .map_err(|e| MarshalError::Codec(format!("CBOR decoding failed: {e}")))?;
        self.decode(value)
    }
}
