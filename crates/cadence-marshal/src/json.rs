use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};

use crate::error::{MarshalError, Result};
use crate::protocol::Marshaled;
use crate::serializer::Serializer;
use crate::value::{StateMap, StateValue};

pub const DEFAULT_TAG_KEY: &str = "$cadence";

const TAG_OBJECT: &str = "object";
const TAG_BYTES: &str = "bytes";
const TAG_TIMESTAMP: &str = "timestamp";
const TAG_MAP: &str = "map";

/// Textual codec on top of `serde_json`.
///
/// Values JSON cannot express natively are written as a JSON object carrying
/// the reserved `tag_key`:
///
/// | State value        | Encoding                                              |
/// |--------------------|-------------------------------------------------------|
/// | `Object`           | `{"$cadence":"object","type":..,"state":{..}}`        |
/// | `Bytes`            | `{"$cadence":"bytes","value":"<hex>"}`                |
/// | `Timestamp`        | `{"$cadence":"timestamp","value":"<rfc3339>"}`        |
/// | `Map` using the tag key | `{"$cadence":"map","value":{..}}`                |
#[derive(Debug, Clone)]
pub struct JsonSerializer {
    tag_key: String,
}

impl JsonSerializer {
    pub fn with_tag_key(tag_key: impl Into<String>) -> Self {
        Self {
            tag_key: tag_key.into(),
        }
    }

    fn encode(&self, value: &StateValue) -> Result<Value> {
        Ok(match value {
            StateValue::Null => Value::Null,
            StateValue::Bool(b) => Value::Bool(*b),
            StateValue::Int(i) => Value::Number((*i).into()),
            StateValue::Float(f) => Value::Number(Number::from_f64(*f).ok_or_else(|| {
                MarshalError::Codec(format!("non-finite float {f} has no JSON form"))
            })?),
            StateValue::Str(s) => Value::String(s.clone()),
            StateValue::Bytes(b) => self.tagged(TAG_BYTES, Value::String(hex::encode(b))),
            StateValue::Timestamp(t) => self.tagged(
                TAG_TIMESTAMP,
                Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            ),
            StateValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.encode(v))
                    .collect::<Result<Vec<_>>>()?,
            ),
            StateValue::Map(map) => {
                let object = self.encode_map(map)?;
                // A plain map that happens to use the tag key must not be
                // mistaken for a tagged value on the way back.
                if map.contains_key(&self.tag_key) {
                    self.tagged(TAG_MAP, Value::Object(object))
                } else {
                    Value::Object(object)
                }
            }
            StateValue::Object(marshaled) => {
                let mut object = Map::new();
                object.insert(self.tag_key.clone(), Value::String(TAG_OBJECT.to_string()));
                object.insert("type".to_string(), Value::String(marshaled.type_ref.clone()));
                object.insert(
                    "state".to_string(),
                    Value::Object(self.encode_map(&marshaled.state)?),
                );
                Value::Object(object)
            }
        })
    }

    fn encode_map(&self, map: &StateMap) -> Result<Map<String, Value>> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.encode(v)?)))
            .collect()
    }

    fn tagged(&self, tag: &str, value: Value) -> Value {
        let mut object = Map::new();
        object.insert(self.tag_key.clone(), Value::String(tag.to_string()));
        object.insert("value".to_string(), value);
        Value::Object(object)
    }

    fn decode(&self, value: Value) -> Result<StateValue> {
        Ok(match value {
            Value::Null => StateValue::Null,
            Value::Bool(b) => StateValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) if !n.is_f64() => StateValue::Int(i),
                _ => StateValue::Float(
                    n.as_f64()
                        .ok_or_else(|| MarshalError::Codec(format!("unrepresentable number {n}")))?,
                ),
            },
            Value::String(s) => StateValue::Str(s),
            Value::Array(items) => StateValue::List(
                items
                    .into_iter()
                    .map(|v| self.decode(v))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Object(mut object) => match object.remove(&self.tag_key) {
                None => StateValue::Map(self.decode_map(object)?),
                Some(Value::String(tag)) => self.decode_tagged(&tag, object)?,
                Some(other) => {
                    return Err(MarshalError::Codec(format!(
                        "tag '{}' must be a string, found {other}",
                        self.tag_key
                    )))
                }
            },
        })
    }

    fn decode_map(&self, object: Map<String, Value>) -> Result<StateMap> {
        object
            .into_iter()
            .map(|(k, v)| Ok((k, self.decode(v)?)))
            .collect()
    }

    fn decode_tagged(&self, tag: &str, mut object: Map<String, Value>) -> Result<StateValue> {
        match tag {
            TAG_OBJECT => {
                let type_ref = match object.remove("type") {
                    Some(Value::String(s)) => s,
                    _ => return Err(MarshalError::Codec("object tag without 'type'".into())),
                };
                let state = match object.remove("state") {
                    Some(Value::Object(state)) => self.decode_map(state)?,
                    _ => return Err(MarshalError::Codec("object tag without 'state'".into())),
                };
                Ok(StateValue::Object(Marshaled::new(type_ref, state)))
            }
            TAG_BYTES => {
                let hex_str = tagged_string(&mut object, tag)?;
                let bytes = hex::decode(&hex_str)
                    .map_err(|e| MarshalError::Codec(format!("invalid hex payload: {e}")))?;
                Ok(StateValue::Bytes(bytes))
            }
            TAG_TIMESTAMP => {
                let raw = tagged_string(&mut object, tag)?;
                let t = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| MarshalError::Codec(format!("invalid timestamp '{raw}': {e}")))?;
                Ok(StateValue::Timestamp(t.with_timezone(&Utc)))
            }
            TAG_MAP => match object.remove("value") {
                Some(Value::Object(inner)) => Ok(StateValue::Map(self.decode_map(inner)?)),
                _ => Err(MarshalError::Codec("map tag without an object value".into())),
            },
            other => Err(MarshalError::Codec(format!("unknown tag '{other}'"))),
        }
    }
}

fn tagged_string(object: &mut Map<String, Value>, tag: &str) -> Result<String> {
    match object.remove("value") {
        Some(Value::String(s)) => Ok(s),
        _ => Err(MarshalError::Codec(format!("{tag} tag without a string value"))),
    }
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::with_tag_key(DEFAULT_TAG_KEY)
    }
}

impl Serializer for JsonSerializer {
    fn name(&self) -> &str {
        "json"
    }

    fn serialize(&self, value: &StateValue) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.encode(value)?)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<StateValue> {
        let value: Value = serde_json::from_slice(bytes)?;
        self.decode(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn round_trip(value: StateValue) -> StateValue {
        let json = JsonSerializer::default();
        json.deserialize(&json.serialize(&value).unwrap()).unwrap()
    }

    #[test]
    fn floats_and_ints_stay_distinct() {
        assert_eq!(round_trip(StateValue::Float(1.0)), StateValue::Float(1.0));
        assert_eq!(round_trip(StateValue::Int(1)), StateValue::Int(1));
    }

    #[test]
    fn timestamps_keep_microseconds() {
        let t = Utc.with_ymd_and_hms(2024, 3, 31, 1, 30, 0).unwrap()
            + chrono::Duration::microseconds(250);
        assert_eq!(round_trip(StateValue::Timestamp(t)), StateValue::Timestamp(t));
    }

    #[test]
    fn map_using_reserved_key_is_escaped() {
        let mut map = StateMap::new();
        map.insert(DEFAULT_TAG_KEY.to_string(), StateValue::Str("object".into()));
        let value = StateValue::Map(map);
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn nan_is_rejected_at_encode_time() {
        let json = JsonSerializer::default();
        assert!(matches!(
            json.serialize(&StateValue::Float(f64::NAN)),
            Err(MarshalError::Codec(_))
        ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let json = JsonSerializer::default();
        let err = json
            .deserialize(br#"{"$cadence":"pickle","value":"x"}"#)
            .unwrap_err();
        assert!(matches!(err, MarshalError::Codec(msg) if msg.contains("pickle")));
    }

    #[test]
    fn custom_tag_key_is_used() {
        let json = JsonSerializer::with_tag_key("__t");
        let bytes = json.serialize(&StateValue::Bytes(vec![0xde, 0xad])).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains(r#""__t":"bytes""#));
        assert!(text.contains("dead"));
    }
}
