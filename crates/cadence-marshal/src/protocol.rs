use chrono::{DateTime, Utc};

use crate::error::{MarshalError, Result};
use crate::value::{StateMap, StateValue};

/// Key every marshaled state carries so old data can be rejected cleanly.
pub const VERSION_KEY: &str = "version";

/// Serializer-neutral form of an object: which type it is, and its state.
#[derive(Debug, Clone, PartialEq)]
pub struct Marshaled {
    pub type_ref: String,
    pub state: StateMap,
}

impl Marshaled {
    pub fn new(type_ref: impl Into<String>, state: StateMap) -> Self {
        Self {
            type_ref: type_ref.into(),
            state,
        }
    }

    /// Start a state map stamped with `version`.
    pub fn versioned(type_ref: impl Into<String>, version: i64) -> Self {
        let mut state = StateMap::new();
        state.insert(VERSION_KEY.to_string(), StateValue::Int(version));
        Self::new(type_ref, state)
    }

    /// Builder-style insert, used when assembling state by hand.
    pub fn with(mut self, key: &str, value: impl Into<StateValue>) -> Self {
        self.state.insert(key.to_string(), value.into());
        self
    }
}

/// Objects that can expose their state for persistence.
///
/// The default implementation reports the type as unsupported, so a type can
/// opt into a trait that requires `Marshal` (such as a trigger) while still
/// being usable with stores that never persist it.
pub trait Marshal {
    fn marshal(&self) -> Result<Marshaled> {
        Err(MarshalError::UnsupportedType(
            std::any::type_name::<Self>().to_string(),
        ))
    }
}

/// Objects that can be rebuilt from marshaled state.
///
/// `restore` does not run the type's normal constructor and must not be fed
/// untrusted data.
pub trait Restore: Sized {
    const TYPE_REF: &'static str;

    fn restore(state: StateMap) -> Result<Self>;
}

pub fn marshal_object<T: Marshal + ?Sized>(obj: &T) -> Result<Marshaled> {
    obj.marshal()
}

/// Rebuild a `T`, failing when the type reference names something else.
pub fn unmarshal_object<T: Restore>(marshaled: Marshaled) -> Result<T> {
    if marshaled.type_ref != T::TYPE_REF {
        return Err(MarshalError::UnsupportedType(marshaled.type_ref));
    }
    T::restore(marshaled.state)
}

/// Typed, consuming access to a state map with errors that name the field.
pub struct StateReader {
    type_ref: String,
    state: StateMap,
}

impl StateReader {
    pub fn new(type_ref: impl Into<String>, state: StateMap) -> Self {
        Self {
            type_ref: type_ref.into(),
            state,
        }
    }

    /// Read the state version and reject anything newer than `supported`.
    pub fn version(&mut self, supported: i64) -> Result<i64> {
        let found = self.take_i64(VERSION_KEY)?;
        if found > supported {
            return Err(MarshalError::UnsupportedVersion {
                type_ref: self.type_ref.clone(),
                found,
                supported,
            });
        }
        Ok(found)
    }

    pub fn take(&mut self, field: &str) -> Result<StateValue> {
        self.state
            .remove(field)
            .ok_or_else(|| MarshalError::MissingField {
                type_ref: self.type_ref.clone(),
                field: field.to_string(),
            })
    }

    /// Missing and null fields both read as `None`.
    pub fn take_opt(&mut self, field: &str) -> Option<StateValue> {
        self.state.remove(field).filter(|v| !v.is_null())
    }

    pub fn take_str(&mut self, field: &str) -> Result<String> {
        match self.take(field)? {
            StateValue::Str(s) => Ok(s),
            _ => Err(self.wrong_type(field, "a string")),
        }
    }

    pub fn take_opt_str(&mut self, field: &str) -> Result<Option<String>> {
        match self.take_opt(field) {
            None => Ok(None),
            Some(StateValue::Str(s)) => Ok(Some(s)),
            Some(_) => Err(self.wrong_type(field, "a string")),
        }
    }

    pub fn take_i64(&mut self, field: &str) -> Result<i64> {
        match self.take(field)? {
            StateValue::Int(i) => Ok(i),
            _ => Err(self.wrong_type(field, "an integer")),
        }
    }

    pub fn take_u32(&mut self, field: &str) -> Result<u32> {
        let i = self.take_i64(field)?;
        u32::try_from(i).map_err(|_| self.wrong_type(field, "a non-negative 32-bit integer"))
    }

    pub fn take_f64(&mut self, field: &str) -> Result<f64> {
        match self.take(field)? {
            StateValue::Float(f) => Ok(f),
            StateValue::Int(i) => Ok(i as f64),
            _ => Err(self.wrong_type(field, "a number")),
        }
    }

    pub fn take_bool(&mut self, field: &str) -> Result<bool> {
        match self.take(field)? {
            StateValue::Bool(b) => Ok(b),
            _ => Err(self.wrong_type(field, "a boolean")),
        }
    }

    pub fn take_timestamp(&mut self, field: &str) -> Result<DateTime<Utc>> {
        match self.take(field)? {
            StateValue::Timestamp(t) => Ok(t),
            _ => Err(self.wrong_type(field, "a timestamp")),
        }
    }

    pub fn take_opt_timestamp(&mut self, field: &str) -> Result<Option<DateTime<Utc>>> {
        match self.take_opt(field) {
            None => Ok(None),
            Some(StateValue::Timestamp(t)) => Ok(Some(t)),
            Some(_) => Err(self.wrong_type(field, "a timestamp")),
        }
    }

    pub fn take_list(&mut self, field: &str) -> Result<Vec<StateValue>> {
        match self.take(field)? {
            StateValue::List(l) => Ok(l),
            _ => Err(self.wrong_type(field, "a list")),
        }
    }

    pub fn take_map(&mut self, field: &str) -> Result<StateMap> {
        match self.take(field)? {
            StateValue::Map(m) => Ok(m),
            _ => Err(self.wrong_type(field, "a map")),
        }
    }

    pub fn take_object(&mut self, field: &str) -> Result<Marshaled> {
        match self.take(field)? {
            StateValue::Object(m) => Ok(m),
            _ => Err(self.wrong_type(field, "a marshaled object")),
        }
    }

    /// Build an `InvalidState` error tagged with this reader's type.
    pub fn invalid(&self, reason: impl Into<String>) -> MarshalError {
        MarshalError::InvalidState {
            type_ref: self.type_ref.clone(),
            reason: reason.into(),
        }
    }

    fn wrong_type(&self, field: &str, expected: &'static str) -> MarshalError {
        MarshalError::WrongType {
            type_ref: self.type_ref.clone(),
            field: field.to_string(),
            expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Opaque;
    impl Marshal for Opaque {}

    #[derive(Debug, PartialEq)]
    struct Counter {
        label: String,
        hits: u32,
    }

    impl Marshal for Counter {
        fn marshal(&self) -> Result<Marshaled> {
            Ok(Marshaled::versioned(Self::TYPE_REF, 1)
                .with("label", self.label.as_str())
                .with("hits", self.hits))
        }
    }

    impl Restore for Counter {
        const TYPE_REF: &'static str = "test.counter";

        fn restore(state: StateMap) -> Result<Self> {
            let mut r = StateReader::new(Self::TYPE_REF, state);
            r.version(1)?;
            Ok(Self {
                label: r.take_str("label")?,
                hits: r.take_u32("hits")?,
            })
        }
    }

    #[test]
    fn default_marshal_is_unsupported() {
        let err = marshal_object(&Opaque).unwrap_err();
        assert!(matches!(err, MarshalError::UnsupportedType(name) if name.ends_with("Opaque")));
    }

    #[test]
    fn restore_round_trips_state() {
        let counter = Counter {
            label: "a".into(),
            hits: 3,
        };
        let marshaled = marshal_object(&counter).unwrap();
        assert_eq!(marshaled.type_ref, "test.counter");
        let restored: Counter = unmarshal_object(marshaled).unwrap();
        assert_eq!(restored, counter);
    }

    #[test]
    fn mismatched_type_ref_is_rejected() {
        let marshaled = Marshaled::versioned("test.other", 1);
        let err = unmarshal_object::<Counter>(marshaled).unwrap_err();
        assert!(matches!(err, MarshalError::UnsupportedType(t) if t == "test.other"));
    }

    #[test]
    fn newer_version_is_rejected() {
        let marshaled = Marshaled::versioned("test.counter", 2)
            .with("label", "a")
            .with("hits", 1u32);
        let err = unmarshal_object::<Counter>(marshaled).unwrap_err();
        assert!(matches!(
            err,
            MarshalError::UnsupportedVersion { found: 2, supported: 1, .. }
        ));
    }

    #[test]
    fn missing_and_mistyped_fields_name_the_field() {
        let marshaled = Marshaled::versioned("test.counter", 1).with("label", "a");
        let err = unmarshal_object::<Counter>(marshaled).unwrap_err();
        assert!(matches!(err, MarshalError::MissingField { field, .. } if field == "hits"));

        let marshaled = Marshaled::versioned("test.counter", 1)
            .with("label", "a")
            .with("hits", -1i64);
        let err = unmarshal_object::<Counter>(marshaled).unwrap_err();
        assert!(matches!(err, MarshalError::WrongType { field, .. } if field == "hits"));
    }
}
