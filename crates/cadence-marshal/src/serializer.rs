use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::cbor::CborSerializer;
use crate::error::{MarshalError, Result};
use crate::json::JsonSerializer;
use crate::protocol::{Marshal, Marshaled};
use crate::value::StateValue;

/// A byte-level codec for state trees.
///
/// Marshaled objects inside the tree are tagged with a codec-specific marker
/// so `deserialize` can hand them back as [`StateValue::Object`].
pub trait Serializer: Send + Sync + fmt::Debug {
    /// Registry name of this codec.
    fn name(&self) -> &str;

    fn serialize(&self, value: &StateValue) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<StateValue>;
}

/// Marshal `obj` and encode it in one step.
pub fn serialize_object<T: Marshal + ?Sized>(serializer: &dyn Serializer, obj: &T) -> Result<Vec<u8>> {
    serializer.serialize(&StateValue::Object(obj.marshal()?))
}

/// Decode bytes that must hold a single marshaled object.
pub fn deserialize_marshaled(serializer: &dyn Serializer, bytes: &[u8]) -> Result<Marshaled> {
    match serializer.deserialize(bytes)? {
        StateValue::Object(marshaled) => Ok(marshaled),
        other => Err(MarshalError::Codec(format!(
            "expected a marshaled object, found {}",
            other.kind()
        ))),
    }
}

pub type SerializerFactory = fn() -> Arc<dyn Serializer>;

/// Name → constructor table used to pick a codec from configuration.
pub struct SerializerRegistry {
    factories: HashMap<String, SerializerFactory>,
}

impl SerializerRegistry {
    /// Registry with the built-in codecs ("json" and "cbor").
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("json", || Arc::new(JsonSerializer::default()));
        registry.register("cbor", || Arc::new(CborSerializer::default()));
        registry
    }

    pub fn register(&mut self, name: &str, factory: SerializerFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn build(&self, name: &str) -> Result<Arc<dyn Serializer>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| MarshalError::UnknownSerializer(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_registered_codec() {
        let registry = SerializerRegistry::with_defaults();
        assert_eq!(registry.build("json").unwrap().name(), "json");
        assert_eq!(registry.build("cbor").unwrap().name(), "cbor");
        assert_eq!(registry.names(), vec!["cbor", "json"]);
    }

    #[test]
    fn unknown_codec_is_an_error() {
        let registry = SerializerRegistry::with_defaults();
        assert!(matches!(
            registry.build("pickle"),
            Err(MarshalError::UnknownSerializer(name)) if name == "pickle"
        ));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let json = JsonSerializer::default();
        let bytes = json.serialize(&StateValue::Int(1)).unwrap();
        assert!(matches!(
            deserialize_marshaled(&json, &bytes),
            Err(MarshalError::Codec(_))
        ));
    }
}
