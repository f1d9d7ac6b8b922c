//! `cadence-marshal`: codec-neutral persistence of stateful objects.
//!
//! # Overview
//!
//! Any object that can be persisted (a job, a trigger) converts itself into a
//! [`Marshaled`] pair: a type reference plus a [`StateMap`] of plain
//! [`StateValue`]s. A [`Serializer`] turns that tree into bytes for one
//! particular codec. Restoring runs the other way: the codec rebuilds the
//! tree, then [`Restore::restore`] rebuilds the object from its state without
//! going through the type's validating constructor.
//!
//! | Piece            | Responsibility                                        |
//! |------------------|-------------------------------------------------------|
//! | [`StateValue`]   | Closed set of values every codec must represent       |
//! | [`Marshal`]      | Object → `(type_ref, state)`                          |
//! | [`Restore`]      | `(type_ref, state)` → object                          |
//! | [`Serializer`]   | `StateValue` ↔ bytes                                  |
//! | [`JsonSerializer`] | Textual reference codec                             |
//! | [`CborSerializer`] | Binary codec with native bytes and timestamps       |
//!
//! Only restore trusted data: state restoration skips the checks a
//! constructor would perform.

pub mod cbor;
pub mod error;
pub mod json;
pub mod protocol;
pub mod serializer;
pub mod value;

pub use cbor::CborSerializer;
pub use error::{MarshalError, Result};
pub use json::JsonSerializer;
pub use protocol::{marshal_object, unmarshal_object, Marshal, Marshaled, Restore, StateReader};
pub use serializer::{
    deserialize_marshaled, serialize_object, Serializer, SerializerFactory, SerializerRegistry,
};
pub use value::{StateMap, StateValue};
