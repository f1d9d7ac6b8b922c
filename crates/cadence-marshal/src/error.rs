use thiserror::Error;

/// Errors raised while marshaling, restoring or encoding object state.
#[derive(Debug, Error)]
pub enum MarshalError {
    /// The object does not expose extractable state, or the type reference is unknown.
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// The stored state was written by a newer version of the type.
    #[error("Cannot restore {type_ref} state version {found} (highest supported: {supported})")]
    UnsupportedVersion {
        type_ref: String,
        found: i64,
        supported: i64,
    },

    #[error("Missing field '{field}' in {type_ref} state")]
    MissingField { type_ref: String, field: String },

    #[error("Field '{field}' in {type_ref} state is not {expected}")]
    WrongType {
        type_ref: String,
        field: String,
        expected: &'static str,
    },

    /// The state was well-formed but describes an impossible object.
    #[error("Invalid {type_ref} state: {reason}")]
    InvalidState { type_ref: String, reason: String },

    /// The byte-level codec could not represent or parse a value.
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Unknown serializer: {0}")]
    UnknownSerializer(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MarshalError>;
