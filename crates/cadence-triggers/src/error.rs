use cadence_marshal::MarshalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid {field} expression '{expr}': {reason}")]
    InvalidExpression {
        field: &'static str,
        expr: String,
        reason: String,
    },

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("invalid datetime '{0}'")]
    InvalidDatetime(String),

    #[error("invalid trigger configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown trigger type: {0}")]
    UnknownType(String),

    #[error("marshal error: {0}")]
    Marshal(#[from] MarshalError),
}

pub type Result<T> = std::result::Result<T, TriggerError>;
