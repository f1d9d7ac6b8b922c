//! `cadence-core`: types and configuration shared by every cadence crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::CadenceConfig;
pub use error::{CoreError, Result};
pub use types::JobId;
