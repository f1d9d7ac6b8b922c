use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Alias used for the executor and job store a job lands in when none is named.
pub const DEFAULT_ALIAS: &str = "default";
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_TABLE: &str = "cadence_jobs";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_executors")]
    pub executors: BTreeMap<String, ExecutorConfig>,
    #[serde(default = "default_jobstores")]
    pub jobstores: BTreeMap<String, JobStoreConfig>,
    /// Jobs declared in configuration, added when the scheduler is built.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            executors: default_executors(),
            jobstores: default_jobstores(),
            jobs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone handed to triggers built from configuration.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub job_defaults: JobDefaults,
    /// How long to wait before polling a job store again after it failed.
    #[serde(default = "default_retry_interval")]
    pub jobstore_retry_interval_secs: u64,
    /// Upper bound for a single sleep of the wakeup loop. `None` sleeps until
    /// the next due job or an explicit wakeup.
    #[serde(default)]
    pub max_sleep_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            job_defaults: JobDefaults::default(),
            jobstore_retry_interval_secs: default_retry_interval(),
            max_sleep_secs: None,
        }
    }
}

/// Values applied to jobs that do not set them explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "default_grace_secs")]
    pub misfire_grace_time_secs: u64,
    #[serde(default = "bool_true")]
    pub coalesce: bool,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            misfire_grace_time_secs: default_grace_secs(),
            coalesce: true,
            max_instances: default_max_instances(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Registered executor name, e.g. "threadpool" or "debug".
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

/// What a job store does with a job whose trigger has no further fire times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    /// Delete the job.
    #[default]
    Remove,
    /// Keep the job with a null next run time.
    Pause,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStoreConfig {
    /// Registered job store name, e.g. "memory" or "sqlite".
    #[serde(rename = "type")]
    pub kind: String,
    /// Database file for persistent stores.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    /// Registered serializer name used by persistent stores ("json" or "cbor").
    #[serde(default = "default_serializer")]
    pub serializer: String,
    #[serde(default)]
    pub exhausted: ExhaustedPolicy,
}

impl JobStoreConfig {
    pub fn memory() -> Self {
        Self {
            kind: "memory".to_string(),
            path: None,
            table: default_table(),
            serializer: default_serializer(),
            exhausted: ExhaustedPolicy::Remove,
        }
    }
}

/// A job declared in configuration.
///
/// `trigger` is a table whose `type` key names a registered trigger
/// ("date", "interval", "cron", "and", "or"); the remaining keys are its fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Name of a registered callable.
    pub func: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub trigger: serde_json::Value,
    #[serde(default = "default_alias")]
    pub executor: String,
    #[serde(default = "default_alias")]
    pub jobstore: String,
    #[serde(default)]
    pub misfire_grace_time_secs: Option<u64>,
    #[serde(default)]
    pub coalesce: Option<bool>,
    #[serde(default)]
    pub max_instances: Option<u32>,
    #[serde(default)]
    pub replace_existing: bool,
}

fn bool_true() -> bool {
    true
}
fn default_alias() -> String {
    DEFAULT_ALIAS.to_string()
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}
fn default_serializer() -> String {
    "json".to_string()
}
fn default_retry_interval() -> u64 {
    10
}
fn default_grace_secs() -> u64 {
    1
}
fn default_max_instances() -> u32 {
    1
}
fn default_max_workers() -> usize {
    10
}
fn default_executors() -> BTreeMap<String, ExecutorConfig> {
    BTreeMap::from([(
        default_alias(),
        ExecutorConfig {
            kind: "threadpool".to_string(),
            max_workers: default_max_workers(),
        },
    )])
}
fn default_jobstores() -> BTreeMap<String, JobStoreConfig> {
    BTreeMap::from([(default_alias(), JobStoreConfig::memory())])
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// Nested keys are separated by a double underscore in env vars, e.g.
    /// `CADENCE_SCHEDULER__TIMEZONE=Europe/Berlin`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Parse config from an in-memory TOML document (no env overrides).
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
