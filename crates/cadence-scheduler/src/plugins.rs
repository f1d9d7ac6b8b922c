use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::{ExecutorConfig, JobConfig, JobStoreConfig};
use cadence_core::CadenceConfig;
use cadence_marshal::{SerializerRegistry, StateValue};
use cadence_triggers::{TriggerContext, TriggerRegistry};
use chrono::Utc;
use rusqlite::Connection;
use tracing::info;

use crate::callables::CallableRegistry;
use crate::error::{Result, SchedulerError, StoreError};
use crate::executor::{DebugExecutor, Executor, ThreadPoolExecutor};
use crate::job::JobSpec;
use crate::jobstore::{JobStore, MemoryJobStore, SqliteJobStore};
use crate::scheduler::{Scheduler, SchedulerSettings};

pub type ExecutorFactory = fn(&ExecutorConfig) -> Result<Arc<dyn Executor>>;
pub type JobStoreFactory = fn(&JobStoreConfig, &SerializerRegistry) -> Result<Arc<dyn JobStore>>;

/// Name → factory tables for every pluggable component family, so
/// configuration can pick implementations by name.
pub struct PluginRegistry {
    executors: HashMap<String, ExecutorFactory>,
    jobstores: HashMap<String, JobStoreFactory>,
    pub serializers: SerializerRegistry,
    pub triggers: TriggerRegistry,
}

impl PluginRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            executors: HashMap::new(),
            jobstores: HashMap::new(),
            serializers: SerializerRegistry::with_defaults(),
            triggers: TriggerRegistry::with_defaults(),
        };
        registry.register_executor(DebugExecutor::KIND, build_debug);
        registry.register_executor(ThreadPoolExecutor::KIND, build_threadpool);
        registry.register_jobstore(MemoryJobStore::KIND, build_memory);
        registry.register_jobstore(SqliteJobStore::KIND, build_sqlite);
        registry
    }

    pub fn register_executor(&mut self, name: &str, factory: ExecutorFactory) {
        self.executors.insert(name.to_string(), factory);
    }

    pub fn register_jobstore(&mut self, name: &str, factory: JobStoreFactory) {
        self.jobstores.insert(name.to_string(), factory);
    }

    pub fn build_executor(&self, config: &ExecutorConfig) -> Result<Arc<dyn Executor>> {
        let factory = self
            .executors
            .get(&config.kind)
            .ok_or_else(|| SchedulerError::UnknownPlugin {
                kind: "executor",
                name: config.kind.clone(),
            })?;
        factory(config)
    }

    pub fn build_jobstore(&self, config: &JobStoreConfig) -> Result<Arc<dyn JobStore>> {
        let factory = self
            .jobstores
            .get(&config.kind)
            .ok_or_else(|| SchedulerError::UnknownPlugin {
                kind: "job store",
                name: config.kind.clone(),
            })?;
        factory(config, &self.serializers)
    }

    /// Turn a declared job into a `JobSpec`, building its trigger by name.
    pub fn job_spec(&self, config: &JobConfig, ctx: &TriggerContext) -> Result<JobSpec> {
        let trigger = self.triggers.build(&config.trigger, ctx)?;
        let mut spec = JobSpec::new(config.func.clone(), trigger)
            .args(config.args.iter().cloned().map(StateValue::from).collect())
            .executor(config.executor.clone())
            .jobstore(config.jobstore.clone())
            .replace_existing(config.replace_existing);
        for (key, value) in &config.kwargs {
            spec = spec.kwarg(key.clone(), StateValue::from(value.clone()));
        }
        if let Some(id) = &config.id {
            spec = spec.id(id.as_str());
        }
        if let Some(name) = &config.name {
            spec = spec.name(name.clone());
        }
        if let Some(secs) = config.misfire_grace_time_secs {
            spec = spec.misfire_grace_time(Duration::from_secs(secs));
        }
        if let Some(coalesce) = config.coalesce {
            spec = spec.coalesce(coalesce);
        }
        if let Some(max) = config.max_instances {
            spec = spec.max_instances(max);
        }
        Ok(spec)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn build_debug(_: &ExecutorConfig) -> Result<Arc<dyn Executor>> {
    Ok(Arc::new(DebugExecutor::new()))
}

fn build_threadpool(config: &ExecutorConfig) -> Result<Arc<dyn Executor>> {
    Ok(Arc::new(ThreadPoolExecutor::new(config.max_workers)))
}

fn build_memory(config: &JobStoreConfig, _: &SerializerRegistry) -> Result<Arc<dyn JobStore>> {
    Ok(Arc::new(MemoryJobStore::with_policy(config.exhausted)))
}

fn build_sqlite(config: &JobStoreConfig, serializers: &SerializerRegistry) -> Result<Arc<dyn JobStore>> {
    let path = config.path.as_deref().ok_or_else(|| {
        StoreError::InvalidConfig("sqlite job store needs a 'path'".to_string())
    })?;
    let serializer = serializers.build(&config.serializer)?;
    let conn = Connection::open(path).map_err(StoreError::from)?;
    let store = SqliteJobStore::new(conn, &config.table, serializer, config.exhausted)?;
    info!(%path, table = %config.table, serializer = %config.serializer, "sqlite job store opened");
    Ok(Arc::new(store))
}

impl Scheduler {
    /// Build a scheduler with the built-in plugins.
    pub fn from_config(config: &CadenceConfig, callables: CallableRegistry) -> Result<Self> {
        Self::from_config_with(config, callables, &PluginRegistry::with_defaults())
    }

    /// Build a scheduler: settings, then executors and job stores by plugin
    /// name, then the declared jobs (held until `start`).
    pub fn from_config_with(
        config: &CadenceConfig,
        callables: CallableRegistry,
        plugins: &PluginRegistry,
    ) -> Result<Self> {
        let settings = SchedulerSettings::from_config(&config.scheduler)?;
        let scheduler = Scheduler::new(settings, callables);

        for (alias, executor) in &config.executors {
            scheduler.add_executor(alias.clone(), plugins.build_executor(executor)?)?;
        }
        for (alias, store) in &config.jobstores {
            scheduler.add_jobstore(alias.clone(), plugins.build_jobstore(store)?)?;
        }

        let ctx = TriggerContext::new(scheduler.settings().timezone, Utc::now());
        for job in &config.jobs {
            scheduler.add_job(plugins.job_spec(job, &ctx)?)?;
        }
        info!(
            executors = config.executors.len(),
            jobstores = config.jobstores.len(),
            jobs = config.jobs.len(),
            "scheduler configured"
        );
        Ok(scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::JobId;

    fn callables() -> CallableRegistry {
        let callables = CallableRegistry::new();
        callables.register("report", |_, _| Ok(StateValue::Null));
        callables
    }

    #[test]
    fn builds_components_and_jobs_from_toml() {
        let config = CadenceConfig::from_toml_str(
            r#"
            [scheduler]
            timezone = "Europe/Berlin"

            [executors.default]
            type = "debug"

            [jobstores.default]
            type = "memory"
            exhausted = "pause"

            [[jobs]]
            id = "weekday-report"
            func = "report"
            args = [1, "two"]
            kwargs = { to = "ops" }
            coalesce = false
            trigger = { type = "cron", day_of_week = "mon-fri", hour = 9 }
            "#,
        )
        .unwrap();

        let scheduler = Scheduler::from_config(&config, callables()).unwrap();
        assert_eq!(scheduler.settings().timezone.name(), "Europe/Berlin");

        let job = scheduler
            .get_job(&JobId::from("weekday-report"), None)
            .unwrap()
            .unwrap();
        assert_eq!(job.args, vec![StateValue::Int(1), StateValue::from("two")]);
        assert_eq!(job.kwargs["to"], StateValue::from("ops"));
        assert!(!job.coalesce);
        assert!(job.trigger.to_string().starts_with("cron["));
    }

    #[test]
    fn unknown_plugins_are_named_in_the_error() {
        let config = CadenceConfig::from_toml_str(
            r#"
            [executors.default]
            type = "processpool"
            "#,
        )
        .unwrap();
        let err = Scheduler::from_config(&config, callables()).err().unwrap();
        assert!(matches!(
            err,
            SchedulerError::UnknownPlugin { kind: "executor", name } if name == "processpool"
        ));
    }

    #[test]
    fn sqlite_store_needs_a_path() {
        let plugins = PluginRegistry::with_defaults();
        let mut config = JobStoreConfig::memory();
        config.kind = "sqlite".into();
        let err = plugins.build_jobstore(&config).err().unwrap();
        assert!(matches!(err, SchedulerError::Store(StoreError::InvalidConfig(_))));
    }

    #[test]
    fn jobs_with_unknown_callables_fail_the_build() {
        let config = CadenceConfig::from_toml_str(
            r#"
            [[jobs]]
            func = "nope"
            trigger = { type = "interval", minutes = 5 }
            "#,
        )
        .unwrap();
        let err = Scheduler::from_config(&config, callables()).err().unwrap();
        assert!(matches!(err, SchedulerError::UnknownCallable(_)));
    }
}
