use crate::config::EngineConfig;
use crate::ensure_dir;
use crate::events::ConfigEvents;
use crate::locks::LockRegistry;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Context {
    pub config: Arc<EngineConfig>,
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub locks: Arc<LockRegistry>,
    pub events: Arc<ConfigEvents>,
}

impl Context {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let registry = Registry::with_builtins(Duration::from_millis(config.process_poll_ms));
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: EngineConfig, registry: Registry) -> Result<Self> {
        ensure_dir(&config.result_root)?;
        let scheduler = Scheduler::new(config.run_threads, config.iteration_threads)?;
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            scheduler: Arc::new(scheduler),
            locks: Arc::new(LockRegistry::new()),
            events: Arc::new(ConfigEvents::new()),
        })
    }

    pub fn result_root(&self) -> &Path {
        &self.config.result_root
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.config.pause_poll_ms.max(1))
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
