use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};

use crate::{
    Config, Engine, Result,
    gateway::ActionGateway,
    mapping::MappingStore,
    pipeline::steps::{LogNotifier, Notifier},
    runtime::RuntimeParts,
};

/// Assembles an [`Engine`] with its collaborators.
pub struct EngineBuilder {
    config: Config,
    rt: Option<Arc<Runtime>>,
    gateway: Option<Arc<dyn ActionGateway>>,
    notifier: Option<Arc<dyn Notifier>>,
    mappings: Option<Arc<MappingStore>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            rt: None,
            gateway: None,
            notifier: None,
            mappings: None,
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(
        mut self,
        config: Config,
    ) -> Self {
        self.config = config;
        self
    }

    pub fn runtime(
        mut self,
        runtime: Arc<Runtime>,
    ) -> Self {
        self.rt = Some(runtime);
        self
    }

    /// The action gateway every read/write step and tool call routes
    /// through. Required.
    pub fn gateway(
        mut self,
        gateway: Arc<dyn ActionGateway>,
    ) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn notifier(
        mut self,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn mappings(
        mut self,
        mappings: Arc<MappingStore>,
    ) -> Self {
        self.mappings = Some(mappings);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let gateway = self
            .gateway
            .ok_or_else(|| crate::FlowgateError::Config("no action gateway registered".to_string()))?;

        let runtime = match self.rt {
            Some(runtime) => runtime,
            None => Arc::new(
                Builder::new_multi_thread()
                    .worker_threads(self.config.async_worker_thread_number.into())
                    .enable_all()
                    .build()
                    .unwrap(),
            ),
        };

        let parts = RuntimeParts {
            gateway,
            mappings: self.mappings.unwrap_or_else(|| Arc::new(MappingStore::new())),
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            limits: Arc::new(self.config.limits.clone()),
        };

        Ok(Engine::with_parts(runtime, parts))
    }
}
