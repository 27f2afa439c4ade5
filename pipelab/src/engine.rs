//! Top-level handle wiring the stores and services together.

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::archive::{ArchiveManager, Bundle, ExportOptions, ImportReport};
use crate::components::ComponentRegistry;
use crate::config::EngineConfig;
use crate::core::{PipelineRecord, Workflow};
use crate::errors::EngineResult;
use crate::graph::DependencyGraph;
use crate::lifecycle::{LifecycleController, Preparer, RunOutcome};
use crate::logs::PipelineLog;
use crate::registry::PipelineRegistry;
use crate::running::{ReconcileReport, RunningRegistry};
use crate::store::Store;

/// An opened lab: active store, archive store and the services over them.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    active: Arc<Store>,
    graph: DependencyGraph,
    controller: LifecycleController,
    archive: ArchiveManager,
}

impl Engine {
    /// Opens both stores and, if configured, reclaims stale runs.
    pub fn open(config: EngineConfig, components: ComponentRegistry) -> EngineResult<Self> {
        config.validate()?;
        let active = Arc::new(Store::open_with_timeout(
            &config.active_store,
            config.busy_timeout(),
        )?);
        let archive_store = Arc::new(Store::open_with_timeout(
            &config.archive_store,
            config.busy_timeout(),
        )?);

        let controller = LifecycleController::new(Arc::clone(&active), Arc::new(components))
            .with_heartbeat_interval(config.heartbeat_interval())
            .with_stale_threshold(config.stale_threshold());
        let mut archive = ArchiveManager::new(Arc::clone(&active), archive_store);
        if let Some(lab_id) = &config.lab_id {
            archive = archive.with_lab_id(lab_id.as_str());
        }

        let engine = Self {
            graph: DependencyGraph::new(Arc::clone(&active)),
            config,
            active,
            controller,
            archive,
        };

        info!(
            active = %engine.config.active_store.display(),
            archive = %engine.config.archive_store.display(),
            lab_id = engine.config.lab_id.as_deref().unwrap_or("-"),
            "Opened engine"
        );
        if engine.config.recover_on_open {
            let report = engine.recover()?;
            if !report.is_empty() {
                warn!(
                    recovered = report.recovered.len(),
                    orphaned = report.orphaned.len(),
                    "Reclaimed stale runs on open"
                );
            }
        }
        Ok(engine)
    }

    /// Installs a preparer on the controller.
    #[must_use]
    pub fn with_preparer(mut self, preparer: impl Preparer + 'static) -> Self {
        self.controller = self.controller.with_preparer(preparer);
        self
    }

    /// Returns the configuration the engine was opened with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the active store.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.active
    }

    /// Returns the pipeline registry.
    #[must_use]
    pub fn registry(&self) -> &PipelineRegistry {
        self.controller.registry()
    }

    /// Returns the dependency graph.
    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Returns the running registry.
    #[must_use]
    pub fn running(&self) -> &RunningRegistry {
        self.controller.running()
    }

    /// Returns the pipeline log.
    #[must_use]
    pub fn logs(&self) -> &PipelineLog {
        self.controller.logs()
    }

    /// Returns the lifecycle controller.
    #[must_use]
    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    /// Returns the archive manager.
    #[must_use]
    pub fn archive(&self) -> &ArchiveManager {
        &self.archive
    }

    /// Creates a pipeline in status `Created`.
    pub fn create_pipeline(&self, workflow: &Workflow, args: &Value) -> EngineResult<PipelineRecord> {
        self.controller.create_pipeline(workflow, args)
    }

    /// Creates, prepares and runs a pipeline.
    pub async fn execute(&self, workflow: &Workflow, args: &Value) -> EngineResult<RunOutcome> {
        self.controller.execute(workflow, args).await
    }

    /// Reconciles runs whose heartbeat is older than the stale threshold.
    pub fn recover(&self) -> EngineResult<ReconcileReport> {
        self.controller.recover()
    }

    /// Moves a terminal pipeline into the archive store.
    pub fn archive_pipeline(&self, pplid: &str) -> EngineResult<PipelineRecord> {
        self.archive.archive(pplid)
    }

    /// Exports pipelines as a bundle.
    pub fn export(&self, pplids: &[String], options: &ExportOptions) -> EngineResult<Bundle> {
        self.archive.export(pplids, options)
    }

    /// Imports a bundle into the active store.
    pub fn import(&self, bundle: &Bundle) -> EngineResult<ImportReport> {
        self.archive.import(bundle)
    }
}
