//! Lifecycle Controller.
//!
//! Drives a pipeline through
//! `Created -> Prepared -> Running -> {Completed, Failed}`, with
//! `Failed -> Created` for an explicit resume. Archival is left to the
//! archive manager.
//!
//! A run inserts its running entry before flipping the status, so a crash
//! between the two leaves the record `Prepared` with a stale entry that
//! reconcile removes. Finalization writes the status, removes the entry and
//! appends the log line in one transaction.

mod heartbeat;
mod preparer;


pub use preparer::{NoOpPreparer, Preparer};

#[cfg(test)]
pub(crate) use preparer::MockPreparer;

use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::archive::transfer::{self, TransferContext};
use crate::components::{ComponentRegistry, StepContext};
use crate::core::{LogLevel, PipelineRecord, PipelineStatus, Workflow};
use crate::errors::{EngineError, EngineResult, ExecutionError};
use crate::identity;
use crate::logs::{self, PipelineLog};
use crate::registry::{self, PipelineRegistry};
use crate::running::{self, ReconcileReport, RunningRegistry};
use crate::store::Store;
use crate::utils::now_utc;
use heartbeat::HeartbeatGuard;

/// Default period between heartbeats of an active run.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default age after which a heartbeat counts as stale.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(60);

/// Result of driving one run to its end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    /// The pipeline that ran.
    pub pplid: String,
    /// Final status, `Completed` or `Failed`.
    pub status: PipelineStatus,
    /// Outputs of the steps that finished, keyed by step name.
    pub outputs: Map<String, Value>,
    /// The step that failed, if any.
    pub failed_step: Option<String>,
    /// The failing step's error, if any.
    pub error: Option<ExecutionError>,
    /// Wall time of the step loop in milliseconds.
    pub duration_ms: f64,
}

impl RunOutcome {
    /// Returns true if every step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    /// Converts a failed outcome into an `Execution` error.
    pub fn into_result(self) -> EngineResult<Map<String, Value>> {
        match (self.failed_step, self.error) {
            (Some(step), Some(source)) => Err(EngineError::Execution {
                pplid: self.pplid,
                step,
                source,
            }),
            _ => Ok(self.outputs),
        }
    }
}

struct StepFailure {
    step: String,
    error: ExecutionError,
}

/// Coordinates the registry, running registry, logs and component resolver.
pub struct LifecycleController {
    store: Arc<Store>,
    registry: PipelineRegistry,
    running: RunningRegistry,
    logs: PipelineLog,
    components: Arc<ComponentRegistry>,
    preparer: Arc<dyn Preparer>,
    heartbeat_interval: Duration,
    stale_threshold: Duration,
}

impl LifecycleController {
    /// Creates a controller over the active store.
    #[must_use]
    pub fn new(store: Arc<Store>, components: Arc<ComponentRegistry>) -> Self {
        Self {
            registry: PipelineRegistry::new(Arc::clone(&store)),
            running: RunningRegistry::new(Arc::clone(&store)),
            logs: PipelineLog::new(Arc::clone(&store)),
            store,
            components,
            preparer: Arc::new(NoOpPreparer),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }

    /// Sets the resource preparer.
    #[must_use]
    pub fn with_preparer(mut self, preparer: impl Preparer + 'static) -> Self {
        self.preparer = Arc::new(preparer);
        self
    }

    /// Sets a shared resource preparer.
    #[must_use]
    pub fn with_preparer_arc(mut self, preparer: Arc<dyn Preparer>) -> Self {
        self.preparer = preparer;
        self
    }

    /// Sets the heartbeat period.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the staleness threshold used by [`Self::recover`].
    #[must_use]
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Overrides the `<host>:<pid>` marker written into running entries.
    #[must_use]
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.running = RunningRegistry::with_marker(Arc::clone(&self.store), marker);
        self
    }

    /// Returns the pipeline registry.
    #[must_use]
    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    /// Returns the running registry.
    #[must_use]
    pub fn running(&self) -> &RunningRegistry {
        &self.running
    }

    /// Returns the log sink.
    #[must_use]
    pub fn logs(&self) -> &PipelineLog {
        &self.logs
    }

    /// Returns the component resolver.
    #[must_use]
    pub fn components(&self) -> &Arc<ComponentRegistry> {
        &self.components
    }

    /// Creates a new pipeline without dedup.
    pub fn create_pipeline(&self, workflow: &Workflow, args: &Value) -> EngineResult<PipelineRecord> {
        self.registry.create(workflow, args)
    }

    /// Returns the newest non-archived pipeline with the same content hash,
    /// or creates one.
    ///
    /// The boolean is true when a new record was created. The lookup and
    /// the insert are separate transactions, so two callers racing on the
    /// same configuration may both create.
    pub fn get_or_create(
        &self,
        workflow: &Workflow,
        args: &Value,
    ) -> EngineResult<(PipelineRecord, bool)> {
        let resolved = workflow.resolve_args(args)?;
        let content_hash = identity::compute_key(&workflow.loc, &resolved)?;

        if let Some(existing) = self
            .registry
            .find_by_hash(&content_hash)?
            .into_iter()
            .find(|r| r.status != PipelineStatus::Archived)
        {
            debug!(pplid = %existing.pplid, content_hash = %content_hash, "Reusing pipeline");
            return Ok((existing, false));
        }
        Ok((self.registry.create(workflow, args)?, true))
    }

    /// Prepares a `Created` pipeline.
    ///
    /// # Errors
    ///
    /// `PreparationError` if the preparer fails; the record stays `Created`
    /// and the cause is logged against it.
    pub async fn prepare(&self, pplid: &str) -> EngineResult<PipelineRecord> {
        let record = self.registry.get(pplid)?;
        if record.status != PipelineStatus::Created {
            return Err(EngineError::invalid_transition(
                pplid,
                record.status,
                PipelineStatus::Prepared,
            ));
        }

        if let Err(message) = self.preparer.prepare(&record).await {
            self.logs.append(
                pplid,
                LogLevel::Error,
                format!("preparation failed: {message}"),
            )?;
            return Err(EngineError::Preparation {
                pplid: pplid.to_string(),
                message,
            });
        }

        let prepared =
            self.registry
                .compare_and_set_status(pplid, record.revision, PipelineStatus::Prepared)?;
        info!(pplid, "Pipeline prepared");
        Ok(prepared)
    }

    /// Runs a `Prepared` pipeline to completion or failure.
    ///
    /// Step failures are reported in the returned [`RunOutcome`]; `Err` is
    /// reserved for engine-level problems (wrong status, already running,
    /// lost race, store failure).
    pub async fn run(&self, pplid: &str) -> EngineResult<RunOutcome> {
        let record = self.registry.get(pplid)?;
        if record.status != PipelineStatus::Prepared {
            return Err(EngineError::invalid_transition_because(
                pplid,
                record.status,
                PipelineStatus::Running,
                "only prepared pipelines can start",
            ));
        }
        let transfer_ctx = self.store.read(|conn| transfer::context_for(conn, pplid))?;

        self.running.mark_running(pplid)?;
        let record = match self.registry.start_run(pplid, record.revision) {
            Ok(record) => record,
            Err(err) => {
                if let Err(cleanup) = self.running.mark_stopped(pplid) {
                    warn!(pplid, error = %cleanup, "Failed to remove running entry after lost start");
                }
                return Err(err);
            }
        };
        info!(
            pplid,
            workflow = %record.workflow.loc,
            steps = record.workflow.template.len(),
            "Pipeline run started"
        );

        let started = Instant::now();
        let (outputs, failure) = {
            let _heartbeat = HeartbeatGuard::spawn(
                self.running.clone(),
                pplid.to_string(),
                self.heartbeat_interval,
            );
            self.execute_steps(&record, &transfer_ctx).await
        };
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.finish(&record, outputs, failure, duration_ms)
    }

    /// Creates, prepares and runs a pipeline.
    pub async fn execute(&self, workflow: &Workflow, args: &Value) -> EngineResult<RunOutcome> {
        let record = self.create_pipeline(workflow, args)?;
        self.prepare(&record.pplid).await?;
        self.run(&record.pplid).await
    }

    /// Moves a `Failed` pipeline back to `Created` for another attempt.
    pub fn resume(&self, pplid: &str) -> EngineResult<PipelineRecord> {
        let record = self.registry.get(pplid)?;
        if record.status != PipelineStatus::Failed {
            return Err(EngineError::invalid_transition_because(
                pplid,
                record.status,
                PipelineStatus::Created,
                "only failed pipelines can be resumed",
            ));
        }
        let resumed =
            self.registry
                .compare_and_set_status(pplid, record.revision, PipelineStatus::Created)?;
        info!(pplid, "Pipeline resumed");
        Ok(resumed)
    }

    /// Reconciles stale runs; call once at process start.
    pub fn recover(&self) -> EngineResult<ReconcileReport> {
        self.running.reconcile(self.stale_threshold)
    }

    async fn execute_steps(
        &self,
        record: &PipelineRecord,
        transfer_ctx: &TransferContext,
    ) -> (Map<String, Value>, Option<StepFailure>) {
        let mut outputs = Map::new();

        for step in &record.workflow.template {
            let declared = record
                .step_loc(step)
                .or_else(|| record.workflow.component(step).map(|c| c.loc.as_str()))
                .unwrap_or_default();
            let loc = transfer_ctx.map_component(declared).to_string();
            let args = transfer_ctx.map_args(
                record
                    .step_args(step)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new())),
            );
            let ctx = StepContext {
                pplid: record.pplid.clone(),
                step: step.clone(),
                loc: loc.clone(),
                prior_outputs: outputs.clone(),
            };

            debug!(pplid = %record.pplid, step = %step, loc = %loc, "Step started");
            let result = match self.components.resolve(&loc) {
                Ok(component) => AssertUnwindSafe(component.invoke(&ctx, &args))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(ExecutionError::new(panic_message(panic.as_ref())))),
                Err(err) => Err(err),
            };

            match result {
                Ok(value) => {
                    debug!(pplid = %record.pplid, step = %step, "Step completed");
                    outputs.insert(step.clone(), value);
                }
                Err(err) => {
                    let error = if err.loc.is_some() { err } else { err.with_loc(loc) };
                    return (
                        outputs,
                        Some(StepFailure {
                            step: step.clone(),
                            error,
                        }),
                    );
                }
            }
        }

        (outputs, None)
    }

    fn finish(
        &self,
        record: &PipelineRecord,
        outputs: Map<String, Value>,
        failure: Option<StepFailure>,
        duration_ms: f64,
    ) -> EngineResult<RunOutcome> {
        let (to, level, message) = match &failure {
            None => (
                PipelineStatus::Completed,
                LogLevel::Info,
                format!(
                    "completed {} step(s) in {duration_ms:.1} ms",
                    record.workflow.template.len()
                ),
            ),
            Some(StepFailure { step, error }) => (
                PipelineStatus::Failed,
                LogLevel::Error,
                format!(
                    "step '{step}' failed at '{}': {}",
                    error.loc.as_deref().unwrap_or_default(),
                    error.message
                ),
            ),
        };

        let pplid = record.pplid.as_str();
        let (finished, entry) = self.store.write(|conn| {
            let finished = registry::transition(conn, pplid, Some(record.revision), to)?;
            running::remove(conn, pplid)?;
            let entry = logs::insert(conn, pplid, level, &message, now_utc())?;
            Ok((finished, entry))
        })?;
        logs::mirror(&entry);

        let (failed_step, error) = match failure {
            Some(StepFailure { step, error }) => (Some(step), Some(error)),
            None => (None, None),
        };
        Ok(RunOutcome {
            pplid: finished.pplid,
            status: finished.status,
            outputs,
            failed_step,
            error,
            duration_ms,
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("component panicked: {detail}")
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("store", &self.store)
            .field("marker", &self.running.marker())
            .field("components", &self.components.len())
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("stale_threshold", &self.stale_threshold)
            .finish_non_exhaustive()
    }
}
