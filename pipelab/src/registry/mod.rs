//! Pipeline Registry: the persistent table of pipeline records.
//!
//! Every mutation is a single immediate transaction. Status changes are
//! validated against the lifecycle state machine and guarded by the record
//! revision, so two writers racing on the same pplid cannot both win.

mod filter;

pub use filter::PipelineFilter;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::{PipelineRecord, PipelineStatus, Workflow};
use crate::errors::{EngineError, EngineResult};
use crate::identity;
use crate::running;
use crate::store::{Store, PIPELINE_COLUMNS};
use crate::utils::{from_millis, now_utc, to_millis, Timestamp};

/// Handle on the pipeline table of one store.
#[derive(Debug, Clone)]
pub struct PipelineRegistry {
    store: Arc<Store>,
}

impl PipelineRegistry {
    /// Creates a registry over a store.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Creates a new record in status `Created`.
    ///
    /// The argument tree is resolved against the workflow and hashed before
    /// anything is written. No dedup is performed; see [`Self::find_by_hash`].
    pub fn create(&self, workflow: &Workflow, args: &Value) -> EngineResult<PipelineRecord> {
        let args_snapshot = workflow.resolve_args(args)?;
        let content_hash = identity::compute_key(&workflow.loc, &args_snapshot)?;
        let now = now_utc();

        let record = PipelineRecord {
            pplid: identity::generate_pplid(),
            content_hash,
            workflow: workflow.clone(),
            args_snapshot,
            status: PipelineStatus::Created,
            revision: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        self.store.write(|conn| insert(conn, &record))?;
        info!(
            pplid = %record.pplid,
            workflow = %workflow.loc,
            content_hash = %record.content_hash,
            "Created pipeline"
        );
        Ok(record)
    }

    /// Gets a record, failing with `NotFound` if absent.
    pub fn get(&self, pplid: &str) -> EngineResult<PipelineRecord> {
        self.store.read(|conn| load_required(conn, pplid))
    }

    /// Gets a record if it exists.
    pub fn find(&self, pplid: &str) -> EngineResult<Option<PipelineRecord>> {
        self.store.read(|conn| load(conn, pplid))
    }

    /// Returns true if a record exists under the identifier.
    pub fn contains(&self, pplid: &str) -> EngineResult<bool> {
        self.store.read(|conn| exists(conn, pplid))
    }

    /// Returns every record with the given content hash, newest first.
    pub fn find_by_hash(&self, content_hash: &str) -> EngineResult<Vec<PipelineRecord>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE content_hash = ?1 \
                 ORDER BY created_at_ms DESC, pplid DESC"
            ))?;
            let rows = stmt
                .query_map(params![content_hash], PipelineRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(PipelineRow::into_record).collect()
        })
    }

    /// Moves a record to a new status.
    ///
    /// Read, validation and write happen in one transaction. Entering or
    /// leaving `Running` is refused; those moves belong to the lifecycle
    /// controller and crash recovery, which keep the running table in step.
    pub fn update_status(&self, pplid: &str, to: PipelineStatus) -> EngineResult<PipelineRecord> {
        self.store.write(|conn| external_transition(conn, pplid, None, to))
    }

    /// Moves a record to a new status only if its revision is unchanged.
    ///
    /// Fails with `ConcurrentModification` when another writer got there
    /// first. Same `Running` restriction as [`Self::update_status`].
    pub fn compare_and_set_status(
        &self,
        pplid: &str,
        expected_revision: i64,
        to: PipelineStatus,
    ) -> EngineResult<PipelineRecord> {
        self.store
            .write(|conn| external_transition(conn, pplid, Some(expected_revision), to))
    }

    /// Moves a `Prepared` record to `Running` once its running entry exists.
    pub(crate) fn start_run(&self, pplid: &str, expected_revision: i64) -> EngineResult<PipelineRecord> {
        self.store.write(|conn| start(conn, pplid, expected_revision))
    }

    /// Lists records matching a filter, oldest first.
    pub fn list(&self, filter: &PipelineFilter) -> EngineResult<Vec<PipelineRecord>> {
        self.store.read(|conn| list(conn, filter))
    }

    /// Reads every record in one consistent snapshot.
    pub fn snapshot(&self) -> EngineResult<Vec<PipelineRecord>> {
        self.list(&PipelineFilter::new())
    }

    /// Returns the number of records.
    pub fn count(&self) -> EngineResult<usize> {
        self.store.read(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM pipelines", [], |r| r.get(0))?;
            Ok(usize::try_from(n).unwrap_or_default())
        })
    }
}

/// Raw pipeline row as stored.
pub(crate) struct PipelineRow {
    pplid: String,
    content_hash: String,
    workflow_json: String,
    args_json: String,
    status: String,
    revision: i64,
    created_at_ms: i64,
    updated_at_ms: i64,
    completed_at_ms: Option<i64>,
}

impl PipelineRow {
    /// Reads a row selected with [`PIPELINE_COLUMNS`].
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pplid: row.get(0)?,
            content_hash: row.get(1)?,
            workflow_json: row.get(2)?,
            args_json: row.get(3)?,
            status: row.get(4)?,
            revision: row.get(5)?,
            created_at_ms: row.get(6)?,
            updated_at_ms: row.get(7)?,
            completed_at_ms: row.get(8)?,
        })
    }

    pub(crate) fn into_record(self) -> EngineResult<PipelineRecord> {
        let status = self.status.parse::<PipelineStatus>().map_err(|e| {
            EngineError::corrupt(format!("pipeline {}: {e}", self.pplid))
        })?;
        Ok(PipelineRecord {
            workflow: serde_json::from_str(&self.workflow_json)?,
            args_snapshot: serde_json::from_str(&self.args_json)?,
            status,
            revision: self.revision,
            created_at: from_millis(self.created_at_ms)?,
            updated_at: from_millis(self.updated_at_ms)?,
            completed_at: self.completed_at_ms.map(from_millis).transpose()?,
            content_hash: self.content_hash,
            pplid: self.pplid,
        })
    }
}

pub(crate) fn load(conn: &Connection, pplid: &str) -> EngineResult<Option<PipelineRecord>> {
    conn.query_row(
        &format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE pplid = ?1"),
        params![pplid],
        PipelineRow::from_row,
    )
    .optional()?
    .map(PipelineRow::into_record)
    .transpose()
}

pub(crate) fn load_required(conn: &Connection, pplid: &str) -> EngineResult<PipelineRecord> {
    load(conn, pplid)?.ok_or_else(|| EngineError::not_found(pplid))
}

pub(crate) fn exists(conn: &Connection, pplid: &str) -> EngineResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM pipelines WHERE pplid = ?1",
            params![pplid],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn insert(conn: &Connection, record: &PipelineRecord) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO pipelines(pplid, content_hash, workflow_loc, workflow_json, args_json, \
         status, revision, created_at_ms, updated_at_ms, completed_at_ms) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.pplid,
            record.content_hash,
            record.workflow.loc,
            serde_json::to_string(&record.workflow)?,
            serde_json::to_string(&record.args_snapshot)?,
            record.status.as_str(),
            record.revision,
            to_millis(&record.created_at),
            to_millis(&record.updated_at),
            record.completed_at.as_ref().map(to_millis),
        ],
    )?;
    Ok(())
}

const RUNNING_OWNER: &str = "running transitions are owned by the lifecycle controller";

fn external_transition(
    conn: &Connection,
    pplid: &str,
    expected_revision: Option<i64>,
    to: PipelineStatus,
) -> EngineResult<PipelineRecord> {
    let current = load_required(conn, pplid)?;
    if to == PipelineStatus::Running || current.status == PipelineStatus::Running {
        return Err(EngineError::invalid_transition_because(
            pplid,
            current.status,
            to,
            RUNNING_OWNER,
        ));
    }
    transition(conn, pplid, expected_revision, to)
}

/// Flips a `Prepared` record to `Running` inside an open transaction.
///
/// The caller's running entry must already be present.
pub(crate) fn start(
    conn: &Connection,
    pplid: &str,
    expected_revision: i64,
) -> EngineResult<PipelineRecord> {
    if running::load(conn, pplid)?.is_none() {
        let from = load_required(conn, pplid)?.status;
        return Err(EngineError::invalid_transition_because(
            pplid,
            from,
            PipelineStatus::Running,
            "no running entry held for this pipeline",
        ));
    }
    transition(conn, pplid, Some(expected_revision), PipelineStatus::Running)
}

/// Validates and applies a status change inside an open transaction.
///
/// `Archived` is never accepted here; only the archive manager writes it.
pub(crate) fn transition(
    conn: &Connection,
    pplid: &str,
    expected_revision: Option<i64>,
    to: PipelineStatus,
) -> EngineResult<PipelineRecord> {
    let current = load_required(conn, pplid)?;

    if let Some(expected) = expected_revision {
        if expected != current.revision {
            return Err(EngineError::ConcurrentModification {
                pplid: pplid.to_string(),
                expected,
                actual: current.revision,
            });
        }
    }

    if to == PipelineStatus::Archived {
        return Err(EngineError::invalid_transition_because(
            pplid,
            current.status,
            to,
            "archival is performed by the archive manager",
        ));
    }
    if !current.status.can_transition_to(to) {
        return Err(EngineError::invalid_transition(pplid, current.status, to));
    }

    apply_status(conn, current, to, now_utc())
}

/// Writes a status that has already been validated.
pub(crate) fn apply_status(
    conn: &Connection,
    mut record: PipelineRecord,
    to: PipelineStatus,
    now: Timestamp,
) -> EngineResult<PipelineRecord> {
    let completed_at = match to {
        PipelineStatus::Completed => Some(now),
        PipelineStatus::Created => None,
        _ => record.completed_at,
    };

    let changed = conn.execute(
        "UPDATE pipelines SET status = ?1, revision = revision + 1, updated_at_ms = ?2, \
         completed_at_ms = ?3 WHERE pplid = ?4 AND revision = ?5",
        params![
            to.as_str(),
            to_millis(&now),
            completed_at.as_ref().map(to_millis),
            record.pplid,
            record.revision,
        ],
    )?;
    if changed == 0 {
        let actual: i64 = conn.query_row(
            "SELECT revision FROM pipelines WHERE pplid = ?1",
            params![record.pplid],
            |r| r.get(0),
        )?;
        return Err(EngineError::ConcurrentModification {
            pplid: record.pplid,
            expected: record.revision,
            actual,
        });
    }

    debug!(
        pplid = %record.pplid,
        from = %record.status,
        to = %to,
        revision = record.revision + 1,
        "Pipeline status changed"
    );

    record.status = to;
    record.revision += 1;
    record.updated_at = now;
    record.completed_at = completed_at;
    Ok(record)
}

pub(crate) fn list(conn: &Connection, filter: &PipelineFilter) -> EngineResult<Vec<PipelineRecord>> {
    let (clause, values) = filter.sql_clause();
    let mut stmt = conn.prepare(&format!(
        "SELECT {PIPELINE_COLUMNS} FROM pipelines{clause} ORDER BY created_at_ms ASC, pplid ASC"
    ))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), PipelineRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let record = row.into_record()?;
        if filter.matches_args(&record) {
            records.push(record);
            if filter.limit.is_some_and(|limit| records.len() >= limit) {
                break;
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ComponentRef;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> PipelineRegistry {
        PipelineRegistry::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    fn workflow() -> Workflow {
        Workflow::new("flows.train_eval")
            .step("train", ComponentRef::new("models.mlp").with_arg("lr", json!(0.01)))
            .step("eval", ComponentRef::new("metrics.accuracy"))
    }

    #[test]
    fn test_create_and_get() {
        let reg = registry();
        let rec = reg.create(&workflow(), &json!({"train": {"lr": 0.1}})).unwrap();

        assert_eq!(rec.status, PipelineStatus::Created);
        assert_eq!(rec.revision, 0);
        assert!(identity::is_valid_pplid(&rec.pplid));

        let loaded = reg.get(&rec.pplid).unwrap();
        assert_eq!(loaded.content_hash, rec.content_hash);
        assert_eq!(loaded.workflow, workflow());
        assert_eq!(loaded.step_args("train").unwrap()["lr"], json!(0.1));
    }

    #[test]
    fn test_get_unknown() {
        let err = registry().get("ppl-nope").unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
        assert_eq!(err.pplid(), Some("ppl-nope"));
    }

    #[test]
    fn test_create_rejects_bad_args_without_writing() {
        let reg = registry();
        assert!(reg.create(&workflow(), &json!({"deploy": {}})).is_err());
        assert_eq!(reg.count().unwrap(), 0);
    }

    #[test]
    fn test_identical_configs_coexist_and_share_hash() {
        let reg = registry();
        let a = reg.create(&workflow(), &json!({"train": {"lr": 0.1}})).unwrap();
        let b = reg.create(&workflow(), &json!({"train": {"lr": 0.1}})).unwrap();
        let c = reg.create(&workflow(), &json!({"train": {"lr": 0.5}})).unwrap();

        assert_ne!(a.pplid, b.pplid);
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);

        let dupes = reg.find_by_hash(&a.content_hash).unwrap();
        let ids: Vec<_> = dupes.iter().map(|r| r.pplid.as_str()).collect();
        assert_eq!(ids, vec![b.pplid.as_str(), a.pplid.as_str()]);
    }

    #[test]
    fn test_update_status_follows_state_machine() {
        let reg = registry();
        let rec = reg.create(&workflow(), &Value::Null).unwrap();

        let rec2 = reg.update_status(&rec.pplid, PipelineStatus::Prepared).unwrap();
        assert_eq!(rec2.revision, 1);

        let err = reg
            .update_status(&rec.pplid, PipelineStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(reg.get(&rec.pplid).unwrap().status, PipelineStatus::Prepared);
    }

    /// Drives a record through a run the way the controller does.
    fn run_to(reg: &PipelineRegistry, pplid: &str, to: PipelineStatus) -> PipelineRecord {
        let prepared = reg.update_status(pplid, PipelineStatus::Prepared).unwrap();
        reg.store()
            .write(|conn| {
                running::insert(conn, pplid, "test-host:1", now_utc())?;
                start(conn, pplid, prepared.revision)?;
                running::remove(conn, pplid)?;
                transition(conn, pplid, None, to)
            })
            .unwrap()
    }

    #[test]
    fn test_update_status_refuses_archived() {
        let reg = registry();
        let rec = reg.create(&workflow(), &Value::Null).unwrap();
        run_to(&reg, &rec.pplid, PipelineStatus::Completed);
        let err = reg
            .update_status(&rec.pplid, PipelineStatus::Archived)
            .unwrap_err();
        assert!(err.to_string().contains("archive manager"));
    }

    #[test]
    fn test_update_status_refuses_entering_running() {
        let reg = registry();
        let rec = reg.create(&workflow(), &Value::Null).unwrap();
        let prepared = reg.update_status(&rec.pplid, PipelineStatus::Prepared).unwrap();

        let err = reg
            .update_status(&rec.pplid, PipelineStatus::Running)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert!(err.to_string().contains("lifecycle controller"));
        assert!(reg
            .compare_and_set_status(&rec.pplid, prepared.revision, PipelineStatus::Running)
            .is_err());

        let stored = reg.get(&rec.pplid).unwrap();
        assert_eq!(stored.status, PipelineStatus::Prepared);
        assert_eq!(stored.revision, prepared.revision);
    }

    #[test]
    fn test_update_status_refuses_leaving_running() {
        let reg = registry();
        let rec = reg.create(&workflow(), &Value::Null).unwrap();
        let prepared = reg.update_status(&rec.pplid, PipelineStatus::Prepared).unwrap();
        reg.store()
            .write(|conn| running::insert(conn, &rec.pplid, "test-host:1", now_utc()))
            .unwrap();
        let started = reg.start_run(&rec.pplid, prepared.revision).unwrap();
        assert_eq!(started.status, PipelineStatus::Running);

        for to in [PipelineStatus::Failed, PipelineStatus::Completed] {
            let err = reg.update_status(&rec.pplid, to).unwrap_err();
            assert!(err.to_string().contains("lifecycle controller"));
        }
        assert_eq!(reg.get(&rec.pplid).unwrap().status, PipelineStatus::Running);
    }

    #[test]
    fn test_start_run_requires_running_entry() {
        let reg = registry();
        let rec = reg.create(&workflow(), &Value::Null).unwrap();
        let prepared = reg.update_status(&rec.pplid, PipelineStatus::Prepared).unwrap();

        let err = reg.start_run(&rec.pplid, prepared.revision).unwrap_err();
        assert!(err.to_string().contains("no running entry"));
        assert_eq!(reg.get(&rec.pplid).unwrap().status, PipelineStatus::Prepared);
    }

    #[test]
    fn test_completed_at_stamped_and_cleared_on_resume() {
        let reg = registry();
        let rec = reg.create(&workflow(), &Value::Null).unwrap();
        let done = run_to(&reg, &rec.pplid, PipelineStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(reg.get(&rec.pplid).unwrap().completed_at.is_some());

        let other = reg.create(&workflow(), &Value::Null).unwrap();
        run_to(&reg, &other.pplid, PipelineStatus::Failed);
        let resumed = reg.update_status(&other.pplid, PipelineStatus::Created).unwrap();
        assert!(resumed.completed_at.is_none());
    }

    #[test]
    fn test_compare_and_set_detects_stale_revision() {
        let reg = registry();
        let rec = reg.create(&workflow(), &Value::Null).unwrap();

        reg.compare_and_set_status(&rec.pplid, rec.revision, PipelineStatus::Prepared)
            .unwrap();
        let err = reg
            .compare_and_set_status(&rec.pplid, rec.revision, PipelineStatus::Prepared)
            .unwrap_err();

        match err {
            EngineError::ConcurrentModification { expected, actual, .. } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_list_with_filter() {
        let reg = registry();
        let a = reg.create(&workflow(), &json!({"train": {"lr": 0.1}})).unwrap();
        let b = reg.create(&workflow(), &json!({"train": {"lr": 0.2}})).unwrap();
        reg.update_status(&b.pplid, PipelineStatus::Prepared).unwrap();

        let prepared = reg
            .list(&PipelineFilter::new().with_status(PipelineStatus::Prepared))
            .unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].pplid, b.pplid);

        let by_arg = reg
            .list(&PipelineFilter::new().with_arg("train.args.lr", json!(0.1)))
            .unwrap();
        assert_eq!(by_arg.len(), 1);
        assert_eq!(by_arg[0].pplid, a.pplid);

        let limited = reg.list(&PipelineFilter::new().with_limit(1)).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(reg.snapshot().unwrap().len(), 2);
    }
}
