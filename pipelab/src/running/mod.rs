//! Running Registry and crash recovery.
//!
//! A row in `running` is the only evidence that a pipeline is executing.
//! The primary key on `pplid` gives at-most-one active run per pipeline
//! across every process sharing the store. Runs whose heartbeat goes stale
//! are treated as crashed by [`RunningRegistry::reconcile`].

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::{LogEntry, LogLevel, PipelineStatus, RunningEntry};
use crate::errors::{EngineError, EngineResult};
use crate::logs;
use crate::registry;
use crate::store::Store;
use crate::utils::{format_iso8601, from_millis, now_utc, to_millis, Timestamp};

/// Outcome of a reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Pipelines moved from `Running` to `Failed`.
    pub recovered: Vec<String>,
    /// Stale entries removed without a status change.
    pub orphaned: Vec<String>,
}

impl ReconcileReport {
    /// Returns true if nothing was stale.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.orphaned.is_empty()
    }

    /// Returns the number of stale entries handled.
    #[must_use]
    pub fn total(&self) -> usize {
        self.recovered.len() + self.orphaned.len()
    }
}

/// Handle on the running table of one store.
#[derive(Debug, Clone)]
pub struct RunningRegistry {
    store: Arc<Store>,
    marker: String,
}

impl RunningRegistry {
    /// Creates a registry that marks runs with this process's marker.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_marker(store, process_marker())
    }

    /// Creates a registry with an explicit holder marker.
    #[must_use]
    pub fn with_marker(store: Arc<Store>, marker: impl Into<String>) -> Self {
        Self {
            store,
            marker: marker.into(),
        }
    }

    /// Returns the marker written into new entries.
    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Records that `pplid` is executing.
    ///
    /// # Errors
    ///
    /// `AlreadyRunningError` carrying the current holder's marker if an entry
    /// already exists.
    pub fn mark_running(&self, pplid: &str) -> EngineResult<RunningEntry> {
        let entry = self
            .store
            .write(|conn| insert(conn, pplid, &self.marker, now_utc()))?;
        debug!(pplid, marker = %entry.marker, "Marked running");
        Ok(entry)
    }

    /// Refreshes the heartbeat of an active run.
    pub fn heartbeat(&self, pplid: &str) -> EngineResult<Timestamp> {
        let now = now_utc();
        let changed = self.store.write(|conn| {
            Ok(conn.execute(
                "UPDATE running SET heartbeat_at_ms = ?1 WHERE pplid = ?2",
                params![to_millis(&now), pplid],
            )?)
        })?;
        if changed == 0 {
            return Err(EngineError::not_found_in(pplid, "running"));
        }
        Ok(now)
    }

    /// Removes the entry for `pplid`, returning whether one existed.
    pub fn mark_stopped(&self, pplid: &str) -> EngineResult<bool> {
        let removed = self.store.write(|conn| remove(conn, pplid))?;
        debug!(pplid, removed, "Marked stopped");
        Ok(removed)
    }

    /// Returns the entry for `pplid`, if any.
    pub fn get(&self, pplid: &str) -> EngineResult<Option<RunningEntry>> {
        self.store.read(|conn| load(conn, pplid))
    }

    /// Returns true if `pplid` has an active entry.
    pub fn is_running(&self, pplid: &str) -> EngineResult<bool> {
        Ok(self.get(pplid)?.is_some())
    }

    /// Returns every active entry, oldest start first.
    pub fn list(&self) -> EngineResult<Vec<RunningEntry>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT pplid, marker, started_at_ms, heartbeat_at_ms FROM running \
                 ORDER BY started_at_ms ASC, pplid ASC",
            )?;
            let rows = stmt
                .query_map([], raw_entry)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(decode).collect()
        })
    }

    /// Treats runs with a heartbeat older than `stale_threshold` as crashed.
    pub fn reconcile(&self, stale_threshold: Duration) -> EngineResult<ReconcileReport> {
        self.reconcile_as_of(now_utc(), stale_threshold)
    }

    /// Reconciles against an explicit clock reading.
    ///
    /// Each stale entry whose record is `Running` moves the record to
    /// `Failed` with an error log entry; any other stale entry (record in
    /// the prepare/start window, or gone) is removed only. The whole pass is
    /// one transaction.
    pub fn reconcile_as_of(
        &self,
        now: Timestamp,
        stale_threshold: Duration,
    ) -> EngineResult<ReconcileReport> {
        let threshold_ms = i64::try_from(stale_threshold.as_millis()).unwrap_or(i64::MAX);
        let cutoff = to_millis(&now).saturating_sub(threshold_ms);

        let (report, entries) = self.store.write(|conn| {
            let stale = {
                let mut stmt = conn.prepare(
                    "SELECT pplid, marker, started_at_ms, heartbeat_at_ms FROM running \
                     WHERE heartbeat_at_ms < ?1 ORDER BY heartbeat_at_ms ASC, pplid ASC",
                )?;
                let rows = stmt
                    .query_map(params![cutoff], raw_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(decode).collect::<EngineResult<Vec<_>>>()?
            };

            let mut report = ReconcileReport::default();
            let mut entries: Vec<LogEntry> = Vec::new();
            for run in stale {
                match registry::load(conn, &run.pplid)? {
                    Some(record) if record.status == PipelineStatus::Running => {
                        registry::apply_status(conn, record, PipelineStatus::Failed, now)?;
                        let message = format!(
                            "crash-recovered: heartbeat stale since {} (held by {})",
                            format_iso8601(&run.heartbeat_at),
                            run.marker
                        );
                        entries.push(logs::insert(conn, &run.pplid, LogLevel::Error, &message, now)?);
                        report.recovered.push(run.pplid.clone());
                    }
                    _ => report.orphaned.push(run.pplid.clone()),
                }
                remove(conn, &run.pplid)?;
            }
            Ok((report, entries))
        })?;

        entries.iter().for_each(logs::mirror);
        for pplid in &report.orphaned {
            warn!(pplid, "Removed stale running entry without a running record");
        }
        if !report.is_empty() {
            info!(
                recovered = report.recovered.len(),
                orphaned = report.orphaned.len(),
                "Reconciled stale runs"
            );
        }
        Ok(report)
    }
}

/// Returns `<host>:<pid>` for the current process.
#[must_use]
pub fn process_marker() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}:{}", std::process::id())
}

type RawEntry = (String, String, i64, i64);

fn raw_entry(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode((pplid, marker, started_at_ms, heartbeat_at_ms): RawEntry) -> EngineResult<RunningEntry> {
    Ok(RunningEntry {
        pplid,
        marker,
        started_at: from_millis(started_at_ms)?,
        heartbeat_at: from_millis(heartbeat_at_ms)?,
    })
}

pub(crate) fn load(conn: &Connection, pplid: &str) -> EngineResult<Option<RunningEntry>> {
    conn.query_row(
        "SELECT pplid, marker, started_at_ms, heartbeat_at_ms FROM running WHERE pplid = ?1",
        params![pplid],
        raw_entry,
    )
    .optional()?
    .map(decode)
    .transpose()
}

/// Insert-if-absent inside an open transaction.
pub(crate) fn insert(
    conn: &Connection,
    pplid: &str,
    marker: &str,
    now: Timestamp,
) -> EngineResult<RunningEntry> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO running(pplid, marker, started_at_ms, heartbeat_at_ms) \
         VALUES (?1, ?2, ?3, ?3)",
        params![pplid, marker, to_millis(&now)],
    )?;
    if changed == 0 {
        let holder = load(conn, pplid)?.map_or_else(|| "unknown".to_string(), |e| e.marker);
        return Err(EngineError::AlreadyRunning {
            pplid: pplid.to_string(),
            marker: holder,
        });
    }
    Ok(RunningEntry {
        pplid: pplid.to_string(),
        marker: marker.to_string(),
        started_at: now,
        heartbeat_at: now,
    })
}

pub(crate) fn remove(conn: &Connection, pplid: &str) -> EngineResult<bool> {
    let changed = conn.execute("DELETE FROM running WHERE pplid = ?1", params![pplid])?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ComponentRef, Workflow};
    use crate::logs::PipelineLog;
    use crate::registry::PipelineRegistry;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn fixture() -> (Arc<Store>, PipelineRegistry, RunningRegistry) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        (
            Arc::clone(&store),
            PipelineRegistry::new(Arc::clone(&store)),
            RunningRegistry::with_marker(store, "test-host:1"),
        )
    }

    fn create(registry: &PipelineRegistry) -> String {
        let wf = Workflow::new("flows.r").step("only", ComponentRef::new("c.only"));
        registry.create(&wf, &Value::Null).unwrap().pplid
    }

    fn start(registry: &PipelineRegistry, running: &RunningRegistry) -> String {
        let pplid = create(registry);
        let prepared = registry.update_status(&pplid, PipelineStatus::Prepared).unwrap();
        running.mark_running(&pplid).unwrap();
        registry.start_run(&pplid, prepared.revision).unwrap();
        pplid
    }

    #[test]
    fn test_mark_running_is_exclusive() {
        let (_, _, running) = fixture();
        running.mark_running("ppl-a").unwrap();

        let err = running.mark_running("ppl-a").unwrap_err();
        match err {
            EngineError::AlreadyRunning { pplid, marker } => {
                assert_eq!(pplid, "ppl-a");
                assert_eq!(marker, "test-host:1");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(running.list().unwrap().len(), 1);
    }

    #[test]
    fn test_exclusive_across_store_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("active.db");
        let first = RunningRegistry::with_marker(Arc::new(Store::open(&path).unwrap()), "host-a:1");
        let second = RunningRegistry::with_marker(Arc::new(Store::open(&path).unwrap()), "host-b:2");

        first.mark_running("ppl-shared").unwrap();
        let err = second.mark_running("ppl-shared").unwrap_err();
        assert!(matches!(
            err,
            EngineError::AlreadyRunning { ref marker, .. } if marker == "host-a:1"
        ));
    }

    #[test]
    fn test_racing_threads_on_separate_handles_have_one_winner() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("active.db");
        let gate = Arc::new(Barrier::new(2));

        let racers: Vec<_> = ["host-a:1", "host-b:2"]
            .into_iter()
            .map(|marker| {
                let running = RunningRegistry::with_marker(Arc::new(Store::open(&path).unwrap()), marker);
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    gate.wait();
                    running.mark_running("ppl-contended")
                })
            })
            .collect();
        let results: Vec<_> = racers.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(
            loser,
            EngineError::AlreadyRunning { marker, .. } if *marker == winners[0].marker
        ));

        let observer = RunningRegistry::new(Arc::new(Store::open(&path).unwrap()));
        assert_eq!(observer.list().unwrap().len(), 1);
    }

    #[test]
    fn test_heartbeat_and_stop() {
        let (_, _, running) = fixture();
        let err = running.heartbeat("ppl-a").unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let entry = running.mark_running("ppl-a").unwrap();
        let beat = running.heartbeat("ppl-a").unwrap();
        assert!(beat >= entry.heartbeat_at);
        assert_eq!(running.get("ppl-a").unwrap().unwrap().heartbeat_at, beat);

        assert!(running.mark_stopped("ppl-a").unwrap());
        assert!(!running.mark_stopped("ppl-a").unwrap());
        assert!(!running.is_running("ppl-a").unwrap());
    }

    #[test]
    fn test_reconcile_recovers_stale_running_pipeline() {
        let (store, registry, running) = fixture();
        let pplid = start(&registry, &running);

        let later = now_utc() + ChronoDuration::minutes(10);
        let report = running
            .reconcile_as_of(later, Duration::from_secs(60))
            .unwrap();

        assert_eq!(report.recovered, vec![pplid.clone()]);
        assert!(report.orphaned.is_empty());

        let record = registry.get(&pplid).unwrap();
        assert_eq!(record.status, PipelineStatus::Failed);
        assert!(running.get(&pplid).unwrap().is_none());

        let entries = PipelineLog::new(store).for_pipeline(&pplid).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Error);
        assert!(entries[0].message.starts_with("crash-recovered:"));
    }

    #[test]
    fn test_reconcile_keeps_fresh_entries() {
        let (_, registry, running) = fixture();
        let pplid = start(&registry, &running);

        let report = running.reconcile(Duration::from_secs(3600)).unwrap();
        assert!(report.is_empty());
        assert!(running.is_running(&pplid).unwrap());
        assert_eq!(registry.get(&pplid).unwrap().status, PipelineStatus::Running);
    }

    #[test]
    fn test_reconcile_drops_crash_window_entry_without_status_change() {
        let (_, registry, running) = fixture();
        let pplid = create(&registry);
        registry.update_status(&pplid, PipelineStatus::Prepared).unwrap();
        running.mark_running(&pplid).unwrap();
        running.mark_running("ppl-gone").unwrap();

        let later = now_utc() + ChronoDuration::minutes(10);
        let report = running
            .reconcile_as_of(later, Duration::from_secs(60))
            .unwrap();

        assert!(report.recovered.is_empty());
        assert_eq!(report.total(), 2);
        assert!(report.orphaned.contains(&pplid));
        assert_eq!(registry.get(&pplid).unwrap().status, PipelineStatus::Prepared);
        assert!(running.list().unwrap().is_empty());
    }

    #[test]
    fn test_process_marker_shape() {
        let marker = process_marker();
        let (host, pid) = marker.rsplit_once(':').unwrap();
        assert!(!host.is_empty());
        assert_eq!(pid, std::process::id().to_string());
    }
}
