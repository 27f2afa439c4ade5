//! Persistent pipeline log sink.
//!
//! Log entries are append-only rows in the store, queryable by pipeline and
//! time range. Every append is mirrored to `tracing` at the matching level so
//! operators see engine activity without querying the store.

use rusqlite::{params, Connection, Row};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::core::{LogEntry, LogLevel};
use crate::errors::{EngineError, EngineResult};
use crate::registry;
use crate::store::Store;
use crate::utils::{from_millis, now_utc, to_millis, Timestamp};

/// Handle on the log table of one store.
#[derive(Debug, Clone)]
pub struct PipelineLog {
    store: Arc<Store>,
}

impl PipelineLog {
    /// Creates a log sink over a store.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Appends an entry stamped with the current time.
    ///
    /// # Errors
    ///
    /// `NotFound` if no pipeline `pplid` exists in this store.
    pub fn append(
        &self,
        pplid: &str,
        level: LogLevel,
        message: impl Into<String>,
    ) -> EngineResult<LogEntry> {
        let message = message.into();
        let entry = self.store.write(|conn| {
            if !registry::exists(conn, pplid)? {
                return Err(EngineError::not_found(pplid));
            }
            insert(conn, pplid, level, &message, now_utc())
        })?;
        mirror(&entry);
        Ok(entry)
    }

    /// Returns every entry for a pipeline in append order.
    pub fn for_pipeline(&self, pplid: &str) -> EngineResult<Vec<LogEntry>> {
        self.store.read(|conn| for_pipeline(conn, pplid))
    }

    /// Returns the entries for a pipeline written in `[from, to)`.
    pub fn between(&self, pplid: &str, from: Timestamp, to: Timestamp) -> EngineResult<Vec<LogEntry>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, pplid, ts_ms, level, message FROM logs \
                 WHERE pplid = ?1 AND ts_ms >= ?2 AND ts_ms < ?3 ORDER BY seq ASC",
            )?;
            let rows = stmt
                .query_map(params![pplid, to_millis(&from), to_millis(&to)], raw_entry)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(decode).collect()
        })
    }
}

type RawEntry = (i64, String, i64, String, String);

fn raw_entry(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode((seq, pplid, ts_ms, level, message): RawEntry) -> EngineResult<LogEntry> {
    let level = level
        .parse::<LogLevel>()
        .map_err(|e| EngineError::corrupt(format!("log {seq}: {e}")))?;
    Ok(LogEntry {
        seq,
        pplid,
        timestamp: from_millis(ts_ms)?,
        level,
        message,
    })
}

/// Appends an entry inside an open transaction.
///
/// The caller mirrors the entry once the transaction has committed.
pub(crate) fn insert(
    conn: &Connection,
    pplid: &str,
    level: LogLevel,
    message: &str,
    timestamp: Timestamp,
) -> EngineResult<LogEntry> {
    conn.execute(
        "INSERT INTO logs(pplid, ts_ms, level, message) VALUES (?1, ?2, ?3, ?4)",
        params![pplid, to_millis(&timestamp), level.as_str(), message],
    )?;
    Ok(LogEntry {
        seq: conn.last_insert_rowid(),
        pplid: pplid.to_string(),
        timestamp,
        level,
        message: message.to_string(),
    })
}

pub(crate) fn for_pipeline(conn: &Connection, pplid: &str) -> EngineResult<Vec<LogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT seq, pplid, ts_ms, level, message FROM logs WHERE pplid = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map(params![pplid], raw_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(decode).collect()
}

/// Emits a persisted entry through `tracing`.
pub(crate) fn mirror(entry: &LogEntry) {
    let pplid = entry.pplid.as_str();
    let seq = entry.seq;
    match entry.level {
        LogLevel::Debug => debug!(pplid, seq, "{}", entry.message),
        LogLevel::Info => info!(pplid, seq, "{}", entry.message),
        LogLevel::Warn => warn!(pplid, seq, "{}", entry.message),
        LogLevel::Error => error!(pplid, seq, "{}", entry.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ComponentRef, Workflow};
    use crate::registry::PipelineRegistry;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn sink() -> (PipelineLog, String, String) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = PipelineRegistry::new(Arc::clone(&store));
        let workflow = Workflow::new("flows.log").step("only", ComponentRef::new("c.only"));
        let a = registry.create(&workflow, &Value::Null).unwrap().pplid;
        let b = registry.create(&workflow, &Value::Null).unwrap().pplid;
        (PipelineLog::new(store), a, b)
    }

    #[test]
    fn test_append_and_read_in_order() {
        let (log, a, b) = sink();
        log.append(&a, LogLevel::Info, "started").unwrap();
        log.append(&b, LogLevel::Info, "other").unwrap();
        log.append(&a, LogLevel::Error, "boom").unwrap();

        let entries = log.for_pipeline(&a).unwrap();
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["started", "boom"]);
        assert!(entries[0].seq < entries[1].seq);
        assert_eq!(entries[1].level, LogLevel::Error);
    }

    #[test]
    fn test_between_is_half_open() {
        let (log, a, _) = sink();
        let entry = log.append(&a, LogLevel::Warn, "slow step").unwrap();
        let ts = entry.timestamp;

        let hit = log
            .between(&a, ts, ts + Duration::milliseconds(1))
            .unwrap();
        assert_eq!(hit, vec![entry]);

        let miss = log
            .between(&a, ts - Duration::seconds(10), ts)
            .unwrap();
        assert!(miss.is_empty());
    }

    #[test]
    fn test_unknown_pipeline_has_no_entries() {
        let (log, _, _) = sink();
        assert!(log.for_pipeline("ppl-none").unwrap().is_empty());
    }

    #[test]
    fn test_append_to_unknown_pipeline_writes_nothing() {
        let (log, a, _) = sink();
        let err = log.append("ppl-none", LogLevel::Info, "orphan").unwrap_err();
        assert!(matches!(err, EngineError::NotFound { ref pplid, .. } if pplid == "ppl-none"));
        assert!(log.for_pipeline("ppl-none").unwrap().is_empty());
        assert!(log.for_pipeline(&a).unwrap().is_empty());
    }
}
