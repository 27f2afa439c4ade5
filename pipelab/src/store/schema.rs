//! SQLite schema shared by the active and archive stores.

/// Current schema version written into `meta`.
pub const SCHEMA_VERSION: &str = "v1";

/// Tables and indexes, created idempotently on open.
///
/// Rollback-journal mode is required: the archive move commits across two
/// attached database files, which SQLite only makes atomic outside WAL.
pub const SCHEMA: &str = r#"
PRAGMA journal_mode=DELETE;
PRAGMA synchronous=FULL;

CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pipelines (
  pplid TEXT PRIMARY KEY,
  content_hash TEXT NOT NULL,
  workflow_loc TEXT NOT NULL,
  workflow_json TEXT NOT NULL,
  args_json TEXT NOT NULL,
  status TEXT NOT NULL,
  revision INTEGER NOT NULL,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL,
  completed_at_ms INTEGER
);

CREATE TABLE IF NOT EXISTS edges (
  parent TEXT NOT NULL,
  child TEXT NOT NULL,
  kind TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  PRIMARY KEY (parent, child, kind)
);

CREATE TABLE IF NOT EXISTS running (
  pplid TEXT PRIMARY KEY,
  marker TEXT NOT NULL,
  started_at_ms INTEGER NOT NULL,
  heartbeat_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS logs (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  pplid TEXT NOT NULL,
  ts_ms INTEGER NOT NULL,
  level TEXT NOT NULL,
  message TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transfers (
  transfer_id TEXT NOT NULL,
  pplid TEXT NOT NULL,
  origin_lab_id TEXT,
  component_map_json TEXT NOT NULL,
  path_map_json TEXT NOT NULL DEFAULT '{}',
  imported_at_ms INTEGER NOT NULL,
  PRIMARY KEY (transfer_id, pplid)
);

CREATE INDEX IF NOT EXISTS idx_pipelines_hash ON pipelines(content_hash);
CREATE INDEX IF NOT EXISTS idx_pipelines_status ON pipelines(status);
CREATE INDEX IF NOT EXISTS idx_pipelines_created ON pipelines(created_at_ms);
CREATE INDEX IF NOT EXISTS idx_edges_child ON edges(child);
CREATE INDEX IF NOT EXISTS idx_logs_pplid_ts ON logs(pplid, ts_ms);
CREATE INDEX IF NOT EXISTS idx_transfers_pplid ON transfers(pplid);
"#;

/// Column list used by every pipeline SELECT, in `PipelineRow` order.
pub const PIPELINE_COLUMNS: &str = "pplid, content_hash, workflow_json, args_json, status, \
     revision, created_at_ms, updated_at_ms, completed_at_ms";
