//! Transfer identifiers and the component and path remapping applied to
//! imported pipelines.

use rand::Rng;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::EngineResult;
use crate::utils::{from_millis, to_millis, Timestamp};

/// Provenance row written for each pipeline brought in by an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Identifier of the bundle the pipeline arrived in.
    pub transfer_id: String,
    /// The pipeline's identifier in this store.
    pub pplid: String,
    /// Lab that produced the bundle.
    pub origin_lab_id: Option<String>,
    /// Component locations rewritten for this environment.
    pub component_map: BTreeMap<String, String>,
    /// Path prefixes rewritten for this environment.
    #[serde(default)]
    pub path_map: BTreeMap<String, String>,
    /// When the import happened.
    pub imported_at: Timestamp,
}

/// Argument keys whose string values are treated as filesystem paths.
pub const PATH_ARG_KEYS: [&str; 3] = ["src", "path", "data_path"];

/// Runtime remapping applied to a transferred pipeline's component
/// locations and path arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferContext {
    component_map: BTreeMap<String, String>,
    path_map: BTreeMap<String, String>,
}

impl TransferContext {
    /// Creates a context from a location map.
    #[must_use]
    pub fn new(component_map: BTreeMap<String, String>) -> Self {
        Self {
            component_map,
            path_map: BTreeMap::new(),
        }
    }

    /// Sets the path prefix map.
    #[must_use]
    pub fn with_path_map(mut self, path_map: BTreeMap<String, String>) -> Self {
        self.path_map = path_map
            .into_iter()
            .map(|(from, to)| (to_forward_slashes(&from), to_forward_slashes(&to)))
            .collect();
        self
    }

    /// Returns the location to resolve in place of `loc`.
    ///
    /// Unmapped locations resolve to themselves.
    #[must_use]
    pub fn map_component<'a>(&'a self, loc: &'a str) -> &'a str {
        self.component_map.get(loc).map_or(loc, String::as_str)
    }

    /// Rewrites the longest mapped prefix of `path`.
    ///
    /// Separators are normalized to `/` first; unmapped paths come back
    /// normalized but otherwise unchanged.
    #[must_use]
    pub fn map_path(&self, path: &str) -> String {
        let path = to_forward_slashes(path);
        self.path_map
            .iter()
            .filter(|(from, _)| path.starts_with(from.as_str()))
            .max_by_key(|(from, _)| from.len())
            .map_or_else(
                || path.clone(),
                |(from, to)| format!("{to}{}", &path[from.len()..]),
            )
    }

    /// Rewrites every path-valued argument in `args`, at any depth.
    #[must_use]
    pub fn map_args(&self, args: Value) -> Value {
        if self.path_map.is_empty() {
            return args;
        }
        match args {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| {
                        let value = match value {
                            Value::String(path) if PATH_ARG_KEYS.contains(&key.as_str()) => {
                                Value::String(self.map_path(&path))
                            }
                            other => self.map_args(other),
                        };
                        (key, value)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.map_args(v)).collect()),
            other => other,
        }
    }

    /// Returns true if nothing is remapped.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.component_map.is_empty() && self.path_map.is_empty()
    }
}

fn to_forward_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// Allocates a transfer identifier: `t_YYYYmmdd_HHMMSS_<6 hex>`.
#[must_use]
pub fn generate_transfer_id(now: &Timestamp) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    format!("t_{}_{suffix:06x}", now.format("%Y%m%d_%H%M%S"))
}

pub(crate) fn insert(conn: &Connection, record: &TransferRecord) -> EngineResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO transfers(transfer_id, pplid, origin_lab_id, component_map_json, \
         path_map_json, imported_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.transfer_id,
            record.pplid,
            record.origin_lab_id,
            serde_json::to_string(&record.component_map)?,
            serde_json::to_string(&record.path_map)?,
            to_millis(&record.imported_at),
        ],
    )?;
    Ok(())
}

/// Transfer rows for a pipeline, oldest import first.
pub(crate) fn for_pipeline(conn: &Connection, pplid: &str) -> EngineResult<Vec<TransferRecord>> {
    let mut stmt = conn.prepare(
        "SELECT transfer_id, pplid, origin_lab_id, component_map_json, path_map_json, \
         imported_at_ms FROM transfers WHERE pplid = ?1 ORDER BY imported_at_ms ASC, transfer_id ASC",
    )?;
    let rows = stmt
        .query_map(params![pplid], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, i64>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(transfer_id, pplid, origin_lab_id, map_json, path_json, imported_at_ms)| {
            Ok(TransferRecord {
                transfer_id,
                pplid,
                origin_lab_id,
                component_map: serde_json::from_str(&map_json)?,
                path_map: serde_json::from_str(&path_json)?,
                imported_at: from_millis(imported_at_ms)?,
            })
        })
        .collect()
}

/// Builds the remapping for a pipeline; later imports override earlier ones.
pub(crate) fn context_for(conn: &Connection, pplid: &str) -> EngineResult<TransferContext> {
    let mut component_map = BTreeMap::new();
    let mut path_map = BTreeMap::new();
    for record in for_pipeline(conn, pplid)? {
        component_map.extend(record.component_map);
        path_map.extend(record.path_map);
    }
    Ok(TransferContext::new(component_map).with_path_map(path_map))
}
