//! Archival and transfer manager.
//!
//! Archiving physically moves a terminal pipeline (record, edges, logs,
//! transfer rows) from the active store to the archive store. The archive
//! file is attached to the active connection for the move, so the copy and
//! the delete commit together or not at all.
//!
//! Export and import move pipelines between environments as a [`Bundle`].

mod bundle;
pub(crate) mod transfer;

pub use bundle::{Bundle, BundleManifest, BundledPipeline, BUNDLE_FORMAT_VERSION};
pub use transfer::{generate_transfer_id, TransferContext, TransferRecord, PATH_ARG_KEYS};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::{Edge, LogEntry, PipelineRecord, PipelineStatus};
use crate::errors::{EngineError, EngineResult};
use crate::graph;
use crate::identity;
use crate::logs;
use crate::registry::{self, PipelineFilter};
use crate::running;
use crate::store::{Store, ARCHIVE_ALIAS};
use crate::utils::{now_utc, to_millis, Timestamp};

/// Whether an export leaves the source rows in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportMode {
    /// The source keeps its pipelines.
    #[default]
    Copy,
    /// Exported pipelines are deleted from the source once the bundle is built.
    Move,
}

/// Options for [`ArchiveManager::export`].
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Widen the export to every ancestor of the requested pipelines.
    pub include_dependencies: bool,
    /// Component locations the destination should resolve instead.
    pub component_map: BTreeMap<String, String>,
    /// Path prefixes the destination should rewrite in path arguments.
    pub path_map: BTreeMap<String, String>,
    /// Copy or move.
    pub mode: ExportMode,
}

impl ExportOptions {
    /// Creates options exporting exactly the requested pipelines.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Includes the dependency closure.
    #[must_use]
    pub fn with_dependencies(mut self) -> Self {
        self.include_dependencies = true;
        self
    }

    /// Adds a component location mapping.
    #[must_use]
    pub fn map_component(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.component_map.insert(from.into(), to.into());
        self
    }

    /// Adds a path prefix mapping.
    #[must_use]
    pub fn map_path(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.path_map.insert(from.into(), to.into());
        self
    }

    /// Deletes the exported pipelines from this lab after bundling.
    #[must_use]
    pub fn with_move(mut self) -> Self {
        self.mode = ExportMode::Move;
        self
    }
}

/// Result of an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Transfer the pipelines arrived in.
    pub transfer_id: String,
    /// Source identifier to destination identifier, for every imported pipeline.
    pub id_map: BTreeMap<String, String>,
    /// Edges written.
    pub edges_imported: usize,
    /// Edges dropped because an endpoint was not in the bundle.
    pub edges_skipped: usize,
}

impl ImportReport {
    /// Returns the destination identifier of a bundled pipeline.
    #[must_use]
    pub fn pplid_for(&self, source: &str) -> Option<&str> {
        self.id_map.get(source).map(String::as_str)
    }

    /// Returns the pipelines that were given a fresh identifier.
    pub fn remapped(&self) -> impl Iterator<Item = (&str, &str)> {
        self.id_map
            .iter()
            .filter(|(from, to)| from != to)
            .map(|(from, to)| (from.as_str(), to.as_str()))
    }
}

/// Moves pipelines between the active store, the archive store and bundles.
#[derive(Debug, Clone)]
pub struct ArchiveManager {
    active: Arc<Store>,
    archive: Arc<Store>,
    lab_id: Option<String>,
}

const PIPELINE_COPY_COLUMNS: &str = "pplid, content_hash, workflow_loc, workflow_json, args_json, \
     status, revision, created_at_ms, updated_at_ms, completed_at_ms";

impl ArchiveManager {
    /// Creates a manager over an active and an archive store.
    #[must_use]
    pub fn new(active: Arc<Store>, archive: Arc<Store>) -> Self {
        Self {
            active,
            archive,
            lab_id: None,
        }
    }

    /// Sets the lab identifier written into exported manifests.
    #[must_use]
    pub fn with_lab_id(mut self, lab_id: impl Into<String>) -> Self {
        self.lab_id = Some(lab_id.into());
        self
    }

    /// Moves a `Completed` or `Failed` pipeline into the archive store.
    ///
    /// Both stores must be files.
    pub fn archive(&self, pplid: &str) -> EngineResult<PipelineRecord> {
        let now = now_utc();
        let archived = self.active.write_attached(&self.archive, |conn| {
            let record = registry::load_required(conn, pplid)?;
            if !record.status.is_archivable() {
                return Err(EngineError::invalid_transition_because(
                    pplid,
                    record.status,
                    PipelineStatus::Archived,
                    "only completed or failed pipelines can be archived",
                ));
            }
            if let Some(entry) = running::load(conn, pplid)? {
                return Err(EngineError::AlreadyRunning {
                    pplid: pplid.to_string(),
                    marker: entry.marker,
                });
            }

            move_rows(conn, pplid, now)?;

            Ok(PipelineRecord {
                status: PipelineStatus::Archived,
                revision: record.revision + 1,
                updated_at: now,
                ..record
            })
        })?;

        info!(pplid, revision = archived.revision, "Archived pipeline");
        Ok(archived)
    }

    /// Gets an archived record.
    ///
    /// # Errors
    ///
    /// `IntegrityError` if the stored hash no longer matches the record.
    pub fn get_archived(&self, pplid: &str) -> EngineResult<PipelineRecord> {
        let record = self.archive.read(|conn| {
            registry::load(conn, pplid)?.ok_or_else(|| EngineError::not_found_in(pplid, "archive"))
        })?;
        verify_integrity(&record)?;
        Ok(record)
    }

    /// Lists archived records matching a filter.
    ///
    /// Fails with `IntegrityError` on the first record whose hash does not
    /// match.
    pub fn list_archived(&self, filter: &PipelineFilter) -> EngineResult<Vec<PipelineRecord>> {
        let records = self.archive.read(|conn| registry::list(conn, filter))?;
        records.iter().try_for_each(verify_integrity)?;
        Ok(records)
    }

    /// Returns the log of an archived pipeline.
    pub fn archived_logs(&self, pplid: &str) -> EngineResult<Vec<LogEntry>> {
        self.archive.read(|conn| logs::for_pipeline(conn, pplid))
    }

    /// Returns the edges of an archived pipeline.
    pub fn archived_edges(&self, pplid: &str) -> EngineResult<Vec<Edge>> {
        self.archive.read(|conn| graph::edges_touching(conn, pplid))
    }

    /// Serializes pipelines into a bundle.
    ///
    /// Records come from the active store, falling back to the archive.
    /// Running pipelines are refused. In [`ExportMode::Move`] the exported
    /// rows are then deleted from whichever store held them, in one
    /// transaction; if any of them changed since it was read, nothing is
    /// deleted and the export fails.
    pub fn export(&self, pplids: &[String], options: &ExportOptions) -> EngineResult<Bundle> {
        let ids = if options.include_dependencies {
            self.closure_across_stores(pplids)?
        } else {
            dedup(pplids)
        };

        let mut found = self.active.read(|conn| collect(conn, &ids, true))?;
        let held_active: HashSet<String> = found.keys().cloned().collect();
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !found.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            found.extend(self.archive.read(|conn| collect(conn, &missing, false))?);
        }

        let members: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut pipelines = Vec::with_capacity(ids.len());
        let mut edges = Vec::new();
        let mut seen_edges = HashSet::new();
        for id in &ids {
            let Some((pipeline, touching)) = found.remove(id) else {
                return Err(EngineError::not_found(id.as_str()));
            };
            for edge in touching {
                let key = (edge.parent.clone(), edge.child.clone(), edge.kind.clone());
                if members.contains(edge.parent.as_str())
                    && members.contains(edge.child.as_str())
                    && seen_edges.insert(key)
                {
                    edges.push(edge);
                }
            }
            pipelines.push(pipeline);
        }
        let ids = parents_first(&ids, &edges);
        pipelines.sort_by_key(|p| ids.iter().position(|id| *id == p.record.pplid));

        let created_at = now_utc();
        let manifest = BundleManifest {
            format_version: BUNDLE_FORMAT_VERSION,
            transfer_id: generate_transfer_id(&created_at),
            origin_lab_id: self.lab_id.clone(),
            created_at,
            pplids: ids,
            component_map: options.component_map.clone(),
            path_map: options.path_map.clone(),
        };
        let bundle = Bundle {
            manifest,
            pipelines,
            edges,
        };
        if options.mode == ExportMode::Move {
            self.remove_exported(&bundle, &held_active)?;
        }
        info!(
            transfer_id = %bundle.manifest.transfer_id,
            pipelines = bundle.pipelines.len(),
            edges = bundle.edges.len(),
            mode = ?options.mode,
            "Exported bundle"
        );
        Ok(bundle)
    }

    /// Imports a bundle into the active store.
    ///
    /// Everything is validated before the store is touched; the import
    /// itself is one transaction. Identifiers already used by the active or
    /// archive store are replaced with fresh ones and edges are rewritten
    /// to match. Archived pipelines are restored to their terminal status.
    pub fn import(&self, bundle: &Bundle) -> EngineResult<ImportReport> {
        validate_bundle(bundle)?;

        let taken_in_archive: HashSet<String> = self.archive.read(|conn| {
            let mut taken = HashSet::new();
            for pipeline in &bundle.pipelines {
                if registry::exists(conn, &pipeline.record.pplid)? {
                    taken.insert(pipeline.record.pplid.clone());
                }
            }
            Ok(taken)
        })?;

        let manifest = &bundle.manifest;
        let imported_at = now_utc();
        let report = self.active.write(|conn| {
            let mut id_map = BTreeMap::new();
            for pipeline in &bundle.pipelines {
                let source = &pipeline.record.pplid;
                let dest = if taken_in_archive.contains(source) || registry::exists(conn, source)? {
                    identity::generate_pplid()
                } else {
                    source.clone()
                };

                let mut record = pipeline.record.clone();
                record.pplid.clone_from(&dest);
                if record.status == PipelineStatus::Archived {
                    record.status = if record.completed_at.is_some() {
                        PipelineStatus::Completed
                    } else {
                        PipelineStatus::Failed
                    };
                }
                registry::insert(conn, &record)?;

                for entry in &pipeline.logs {
                    logs::insert(conn, &dest, entry.level, &entry.message, entry.timestamp)?;
                }
                transfer::insert(
                    conn,
                    &TransferRecord {
                        transfer_id: manifest.transfer_id.clone(),
                        pplid: dest.clone(),
                        origin_lab_id: manifest.origin_lab_id.clone(),
                        component_map: manifest.component_map.clone(),
                        path_map: manifest.path_map.clone(),
                        imported_at,
                    },
                )?;
                id_map.insert(source.clone(), dest);
            }

            let mut edges_imported = 0;
            let mut edges_skipped = 0;
            for edge in &bundle.edges {
                let (Some(parent), Some(child)) = (id_map.get(&edge.parent), id_map.get(&edge.child))
                else {
                    warn!(
                        parent = %edge.parent,
                        child = %edge.child,
                        "Skipping bundled edge with an endpoint outside the bundle"
                    );
                    edges_skipped += 1;
                    continue;
                };
                let rewritten = Edge {
                    parent: parent.clone(),
                    child: child.clone(),
                    kind: edge.kind.clone(),
                    created_at: edge.created_at,
                };
                if graph::insert_edge(conn, &rewritten)? {
                    edges_imported += 1;
                }
            }

            Ok(ImportReport {
                transfer_id: manifest.transfer_id.clone(),
                id_map,
                edges_imported,
                edges_skipped,
            })
        })?;

        for (from, to) in report.remapped() {
            info!(from, to, "Remapped colliding pipeline identifier");
        }
        info!(
            transfer_id = %report.transfer_id,
            pipelines = report.id_map.len(),
            edges = report.edges_imported,
            "Imported bundle"
        );
        Ok(report)
    }

    fn remove_exported(&self, bundle: &Bundle, held_active: &HashSet<String>) -> EngineResult<()> {
        let (active, archived): (Vec<&PipelineRecord>, Vec<&PipelineRecord>) = bundle
            .pipelines
            .iter()
            .map(|p| &p.record)
            .partition(|r| held_active.contains(&r.pplid));

        if archived.is_empty() {
            self.active.write(|conn| delete_exported(conn, "main", &active))?;
        } else {
            self.active.write_attached(&self.archive, |conn| {
                delete_exported(conn, "main", &active)?;
                delete_exported(conn, ARCHIVE_ALIAS, &archived)
            })?;
        }
        info!(
            transfer_id = %bundle.manifest.transfer_id,
            active = active.len(),
            archived = archived.len(),
            "Removed moved pipelines from this lab"
        );
        Ok(())
    }

    fn closure_across_stores(&self, pplids: &[String]) -> EngineResult<Vec<String>> {
        let mut ids = dedup(pplids);
        loop {
            let widened = self
                .active
                .read(|conn| graph::dependency_closure(conn, &ids))?;
            let widened = self
                .archive
                .read(|conn| graph::dependency_closure(conn, &widened))?;
            if widened.len() == ids.len() {
                return Ok(widened);
            }
            ids = widened;
        }
    }
}

/// Copies one pipeline's rows into the attached archive and deletes them.
fn move_rows(conn: &Connection, pplid: &str, now: Timestamp) -> EngineResult<()> {
    let a = ARCHIVE_ALIAS;
    conn.execute(
        &format!(
            "INSERT INTO {a}.pipelines({PIPELINE_COPY_COLUMNS}) \
             SELECT {PIPELINE_COPY_COLUMNS} FROM main.pipelines WHERE pplid = ?1"
        ),
        params![pplid],
    )?;
    conn.execute(
        &format!(
            "UPDATE {a}.pipelines SET status = ?1, revision = revision + 1, updated_at_ms = ?2 \
             WHERE pplid = ?3"
        ),
        params![PipelineStatus::Archived.as_str(), to_millis(&now), pplid],
    )?;
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {a}.edges(parent, child, kind, created_at_ms) \
             SELECT parent, child, kind, created_at_ms FROM main.edges \
             WHERE parent = ?1 OR child = ?1"
        ),
        params![pplid],
    )?;
    conn.execute(
        &format!(
            "INSERT INTO {a}.logs(pplid, ts_ms, level, message) \
             SELECT pplid, ts_ms, level, message FROM main.logs WHERE pplid = ?1 ORDER BY seq"
        ),
        params![pplid],
    )?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {a}.transfers(transfer_id, pplid, origin_lab_id, \
             component_map_json, path_map_json, imported_at_ms) \
             SELECT transfer_id, pplid, origin_lab_id, component_map_json, path_map_json, \
             imported_at_ms FROM main.transfers WHERE pplid = ?1"
        ),
        params![pplid],
    )?;

    conn.execute("DELETE FROM main.edges WHERE parent = ?1 OR child = ?1", params![pplid])?;
    conn.execute("DELETE FROM main.logs WHERE pplid = ?1", params![pplid])?;
    conn.execute("DELETE FROM main.transfers WHERE pplid = ?1", params![pplid])?;
    conn.execute("DELETE FROM main.pipelines WHERE pplid = ?1", params![pplid])?;
    Ok(())
}

/// Deletes exported pipelines from `schema`, refusing any that changed since
/// they were bundled.
fn delete_exported(conn: &Connection, schema: &str, records: &[&PipelineRecord]) -> EngineResult<()> {
    for record in records {
        let pplid = record.pplid.as_str();
        let revision: Option<i64> = conn
            .query_row(
                &format!("SELECT revision FROM {schema}.pipelines WHERE pplid = ?1"),
                params![pplid],
                |r| r.get(0),
            )
            .optional()?;
        match revision {
            None => return Err(EngineError::not_found(pplid)),
            Some(actual) if actual != record.revision => {
                return Err(EngineError::ConcurrentModification {
                    pplid: pplid.to_string(),
                    expected: record.revision,
                    actual,
                });
            }
            Some(_) => {}
        }
        if schema == "main" {
            if let Some(entry) = running::load(conn, pplid)? {
                return Err(EngineError::AlreadyRunning {
                    pplid: pplid.to_string(),
                    marker: entry.marker,
                });
            }
        }

        conn.execute(
            &format!("DELETE FROM {schema}.edges WHERE parent = ?1 OR child = ?1"),
            params![pplid],
        )?;
        conn.execute(&format!("DELETE FROM {schema}.logs WHERE pplid = ?1"), params![pplid])?;
        conn.execute(&format!("DELETE FROM {schema}.transfers WHERE pplid = ?1"), params![pplid])?;
        conn.execute(&format!("DELETE FROM {schema}.pipelines WHERE pplid = ?1"), params![pplid])?;
    }
    Ok(())
}

fn dedup(pplids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    pplids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// Orders `ids` so every parent precedes its children, keeping the
/// requested order among unrelated pipelines.
fn parents_first(ids: &[String], edges: &[Edge]) -> Vec<String> {
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    let mut pending = vec![0usize; ids.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    let mut seen = HashSet::new();
    for edge in edges {
        if let (Some(&p), Some(&c)) = (index.get(edge.parent.as_str()), index.get(edge.child.as_str())) {
            if seen.insert((p, c)) {
                pending[c] += 1;
                children[p].push(c);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..ids.len()).filter(|&i| pending[i] == 0).collect();
    let mut ordered = Vec::with_capacity(ids.len());
    while let Some(next) = ready.pop_first() {
        ordered.push(ids[next].clone());
        for &child in &children[next] {
            pending[child] -= 1;
            if pending[child] == 0 {
                ready.insert(child);
            }
        }
    }
    if ordered.len() < ids.len() {
        let placed: HashSet<&str> = ordered.iter().map(String::as_str).collect();
        let rest: Vec<String> = ids.iter().filter(|id| !placed.contains(id.as_str())).cloned().collect();
        ordered.extend(rest);
    }
    ordered
}

type Collected = HashMap<String, (BundledPipeline, Vec<Edge>)>;

fn collect(conn: &Connection, ids: &[String], refuse_running: bool) -> EngineResult<Collected> {
    let mut found = HashMap::new();
    for id in ids {
        let Some(record) = registry::load(conn, id)? else {
            continue;
        };
        if refuse_running && record.status == PipelineStatus::Running {
            let marker = running::load(conn, id)?
                .map_or_else(|| "unknown".to_string(), |e| e.marker);
            return Err(EngineError::AlreadyRunning {
                pplid: id.clone(),
                marker,
            });
        }
        verify_integrity(&record)?;
        let entries = logs::for_pipeline(conn, id)?;
        let edges = graph::edges_touching(conn, id)?;
        found.insert(
            id.clone(),
            (
                BundledPipeline {
                    record,
                    logs: entries,
                },
                edges,
            ),
        );
    }
    Ok(found)
}

fn validate_bundle(bundle: &Bundle) -> EngineResult<()> {
    let manifest = &bundle.manifest;
    if manifest.format_version != BUNDLE_FORMAT_VERSION {
        return Err(EngineError::configuration(format!(
            "unsupported bundle format version {} (expected {BUNDLE_FORMAT_VERSION})",
            manifest.format_version
        )));
    }

    let mut seen = HashSet::new();
    for pipeline in &bundle.pipelines {
        let record = &pipeline.record;
        if !identity::is_valid_pplid(&record.pplid) {
            return Err(EngineError::configuration(format!(
                "bundle {} holds a malformed pipeline identifier '{}'",
                manifest.transfer_id, record.pplid
            )));
        }
        if !seen.insert(record.pplid.as_str()) {
            return Err(EngineError::configuration_for(
                record.pplid.as_str(),
                format!("bundle {} holds this pipeline twice", manifest.transfer_id),
            ));
        }
        if record.status == PipelineStatus::Running {
            return Err(EngineError::configuration_for(
                record.pplid.as_str(),
                "bundled pipeline is marked running",
            ));
        }
        verify_integrity(record)?;
    }
    Ok(())
}

fn verify_integrity(record: &PipelineRecord) -> EngineResult<()> {
    if let Err(actual) =
        identity::verify_key(&record.content_hash, &record.workflow.loc, &record.args_snapshot)?
    {
        return Err(EngineError::Integrity {
            pplid: record.pplid.clone(),
            expected: record.content_hash.clone(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod archive_tests;
