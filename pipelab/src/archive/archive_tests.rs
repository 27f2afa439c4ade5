use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

use super::*;
use crate::components::ComponentRegistry;
use crate::core::{Direction, LogLevel};
use crate::graph::DependencyGraph;
use crate::lifecycle::LifecycleController;
use crate::logs::PipelineLog;
use crate::registry::PipelineRegistry;
use crate::testing::{
    single_step_workflow, train_eval_workflow, FailingComponent, RecordingComponent, EVAL_LOC,
    TRAIN_LOC,
};

struct Lab {
    active: Arc<Store>,
    registry: PipelineRegistry,
    graph: DependencyGraph,
    logs: PipelineLog,
    controller: LifecycleController,
    manager: ArchiveManager,
}

fn lab(dir: &Path, name: &str) -> Lab {
    let active = Arc::new(Store::open(dir.join(format!("{name}.db"))).unwrap());
    let archive = Arc::new(Store::open(dir.join(format!("{name}-archive.db"))).unwrap());
    let components = ComponentRegistry::new()
        .with(TRAIN_LOC, RecordingComponent::returning(json!({"loss": 0.1})))
        .with(EVAL_LOC, RecordingComponent::returning(json!({"accuracy": 0.9})));
    Lab {
        registry: PipelineRegistry::new(Arc::clone(&active)),
        graph: DependencyGraph::new(Arc::clone(&active)),
        logs: PipelineLog::new(Arc::clone(&active)),
        controller: LifecycleController::new(Arc::clone(&active), Arc::new(components)),
        manager: ArchiveManager::new(Arc::clone(&active), archive).with_lab_id(name),
        active,
    }
}

async fn completed(lab: &Lab, lr: f64) -> PipelineRecord {
    let outcome = lab
        .controller
        .execute(&train_eval_workflow(), &json!({"train": {"lr": lr}}))
        .await
        .unwrap();
    assert!(outcome.is_success());
    lab.registry.get(&outcome.pplid).unwrap()
}

#[tokio::test]
async fn test_archive_moves_record_edges_and_logs() {
    let dir = TempDir::new().unwrap();
    let lab = lab(dir.path(), "lab_a");
    let parent = completed(&lab, 0.1).await;
    let child = completed(&lab, 0.2).await;
    lab.graph.add_edge(&parent.pplid, &child.pplid, "derived").unwrap();
    lab.logs
        .append(&parent.pplid, LogLevel::Info, "trained")
        .unwrap();

    let archived = lab.manager.archive(&parent.pplid).unwrap();
    assert_eq!(archived.status, PipelineStatus::Archived);
    assert_eq!(archived.revision, parent.revision + 1);
    assert_eq!(archived.completed_at, parent.completed_at);

    assert!(!lab.registry.contains(&parent.pplid).unwrap());
    assert_eq!(lab.manager.get_archived(&parent.pplid).unwrap(), archived);
    assert!(lab.graph.edges_of(&child.pplid, Direction::Incoming).unwrap().is_empty());
    assert!(lab.logs.for_pipeline(&parent.pplid).unwrap().is_empty());

    let edges = lab.manager.archived_edges(&parent.pplid).unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].child, child.pplid);
    let entries = lab.manager.archived_logs(&parent.pplid).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].message.starts_with("completed 2 step(s)"));
    assert_eq!(entries[1].message, "trained");

    let listed = lab
        .manager
        .list_archived(&PipelineFilter::new().with_status(PipelineStatus::Archived))
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_archive_rejects_non_terminal_pipeline() {
    let dir = TempDir::new().unwrap();
    let lab = lab(dir.path(), "lab_a");
    let record = lab.registry.create(&train_eval_workflow(), &json!({})).unwrap();

    let err = lab.manager.archive(&record.pplid).unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    assert_eq!(lab.registry.get(&record.pplid).unwrap(), record);
    assert!(matches!(
        lab.manager.get_archived(&record.pplid),
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_archive_requires_file_backed_stores() {
    let active = Arc::new(Store::open_in_memory().unwrap());
    let archive = Arc::new(Store::open_in_memory().unwrap());
    let registry = PipelineRegistry::new(Arc::clone(&active));
    let controller = LifecycleController::new(
        Arc::clone(&active),
        Arc::new(ComponentRegistry::new().with("util.broken", FailingComponent::new("boom"))),
    );
    let manager = ArchiveManager::new(active, archive);
    let record = controller
        .execute(&single_step_workflow("util.broken"), &json!({}))
        .await
        .unwrap();
    assert_eq!(record.status, PipelineStatus::Failed);
    let record = registry.get(&record.pplid).unwrap();

    let err = manager.archive(&record.pplid).unwrap_err();
    assert!(matches!(err, EngineError::Configuration { .. }));
    assert!(registry.contains(&record.pplid).unwrap());
}

#[tokio::test]
async fn test_export_import_between_labs() {
    let dir = TempDir::new().unwrap();
    let origin = lab(dir.path(), "origin");
    let dest = lab(dir.path(), "dest");
    let parent = completed(&origin, 0.1).await;
    let child = completed(&origin, 0.2).await;
    origin.graph.add_edge(&parent.pplid, &child.pplid, "derived").unwrap();
    origin
        .logs
        .append(&child.pplid, LogLevel::Info, "evaluated")
        .unwrap();

    let options = ExportOptions::new()
        .with_dependencies()
        .map_component("models.train", "remote.train");
    let bundle = origin.manager.export(&[child.pplid.clone()], &options).unwrap();
    assert_eq!(bundle.manifest.pplids, vec![parent.pplid.clone(), child.pplid.clone()]);
    assert_eq!(bundle.manifest.origin_lab_id.as_deref(), Some("origin"));
    assert_eq!(bundle.edges.len(), 1);

    let path = dir.path().join("bundles").join("transfer.json");
    bundle.write_to(&path).unwrap();
    let bundle = Bundle::read_from(&path).unwrap();

    let report = dest.manager.import(&bundle).unwrap();
    assert_eq!(report.remapped().count(), 0);
    assert_eq!(report.edges_imported, 1);
    assert_eq!(report.transfer_id, bundle.manifest.transfer_id);

    let imported = dest.registry.get(&child.pplid).unwrap();
    assert_eq!(imported, child);
    let entries = dest.logs.for_pipeline(&child.pplid).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].message, "evaluated");

    let store = dest.registry.store();
    let context = store
        .read(|conn| transfer::context_for(conn, &child.pplid))
        .unwrap();
    assert_eq!(context.map_component("models.train"), "remote.train");
    let rows = store
        .read(|conn| transfer::for_pipeline(conn, &parent.pplid))
        .unwrap();
    assert_eq!(rows[0].origin_lab_id.as_deref(), Some("origin"));
}

#[tokio::test]
async fn test_reimport_remaps_identifiers_and_rewrites_edges() {
    let dir = TempDir::new().unwrap();
    let lab = lab(dir.path(), "lab_a");
    let parent = completed(&lab, 0.1).await;
    let child = completed(&lab, 0.2).await;
    lab.graph.add_edge(&parent.pplid, &child.pplid, "derived").unwrap();

    let bundle = lab
        .manager
        .export(&[parent.pplid.clone(), child.pplid.clone()], &ExportOptions::new())
        .unwrap();
    let report = lab.manager.import(&bundle).unwrap();

    assert_eq!(report.remapped().count(), 2);
    let new_parent = report.pplid_for(&parent.pplid).unwrap();
    let new_child = report.pplid_for(&child.pplid).unwrap();
    assert_ne!(new_parent, parent.pplid);

    let copy = lab.registry.get(new_child).unwrap();
    assert_eq!(copy.content_hash, child.content_hash);
    let edges = lab.graph.edges_of(new_child, Direction::Incoming).unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].parent, new_parent);
    assert_eq!(lab.registry.find_by_hash(&child.content_hash).unwrap().len(), 2);
}

#[tokio::test]
async fn test_import_remaps_identifier_held_by_archive() {
    let dir = TempDir::new().unwrap();
    let lab = lab(dir.path(), "lab_a");
    let record = completed(&lab, 0.1).await;
    let bundle = lab
        .manager
        .export(&[record.pplid.clone()], &ExportOptions::new())
        .unwrap();
    lab.manager.archive(&record.pplid).unwrap();

    let report = lab.manager.import(&bundle).unwrap();
    assert_ne!(report.pplid_for(&record.pplid), Some(record.pplid.as_str()));
}

#[tokio::test]
async fn test_tampered_bundle_is_rejected_without_writes() {
    let dir = TempDir::new().unwrap();
    let origin = lab(dir.path(), "origin");
    let dest = lab(dir.path(), "dest");
    let first = completed(&origin, 0.1).await;
    let second = completed(&origin, 0.2).await;

    let mut bundle = origin
        .manager
        .export(&[first.pplid.clone(), second.pplid.clone()], &ExportOptions::new())
        .unwrap();
    bundle.pipelines[1].record.args_snapshot["train"]["lr"] = json!(0.9);

    let err = dest.manager.import(&bundle).unwrap_err();
    assert!(matches!(err, EngineError::Integrity { ref pplid, .. } if *pplid == second.pplid));
    assert_eq!(dest.registry.count().unwrap(), 0);
}

#[tokio::test]
async fn test_import_rejects_running_record_and_unknown_version() {
    let dir = TempDir::new().unwrap();
    let origin = lab(dir.path(), "origin");
    let dest = lab(dir.path(), "dest");
    let record = completed(&origin, 0.1).await;
    let bundle = origin
        .manager
        .export(&[record.pplid.clone()], &ExportOptions::new())
        .unwrap();

    let mut running = bundle.clone();
    running.pipelines[0].record.status = PipelineStatus::Running;
    assert!(matches!(
        dest.manager.import(&running),
        Err(EngineError::Configuration { .. })
    ));

    let mut future = bundle;
    future.manifest.format_version = BUNDLE_FORMAT_VERSION + 1;
    assert!(matches!(
        dest.manager.import(&future),
        Err(EngineError::Configuration { .. })
    ));
    assert_eq!(dest.registry.count().unwrap(), 0);
}

#[tokio::test]
async fn test_export_refuses_running_pipeline() {
    let dir = TempDir::new().unwrap();
    let lab = lab(dir.path(), "lab_a");
    let record = lab.registry.create(&train_eval_workflow(), &json!({})).unwrap();
    let prepared = lab.controller.prepare(&record.pplid).await.unwrap();
    lab.controller.running().mark_running(&record.pplid).unwrap();
    lab.registry.start_run(&record.pplid, prepared.revision).unwrap();

    let err = lab
        .manager
        .export(&[record.pplid.clone()], &ExportOptions::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRunning { .. }));
}

#[tokio::test]
async fn test_export_reads_archived_and_import_restores_terminal_status() {
    let dir = TempDir::new().unwrap();
    let origin = lab(dir.path(), "origin");
    let dest = lab(dir.path(), "dest");
    let record = completed(&origin, 0.1).await;
    origin.manager.archive(&record.pplid).unwrap();

    let bundle = origin
        .manager
        .export(&[record.pplid.clone()], &ExportOptions::new())
        .unwrap();
    assert_eq!(bundle.pipelines[0].record.status, PipelineStatus::Archived);

    dest.manager.import(&bundle).unwrap();
    let imported = dest.registry.get(&record.pplid).unwrap();
    assert_eq!(imported.status, PipelineStatus::Completed);
}

#[tokio::test]
async fn test_export_unknown_pipeline_is_not_found() {
    let dir = TempDir::new().unwrap();
    let lab = lab(dir.path(), "lab_a");
    let err = lab
        .manager
        .export(&[identity::generate_pplid()], &ExportOptions::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_edge_outside_bundle_is_skipped() {
    let dir = TempDir::new().unwrap();
    let origin = lab(dir.path(), "origin");
    let dest = lab(dir.path(), "dest");
    let parent = completed(&origin, 0.1).await;
    let child = completed(&origin, 0.2).await;
    origin.graph.add_edge(&parent.pplid, &child.pplid, "derived").unwrap();

    let mut bundle = origin
        .manager
        .export(&[child.pplid.clone()], &ExportOptions::new().with_dependencies())
        .unwrap();
    bundle.pipelines.retain(|p| p.record.pplid == child.pplid);

    let report = dest.manager.import(&bundle).unwrap();
    assert_eq!(report.edges_imported, 0);
    assert_eq!(report.edges_skipped, 1);
    assert!(dest.registry.contains(&child.pplid).unwrap());
}

#[tokio::test]
async fn test_failed_archive_move_leaves_active_rows_in_place() {
    let dir = TempDir::new().unwrap();
    let lab = lab(dir.path(), "lab_a");
    let parent = completed(&lab, 0.1).await;
    let child = completed(&lab, 0.2).await;
    lab.graph.add_edge(&parent.pplid, &child.pplid, "derived").unwrap();

    // Another writer already holds this identifier in the archive file.
    let archive_file = Store::open(dir.path().join("lab_a-archive.db")).unwrap();
    archive_file
        .write(|conn| registry::insert(conn, &parent))
        .unwrap();

    assert!(lab.manager.archive(&parent.pplid).is_err());

    assert_eq!(lab.registry.get(&parent.pplid).unwrap(), parent);
    assert_eq!(lab.graph.edges_of(&child.pplid, Direction::Incoming).unwrap().len(), 1);
    assert_eq!(lab.logs.for_pipeline(&parent.pplid).unwrap().len(), 1);
    assert!(lab.manager.archived_edges(&parent.pplid).unwrap().is_empty());
    assert!(lab.manager.archived_logs(&parent.pplid).unwrap().is_empty());
    assert_eq!(lab.manager.get_archived(&parent.pplid).unwrap().status, PipelineStatus::Completed);
}

#[tokio::test]
async fn test_archived_reads_detect_edited_rows() {
    let dir = TempDir::new().unwrap();
    let lab = lab(dir.path(), "lab_a");
    let record = completed(&lab, 0.1).await;
    let untouched = completed(&lab, 0.3).await;
    lab.manager.archive(&record.pplid).unwrap();
    lab.manager.archive(&untouched.pplid).unwrap();

    let archive_file = Store::open(dir.path().join("lab_a-archive.db")).unwrap();
    let changed = archive_file
        .write(|conn| {
            Ok(conn.execute(
                "UPDATE pipelines SET args_json = replace(args_json, '0.1', '0.7') WHERE pplid = ?1",
                params![record.pplid],
            )?)
        })
        .unwrap();
    assert_eq!(changed, 1);

    let err = lab.manager.get_archived(&record.pplid).unwrap_err();
    match err {
        EngineError::Integrity { pplid, expected, actual } => {
            assert_eq!(pplid, record.pplid);
            assert_eq!(expected, record.content_hash);
            assert_ne!(actual, expected);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(
        lab.manager.list_archived(&PipelineFilter::new()),
        Err(EngineError::Integrity { .. })
    ));
    assert!(lab.manager.get_archived(&untouched.pplid).is_ok());
    assert!(matches!(
        lab.manager.export(&[record.pplid.clone()], &ExportOptions::new()),
        Err(EngineError::Integrity { .. })
    ));
}

#[tokio::test]
async fn test_path_map_travels_into_transfer_rows() {
    let dir = TempDir::new().unwrap();
    let origin = lab(dir.path(), "origin");
    let dest = lab(dir.path(), "dest");
    let record = completed(&origin, 0.1).await;

    let options = ExportOptions::new().map_path("/base/lab", "/remote/lab");
    let bundle = origin.manager.export(&[record.pplid.clone()], &options).unwrap();
    assert_eq!(bundle.manifest.path_map["/base/lab"], "/remote/lab");
    let bundle = Bundle::from_json(&bundle.to_json().unwrap()).unwrap();
    dest.manager.import(&bundle).unwrap();

    let context = dest
        .active
        .read(|conn| transfer::context_for(conn, &record.pplid))
        .unwrap();
    assert_eq!(context.map_path("/base/lab/data/x.csv"), "/remote/lab/data/x.csv");

    dest.manager.archive(&record.pplid).unwrap();
    let archive_file = Store::open(dir.path().join("dest-archive.db")).unwrap();
    let rows = archive_file
        .read(|conn| transfer::for_pipeline(conn, &record.pplid))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].path_map["/base/lab"], "/remote/lab");
}

#[tokio::test]
async fn test_move_export_deletes_exported_rows_from_both_stores() {
    let dir = TempDir::new().unwrap();
    let origin = lab(dir.path(), "origin");
    let dest = lab(dir.path(), "dest");
    let parent = completed(&origin, 0.1).await;
    let child = completed(&origin, 0.2).await;
    let bystander = completed(&origin, 0.3).await;
    origin.graph.add_edge(&parent.pplid, &child.pplid, "derived").unwrap();
    origin.manager.archive(&parent.pplid).unwrap();

    let bundle = origin
        .manager
        .export(&[child.pplid.clone()], &ExportOptions::new().with_dependencies().with_move())
        .unwrap();
    assert_eq!(bundle.manifest.pplids, vec![parent.pplid.clone(), child.pplid.clone()]);
    assert_eq!(bundle.edges.len(), 1);

    assert!(!origin.registry.contains(&child.pplid).unwrap());
    assert!(origin.logs.for_pipeline(&child.pplid).unwrap().is_empty());
    assert!(matches!(
        origin.manager.get_archived(&parent.pplid),
        Err(EngineError::NotFound { .. })
    ));
    assert!(origin.manager.archived_edges(&parent.pplid).unwrap().is_empty());
    assert!(origin.manager.archived_logs(&parent.pplid).unwrap().is_empty());
    assert!(origin.registry.contains(&bystander.pplid).unwrap());

    let report = dest.manager.import(&bundle).unwrap();
    assert_eq!(report.remapped().count(), 0);
    assert_eq!(dest.registry.get(&parent.pplid).unwrap().status, PipelineStatus::Completed);
    assert_eq!(dest.graph.edges_of(&child.pplid, Direction::Incoming).unwrap().len(), 1);
}

#[tokio::test]
async fn test_copy_export_keeps_source_rows() {
    let dir = TempDir::new().unwrap();
    let lab = lab(dir.path(), "lab_a");
    let record = completed(&lab, 0.1).await;

    let options = ExportOptions::new();
    assert_eq!(options.mode, ExportMode::Copy);
    lab.manager.export(&[record.pplid.clone()], &options).unwrap();
    assert_eq!(lab.registry.get(&record.pplid).unwrap(), record);
}

#[tokio::test]
async fn test_dependency_export_with_repeated_ids_reaches_full_closure() {
    let dir = TempDir::new().unwrap();
    let lab = lab(dir.path(), "lab_a");
    let root = completed(&lab, 0.1).await;
    let upstream = completed(&lab, 0.2).await;
    let middle = completed(&lab, 0.3).await;
    let leaf = completed(&lab, 0.4).await;
    lab.graph.add_edge(&root.pplid, &upstream.pplid, "derived").unwrap();
    lab.graph.add_edge(&upstream.pplid, &middle.pplid, "derived").unwrap();
    lab.graph.add_edge(&middle.pplid, &leaf.pplid, "derived").unwrap();
    // Leaves root->upstream active and moves the other two edges to the archive.
    lab.manager.archive(&middle.pplid).unwrap();

    let requested = vec![leaf.pplid.clone(), leaf.pplid.clone(), leaf.pplid.clone()];
    let bundle = lab
        .manager
        .export(&requested, &ExportOptions::new().with_dependencies())
        .unwrap();

    assert_eq!(
        bundle.manifest.pplids,
        vec![root.pplid, upstream.pplid, middle.pplid, leaf.pplid]
    );
    assert_eq!(bundle.len(), 4);
    assert_eq!(bundle.edges.len(), 3);
}
