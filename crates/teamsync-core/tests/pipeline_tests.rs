//! End-to-end tests of compare and update against in-memory instances.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use teamsync_core::compare::schema::MORE_THAN_ONE_CLASS;
use teamsync_core::models::{AnnotationObject, AnnotationTag, ObjClass, TagMeta};
use teamsync_core::{
    diff, Annotation, CustomFilter, MemoryPlatform, NodeInfo, NodeKind, ProgressEvent,
    ProjectMeta, RunStatus, SchemaReport, SyncError, SyncSession, SyncSettings,
};
use tempfile::TempDir;

const CLASS: &str = "dog_breeds_mask";

struct Fixture {
    source: Arc<MemoryPlatform>,
    target: Arc<MemoryPlatform>,
    work_dir: TempDir,
    source_team: NodeInfo,
}

impl Fixture {
    fn new() -> Self {
        let source = Arc::new(MemoryPlatform::new("memory://source"));
        let source_team = source.add_team("source-team");
        Self {
            source,
            target: Arc::new(MemoryPlatform::new("memory://target")),
            work_dir: TempDir::new().expect("Failed to create temp dir"),
            source_team,
        }
    }

    fn session(&self, settings: SyncSettings) -> SyncSession {
        SyncSession::new(
            self.source.clone(),
            self.target.clone(),
            settings,
            self.work_dir.path(),
        )
    }

    /// Find or add workspace/project/dataset under `team_id`.
    fn dataset_in(
        platform: &MemoryPlatform,
        team_id: i64,
        workspace: &str,
        project: &str,
        dataset: &str,
    ) -> (NodeInfo, NodeInfo) {
        let ws = platform
            .find(NodeKind::Workspace, Some(team_id), workspace)
            .unwrap_or_else(|| platform.add_node(NodeKind::Workspace, team_id, workspace));
        let proj = platform
            .find(NodeKind::Project, Some(ws.id), project)
            .unwrap_or_else(|| platform.add_node(NodeKind::Project, ws.id, project));
        let ds = platform
            .find(NodeKind::Dataset, Some(proj.id), dataset)
            .unwrap_or_else(|| platform.add_node(NodeKind::Dataset, proj.id, dataset));
        (proj, ds)
    }

    fn source_dataset(&self, workspace: &str, project: &str, dataset: &str) -> (NodeInfo, NodeInfo) {
        let (proj, ds) =
            Self::dataset_in(&self.source, self.source_team.id, workspace, project, dataset);
        self.source.set_project_meta(proj.id, meta(&[CLASS]));
        (proj, ds)
    }

    fn target_dataset(&self, workspace: &str, project: &str, dataset: &str) -> NodeInfo {
        let team = self
            .target
            .find(NodeKind::Team, None, "primitives")
            .unwrap_or_else(|| self.target.add_team("primitives"));
        Self::dataset_in(&self.target, team.id, workspace, project, dataset).1
    }
}

fn meta(classes: &[&str]) -> ProjectMeta {
    ProjectMeta {
        classes: classes.iter().map(|c| ObjClass::new(*c, "bitmap")).collect(),
        tags: vec![TagMeta::new("inference")],
        ..Default::default()
    }
}

/// A bitmap object whose description identifies the image it belongs to.
fn bitmap(label: &str) -> Annotation {
    let mut object = AnnotationObject::new("bitmap", CLASS);
    object
        .extra
        .insert("description".into(), Value::String(label.to_string()));
    object.extra.insert("id".into(), json!(9000));
    Annotation {
        objects: vec![object],
        ..Default::default()
    }
}

fn inference_tag() -> Annotation {
    Annotation {
        tags: vec![AnnotationTag::new("inference")],
        ..Default::default()
    }
}

fn names(images: &[teamsync_core::ImageRecord]) -> Vec<&str> {
    images.iter().map(|i| i.name.as_str()).collect()
}

fn bitmap_only() -> SyncSettings {
    SyncSettings::custom(
        CustomFilter {
            annotation_types: Some(vec!["bitmap".into()]),
            tag_name: Some("inference".into()),
            normalize_metadata: false,
        },
        "primitives",
    )
}

#[tokio::test]
async fn test_only_missing_annotated_image_is_selected() {
    let fx = Fixture::new();
    let (_, ds) = fx.source_dataset("ws", "proj", "ds");
    fx.source.add_image(ds.id, "a.jpg", Map::new(), bitmap("a"));
    fx.source.add_image(ds.id, "b.jpg", Map::new(), bitmap("b"));
    let target_ds = fx.target_dataset("ws", "proj", "ds");
    fx.target
        .add_image(target_ds.id, "a.jpg", Map::new(), Annotation::default());

    let mut session = fx.session(bitmap_only());
    let outcome = session.compare(fx.source_team.id).await.unwrap();

    let leaf = &outcome.tree.workspaces["ws"]["proj"]["ds"];
    assert_eq!(names(&leaf.annotated_images), vec!["b.jpg"]);
    assert!(leaf.tagged_images.is_empty());
    assert_eq!(leaf.target.id, target_ds.id);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(fx.target.calls().created.is_empty());
}

#[tokio::test]
async fn test_tag_only_image_is_selected_as_tagged() {
    let fx = Fixture::new();
    let (_, ds) = fx.source_dataset("ws", "proj", "ds");
    fx.source.add_image(ds.id, "a.jpg", Map::new(), bitmap("a"));
    fx.source.add_image(ds.id, "b.jpg", Map::new(), inference_tag());
    let target_ds = fx.target_dataset("ws", "proj", "ds");
    fx.target
        .add_image(target_ds.id, "a.jpg", Map::new(), Annotation::default());

    let mut session = fx.session(bitmap_only());
    let outcome = session.compare(fx.source_team.id).await.unwrap();

    let leaf = &outcome.tree.workspaces["ws"]["proj"]["ds"];
    assert!(leaf.annotated_images.is_empty());
    assert_eq!(names(&leaf.tagged_images), vec!["b.jpg"]);
    assert_eq!(
        outcome.summary(),
        "Found 0 new annotated images and 1 new tagged images."
    );
}

#[tokio::test]
async fn test_uploads_are_batched_and_annotations_follow_their_batch() {
    let fx = Fixture::new();
    let (_, ds) = fx.source_dataset("ws", "proj", "ds");
    for i in 0..5 {
        let name = format!("img{}.jpg", i);
        fx.source.add_image(ds.id, &name, Map::new(), bitmap(&name));
    }

    let mut session = fx.session(bitmap_only().with_batch_size(2));
    let outcome = session.compare(fx.source_team.id).await.unwrap();
    let report = session.migrate(&outcome.tree).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.uploaded_annotated_images, 5);
    assert_eq!(
        report.summary(),
        "Successfully uploaded 5 annotated images and 0 tagged images."
    );

    let calls = fx.target.calls();
    let sizes: Vec<usize> = calls.image_upload_batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(calls.annotation_uploads.len(), 3);
    assert_eq!(calls.annotation_uploads[2], calls.image_upload_results[2]);
    assert_eq!(fx.source.calls().image_download_batches, vec![2, 2, 1]);

    // Every uploaded image carries the annotation of the same source image.
    let target_ds = &outcome.tree.workspaces["ws"]["proj"]["ds"].target;
    for image in fx.target.images_in(target_ds.id) {
        let annotation = fx.target.annotation_of(image.id).unwrap();
        assert_eq!(annotation.objects[0].extra["description"], image.name.as_str());
        assert!(!annotation.objects[0].extra.contains_key("id"));
    }

    // Schema was merged before annotations were attached.
    assert_eq!(
        fx.target.project_meta(target_ds.project_id).class_titles(),
        vec![CLASS]
    );
    assert_eq!(fx.target.calls().meta_updates, vec![target_ds.project_id]);

    // Staging directory is gone.
    assert!(!session.images_dir().join("ds").exists());
}

#[tokio::test]
async fn test_cancel_after_first_workspace_keeps_one_workspace() {
    let fx = Fixture::new();
    for ws in ["ws1", "ws2", "ws3"] {
        let (_, ds) = fx.source_dataset(ws, "proj", "ds");
        fx.source.add_image(ds.id, "a.jpg", Map::new(), bitmap("a"));
    }

    let session = fx.session(bitmap_only());
    let token = session.compare_token();
    let mut session = session.with_progress(Arc::new(move |event: &ProgressEvent| {
        if let ProgressEvent::WorkspaceCompared { .. } = event {
            token.cancel();
        }
    }));

    let outcome = session.compare_and_save(fx.source_team.id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(outcome.tree.workspaces.len(), 1);
    assert!(outcome.tree.workspaces.contains_key("ws1"));
    assert!(outcome.summary().starts_with("The comparison was canceled."));

    let saved = diff::load_checkpoint(&session.checkpoint_path()).unwrap();
    assert_eq!(saved, outcome.tree);
}

#[tokio::test]
async fn test_schema_problem_is_reported_and_project_still_migrated() {
    let fx = Fixture::new();
    let (proj, ds) = fx.source_dataset("Animals", "Dog breeds", "ds");
    fx.source
        .set_project_meta(proj.id, meta(&[CLASS, "dog_breeds_other"]));
    let mut source_meta = Map::new();
    source_meta.insert("Photographer name".into(), json!("Jane"));
    source_meta.insert("camera".into(), json!("X100"));
    fx.source.add_image(ds.id, "a.jpg", source_meta, bitmap("a"));

    let mut session = fx.session(SyncSettings::default());
    let outcome = session.compare_and_save(fx.source_team.id).await.unwrap();

    let issues = outcome.schema_report.issues_for("Animals");
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].error, MORE_THAN_ONE_CLASS);
    assert_eq!(issues[0].project_name, "Dog breeds");
    assert!(session.schema_report_path().exists());

    let report = session.update_from_checkpoint().await.unwrap();
    assert_eq!(report.uploaded_annotated_images, 1);

    let target_ds = &outcome.tree.workspaces["Animals"]["Dog breeds"]["ds"].target;
    let uploaded = fx.target.images_in(target_ds.id);
    assert_eq!(names(&uploaded), vec!["a.jpg"]);
    assert_eq!(
        Value::Object(uploaded[0].meta.clone()),
        json!({"URL": null, "Author": "Jane", "License": "Pexels license"})
    );
}

#[tokio::test]
async fn test_second_compare_finds_nothing_after_update() {
    let fx = Fixture::new();
    let (_, ds) = fx.source_dataset("ws", "proj", "ds");
    fx.source.add_image(ds.id, "a.jpg", Map::new(), bitmap("a"));
    fx.source.add_image(ds.id, "b.jpg", Map::new(), inference_tag());

    let mut session = fx.session(bitmap_only());
    session.compare_and_save(fx.source_team.id).await.unwrap();
    let report = session.update_from_checkpoint().await.unwrap();
    assert_eq!(report.uploaded_annotated_images, 1);
    assert_eq!(report.uploaded_tagged_images, 1);

    let again = session.compare(fx.source_team.id).await.unwrap();
    assert_eq!(again.tree.annotated_count(), 0);
    assert_eq!(again.tree.tagged_count(), 0);
    assert_eq!(session.counters().annotated_images, 0);
}

#[tokio::test]
async fn test_image_matching_both_filters_is_only_annotated() {
    let fx = Fixture::new();
    let (_, ds) = fx.source_dataset("ws", "proj", "ds");
    let mut both = bitmap("a");
    both.tags.push(AnnotationTag::new("inference"));
    fx.source.add_image(ds.id, "a.jpg", Map::new(), both);

    let mut session = fx.session(bitmap_only());
    let outcome = session.compare(fx.source_team.id).await.unwrap();

    let leaf = &outcome.tree.workspaces["ws"]["proj"]["ds"];
    assert_eq!(names(&leaf.annotated_images), vec!["a.jpg"]);
    assert!(leaf.tagged_images.is_empty());
}

#[tokio::test]
async fn test_missing_target_containers_are_created() {
    let fx = Fixture::new();
    fx.source_dataset("ws", "proj", "ds");

    let mut session = fx.session(bitmap_only());
    session.compare(fx.source_team.id).await.unwrap();

    let created: Vec<NodeKind> = fx.target.calls().created.iter().map(|(k, _)| *k).collect();
    assert_eq!(
        created,
        vec![
            NodeKind::Team,
            NodeKind::Workspace,
            NodeKind::Project,
            NodeKind::Dataset
        ]
    );

    // A second run reuses them.
    session.compare(fx.source_team.id).await.unwrap();
    assert_eq!(fx.target.calls().created.len(), 4);
}

#[tokio::test]
async fn test_pass_through_selects_every_new_image() {
    let fx = Fixture::new();
    let (_, ds) = fx.source_dataset("ws", "proj", "ds");
    fx.source.add_image(ds.id, "a.jpg", Map::new(), Annotation::default());
    fx.source.add_image(ds.id, "b.jpg", Map::new(), inference_tag());

    let mut session = fx.session(SyncSettings::custom(CustomFilter::default(), "primitives"));
    let outcome = session.compare(fx.source_team.id).await.unwrap();

    assert_eq!(outcome.tree.annotated_count(), 2);
    assert_eq!(outcome.summary(), "Found 2 new images.");
    assert!(fx.source.calls().annotation_downloads.is_empty());
}

#[tokio::test]
async fn test_invalid_settings_fail_before_touching_target() {
    let fx = Fixture::new();
    fx.source_dataset("ws", "proj", "ds");

    let settings = SyncSettings::custom(
        CustomFilter {
            annotation_types: Some(Vec::new()),
            tag_name: None,
            normalize_metadata: false,
        },
        "primitives",
    );
    let mut session = fx.session(settings);
    let err = session.compare(fx.source_team.id).await.unwrap_err();

    match err {
        SyncError::Validation { message, .. } => {
            assert_eq!(message, "No annotation types selected.")
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fx.target.find(NodeKind::Team, None, "primitives").is_none());
}

#[tokio::test]
async fn test_dataset_with_bad_image_data_is_skipped() {
    let fx = Fixture::new();
    let (_, ds1) = fx.source_dataset("ws", "proj", "ds1");
    let (_, ds2) = fx.source_dataset("ws", "proj", "ds2");
    fx.source.add_image(ds1.id, "a.jpg", Map::new(), bitmap("a"));
    fx.source.add_image(ds2.id, "b.jpg", Map::new(), bitmap("b"));

    let mut session = fx.session(bitmap_only());
    let mut tree = session.compare(fx.source_team.id).await.unwrap().tree;
    let leaf = tree
        .workspaces
        .get_mut("ws")
        .and_then(|projects| projects.get_mut("proj"))
        .and_then(|datasets| datasets.get_mut("ds1"))
        .unwrap();
    let duplicate = leaf.annotated_images[0].clone();
    leaf.annotated_images.push(duplicate);

    let report = session.migrate(&tree).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].dataset, "ds1");
    assert_eq!(report.datasets_migrated, 1);
    assert_eq!(report.uploaded_annotated_images, 1);
}

#[tokio::test]
async fn test_cancel_during_update_stops_at_dataset_boundary() {
    let fx = Fixture::new();
    let (_, ds1) = fx.source_dataset("ws", "proj", "ds1");
    let (_, ds2) = fx.source_dataset("ws", "proj", "ds2");
    fx.source.add_image(ds1.id, "a.jpg", Map::new(), bitmap("a"));
    fx.source.add_image(ds2.id, "b.jpg", Map::new(), bitmap("b"));

    let session = fx.session(bitmap_only());
    let token = session.upload_token();
    let mut session = session.with_progress(Arc::new(move |event: &ProgressEvent| {
        if let ProgressEvent::DatasetUploaded { .. } = event {
            token.cancel();
        }
    }));

    let tree = session.compare(fx.source_team.id).await.unwrap().tree;
    let report = session.migrate(&tree).await.unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.uploaded_annotated_images, 1);
    assert_eq!(
        report.summary(),
        "Uploading of images was cancelled after uploading 1 annotated images and 0 tagged images."
    );
    assert_eq!(fx.target.calls().image_upload_batches.len(), 1);
}

#[tokio::test]
async fn test_cancel_during_last_dataset_of_update_reports_cancelled() {
    let fx = Fixture::new();
    let (_, ds) = fx.source_dataset("ws", "proj", "ds");
    fx.source.add_image(ds.id, "a.jpg", Map::new(), bitmap("a"));

    let session = fx.session(bitmap_only());
    let token = session.upload_token();
    let mut session = session.with_progress(Arc::new(move |event: &ProgressEvent| {
        if let ProgressEvent::DatasetUploaded { .. } = event {
            token.cancel();
        }
    }));

    let tree = session.compare(fx.source_team.id).await.unwrap().tree;
    let report = session.migrate(&tree).await.unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.uploaded_annotated_images, 1);
    assert!(report
        .summary()
        .starts_with("Uploading of images was cancelled after uploading"));
}

#[tokio::test]
async fn test_cancel_during_last_workspace_of_compare_reports_cancelled() {
    let fx = Fixture::new();
    let (_, ds) = fx.source_dataset("ws", "proj", "ds");
    fx.source.add_image(ds.id, "a.jpg", Map::new(), bitmap("a"));

    let session = fx.session(bitmap_only());
    let token = session.compare_token();
    let mut session = session.with_progress(Arc::new(move |event: &ProgressEvent| {
        if let ProgressEvent::DatasetCompared { .. } = event {
            token.cancel();
        }
    }));

    let outcome = session.compare(fx.source_team.id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(outcome.annotated_images, 1);
    assert!(outcome.tree.workspaces["ws"]["proj"].contains_key("ds"));
    assert!(outcome.summary().starts_with("The comparison was canceled."));
}

#[tokio::test]
async fn test_clean_compare_replaces_previous_schema_report() {
    let fx = Fixture::new();
    let (proj, ds) = fx.source_dataset("Animals", "Dog breeds", "ds");
    fx.source
        .set_project_meta(proj.id, meta(&[CLASS, "dog_breeds_other"]));
    fx.source.add_image(ds.id, "a.jpg", Map::new(), bitmap("a"));

    let mut session = fx.session(SyncSettings::default());
    session.compare_and_save(fx.source_team.id).await.unwrap();
    let first: SchemaReport = diff::read_json(&session.schema_report_path())
        .unwrap()
        .unwrap();
    assert_eq!(first.issue_count(), 1);

    fx.source.set_project_meta(proj.id, meta(&[CLASS]));
    let outcome = session.compare_and_save(fx.source_team.id).await.unwrap();
    assert!(outcome.schema_report.is_empty());

    let second: SchemaReport = diff::read_json(&session.schema_report_path())
        .unwrap()
        .unwrap();
    assert!(second.is_empty());
}
