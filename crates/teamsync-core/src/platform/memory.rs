//! In-memory [`PlatformApi`] implementation.
//!
//! Holds a complete instance (nodes, image bytes, annotations, metas, team
//! files) behind a mutex and records the calls the pipeline makes, so that
//! batch sizes and upload ordering can be asserted on.

use super::PlatformApi;
use crate::models::{
    Annotation, AnnotationRecord, ImageRecord, NodeInfo, NodeKind, ProjectMeta,
};
use crate::{Result, SyncError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Calls observed by a [`MemoryPlatform`].
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    /// Names passed to each `upload_images` call.
    pub image_upload_batches: Vec<Vec<String>>,
    /// Ids assigned by each `upload_images` call.
    pub image_upload_results: Vec<Vec<i64>>,
    /// Number of ids in each `download_images` call.
    pub image_download_batches: Vec<usize>,
    /// Image ids passed to each `upload_annotations` call.
    pub annotation_uploads: Vec<Vec<i64>>,
    /// Number of ids in each `download_annotations` call.
    pub annotation_downloads: Vec<usize>,
    /// Project ids passed to `update_project_meta`.
    pub meta_updates: Vec<i64>,
    /// Nodes created through the API.
    pub created: Vec<(NodeKind, String)>,
}

#[derive(Debug, Clone)]
struct StoredNode {
    kind: NodeKind,
    info: NodeInfo,
}

#[derive(Debug, Clone)]
struct StoredImage {
    record: ImageRecord,
    dataset_id: i64,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    nodes: Vec<StoredNode>,
    images: Vec<StoredImage>,
    annotations: HashMap<i64, Annotation>,
    metas: HashMap<i64, ProjectMeta>,
    files: HashMap<(i64, String), Vec<u8>>,
    calls: CallLog,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_node(&mut self, kind: NodeKind, parent_id: Option<i64>, name: &str) -> NodeInfo {
        let info = NodeInfo::new(self.allocate_id(), name, parent_id);
        self.nodes.push(StoredNode {
            kind,
            info: info.clone(),
        });
        info
    }

    fn node(&self, kind: NodeKind, id: i64) -> Option<&NodeInfo> {
        self.nodes
            .iter()
            .find(|n| n.kind == kind && n.info.id == id)
            .map(|n| &n.info)
    }

    fn children(&self, kind: NodeKind, parent_id: i64) -> Vec<NodeInfo> {
        self.nodes
            .iter()
            .filter(|n| n.kind == kind && n.info.parent_id == Some(parent_id))
            .map(|n| n.info.clone())
            .collect()
    }

    fn dataset_project(&self, dataset_id: i64) -> Result<i64> {
        self.node(NodeKind::Dataset, dataset_id)
            .and_then(|d| d.parent_id)
            .ok_or_else(|| SyncError::NotFound {
                kind: "Dataset".into(),
                name: dataset_id.to_string(),
            })
    }
}

/// How [`PlatformApi::check_connection`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionFault {
    None,
    RejectKey,
    Unreachable,
}

/// A whole platform instance held in memory.
#[derive(Debug)]
pub struct MemoryPlatform {
    address: String,
    fault: ConnectionFault,
    state: Mutex<MemoryState>,
}

impl MemoryPlatform {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            fault: ConnectionFault::None,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// An instance that answers every connection check with HTTP 401.
    pub fn rejecting_key(address: impl Into<String>) -> Self {
        Self {
            fault: ConnectionFault::RejectKey,
            ..Self::new(address)
        }
    }

    /// An instance whose connection check fails below HTTP.
    pub fn unreachable(address: impl Into<String>) -> Self {
        Self {
            fault: ConnectionFault::Unreachable,
            ..Self::new(address)
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means another test thread panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Seeding

    pub fn add_team(&self, name: &str) -> NodeInfo {
        self.lock().insert_node(NodeKind::Team, None, name)
    }

    pub fn add_node(&self, kind: NodeKind, parent_id: i64, name: &str) -> NodeInfo {
        self.lock().insert_node(kind, Some(parent_id), name)
    }

    /// Add an image with its bytes and annotation to a dataset.
    pub fn add_image(
        &self,
        dataset_id: i64,
        name: &str,
        meta: Map<String, Value>,
        annotation: Annotation,
    ) -> ImageRecord {
        let mut state = self.lock();
        let record = ImageRecord::new(state.allocate_id(), name).with_meta(meta);
        state.annotations.insert(record.id, annotation);
        state.images.push(StoredImage {
            record: record.clone(),
            dataset_id,
            bytes: format!("bytes-of-{}", name).into_bytes(),
        });
        record
    }

    pub fn set_project_meta(&self, project_id: i64, meta: ProjectMeta) {
        self.lock().metas.insert(project_id, meta);
    }

    pub fn put_team_file(&self, team_id: i64, remote_path: &str, bytes: Vec<u8>) {
        self.lock()
            .files
            .insert((team_id, remote_path.to_string()), bytes);
    }

    // Inspection

    pub fn calls(&self) -> CallLog {
        self.lock().calls.clone()
    }

    pub fn find(&self, kind: NodeKind, parent_id: Option<i64>, name: &str) -> Option<NodeInfo> {
        self.lock()
            .nodes
            .iter()
            .find(|n| n.kind == kind && n.info.parent_id == parent_id && n.info.name == name)
            .map(|n| n.info.clone())
    }

    pub fn images_in(&self, dataset_id: i64) -> Vec<ImageRecord> {
        self.lock()
            .images
            .iter()
            .filter(|i| i.dataset_id == dataset_id)
            .map(|i| i.record.clone())
            .collect()
    }

    pub fn image_bytes(&self, image_id: i64) -> Option<Vec<u8>> {
        self.lock()
            .images
            .iter()
            .find(|i| i.record.id == image_id)
            .map(|i| i.bytes.clone())
    }

    pub fn annotation_of(&self, image_id: i64) -> Option<Annotation> {
        self.lock().annotations.get(&image_id).cloned()
    }

    pub fn project_meta(&self, project_id: i64) -> ProjectMeta {
        self.lock()
            .metas
            .get(&project_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PlatformApi for MemoryPlatform {
    fn address(&self) -> &str {
        &self.address
    }

    async fn check_connection(&self) -> Result<()> {
        match self.fault {
            ConnectionFault::None => Ok(()),
            ConnectionFault::RejectKey => Err(SyncError::Http {
                status: 401,
                endpoint: "teams.list".into(),
                message: "Unauthorized".into(),
            }),
            ConnectionFault::Unreachable => Err(SyncError::Network {
                message: format!("POST teams.list failed: connection refused by {}", self.address),
                cause: None,
            }),
        }
    }

    async fn get_team_by_name(&self, name: &str) -> Result<Option<NodeInfo>> {
        Ok(self.find(NodeKind::Team, None, name))
    }

    async fn create_team(&self, name: &str) -> Result<NodeInfo> {
        let mut state = self.lock();
        state.calls.created.push((NodeKind::Team, name.to_string()));
        Ok(state.insert_node(NodeKind::Team, None, name))
    }

    async fn list_children(&self, kind: NodeKind, parent_id: i64) -> Result<Vec<NodeInfo>> {
        Ok(self.lock().children(kind, parent_id))
    }

    async fn get_child_by_name(
        &self,
        kind: NodeKind,
        parent_id: i64,
        name: &str,
    ) -> Result<Option<NodeInfo>> {
        Ok(self.find(kind, Some(parent_id), name))
    }

    async fn create_child(&self, kind: NodeKind, parent_id: i64, name: &str) -> Result<NodeInfo> {
        let mut state = self.lock();
        state.calls.created.push((kind, name.to_string()));
        Ok(state.insert_node(kind, Some(parent_id), name))
    }

    async fn get_dataset(&self, dataset_id: i64) -> Result<NodeInfo> {
        self.lock()
            .node(NodeKind::Dataset, dataset_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound {
                kind: "Dataset".into(),
                name: dataset_id.to_string(),
            })
    }

    async fn list_images(&self, dataset_id: i64) -> Result<Vec<ImageRecord>> {
        Ok(self.images_in(dataset_id))
    }

    async fn download_images(
        &self,
        dataset_id: i64,
        ids: &[i64],
        paths: &[PathBuf],
    ) -> Result<()> {
        let payloads: Vec<Vec<u8>> = {
            let mut state = self.lock();
            state.calls.image_download_batches.push(ids.len());
            ids.iter()
                .map(|id| {
                    state
                        .images
                        .iter()
                        .find(|i| i.record.id == *id && i.dataset_id == dataset_id)
                        .map(|i| i.bytes.clone())
                        .ok_or_else(|| SyncError::NotFound {
                            kind: "Image".into(),
                            name: id.to_string(),
                        })
                })
                .collect::<Result<_>>()?
        };

        for (bytes, path) in payloads.iter().zip(paths) {
            tokio::fs::write(path, bytes)
                .await
                .map_err(|e| SyncError::io_with_path(e, path))?;
        }
        Ok(())
    }

    async fn upload_images(
        &self,
        dataset_id: i64,
        names: &[String],
        paths: &[PathBuf],
        metas: &[Map<String, Value>],
    ) -> Result<Vec<ImageRecord>> {
        let mut payloads = Vec::with_capacity(paths.len());
        for path in paths {
            payloads.push(
                tokio::fs::read(path)
                    .await
                    .map_err(|e| SyncError::io_with_path(e, path))?,
            );
        }

        let mut state = self.lock();
        state.calls.image_upload_batches.push(names.to_vec());

        let mut uploaded = Vec::with_capacity(names.len());
        for ((name, meta), bytes) in names.iter().zip(metas).zip(payloads) {
            let record = ImageRecord::new(state.allocate_id(), name.clone()).with_meta(meta.clone());
            state.images.push(StoredImage {
                record: record.clone(),
                dataset_id,
                bytes,
            });
            uploaded.push(record);
        }

        state
            .calls
            .image_upload_results
            .push(uploaded.iter().map(|r| r.id).collect());
        Ok(uploaded)
    }

    async fn download_annotations(
        &self,
        _dataset_id: i64,
        image_ids: &[i64],
    ) -> Result<Vec<AnnotationRecord>> {
        let mut state = self.lock();
        state.calls.annotation_downloads.push(image_ids.len());

        let mut records = Vec::with_capacity(image_ids.len());
        for id in image_ids {
            let image_name = state
                .images
                .iter()
                .find(|i| i.record.id == *id)
                .map(|i| i.record.name.clone())
                .unwrap_or_default();
            records.push(AnnotationRecord {
                image_id: *id,
                image_name,
                annotation: state.annotations.get(id).cloned().unwrap_or_default(),
            });
        }
        Ok(records)
    }

    async fn upload_annotations(
        &self,
        dataset_id: i64,
        image_ids: &[i64],
        annotations: &[Annotation],
    ) -> Result<()> {
        let mut state = self.lock();
        let project_id = state.dataset_project(dataset_id)?;
        let meta = state.metas.get(&project_id).cloned().unwrap_or_default();

        // Reject annotations the project schema does not cover.
        for annotation in annotations {
            annotation.materialize(&meta)?;
        }

        state.calls.annotation_uploads.push(image_ids.to_vec());
        for (id, annotation) in image_ids.iter().zip(annotations) {
            state.annotations.insert(*id, annotation.clone());
        }
        Ok(())
    }

    async fn get_project_meta(&self, project_id: i64) -> Result<ProjectMeta> {
        Ok(self.project_meta(project_id))
    }

    async fn update_project_meta(&self, project_id: i64, meta: &ProjectMeta) -> Result<()> {
        let mut state = self.lock();
        state.calls.meta_updates.push(project_id);
        state.metas.insert(project_id, meta.clone());
        Ok(())
    }

    async fn download_team_file(
        &self,
        team_id: i64,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<()> {
        let bytes = self
            .lock()
            .files
            .get(&(team_id, remote_path.to_string()))
            .cloned()
            .ok_or_else(|| SyncError::NotFound {
                kind: "File".into(),
                name: remote_path.to_string(),
            })?;
        tokio::fs::write(local_path, bytes)
            .await
            .map_err(|e| SyncError::io_with_path(e, local_path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::get_or_create_child;

    #[tokio::test]
    async fn test_children_keep_insertion_order() {
        let platform = MemoryPlatform::new("memory://source");
        let team = platform.add_team("team");
        platform.add_node(NodeKind::Workspace, team.id, "zeta");
        platform.add_node(NodeKind::Workspace, team.id, "alpha");

        let names: Vec<String> = platform
            .list_children(NodeKind::Workspace, team.id)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[tokio::test]
    async fn test_get_or_create_child() {
        let platform = MemoryPlatform::new("memory://target");
        let team = platform.add_team("team");

        let (first, created) = get_or_create_child(&platform, NodeKind::Workspace, team.id, "ws")
            .await
            .unwrap();
        assert!(created);
        let (second, created) = get_or_create_child(&platform, NodeKind::Workspace, team.id, "ws")
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(platform.calls().created.len(), 1);
    }

    #[tokio::test]
    async fn test_upload_annotations_requires_schema() {
        let platform = MemoryPlatform::new("memory://target");
        let team = platform.add_team("team");
        let ws = platform.add_node(NodeKind::Workspace, team.id, "ws");
        let project = platform.add_node(NodeKind::Project, ws.id, "cats");
        let dataset = platform.add_node(NodeKind::Dataset, project.id, "ds");

        let ann = Annotation {
            objects: vec![crate::models::AnnotationObject::new("bitmap", "cat")],
            ..Default::default()
        };
        let err = platform
            .upload_annotations(dataset.id, &[1], &[ann.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SchemaMismatch { .. }));

        platform.set_project_meta(
            project.id,
            ProjectMeta {
                classes: vec![crate::models::ObjClass::new("cat", "bitmap")],
                ..Default::default()
            },
        );
        platform
            .upload_annotations(dataset.id, &[1], &[ann])
            .await
            .unwrap();
        assert_eq!(platform.calls().annotation_uploads, vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_rejecting_key() {
        let platform = MemoryPlatform::rejecting_key("memory://target");
        let err = platform.check_connection().await.unwrap_err();
        assert!(err.is_auth_failure());

        let platform = MemoryPlatform::unreachable("memory://target");
        let err = platform.check_connection().await.unwrap_err();
        assert!(!err.is_auth_failure());
    }
}
