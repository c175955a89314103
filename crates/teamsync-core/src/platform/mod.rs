//! Access to a platform instance.
//!
//! The pipeline only ever talks to an instance through [`PlatformApi`]. Two
//! implementations are provided:
//! - [`HttpPlatform`] calls the public REST API of a live instance.
//! - [`MemoryPlatform`] keeps a whole instance in memory and records calls.

mod http;
mod memory;

pub use http::HttpPlatform;
pub use memory::{CallLog, MemoryPlatform};

use crate::models::{
    Annotation, AnnotationRecord, ImageRecord, NodeInfo, NodeKind, ProjectMeta,
};
use crate::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Hierarchical CRUD over one instance: team → workspace → project →
/// dataset → image, plus annotations, project metas and team files.
///
/// All calls are request/response; implementations must return listings in
/// the order the instance produces them.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Address of the instance, for logs and error messages.
    fn address(&self) -> &str;

    /// Perform one authenticated request to verify address and key.
    ///
    /// A rejected key surfaces as an HTTP 401/403 error.
    async fn check_connection(&self) -> Result<()>;

    async fn get_team_by_name(&self, name: &str) -> Result<Option<NodeInfo>>;

    async fn create_team(&self, name: &str) -> Result<NodeInfo>;

    /// List workspaces of a team, projects of a workspace or datasets of a
    /// project.
    async fn list_children(&self, kind: NodeKind, parent_id: i64) -> Result<Vec<NodeInfo>>;

    async fn get_child_by_name(
        &self,
        kind: NodeKind,
        parent_id: i64,
        name: &str,
    ) -> Result<Option<NodeInfo>>;

    async fn create_child(&self, kind: NodeKind, parent_id: i64, name: &str) -> Result<NodeInfo>;

    async fn get_dataset(&self, dataset_id: i64) -> Result<NodeInfo>;

    async fn list_images(&self, dataset_id: i64) -> Result<Vec<ImageRecord>>;

    /// Download image bytes; `ids[i]` is written to `paths[i]`.
    async fn download_images(&self, dataset_id: i64, ids: &[i64], paths: &[PathBuf])
        -> Result<()>;

    /// Upload local files as new images. The returned records are in the
    /// same order as `names`.
    async fn upload_images(
        &self,
        dataset_id: i64,
        names: &[String],
        paths: &[PathBuf],
        metas: &[Map<String, Value>],
    ) -> Result<Vec<ImageRecord>>;

    async fn download_annotations(
        &self,
        dataset_id: i64,
        image_ids: &[i64],
    ) -> Result<Vec<AnnotationRecord>>;

    /// Attach `annotations[i]` to `image_ids[i]`.
    async fn upload_annotations(
        &self,
        dataset_id: i64,
        image_ids: &[i64],
        annotations: &[Annotation],
    ) -> Result<()>;

    async fn get_project_meta(&self, project_id: i64) -> Result<ProjectMeta>;

    async fn update_project_meta(&self, project_id: i64, meta: &ProjectMeta) -> Result<()>;

    /// Copy a file from the team file storage to a local path.
    async fn download_team_file(
        &self,
        team_id: i64,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<()>;
}

/// Resolve a child by name, creating it when it does not exist.
///
/// Returns the node and whether it was created.
pub async fn get_or_create_child(
    api: &dyn PlatformApi,
    kind: NodeKind,
    parent_id: i64,
    name: &str,
) -> Result<(NodeInfo, bool)> {
    if let Some(node) = api.get_child_by_name(kind, parent_id, name).await? {
        tracing::debug!(
            "{} {} is found in target with ID {}.",
            kind,
            name,
            node.id
        );
        return Ok((node, false));
    }

    tracing::debug!("{} {} is not found in target. Will create it.", kind, name);
    let node = api.create_child(kind, parent_id, name).await?;
    tracing::debug!("{} {} is created in target with ID {}.", kind, name, node.id);
    Ok((node, true))
}
