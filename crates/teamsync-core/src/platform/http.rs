//! [`PlatformApi`] over the public REST API of a live instance.
//!
//! Every method is a JSON POST to `{address}/public/api/v3/{method}`. Listing
//! methods are paginated. Image download is one bulk request per batch whose
//! multipart response names each part by image id. Image upload is
//! content-addressed:
//! 1. Hash each file (sha256, base64)
//! 2. Upload the blobs as one multipart request
//! 3. Register the images in the dataset by name, hash and meta

use super::PlatformApi;
use crate::config::NetworkConfig;
use crate::models::{
    Annotation, AnnotationRecord, ImageRecord, NodeInfo, NodeKind, ProjectMeta,
};
use crate::network::HttpClient;
use crate::{Result, SyncError};
use async_trait::async_trait;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One page of a listing response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    #[serde(default = "Vec::new")]
    entities: Vec<T>,
    #[serde(default)]
    pages_count: u32,
}

/// Container entity as returned by the list/info/add methods.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntity {
    id: i64,
    name: String,
    #[serde(default)]
    team_id: Option<i64>,
    #[serde(default)]
    workspace_id: Option<i64>,
    #[serde(default)]
    project_id: Option<i64>,
}

impl RawEntity {
    fn into_node(self, kind: NodeKind) -> NodeInfo {
        let parent_id = match kind {
            NodeKind::Team => None,
            NodeKind::Workspace => self.team_id,
            NodeKind::Project => self.workspace_id,
            NodeKind::Dataset => self.project_id,
        };
        NodeInfo::new(self.id, self.name, parent_id)
    }
}

/// API method names and parent key for each container kind.
struct KindMethods {
    list: &'static str,
    add: &'static str,
    parent_field: &'static str,
}

fn methods_for(kind: NodeKind) -> KindMethods {
    match kind {
        NodeKind::Team => KindMethods {
            list: "teams.list",
            add: "teams.add",
            parent_field: "",
        },
        NodeKind::Workspace => KindMethods {
            list: "workspaces.list",
            add: "workspaces.add",
            parent_field: "teamId",
        },
        NodeKind::Project => KindMethods {
            list: "projects.list",
            add: "projects.add",
            parent_field: "workspaceId",
        },
        NodeKind::Dataset => KindMethods {
            list: "datasets.list",
            add: "datasets.add",
            parent_field: "projectId",
        },
    }
}

/// Content hash used by the instance to address image blobs.
pub(crate) fn image_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Platform client for a live instance.
#[derive(Debug)]
pub struct HttpPlatform {
    http: HttpClient,
}

impl HttpPlatform {
    /// Create a client for `address` authenticated with `api_key`.
    ///
    /// No request is made; call [`PlatformApi::check_connection`] to verify
    /// the key.
    pub fn new(address: &str, api_key: &str) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(address, api_key)?,
        })
    }

    /// Fetch every page of a listing method.
    async fn list_all<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1u32;

        loop {
            let mut body = params.clone();
            if let Some(obj) = body.as_object_mut() {
                obj.insert("page".into(), json!(page));
                obj.insert("per_page".into(), json!(NetworkConfig::LIST_PAGE_SIZE));
            }

            let response: Page<T> = self.http.call(method, &body).await?;
            let pages_count = response.pages_count;
            items.extend(response.entities);

            if page >= pages_count {
                break;
            }
            page += 1;
        }

        debug!("{} returned {} entities", method, items.len());
        Ok(items)
    }

    fn name_filter(name: &str) -> Value {
        json!([{ "field": "name", "operator": "=", "value": name }])
    }
}

#[async_trait]
impl PlatformApi for HttpPlatform {
    fn address(&self) -> &str {
        self.http.address()
    }

    async fn check_connection(&self) -> Result<()> {
        let body = json!({ "page": 1, "per_page": 1 });
        self.http
            .call::<_, Page<RawEntity>>("teams.list", &body)
            .await?;
        info!("The connection to {} was successful.", self.address());
        Ok(())
    }

    async fn get_team_by_name(&self, name: &str) -> Result<Option<NodeInfo>> {
        let teams: Vec<RawEntity> = self
            .list_all("teams.list", json!({ "filter": Self::name_filter(name) }))
            .await?;
        Ok(teams
            .into_iter()
            .find(|t| t.name == name)
            .map(|t| t.into_node(NodeKind::Team)))
    }

    async fn create_team(&self, name: &str) -> Result<NodeInfo> {
        let team: RawEntity = self.http.call("teams.add", &json!({ "name": name })).await?;
        Ok(team.into_node(NodeKind::Team))
    }

    async fn list_children(&self, kind: NodeKind, parent_id: i64) -> Result<Vec<NodeInfo>> {
        let methods = methods_for(kind);
        let entities: Vec<RawEntity> = self
            .list_all(methods.list, json!({ methods.parent_field: parent_id }))
            .await?;
        Ok(entities
            .into_iter()
            .map(|mut e| {
                // Some listings omit the parent key.
                match kind {
                    NodeKind::Workspace => e.team_id = e.team_id.or(Some(parent_id)),
                    NodeKind::Project => e.workspace_id = e.workspace_id.or(Some(parent_id)),
                    NodeKind::Dataset => e.project_id = e.project_id.or(Some(parent_id)),
                    NodeKind::Team => {}
                }
                e.into_node(kind)
            })
            .collect())
    }

    async fn get_child_by_name(
        &self,
        kind: NodeKind,
        parent_id: i64,
        name: &str,
    ) -> Result<Option<NodeInfo>> {
        let methods = methods_for(kind);
        let entities: Vec<RawEntity> = self
            .list_all(
                methods.list,
                json!({ methods.parent_field: parent_id, "filter": Self::name_filter(name) }),
            )
            .await?;
        Ok(entities
            .into_iter()
            .find(|e| e.name == name)
            .map(|mut e| {
                match kind {
                    NodeKind::Workspace => e.team_id = Some(parent_id),
                    NodeKind::Project => e.workspace_id = Some(parent_id),
                    NodeKind::Dataset => e.project_id = Some(parent_id),
                    NodeKind::Team => {}
                }
                e.into_node(kind)
            }))
    }

    async fn create_child(&self, kind: NodeKind, parent_id: i64, name: &str) -> Result<NodeInfo> {
        let methods = methods_for(kind);
        let mut body = json!({ methods.parent_field: parent_id, "name": name });
        if kind == NodeKind::Project {
            body["type"] = json!("images");
        }
        let mut entity: RawEntity = self.http.call(methods.add, &body).await?;
        match kind {
            NodeKind::Workspace => entity.team_id = Some(parent_id),
            NodeKind::Project => entity.workspace_id = Some(parent_id),
            NodeKind::Dataset => entity.project_id = Some(parent_id),
            NodeKind::Team => {}
        }
        Ok(entity.into_node(kind))
    }

    async fn get_dataset(&self, dataset_id: i64) -> Result<NodeInfo> {
        let entity: RawEntity = self
            .http
            .call("datasets.info", &json!({ "id": dataset_id }))
            .await?;
        Ok(entity.into_node(NodeKind::Dataset))
    }

    async fn list_images(&self, dataset_id: i64) -> Result<Vec<ImageRecord>> {
        self.list_all("images.list", json!({ "datasetId": dataset_id }))
            .await
    }

    async fn download_images(
        &self,
        dataset_id: i64,
        ids: &[i64],
        paths: &[PathBuf],
    ) -> Result<()> {
        if ids.len() != paths.len() {
            return Err(SyncError::Other(format!(
                "Cannot download {} images to {} paths",
                ids.len(),
                paths.len()
            )));
        }
        if ids.is_empty() {
            return Ok(());
        }

        let parts = self
            .http
            .download_parts(
                "images.bulk.download",
                &json!({ "datasetId": dataset_id, "imageIds": ids }),
            )
            .await?;
        let mut by_id: HashMap<i64, Vec<u8>> = parts
            .into_iter()
            .filter_map(|part| part.name.parse::<i64>().ok().map(|id| (id, part.body)))
            .collect();

        for (id, path) in ids.iter().zip(paths) {
            let bytes = by_id.remove(id).ok_or_else(|| SyncError::NotFound {
                kind: "Image".into(),
                name: id.to_string(),
            })?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SyncError::io_with_path(e, parent))?;
            }
            tokio::fs::write(path, &bytes)
                .await
                .map_err(|e| SyncError::io_with_path(e, path))?;
        }
        debug!("Downloaded {} images from dataset {}", ids.len(), dataset_id);
        Ok(())
    }

    async fn upload_images(
        &self,
        dataset_id: i64,
        names: &[String],
        paths: &[PathBuf],
        metas: &[Map<String, Value>],
    ) -> Result<Vec<ImageRecord>> {
        if names.len() != paths.len() || names.len() != metas.len() {
            return Err(SyncError::Other(format!(
                "Upload lists differ in length: {} names, {} paths, {} metas",
                names.len(),
                paths.len(),
                metas.len()
            )));
        }

        let mut form = Form::new();
        let mut hashes = Vec::with_capacity(paths.len());
        for (name, path) in names.iter().zip(paths) {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| SyncError::io_with_path(e, path))?;
            let hash = image_hash(&bytes);
            form = form.part(hash.clone(), Part::bytes(bytes).file_name(name.clone()));
            hashes.push(hash);
        }
        self.http.post_multipart("images.bulk.upload", form).await?;

        let images: Vec<Value> = names
            .iter()
            .zip(&hashes)
            .zip(metas)
            .map(|((name, hash), meta)| json!({ "title": name, "hash": hash, "meta": meta }))
            .collect();

        let uploaded: Vec<ImageRecord> = self
            .http
            .call(
                "images.bulk.add",
                &json!({ "datasetId": dataset_id, "images": images }),
            )
            .await?;

        if uploaded.len() != names.len() {
            return Err(SyncError::Other(format!(
                "images.bulk.add returned {} records for {} images",
                uploaded.len(),
                names.len()
            )));
        }
        Ok(uploaded)
    }

    async fn download_annotations(
        &self,
        dataset_id: i64,
        image_ids: &[i64],
    ) -> Result<Vec<AnnotationRecord>> {
        self.http
            .call(
                "annotations.bulk.info",
                &json!({ "datasetId": dataset_id, "imageIds": image_ids }),
            )
            .await
    }

    async fn upload_annotations(
        &self,
        dataset_id: i64,
        image_ids: &[i64],
        annotations: &[Annotation],
    ) -> Result<()> {
        let payload: Vec<Value> = image_ids
            .iter()
            .zip(annotations)
            .map(|(id, ann)| json!({ "imageId": id, "annotation": ann }))
            .collect();

        self.http
            .post_json(
                "annotations.bulk.add",
                &json!({ "datasetId": dataset_id, "annotations": payload }),
            )
            .await?;
        Ok(())
    }

    async fn get_project_meta(&self, project_id: i64) -> Result<ProjectMeta> {
        self.http
            .call("projects.meta", &json!({ "id": project_id }))
            .await
    }

    async fn update_project_meta(&self, project_id: i64, meta: &ProjectMeta) -> Result<()> {
        self.http
            .post_json(
                "projects.meta.update",
                &json!({ "id": project_id, "meta": meta }),
            )
            .await?;
        Ok(())
    }

    async fn download_team_file(
        &self,
        team_id: i64,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<()> {
        let bytes = self
            .http
            .download_bytes(
                "file-storage.download",
                &json!({ "teamId": team_id, "path": remote_path }),
            )
            .await?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::io_with_path(e, parent))?;
        }
        tokio::fs::write(local_path, bytes)
            .await
            .map_err(|e| SyncError::io_with_path(e, local_path))?;
        Ok(())
    }
}
