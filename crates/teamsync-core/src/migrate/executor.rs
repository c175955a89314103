//! Replays a diff tree against the target instance.
//!
//! Per dataset the order is fixed: stage image bytes (annotated first, then
//! tagged), merge the project meta into the target, fetch annotations, then
//! upload images and their annotations batch by batch, and finally remove
//! the staging directory.

use super::metadata::normalize_image_meta;
use super::staging::{check_image_names, StagingDir};
use crate::cancel::CancellationToken;
use crate::diff::{DatasetEntry, DiffTree};
use crate::models::{Annotation, DatasetRef, ImageRecord, ProjectMeta};
use crate::platform::PlatformApi;
use crate::session::{ProgressEvent, RunStatus, SyncSession};
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A dataset left out of the run because its image data was unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedDataset {
    pub workspace: String,
    pub project: String,
    pub dataset: String,
    pub reason: String,
}

/// Result of one update run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub status: RunStatus,
    pub uploaded_annotated_images: usize,
    pub uploaded_tagged_images: usize,
    pub datasets_migrated: usize,
    pub skipped: Vec<SkippedDataset>,
    /// Both filters were disabled; all images count as annotated.
    pub pass_through: bool,
}

impl MigrationReport {
    pub fn summary(&self) -> String {
        let uploaded = if self.pass_through {
            format!("{} images", self.uploaded_annotated_images)
        } else {
            format!(
                "{} annotated images and {} tagged images",
                self.uploaded_annotated_images, self.uploaded_tagged_images
            )
        };
        match self.status {
            RunStatus::Completed => format!("Successfully uploaded {}.", uploaded),
            RunStatus::Cancelled => {
                format!("Uploading of images was cancelled after uploading {}.", uploaded)
            }
        }
    }
}

/// Ids, names, local paths and metas of one image list, index-aligned.
#[derive(Debug, Default)]
struct ImageBatchData {
    ids: Vec<i64>,
    names: Vec<String>,
    paths: Vec<PathBuf>,
    metas: Vec<Map<String, Value>>,
}

impl ImageBatchData {
    fn new(images: &[ImageRecord], staging: &StagingDir, normalize: bool) -> Self {
        let mut data = ImageBatchData::default();
        for image in images {
            data.ids.push(image.id);
            data.names.push(image.name.clone());
            data.paths.push(staging.file_for(&image.name));
            data.metas.push(if normalize {
                normalize_image_meta(&image.meta)
            } else {
                image.meta.clone()
            });
        }
        data
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// `[start, end)` ranges covering `len` items in steps of `batch_size`.
fn batch_ranges(len: usize, batch_size: usize) -> impl Iterator<Item = std::ops::Range<usize>> {
    let step = batch_size.max(1);
    (0..len)
        .step_by(step)
        .map(move |start| start..(start + step).min(len))
}

struct Migrator<'a> {
    session: &'a mut SyncSession,
    source: Arc<dyn PlatformApi>,
    target: Arc<dyn PlatformApi>,
    token: CancellationToken,
    batch_size: usize,
    normalize: bool,
    images_dir: PathBuf,
}

impl<'a> Migrator<'a> {
    async fn run(&mut self, tree: &DiffTree, pass_through: bool) -> Result<MigrationReport> {
        let mut report = MigrationReport {
            status: RunStatus::Completed,
            uploaded_annotated_images: 0,
            uploaded_tagged_images: 0,
            datasets_migrated: 0,
            skipped: Vec::new(),
            pass_through,
        };

        'workspaces: for (workspace, projects) in &tree.workspaces {
            if self.token.is_cancelled() {
                report.status = RunStatus::Cancelled;
                break;
            }
            debug!("Working on a workspace {}.", workspace);

            for (project, datasets) in projects {
                debug!("Working on a project {}.", project);
                for (dataset, diff) in datasets {
                    if self.token.is_cancelled() {
                        debug!(
                            "Uploading of images was interrupted, while working on workspace {}.",
                            workspace
                        );
                        report.status = RunStatus::Cancelled;
                        break 'workspaces;
                    }

                    let entry = DatasetEntry {
                        workspace,
                        project,
                        dataset,
                        diff,
                    };
                    match self.migrate_dataset(entry).await {
                        Ok((annotated, tagged)) => {
                            report.datasets_migrated += 1;
                            self.session.emit(ProgressEvent::DatasetUploaded {
                                workspace: workspace.clone(),
                                project: project.clone(),
                                dataset: dataset.clone(),
                                annotated,
                                tagged,
                            });
                        }
                        Err(e @ SyncError::DataIntegrity { .. }) => {
                            error!("Failed to get images data for dataset {}: {}", dataset, e);
                            report.skipped.push(SkippedDataset {
                                workspace: workspace.clone(),
                                project: project.clone(),
                                dataset: dataset.clone(),
                                reason: e.to_string(),
                            });
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            debug!("Finished uploading projects in workspace {}.", workspace);
            self.session.emit(ProgressEvent::WorkspaceUploaded {
                workspace: workspace.clone(),
            });
        }

        // A cancel that lands during the last dataset is only seen here.
        if self.token.is_cancelled() {
            report.status = RunStatus::Cancelled;
        }
        report.uploaded_annotated_images = self.session.counters.uploaded_annotated_images;
        report.uploaded_tagged_images = self.session.counters.uploaded_tagged_images;
        Ok(report)
    }

    /// Returns the number of annotated and tagged images uploaded.
    async fn migrate_dataset(&mut self, entry: DatasetEntry<'_>) -> Result<(usize, usize)> {
        let diff = entry.diff;
        debug!(
            "Working on a dataset {}. Source dataset ID: {}. Target dataset ID: {}.",
            entry.dataset, diff.source.id, diff.target.id
        );

        check_image_names(
            entry.dataset,
            diff.annotated_images
                .iter()
                .chain(diff.tagged_images.iter())
                .map(|image| image.name.as_str()),
        )?;

        let staging = StagingDir::create(&self.images_dir, entry.dataset)?;
        let annotated = ImageBatchData::new(&diff.annotated_images, &staging, self.normalize);
        let tagged = ImageBatchData::new(&diff.tagged_images, &staging, self.normalize);

        match self
            .transfer(entry.dataset, &diff.source, &diff.target, &annotated, &tagged)
            .await
        {
            Ok(counts) => {
                staging.remove()?;
                debug!("Finished uploading images for dataset {}.", entry.dataset);
                Ok(counts)
            }
            Err(e) => {
                staging.discard();
                Err(e)
            }
        }
    }

    async fn transfer(
        &mut self,
        dataset_name: &str,
        source: &DatasetRef,
        target: &DatasetRef,
        annotated: &ImageBatchData,
        tagged: &ImageBatchData,
    ) -> Result<(usize, usize)> {
        self.download_images(source.id, annotated).await?;
        debug!("Finished downloading annotated images for dataset {}.", dataset_name);
        self.download_images(source.id, tagged).await?;
        debug!("Finished downloading tagged images for dataset {}.", dataset_name);

        let meta = self.sync_project_meta(source, target).await?;
        debug!("Retrieved and updated project meta.");

        let annotated_annotations = self
            .download_annotations(dataset_name, source.id, &annotated.ids, &meta)
            .await?;
        let tagged_annotations = self
            .download_annotations(dataset_name, source.id, &tagged.ids, &meta)
            .await?;

        let uploaded_annotated = self
            .upload_with_annotations(target.id, annotated, &annotated_annotations)
            .await?;
        self.session.counters.uploaded_annotated_images += uploaded_annotated;
        debug!(
            "Uploaded {} annotated images with annotations to dataset {}.",
            uploaded_annotated, dataset_name
        );

        let uploaded_tagged = self
            .upload_with_annotations(target.id, tagged, &tagged_annotations)
            .await?;
        self.session.counters.uploaded_tagged_images += uploaded_tagged;
        debug!(
            "Uploaded {} tagged images with annotations to dataset {}.",
            uploaded_tagged, dataset_name
        );

        Ok((uploaded_annotated, uploaded_tagged))
    }

    async fn download_images(&self, source_dataset_id: i64, images: &ImageBatchData) -> Result<()> {
        for range in batch_ranges(images.len(), self.batch_size) {
            self.source
                .download_images(
                    source_dataset_id,
                    &images.ids[range.clone()],
                    &images.paths[range],
                )
                .await?;
        }
        Ok(())
    }

    /// Merge the source project meta into the target project and return the
    /// meta annotations are bound to.
    async fn sync_project_meta(
        &self,
        source: &DatasetRef,
        target: &DatasetRef,
    ) -> Result<ProjectMeta> {
        let source_project_id = self.project_id_of(self.source.as_ref(), source).await?;
        let target_project_id = self.project_id_of(self.target.as_ref(), target).await?;

        let source_meta = self.source.get_project_meta(source_project_id).await?;
        let target_meta = self.target.get_project_meta(target_project_id).await?;
        let merged = target_meta.merged_with(&source_meta);

        if merged != target_meta {
            self.target
                .update_project_meta(target_project_id, &merged)
                .await?;
            debug!("Updated project meta of target project {}.", target_project_id);
        }
        Ok(merged)
    }

    async fn project_id_of(&self, api: &dyn PlatformApi, dataset: &DatasetRef) -> Result<i64> {
        if dataset.project_id > 0 {
            return Ok(dataset.project_id);
        }
        let info = api.get_dataset(dataset.id).await?;
        info.parent_id.ok_or_else(|| SyncError::NotFound {
            kind: "Project".to_string(),
            name: format!("of dataset {}", dataset.id),
        })
    }

    /// Fetch annotations in batches and return them in the order of
    /// `image_ids`, bound to `meta`.
    async fn download_annotations(
        &self,
        dataset_name: &str,
        source_dataset_id: i64,
        image_ids: &[i64],
        meta: &ProjectMeta,
    ) -> Result<Vec<Annotation>> {
        let mut by_id: HashMap<i64, Annotation> = HashMap::with_capacity(image_ids.len());
        for range in batch_ranges(image_ids.len(), self.batch_size) {
            let records = self
                .source
                .download_annotations(source_dataset_id, &image_ids[range])
                .await?;
            for record in records {
                by_id.insert(record.image_id, record.annotation);
            }
        }

        let annotations = image_ids
            .iter()
            .map(|id| {
                let annotation = by_id.remove(id).ok_or_else(|| SyncError::DataIntegrity {
                    dataset: dataset_name.to_string(),
                    message: format!("no annotation returned for image {}", id),
                })?;
                annotation.materialize(meta)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Downloaded {} annotations.", annotations.len());
        Ok(annotations)
    }

    /// Upload images batch by batch, attaching each batch's annotations to
    /// the ids the target returned for that batch.
    async fn upload_with_annotations(
        &self,
        target_dataset_id: i64,
        images: &ImageBatchData,
        annotations: &[Annotation],
    ) -> Result<usize> {
        let mut uploaded = 0;
        for range in batch_ranges(images.len(), self.batch_size) {
            let records = self
                .target
                .upload_images(
                    target_dataset_id,
                    &images.names[range.clone()],
                    &images.paths[range.clone()],
                    &images.metas[range.clone()],
                )
                .await?;

            if records.len() != range.len() {
                return Err(SyncError::Other(format!(
                    "Target returned {} images for a batch of {}",
                    records.len(),
                    range.len()
                )));
            }

            let ids: Vec<i64> = records.iter().map(|record| record.id).collect();
            self.target
                .upload_annotations(target_dataset_id, &ids, &annotations[range])
                .await?;
            uploaded += ids.len();
            debug!("Uploaded {} images to dataset {}.", ids.len(), target_dataset_id);
        }
        Ok(uploaded)
    }
}

/// Replay `tree` against the session's target.
///
/// The upload token is reset at the start and polled before every
/// workspace and dataset; a dataset in progress always finishes. Datasets
/// whose image data fails integrity checks are skipped and listed in the
/// report. Any other error aborts the run.
pub async fn migrate(session: &mut SyncSession, tree: &DiffTree) -> Result<MigrationReport> {
    let filter = session.settings().resolve_filter()?;
    let batch_size = session.settings().batch_size;
    let normalize = session.settings().normalize_metadata();
    debug!("Normalize image metadata is set to {}.", normalize);

    session.counters.uploaded_annotated_images = 0;
    session.counters.uploaded_tagged_images = 0;
    let token = session.upload_token();
    token.reset();

    info!(
        "Uploading {} annotated and {} tagged images.",
        tree.annotated_count(),
        tree.tagged_count()
    );

    let mut migrator = Migrator {
        source: session.source_handle(),
        target: session.target_handle(),
        images_dir: session.images_dir(),
        session,
        token,
        batch_size,
        normalize,
    };
    let report = migrator.run(tree, filter.is_pass_through()).await?;

    if report.status == RunStatus::Cancelled {
        warn!("Uploading of images was interrupted.");
    }
    if !report.skipped.is_empty() {
        warn!("{} datasets were skipped.", report.skipped.len());
    }
    info!("{}", report.summary());
    Ok(report)
}
