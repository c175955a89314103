//! Run context for compare and update.
//!
//! A [`SyncSession`] owns everything one user session needs: both platform
//! connections, the filter settings, running counters, the two cancellation
//! tokens and the local work directory. Pipeline stages receive it
//! explicitly, so several sessions can coexist in one process.

use crate::cancel::CancellationToken;
use crate::compare::{self, CompareOutcome};
use crate::config::{PathsConfig, SyncSettings};
use crate::diff::{self, DiffTree};
use crate::migrate::{self, MigrationReport};
use crate::platform::PlatformApi;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Terminal status of a compare or update run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

/// Running counters shown while a session works.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub annotated_images: usize,
    pub tagged_images: usize,
    pub uploaded_annotated_images: usize,
    pub uploaded_tagged_images: usize,
}

impl RunCounters {
    pub fn reset(&mut self) {
        *self = RunCounters::default();
    }
}

/// Progress notifications emitted at the same boundaries where
/// cancellation is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    WorkspaceStarted {
        workspace: String,
        projects: usize,
    },
    DatasetCompared {
        workspace: String,
        project: String,
        dataset: String,
        annotated: usize,
        tagged: usize,
    },
    ProjectCompared {
        workspace: String,
        project: String,
    },
    WorkspaceCompared {
        workspace: String,
    },
    DatasetUploaded {
        workspace: String,
        project: String,
        dataset: String,
        annotated: usize,
        tagged: usize,
    },
    WorkspaceUploaded {
        workspace: String,
    },
}

/// Callback invoked synchronously for every [`ProgressEvent`].
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Everything a compare/update session needs.
pub struct SyncSession {
    source: Arc<dyn PlatformApi>,
    target: Arc<dyn PlatformApi>,
    settings: SyncSettings,
    work_dir: PathBuf,
    pub(crate) counters: RunCounters,
    compare_token: CancellationToken,
    upload_token: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl SyncSession {
    /// Create a session. `work_dir` holds the checkpoint, the schema report
    /// and the per-dataset image staging directories.
    pub fn new(
        source: Arc<dyn PlatformApi>,
        target: Arc<dyn PlatformApi>,
        settings: SyncSettings,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            target,
            settings,
            work_dir: work_dir.into(),
            counters: RunCounters::default(),
            compare_token: CancellationToken::new(),
            upload_token: CancellationToken::new(),
            progress: None,
        }
    }

    /// Attach a progress callback.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn source(&self) -> &dyn PlatformApi {
        self.source.as_ref()
    }

    pub fn target(&self) -> &dyn PlatformApi {
        self.target.as_ref()
    }

    pub(crate) fn source_handle(&self) -> Arc<dyn PlatformApi> {
        Arc::clone(&self.source)
    }

    pub(crate) fn target_handle(&self) -> Arc<dyn PlatformApi> {
        Arc::clone(&self.target)
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut SyncSettings {
        &mut self.settings
    }

    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Token polled by compare runs. Clone it to cancel from elsewhere.
    pub fn compare_token(&self) -> CancellationToken {
        self.compare_token.clone()
    }

    /// Token polled by update runs. Clone it to cancel from elsewhere.
    pub fn upload_token(&self) -> CancellationToken {
        self.upload_token.clone()
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.work_dir.join(PathsConfig::CHECKPOINT_FILE_NAME)
    }

    pub fn schema_report_path(&self) -> PathBuf {
        self.work_dir.join(PathsConfig::SCHEMA_REPORT_FILE_NAME)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.work_dir.join(PathsConfig::IMAGES_DIR_NAME)
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        if let Some(callback) = &self.progress {
            callback(&event);
        }
    }

    /// Compute the diff tree between a source team and the target team named
    /// in the settings. Nothing is written to disk.
    pub async fn compare(&mut self, source_team_id: i64) -> Result<CompareOutcome> {
        compare::compare_team(self, source_team_id).await
    }

    /// Compare, then write the checkpoint and the schema report into the work
    /// directory. Both files are replaced on every run; a clean compare
    /// leaves an empty report.
    pub async fn compare_and_save(&mut self, source_team_id: i64) -> Result<CompareOutcome> {
        let outcome = self.compare(source_team_id).await?;

        let checkpoint = self.checkpoint_path();
        diff::save_checkpoint(&checkpoint, &outcome.tree)?;
        info!("Team differences are saved to {}.", checkpoint.display());

        let report_path = self.schema_report_path();
        diff::write_json_pretty(&report_path, &outcome.schema_report)?;
        info!("Schema report is saved to {}.", report_path.display());

        Ok(outcome)
    }

    /// Replay a diff tree against the target.
    pub async fn migrate(&mut self, tree: &DiffTree) -> Result<MigrationReport> {
        migrate::migrate(self, tree).await
    }

    /// Load the checkpoint written by the last compare and replay it.
    ///
    /// The checkpoint is not validated against the live target; replaying a
    /// stale file can upload images a second time.
    pub async fn update_from_checkpoint(&mut self) -> Result<MigrationReport> {
        let tree = diff::load_checkpoint(&self.checkpoint_path())?;
        info!("Successfully loaded team differences checkpoint.");
        self.migrate(&tree).await
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("source", &self.source.address())
            .field("target", &self.target.address())
            .field("settings", &self.settings)
            .field("work_dir", &self.work_dir)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}
