//! Recursive comparison of the source team against the target team.
//!
//! Missing target containers are created on the way down, so after a
//! compare every source workspace, project and dataset that was visited has
//! a same-named counterpart in the target.

use super::filter::filter_images;
use super::schema::{check_project_schema, SchemaReport};
use crate::cancel::CancellationToken;
use crate::config::ResolvedFilter;
use crate::diff::{DatasetDiff, DiffTree, ProjectDiff, WorkspaceDiff};
use crate::models::{DatasetRef, NodeInfo, NodeKind};
use crate::platform::{get_or_create_child, PlatformApi};
use crate::session::{ProgressEvent, SyncSession};
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

pub(crate) struct TeamWalker<'a> {
    session: &'a mut SyncSession,
    source: Arc<dyn PlatformApi>,
    target: Arc<dyn PlatformApi>,
    filter: ResolvedFilter,
    token: CancellationToken,
    pub(crate) report: SchemaReport,
    cancelled: bool,
}

impl<'a> TeamWalker<'a> {
    pub(crate) fn new(session: &'a mut SyncSession, filter: ResolvedFilter) -> Self {
        Self {
            source: session.source_handle(),
            target: session.target_handle(),
            token: session.compare_token(),
            session,
            filter,
            report: SchemaReport::default(),
            cancelled: false,
        }
    }

    pub(crate) fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Checked before every workspace, project and dataset.
    fn should_stop(&mut self) -> bool {
        if self.token.is_cancelled() {
            self.cancelled = true;
        }
        self.cancelled
    }

    pub(crate) async fn walk_team(
        &mut self,
        source_team_id: i64,
        target_team_id: i64,
    ) -> Result<DiffTree> {
        let workspaces = self
            .source
            .list_children(NodeKind::Workspace, source_team_id)
            .await?;
        debug!(
            "Found {} workspaces in source team, starting workspace comparison.",
            workspaces.len()
        );

        let mut tree = DiffTree::new();
        for workspace in &workspaces {
            if self.should_stop() {
                info!("Comparison cancelled before workspace {}.", workspace.name);
                break;
            }
            let diff = self.workspace_difference(workspace, target_team_id).await?;
            tree.workspaces.insert(workspace.name.clone(), diff);
            self.session.emit(ProgressEvent::WorkspaceCompared {
                workspace: workspace.name.clone(),
            });
        }

        if self.token.is_cancelled() {
            self.cancelled = true;
        }
        debug!(
            "Finished workspaces comparison. Found new {} annotated images and {} tagged images.",
            self.session.counters.annotated_images, self.session.counters.tagged_images
        );
        Ok(tree)
    }

    async fn workspace_difference(
        &mut self,
        workspace: &NodeInfo,
        target_team_id: i64,
    ) -> Result<WorkspaceDiff> {
        debug!("Working on a workspace {}.", workspace.name);
        let (target_workspace, _) = get_or_create_child(
            self.target.as_ref(),
            NodeKind::Workspace,
            target_team_id,
            &workspace.name,
        )
        .await?;

        let projects = self
            .source
            .list_children(NodeKind::Project, workspace.id)
            .await?;
        debug!(
            "Found {} projects in source workspace, starting project comparison.",
            projects.len()
        );
        self.session.emit(ProgressEvent::WorkspaceStarted {
            workspace: workspace.name.clone(),
            projects: projects.len(),
        });

        let mut diff = WorkspaceDiff::new();
        for project in &projects {
            if self.should_stop() {
                break;
            }
            let project_diff = self
                .project_difference(&workspace.name, project, target_workspace.id)
                .await?;
            diff.insert(project.name.clone(), project_diff);
            self.session.emit(ProgressEvent::ProjectCompared {
                workspace: workspace.name.clone(),
                project: project.name.clone(),
            });
        }

        Ok(diff)
    }

    async fn project_difference(
        &mut self,
        workspace_name: &str,
        project: &NodeInfo,
        target_workspace_id: i64,
    ) -> Result<ProjectDiff> {
        debug!("Working on a project {}.", project.name);

        if self.session.settings().is_default_mode() {
            let meta = self.source.get_project_meta(project.id).await?;
            if let Some(problem) = check_project_schema(&project.name, &meta) {
                error!(
                    "Default settings are enabled, but project {} fails the schema check: {}",
                    project.name, problem
                );
                self.report.record(workspace_name, &project.name, problem);
            }
        }

        let (target_project, _) = get_or_create_child(
            self.target.as_ref(),
            NodeKind::Project,
            target_workspace_id,
            &project.name,
        )
        .await?;

        let datasets = self
            .source
            .list_children(NodeKind::Dataset, project.id)
            .await?;
        debug!(
            "Found {} datasets in source project, starting dataset comparison.",
            datasets.len()
        );

        let mut diff = ProjectDiff::new();
        for dataset in &datasets {
            if self.should_stop() {
                break;
            }
            let dataset_diff = self
                .dataset_difference(workspace_name, &project.name, dataset, target_project.id)
                .await?;
            diff.insert(dataset.name.clone(), dataset_diff);
        }

        Ok(diff)
    }

    async fn dataset_difference(
        &mut self,
        workspace_name: &str,
        project_name: &str,
        dataset: &NodeInfo,
        target_project_id: i64,
    ) -> Result<DatasetDiff> {
        let (target_dataset, _) = get_or_create_child(
            self.target.as_ref(),
            NodeKind::Dataset,
            target_project_id,
            &dataset.name,
        )
        .await?;

        let source_images = self.source.list_images(dataset.id).await?;
        debug!("Found {} images in source dataset.", source_images.len());
        let target_images = self.target.list_images(target_dataset.id).await?;
        debug!("Found {} images in target dataset.", target_images.len());

        let existing: HashSet<&str> = target_images.iter().map(|i| i.name.as_str()).collect();
        let new_images: Vec<_> = source_images
            .into_iter()
            .filter(|image| !existing.contains(image.name.as_str()))
            .collect();
        debug!(
            "Found {} new images in dataset {}.",
            new_images.len(),
            dataset.name
        );

        let batch_size = self.session.settings().batch_size;
        let filtered = filter_images(
            self.source.as_ref(),
            dataset.id,
            &new_images,
            &self.filter,
            batch_size,
        )
        .await?;

        self.session.counters.annotated_images += filtered.annotated.len();
        self.session.counters.tagged_images += filtered.tagged.len();
        self.session.emit(ProgressEvent::DatasetCompared {
            workspace: workspace_name.to_string(),
            project: project_name.to_string(),
            dataset: dataset.name.clone(),
            annotated: filtered.annotated.len(),
            tagged: filtered.tagged.len(),
        });

        let mut diff = DatasetDiff::new(
            DatasetRef::from(dataset),
            DatasetRef::from(&target_dataset),
        );
        diff.annotated_images = filtered.annotated;
        diff.tagged_images = filtered.tagged;
        Ok(diff)
    }
}
