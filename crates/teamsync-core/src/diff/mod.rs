//! The diff tree produced by compare and consumed by update.
//!
//! The tree is keyed by name at every level and keeps insertion order, which
//! is the order the source instance listed its workspaces, projects and
//! datasets. Only datasets are leaves; a workspace or project with no
//! datasets simply has an empty map.

mod checkpoint;

pub use checkpoint::{load_checkpoint, read_json, save_checkpoint, write_json_pretty};

use crate::models::{DatasetRef, ImageRecord};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Pending work for one source/target dataset pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDiff {
    pub source: DatasetRef,
    pub target: DatasetRef,
    /// Images that matched the annotation-type filter.
    pub annotated_images: Vec<ImageRecord>,
    /// Images that matched only the tag filter.
    pub tagged_images: Vec<ImageRecord>,
}

impl DatasetDiff {
    pub fn new(source: DatasetRef, target: DatasetRef) -> Self {
        Self {
            source,
            target,
            annotated_images: Vec::new(),
            tagged_images: Vec::new(),
        }
    }

    pub fn image_count(&self) -> usize {
        self.annotated_images.len() + self.tagged_images.len()
    }
}

/// Datasets of one project, by dataset name.
pub type ProjectDiff = IndexMap<String, DatasetDiff>;

/// Projects of one workspace, by project name.
pub type WorkspaceDiff = IndexMap<String, ProjectDiff>;

/// Workspace → project → dataset → [`DatasetDiff`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiffTree {
    pub workspaces: IndexMap<String, WorkspaceDiff>,
}

/// One leaf of a [`DiffTree`] together with its path.
#[derive(Debug, Clone, Copy)]
pub struct DatasetEntry<'a> {
    pub workspace: &'a str,
    pub project: &'a str,
    pub dataset: &'a str,
    pub diff: &'a DatasetDiff,
}

impl DiffTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }

    /// Walk every dataset leaf in tree order.
    pub fn datasets(&self) -> impl Iterator<Item = DatasetEntry<'_>> {
        self.workspaces.iter().flat_map(|(workspace, projects)| {
            projects.iter().flat_map(move |(project, datasets)| {
                datasets.iter().map(move |(dataset, diff)| DatasetEntry {
                    workspace: workspace.as_str(),
                    project: project.as_str(),
                    dataset: dataset.as_str(),
                    diff,
                })
            })
        })
    }

    pub fn annotated_count(&self) -> usize {
        self.datasets().map(|e| e.diff.annotated_images.len()).sum()
    }

    pub fn tagged_count(&self) -> usize {
        self.datasets().map(|e| e.diff.tagged_images.len()).sum()
    }
}
