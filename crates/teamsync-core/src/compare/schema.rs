//! Single-class schema check applied to source projects in default mode.
//!
//! A project on the assets instance must have exactly one class, and that
//! class must be named after the project: `"Dog breeds"` expects a class
//! `"dog_breeds"` optionally followed by a `_<suffix>`. Problems are
//! collected into a report; they never stop a compare run.

use crate::config::SyncConfig;
use crate::models::ProjectMeta;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const MORE_THAN_ONE_CLASS: &str = "Project has more than one class.";
pub const INCORRECT_CLASS_NAME: &str = "Class name is incorrect.";

/// One schema problem found in a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaIssue {
    pub timestamp: String,
    pub project_name: String,
    pub error: String,
}

/// Schema problems grouped by workspace name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaReport {
    pub workspaces: IndexMap<String, Vec<SchemaIssue>>,
}

impl SchemaReport {
    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }

    pub fn issue_count(&self) -> usize {
        self.workspaces.values().map(Vec::len).sum()
    }

    pub fn issues_for(&self, workspace: &str) -> &[SchemaIssue] {
        self.workspaces
            .get(workspace)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Record an issue stamped with the current local time.
    pub fn record(&mut self, workspace: &str, project_name: &str, error: &str) {
        let timestamp = chrono::Local::now()
            .format(SyncConfig::SCHEMA_REPORT_TIMESTAMP_FORMAT)
            .to_string();
        self.workspaces
            .entry(workspace.to_string())
            .or_default()
            .push(SchemaIssue {
                timestamp,
                project_name: project_name.to_string(),
                error: error.to_string(),
            });
    }
}

/// Check a project's meta. Returns the problem, if any.
///
/// Projects without classes pass.
pub fn check_project_schema(project_name: &str, meta: &ProjectMeta) -> Option<&'static str> {
    match meta.classes.as_slice() {
        [] => None,
        [class] => {
            if unified_class_name(&class.title) == unified_project_name(project_name) {
                None
            } else {
                Some(INCORRECT_CLASS_NAME)
            }
        }
        _ => Some(MORE_THAN_ONE_CLASS),
    }
}

/// Lowercase, then drop everything from the last underscore on.
fn unified_class_name(title: &str) -> String {
    let lower = title.to_lowercase();
    match lower.rsplit_once('_') {
        Some((head, _)) => head.to_string(),
        None => lower,
    }
}

fn unified_project_name(name: &str) -> String {
    name.replace(' ', "_").to_lowercase()
}
