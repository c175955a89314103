//! Compare stage: walk the source team and build the diff tree.

pub mod filter;
pub mod schema;
mod walker;

pub use filter::{classify, filter_images, FilteredImages, ImageClass};
pub use schema::{check_project_schema, SchemaIssue, SchemaReport};

use crate::diff::DiffTree;
use crate::models::NodeInfo;
use crate::platform::PlatformApi;
use crate::session::{RunStatus, SyncSession};
use crate::Result;
use tracing::{debug, info, warn};
use walker::TeamWalker;

/// Result of one compare run.
#[derive(Debug, Clone)]
pub struct CompareOutcome {
    pub tree: DiffTree,
    pub schema_report: SchemaReport,
    pub status: RunStatus,
    pub annotated_images: usize,
    pub tagged_images: usize,
    /// Both filters were disabled; every new image counts as annotated.
    pub pass_through: bool,
}

impl CompareOutcome {
    /// Human-readable result line.
    pub fn summary(&self) -> String {
        let found = if self.pass_through {
            format!("Found {} new images.", self.annotated_images)
        } else {
            format!(
                "Found {} new annotated images and {} new tagged images.",
                self.annotated_images, self.tagged_images
            )
        };
        match self.status {
            RunStatus::Completed => found,
            RunStatus::Cancelled => format!("The comparison was canceled. {}", found),
        }
    }
}

/// Resolve the target team by name, creating it when missing.
pub async fn get_or_create_team(target: &dyn PlatformApi, name: &str) -> Result<NodeInfo> {
    if let Some(team) = target.get_team_by_name(name).await? {
        debug!("Team {} is found in target instance with ID {}.", name, team.id);
        return Ok(team);
    }
    debug!("Team {} is not found in target instance. Will create it.", name);
    let team = target.create_team(name).await?;
    debug!("Team {} is created in target instance with ID {}.", name, team.id);
    Ok(team)
}

/// Compare the source team `source_team_id` against the target team named
/// in the session settings.
///
/// Settings are validated before anything is read or created. Counters are
/// reset at the start of every run. When the compare token is cancelled the
/// walk stops at the next workspace, project or dataset boundary and the
/// partial tree is returned with [`RunStatus::Cancelled`].
pub async fn compare_team(session: &mut SyncSession, source_team_id: i64) -> Result<CompareOutcome> {
    let filter = session.settings().resolve_filter()?;
    let pass_through = filter.is_pass_through();
    let target_team_name = session.settings().target_team_name.clone();

    session.counters.reset();
    session.compare_token().reset();
    info!(
        "Comparing source team {} with target team {}.",
        source_team_id, target_team_name
    );

    let target = session.target_handle();
    let target_team = get_or_create_team(target.as_ref(), &target_team_name).await?;

    let mut walker = TeamWalker::new(session, filter);
    let tree = walker.walk_team(source_team_id, target_team.id).await?;
    let status = if walker.was_cancelled() {
        RunStatus::Cancelled
    } else {
        RunStatus::Completed
    };
    let schema_report = std::mem::take(&mut walker.report);
    drop(walker);

    if status == RunStatus::Cancelled {
        warn!("The comparison was canceled.");
    }
    if !schema_report.is_empty() {
        warn!(
            "{} projects failed the schema check.",
            schema_report.issue_count()
        );
    }

    let outcome = CompareOutcome {
        tree,
        schema_report,
        status,
        annotated_images: session.counters.annotated_images,
        tagged_images: session.counters.tagged_images,
        pass_through,
    };
    info!("{}", outcome.summary());
    Ok(outcome)
}
