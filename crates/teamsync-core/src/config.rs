//! Centralized configuration for teamsync.
//!
//! Constants for the pipeline, the network layer and local paths, plus the
//! user-selectable filter settings for a compare/update session.

use crate::error::{Result, SyncError};
use std::collections::BTreeSet;
use std::time::Duration;

/// Pipeline-level configuration.
pub struct SyncConfig;

impl SyncConfig {
    pub const APP_NAME: &'static str = "teamsync";
    pub const BATCH_SIZE: usize = 100;
    pub const DEFAULT_TARGET_TEAM_NAME: &'static str = "primitives";
    pub const DEFAULT_TAG_NAME: &'static str = "inference";
    pub const DEFAULT_ANNOTATION_TYPES: &'static [&'static str] = &["bitmap"];
    pub const FALLBACK_LICENSE: &'static str = "Pexels license";
    pub const SCHEMA_REPORT_TIMESTAMP_FORMAT: &'static str = "%Y-%m-%d_%H-%M-%S";

    /// Geometry types the platform knows about.
    pub const GEOMETRY_TYPES: &'static [&'static str] = &[
        "bitmap",
        "rectangle",
        "polygon",
        "line",
        "point",
        "graph",
        "cuboid",
        "cuboid_3d",
        "point_cloud",
        "alpha_mask",
        "any",
    ];
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);
    pub const API_PREFIX: &'static str = "public/api/v3";
    pub const API_KEY_HEADER: &'static str = "x-api-key";
    pub const LIST_PAGE_SIZE: u32 = 500;
    pub const USER_AGENT: &'static str = "teamsync/0.3";
}

/// Local directory and file names.
pub struct PathsConfig;

impl PathsConfig {
    pub const IMAGES_DIR_NAME: &'static str = "images";
    pub const CHECKPOINT_FILE_NAME: &'static str = "team_differences.json";
    pub const SCHEMA_REPORT_FILE_NAME: &'static str = "error_report.json";
    pub const TARGET_ENV_FILE_NAME: &'static str = "target.env";
    pub const LOCAL_ENV_FILE_NAME: &'static str = "local.env";
    pub const HOME_ENV_FILE_NAME: &'static str = "supervisely.env";
}

/// Known target instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instance {
    Assets,
    Dev,
    App,
}

impl Instance {
    pub const ALL: [Instance; 3] = [Instance::Assets, Instance::Dev, Instance::App];

    pub fn as_str(&self) -> &'static str {
        match self {
            Instance::Assets => "assets",
            Instance::Dev => "dev",
            Instance::App => "app",
        }
    }

    pub fn address(&self) -> &'static str {
        match self {
            Instance::Assets => "https://assets.supervise.ly/",
            Instance::Dev => "https://dev.supervise.ly/",
            Instance::App => "https://app.supervise.ly/",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "assets" => Some(Instance::Assets),
            "dev" => Some(Instance::Dev),
            "app" => Some(Instance::App),
            _ => None,
        }
    }

    /// Resolve a preset name or pass a custom address through.
    pub fn resolve_address(value: &str) -> String {
        match Instance::from_str(value) {
            Some(instance) => instance.address().to_string(),
            None => value.to_string(),
        }
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Filters chosen by the user when not running with default settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomFilter {
    /// `Some` when filtering by annotation type is enabled.
    pub annotation_types: Option<Vec<String>>,
    /// `Some` when filtering by tag name is enabled.
    pub tag_name: Option<String>,
    pub normalize_metadata: bool,
}

/// How candidate images are selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMode {
    /// Assets-instance requirements: default annotation types and tag,
    /// normalized metadata, single-class schema checks.
    Default,
    Custom(CustomFilter),
}

impl Default for FilterMode {
    fn default() -> Self {
        FilterMode::Default
    }
}

/// Filter configuration after validation.
///
/// A `None` field means that filter is disabled. With both disabled every
/// candidate image passes through as "annotated".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedFilter {
    pub annotation_types: Option<BTreeSet<String>>,
    pub tag_name: Option<String>,
}

impl ResolvedFilter {
    pub fn is_pass_through(&self) -> bool {
        self.annotation_types.is_none() && self.tag_name.is_none()
    }
}

/// Settings for one compare/update session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub mode: FilterMode,
    pub target_team_name: String,
    pub batch_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mode: FilterMode::Default,
            target_team_name: SyncConfig::DEFAULT_TARGET_TEAM_NAME.to_string(),
            batch_size: SyncConfig::BATCH_SIZE,
        }
    }
}

impl SyncSettings {
    pub fn custom(filter: CustomFilter, target_team_name: impl Into<String>) -> Self {
        Self {
            mode: FilterMode::Custom(filter),
            target_team_name: target_team_name.into(),
            batch_size: SyncConfig::BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn is_default_mode(&self) -> bool {
        matches!(self.mode, FilterMode::Default)
    }

    pub fn normalize_metadata(&self) -> bool {
        match &self.mode {
            FilterMode::Default => true,
            FilterMode::Custom(filter) => filter.normalize_metadata,
        }
    }

    /// Validate the settings and produce the filter used by the leaf filter.
    pub fn resolve_filter(&self) -> Result<ResolvedFilter> {
        if self.batch_size == 0 {
            return Err(SyncError::validation(
                "batch_size",
                "Batch size must be at least 1.",
            ));
        }
        if self.target_team_name.trim().is_empty() {
            return Err(SyncError::validation(
                "target_team_name",
                "Target team name is not specified.",
            ));
        }

        match &self.mode {
            FilterMode::Default => Ok(ResolvedFilter {
                annotation_types: Some(
                    SyncConfig::DEFAULT_ANNOTATION_TYPES
                        .iter()
                        .map(|t| t.to_string())
                        .collect(),
                ),
                tag_name: Some(SyncConfig::DEFAULT_TAG_NAME.to_string()),
            }),
            FilterMode::Custom(filter) => {
                let annotation_types = match &filter.annotation_types {
                    None => None,
                    Some(types) if types.is_empty() => {
                        return Err(SyncError::validation(
                            "annotation_types",
                            "No annotation types selected.",
                        ));
                    }
                    Some(types) => {
                        if let Some(unknown) = types
                            .iter()
                            .find(|t| !SyncConfig::GEOMETRY_TYPES.contains(&t.as_str()))
                        {
                            return Err(SyncError::validation(
                                "annotation_types",
                                format!("Unknown annotation type: {}", unknown),
                            ));
                        }
                        Some(types.iter().cloned().collect())
                    }
                };

                let tag_name = match &filter.tag_name {
                    None => None,
                    Some(name) if name.trim().is_empty() => {
                        return Err(SyncError::validation(
                            "tag_name",
                            "No tag name was entered.",
                        ));
                    }
                    Some(name) => Some(name.clone()),
                };

                Ok(ResolvedFilter {
                    annotation_types,
                    tag_name,
                })
            }
        }
    }
}
