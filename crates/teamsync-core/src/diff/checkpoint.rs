//! Durable JSON persistence for the diff tree and the schema report.
//!
//! Writes go to a temp file next to the target, are synced, then renamed
//! over the target, so a crash never leaves a half-written checkpoint.
//! Output is indented with four spaces and keeps non-ASCII text literal.

use super::DiffTree;
use crate::{Result, SyncError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process;
use tracing::debug;

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist, or an error if parsing fails.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path).map_err(|e| SyncError::Io {
        message: format!("Failed to read {}", path.display()),
        path: Some(path.to_path_buf()),
        source: Some(e),
    })?;

    let data: T = serde_json::from_str(&contents).map_err(|e| SyncError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Write data to a JSON file atomically, creating parent directories.
pub fn write_json_pretty<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| SyncError::Io {
                message: format!("Failed to create directory {}", parent.display()),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }
    }

    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    data.serialize(&mut serializer).map_err(|e| SyncError::Json {
        message: format!("Failed to serialize {}: {}", path.display(), e),
        source: Some(e),
    })?;

    let temp_path = path.with_extension(format!("json.{}.tmp", process::id()));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| SyncError::Io {
                message: format!("Failed to create temp file {}", temp_path.display()),
                path: Some(temp_path.clone()),
                source: Some(e),
            })?;

        file.write_all(&buffer).map_err(|e| SyncError::Io {
            message: format!("Failed to write temp file {}", temp_path.display()),
            path: Some(temp_path.clone()),
            source: Some(e),
        })?;

        file.sync_all().map_err(|e| SyncError::Io {
            message: format!("Failed to sync temp file {}", temp_path.display()),
            path: Some(temp_path.clone()),
            source: Some(e),
        })?;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        SyncError::Io {
            message: format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                path.display()
            ),
            path: Some(path.to_path_buf()),
            source: Some(e),
        }
    })?;

    debug!("Wrote {}", path.display());
    Ok(())
}

/// Persist a diff tree.
pub fn save_checkpoint(path: &Path, tree: &DiffTree) -> Result<()> {
    write_json_pretty(path, tree)
}

/// Load a diff tree written by [`save_checkpoint`].
pub fn load_checkpoint(path: &Path) -> Result<DiffTree> {
    read_json(path)?.ok_or_else(|| SyncError::NotFound {
        kind: "Checkpoint".to_string(),
        name: path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DatasetDiff;
    use crate::models::{DatasetRef, ImageRecord};
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_tree() -> DiffTree {
        let mut diff = DatasetDiff::new(
            DatasetRef {
                id: 11,
                name: "Собаки".into(),
                project_id: 3,
            },
            DatasetRef {
                id: 211,
                name: "Собаки".into(),
                project_id: 203,
            },
        );
        let meta = json!({"URL": "https://example.com/x.jpg", "Author": null, "License": "CC0"});
        diff.annotated_images
            .push(ImageRecord::new(5, "x.jpg").with_meta(meta.as_object().unwrap().clone()));
        diff.tagged_images.push(ImageRecord::new(6, "y.jpg"));

        let mut tree = DiffTree::new();
        tree.workspaces
            .entry("Animals".into())
            .or_default()
            .entry("Dog breeds".into())
            .or_default()
            .insert("Собаки".into(), diff);
        tree
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("team_differences.json");
        let tree = sample_tree();

        save_checkpoint(&path, &tree).unwrap();
        let loaded = load_checkpoint(&path).unwrap();
        assert_eq!(loaded, tree);
    }

    #[test]
    fn test_checkpoint_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("team_differences.json");
        save_checkpoint(&path, &sample_tree()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("Собаки"), "non-ASCII must stay literal");
        assert!(text.starts_with("{\n    \"Animals\""));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("team_differences.json");
        save_checkpoint(&path, &sample_tree()).unwrap();
        save_checkpoint(&path, &DiffTree::new()).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert!(load_checkpoint(&path).unwrap().is_empty());
    }

    #[test]
    fn test_missing_checkpoint_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = load_checkpoint(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[test]
    fn test_corrupt_checkpoint_is_json_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("team_differences.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_checkpoint(&path).unwrap_err(),
            SyncError::Json { .. }
        ));
    }
}
