//! Per-dataset local staging directory for downloaded image files.

use crate::{Result, SyncError};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// `<images_dir>/<dataset name>`; removed once the dataset is uploaded.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Create (or reuse) the staging directory for `dataset_name`.
    pub fn create(images_dir: &Path, dataset_name: &str) -> Result<Self> {
        let path = images_dir.join(sanitize_component(dataset_name));
        fs::create_dir_all(&path).map_err(|e| SyncError::io_with_path(e, &path))?;
        debug!("Created staging directory {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Local file path for an image name.
    pub fn file_for(&self, image_name: &str) -> PathBuf {
        self.path.join(image_name)
    }

    /// Delete the directory and everything in it.
    pub fn remove(self) -> Result<()> {
        if self.path.exists() {
            fs::remove_dir_all(&self.path).map_err(|e| SyncError::io_with_path(e, &self.path))?;
            debug!("Removed staging directory {}", self.path.display());
        }
        Ok(())
    }

    /// Removal on an error path; failures are only logged.
    pub fn discard(self) {
        let path = self.path.clone();
        if let Err(e) = self.remove() {
            warn!("Failed to remove staging directory {}: {}", path.display(), e);
        }
    }
}

/// Reject image names that cannot be staged as distinct files.
pub fn check_image_names<'a>(
    dataset_name: &str,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(SyncError::DataIntegrity {
                dataset: dataset_name.to_string(),
                message: format!("invalid image name '{}'", name),
            });
        }
        if !seen.insert(name) {
            return Err(SyncError::DataIntegrity {
                dataset: dataset_name.to_string(),
                message: format!("duplicate image name '{}'", name),
            });
        }
    }
    Ok(())
}

fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_remove() {
        let dir = TempDir::new().unwrap();
        let staging = StagingDir::create(dir.path(), "train").unwrap();
        fs::write(staging.file_for("a.jpg"), b"x").unwrap();
        assert!(staging.path().ends_with("train"));

        let path = staging.path().to_path_buf();
        staging.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_dataset_name_is_one_component() {
        let dir = TempDir::new().unwrap();
        let staging = StagingDir::create(dir.path(), "a/b").unwrap();
        assert_eq!(staging.path(), dir.path().join("a_b"));

        let staging = StagingDir::create(dir.path(), "..").unwrap();
        assert_eq!(staging.path(), dir.path().join("_"));
    }

    #[test]
    fn test_check_image_names() {
        assert!(check_image_names("ds", ["a.jpg", "b.jpg"]).is_ok());

        let err = check_image_names("ds", ["a.jpg", "a.jpg"]).unwrap_err();
        assert!(matches!(err, SyncError::DataIntegrity { .. }));

        assert!(check_image_names("ds", ["../etc/passwd"]).is_err());
        assert!(check_image_names("ds", [""]).is_err());
    }
}
