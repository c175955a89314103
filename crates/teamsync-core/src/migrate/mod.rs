//! Update stage: upload the images recorded in a diff tree.

mod executor;
pub mod metadata;
pub mod staging;

pub use executor::{migrate, MigrationReport, SkippedDataset};
pub use metadata::normalize_image_meta;
pub use staging::StagingDir;
