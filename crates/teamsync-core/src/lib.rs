//! Teamsync Core - headless library for synchronizing image datasets between
//! two installations of a hierarchical annotation platform.
//!
//! A run has two stages:
//! - **compare** walks a source team (workspace → project → dataset), makes
//!   sure every container exists in the target team, filters the images the
//!   target is missing and writes the result to a JSON checkpoint.
//! - **update** replays the checkpoint: it stages image bytes locally, merges
//!   project metas and uploads images with their annotations in batches.
//!
//! Both stages run against the [`PlatformApi`] trait; [`HttpPlatform`] talks
//! to a live instance and [`MemoryPlatform`] keeps one in memory.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use teamsync_core::{credentials, HttpPlatform, SyncSession, SyncSettings};
//!
//! #[tokio::main]
//! async fn main() -> teamsync_core::Result<()> {
//!     let source = HttpPlatform::new("https://dev.supervise.ly/", "source-key")?;
//!     let target = credentials::connect_target(&credentials::Credentials::new(
//!         "Assets",
//!         "target-key",
//!     ))
//!     .await?;
//!
//!     let mut session = SyncSession::new(
//!         Arc::new(source),
//!         Arc::new(target),
//!         SyncSettings::default(),
//!         "tmp",
//!     );
//!
//!     let outcome = session.compare_and_save(8).await?;
//!     println!("{}", outcome.summary());
//!
//!     let report = session.update_from_checkpoint().await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod compare;
pub mod config;
pub mod credentials;
pub mod diff;
pub mod error;
pub mod migrate;
pub mod models;
pub mod network;
pub mod platform;
pub mod session;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use compare::{CompareOutcome, SchemaReport};
pub use config::{CustomFilter, FilterMode, Instance, ResolvedFilter, SyncConfig, SyncSettings};
pub use diff::{DatasetDiff, DiffTree};
pub use error::{Result, SyncError};
pub use migrate::{MigrationReport, SkippedDataset};
pub use models::{Annotation, DatasetRef, ImageRecord, NodeInfo, NodeKind, ProjectMeta};
pub use platform::{HttpPlatform, MemoryPlatform, PlatformApi};
pub use session::{ProgressCallback, ProgressEvent, RunCounters, RunStatus, SyncSession};
