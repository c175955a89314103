//! Teamsync CLI - compare a source team with a target instance and upload
//! the missing images.
//!
//! Source credentials come from `local.env` / `~/supervisely.env`
//! (`SERVER_ADDRESS`, `API_TOKEN`, `TEAM_ID`). Target credentials come from
//! the command line, the environment, or a `target.env` stored in the source
//! team files.

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use teamsync_core::credentials::{self, Credentials};
use teamsync_core::{
    CancellationToken, CustomFilter, HttpPlatform, PlatformApi, ProgressEvent, SyncConfig,
    SyncError, SyncSession, SyncSettings,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "teamsync")]
#[command(about = "Compare two platform instances and migrate filtered images")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Directory for the checkpoint, the schema report and staged images
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Target instance: Assets, Dev, App or a full address
    #[arg(long, global = true, env = credentials::TARGET_ADDRESS_VAR)]
    target_address: Option<String>,

    /// Target API key
    #[arg(long, global = true, env = credentials::TARGET_TOKEN_VAR, hide_env_values = true)]
    target_key: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    filter: FilterArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct FilterArgs {
    /// Use custom filters instead of the assets-instance defaults
    #[arg(long, global = true)]
    custom: bool,

    /// Annotation geometry types to select (custom mode)
    #[arg(long, global = true, value_delimiter = ',')]
    annotation_types: Option<Vec<String>>,

    /// Image tag to select (custom mode)
    #[arg(long, global = true)]
    tag: Option<String>,

    /// Normalize image metadata to URL/Author/License (custom mode)
    #[arg(long, global = true)]
    normalize_metadata: bool,

    /// Name of the team in the target instance
    #[arg(long, global = true, default_value = SyncConfig::DEFAULT_TARGET_TEAM_NAME)]
    team_name: String,

    /// Images per API batch
    #[arg(long, global = true, default_value_t = SyncConfig::BATCH_SIZE)]
    batch_size: usize,
}

impl FilterArgs {
    fn settings(&self) -> SyncSettings {
        if self.custom {
            SyncSettings::custom(
                CustomFilter {
                    annotation_types: self.annotation_types.clone(),
                    tag_name: self.tag.clone(),
                    normalize_metadata: self.normalize_metadata,
                },
                self.team_name.clone(),
            )
            .with_batch_size(self.batch_size)
        } else {
            SyncSettings {
                target_team_name: self.team_name.clone(),
                ..SyncSettings::default()
            }
            .with_batch_size(self.batch_size)
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify the target address and API key
    Check,
    /// Compare the source team with the target team and write the checkpoint
    Compare {
        /// Source team id (defaults to TEAM_ID)
        #[arg(long)]
        team_id: Option<i64>,
    },
    /// Upload the images recorded in the checkpoint
    Update,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cwd = std::env::current_dir()?;
    credentials::load_env_files(&cwd);

    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match run(args).await {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<SyncError>() {
            Some(sync_error) if sync_error.is_user_facing() => {
                eprintln!("{}", user_message(sync_error));
                std::process::exit(2);
            }
            _ => Err(e),
        },
    }
}

fn user_message(error: &SyncError) -> String {
    match error {
        SyncError::Validation { message, .. } | SyncError::Connection { message, .. } => {
            message.clone()
        }
        other => other.to_string(),
    }
}

fn default_work_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join(SyncConfig::APP_NAME))
        .unwrap_or_else(|| PathBuf::from("tmp"))
}

async fn run(args: Args) -> Result<()> {
    let work_dir = args.work_dir.clone().unwrap_or_else(default_work_dir);
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("Failed to create work directory {}", work_dir.display()))?;
    info!("Work directory: {}", work_dir.display());

    let source_env = credentials::source_from_env()?;
    let source = HttpPlatform::new(
        &source_env.credentials.address,
        &source_env.credentials.api_key,
    )?;

    let target_credentials = match (&args.target_address, &args.target_key) {
        (Some(address), Some(key)) => Credentials::new(address, key.clone()),
        _ => {
            let from_files = match (source_env.team_id, &source_env.target_file) {
                (Some(team_id), Some(remote)) => {
                    credentials::target_from_team_files(&source, team_id, remote, &work_dir).await
                }
                _ => None,
            };
            match from_files {
                Some(creds) => creds,
                None => bail!(
                    "Target address and API key are required (--target-address/--target-key or {}/{})",
                    credentials::TARGET_ADDRESS_VAR,
                    credentials::TARGET_TOKEN_VAR
                ),
            }
        }
    };
    let target = credentials::connect_target(&target_credentials).await?;

    let json = args.json;
    let settings = args.filter.settings();

    match args.command {
        Command::Check => {
            println!("Connected to {}.", target.address());
        }
        Command::Compare { team_id } => {
            let team_id = team_id
                .or(source_env.team_id)
                .context("Source team id is required (--team-id or TEAM_ID)")?;
            let mut session = start_session(source, target, settings, &work_dir);
            let outcome = session.compare_and_save(team_id).await?;
            if json {
                let value = serde_json::json!({
                    "status": outcome.status,
                    "annotated_images": outcome.annotated_images,
                    "tagged_images": outcome.tagged_images,
                    "checkpoint": session.checkpoint_path(),
                    "schema_report": outcome.schema_report,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("{}", outcome.summary());
                if !outcome.schema_report.is_empty() {
                    println!(
                        "{} projects failed the schema check, see {}.",
                        outcome.schema_report.issue_count(),
                        session.schema_report_path().display()
                    );
                }
            }
        }
        Command::Update => {
            let mut session = start_session(source, target, settings, &work_dir);
            let report = session.update_from_checkpoint().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.summary());
                for skipped in &report.skipped {
                    println!(
                        "Skipped {}/{}/{}: {}",
                        skipped.workspace, skipped.project, skipped.dataset, skipped.reason
                    );
                }
            }
        }
    }

    Ok(())
}

/// Exit status used when a second Ctrl-C aborts the process.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    Cancel,
    Exit,
}

/// First interrupt cancels both runs cooperatively, the next one exits.
struct InterruptHandler {
    tokens: [CancellationToken; 2],
    requested: bool,
}

impl InterruptHandler {
    fn new(session: &SyncSession) -> Self {
        Self {
            tokens: [session.compare_token(), session.upload_token()],
            requested: false,
        }
    }

    fn handle(&mut self) -> InterruptAction {
        if self.requested {
            return InterruptAction::Exit;
        }
        self.requested = true;
        for token in &self.tokens {
            token.cancel();
        }
        InterruptAction::Cancel
    }
}

/// Build the session and route Ctrl-C through an [`InterruptHandler`].
fn start_session(
    source: HttpPlatform,
    target: HttpPlatform,
    settings: SyncSettings,
    work_dir: &std::path::Path,
) -> SyncSession {
    let session = SyncSession::new(Arc::new(source), Arc::new(target), settings, work_dir)
        .with_progress(Arc::new(log_progress));

    let mut handler = InterruptHandler::new(&session);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match handler.handle() {
                InterruptAction::Cancel => warn!(
                    "Cancellation requested, stopping at the next boundary (Ctrl-C again to exit)"
                ),
                InterruptAction::Exit => {
                    warn!("Second interrupt, exiting without waiting for the current batch");
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
            }
        }
    });

    session
}

fn log_progress(event: &ProgressEvent) {
    match event {
        ProgressEvent::WorkspaceStarted {
            workspace,
            projects,
        } => info!("Comparing {} projects in workspace {}...", projects, workspace),
        ProgressEvent::DatasetCompared {
            project,
            dataset,
            annotated,
            tagged,
            ..
        } => info!(
            "{}/{}: {} annotated, {} tagged",
            project, dataset, annotated, tagged
        ),
        ProgressEvent::DatasetUploaded {
            project,
            dataset,
            annotated,
            tagged,
            ..
        } => info!(
            "Uploaded {}/{}: {} annotated, {} tagged",
            project, dataset, annotated, tagged
        ),
        ProgressEvent::WorkspaceUploaded { workspace } => {
            info!("Finished uploading workspace {}", workspace)
        }
        ProgressEvent::ProjectCompared { .. } | ProgressEvent::WorkspaceCompared { .. } => {}
    }
}
