//! certis-admin: maintenance and reporting over a certis database.
//!
//! Reads `certis.toml` (or the path given with `--config`), opens the SQLite
//! database, brings its schema up to date, archives old completed sessions,
//! runs one command and closes the connection again. Command output is JSON
//! on stdout; logs go to stderr.

mod config;

use std::{collections::BTreeSet, path::PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use certis_core::{
  catalog::{BlockId, QuestionId},
  device::GlobalKitSync,
  scoring::{
    BlockPerformance, DateWindow, SessionStats, Thresholds, block_performance,
    draw_statistics, session_stats,
  },
  session::{Session, SessionId},
};
use certis_store_sqlite::Database;

use crate::config::AdminConfig;

/// Settings key holding thresholds that override the configured ones.
const THRESHOLDS_SETTING: &str = "scoring.thresholds";

#[derive(Parser)]
#[command(author, version, about = "Certis database administration")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "certis.toml")]
  config: PathBuf,

  /// Database file; takes precedence over `database_path` in the config.
  #[arg(long)]
  database: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Create or upgrade the schema and print the migration report.
  Migrate,
  /// Reconcile the global device kit and archive old completed sessions.
  Maintain,
  /// Complete a session once all of its iterations are settled.
  Finalize { session_id: SessionId },
  /// Print how often referentials, themes and blocks were drawn.
  DrawStats {
    /// First session date to count (inclusive, YYYY-MM-DD).
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Last session date to count (inclusive, YYYY-MM-DD).
    #[arg(long)]
    to:   Option<NaiveDate>,
  },
  /// Print participant outcomes, session statistics and block performance.
  Report { session_id: SessionId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  let admin = AdminConfig::load(&cli.config)?;

  let path = match cli.database {
    Some(path) => path,
    None => admin.database_path()?,
  };
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {parent:?}"))?;
  }

  let db = Database::connect(&path)
    .await
    .with_context(|| format!("failed to open database at {path:?}"))?;
  let report = db
    .ensure_schema()
    .await
    .context("failed to bring the schema up to date")?;
  for failure in &report.failed {
    tracing::warn!(
      version = failure.version,
      name = failure.name,
      error = %failure.error,
      "migration step skipped"
    );
  }

  let archive = run_janitor(&db, &admin).await;

  let output = match cli.command {
    Command::Migrate => serde_json::to_value(&report)?,
    Command::Maintain => serde_json::to_value(maintain(&db, archive).await?)?,
    Command::Finalize { session_id } => {
      let outcome = db
        .sessions()
        .check_and_finalize_session_status(session_id)
        .await
        .with_context(|| format!("failed to finalize session {session_id}"))?;
      serde_json::to_value(outcome)?
    }
    Command::DrawStats { from, to } => {
      serde_json::to_value(draw_stats(&db, DateWindow { from, to }).await?)?
    }
    Command::Report { session_id } => {
      serde_json::to_value(report_session(&db, &admin, session_id).await?)?
    }
  };

  db.close().await.context("failed to close database")?;
  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

// ─── Commands ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
struct Archive {
  cutoff:   DateTime<Utc>,
  archived: usize,
}

/// The startup janitor: archives completed sessions whose results were
/// imported more than `retention_days` ago.
async fn archive_old_sessions(db: &Database, admin: &AdminConfig) -> anyhow::Result<Archive> {
  let cutoff = admin.archive_cutoff(Utc::now())?;
  let archived = db
    .sessions()
    .archive_sessions_imported_before(cutoff)
    .await
    .context("failed to archive sessions")?;
  Ok(Archive { cutoff, archived })
}

/// Runs [`archive_old_sessions`], logging a failure instead of aborting the
/// command.
async fn run_janitor(db: &Database, admin: &AdminConfig) -> Option<Archive> {
  match archive_old_sessions(db, admin).await {
    Ok(archive) => Some(archive),
    Err(e) => {
      tracing::error!(error = format!("{e:#}"), "archiving old sessions failed");
      None
    }
  }
}

#[derive(Serialize)]
struct Maintenance {
  global_kit: GlobalKitSync,
  archive:    Option<Archive>,
}

async fn maintain(db: &Database, archive: Option<Archive>) -> anyhow::Result<Maintenance> {
  let global_kit = db
    .devices()
    .reconcile_global_kit()
    .await
    .context("failed to reconcile the global kit")?;
  Ok(Maintenance { global_kit, archive })
}

async fn draw_stats(
  db: &Database,
  window: DateWindow,
) -> anyhow::Result<certis_core::scoring::DrawStatistics> {
  if let (Some(from), Some(to)) = (window.from, window.to) {
    anyhow::ensure!(from <= to, "--from {from} is after --to {to}");
  }

  let sessions: Vec<Session> = db
    .sessions()
    .get_all_sessions()
    .await?
    .into_iter()
    .map(|summary| summary.session)
    .collect();
  let catalog = db.catalog();
  let referentials = catalog.get_all_referentials().await?;
  let themes = catalog.get_all_themes().await?;
  let blocks = catalog.get_all_blocks().await?;

  Ok(draw_statistics(&sessions, &referentials, &themes, &blocks, window))
}

#[derive(Serialize)]
struct SessionReport {
  session:    Session,
  thresholds: Thresholds,
  stats:      SessionStats,
  blocks:     Vec<BlockPerformance>,
}

/// Thresholds stored in the database take precedence over the configured
/// ones.
async fn scoring_thresholds(db: &Database, admin: &AdminConfig) -> anyhow::Result<Thresholds> {
  match db.settings().get_setting(THRESHOLDS_SETTING).await? {
    Some(value) => serde_json::from_value(value)
      .with_context(|| format!("invalid {THRESHOLDS_SETTING} setting")),
    None => Ok(admin.scoring),
  }
}

async fn report_session(
  db: &Database,
  admin: &AdminConfig,
  session_id: SessionId,
) -> anyhow::Result<SessionReport> {
  let detail = db
    .sessions()
    .get_session_by_id(session_id)
    .await?
    .with_context(|| format!("session {session_id} not found"))?;

  // Questions actually placed in the generated decks, falling back to the
  // selected blocks for sessions that never generated one.
  let mut question_ids: BTreeSet<QuestionId> = detail
    .iterations
    .iter()
    .flat_map(|i| &i.iteration.question_mappings)
    .map(|m| m.question_id)
    .collect();
  if question_ids.is_empty() {
    question_ids = db
      .catalog()
      .get_questions_for_blocks(&detail.session.selected_block_ids)
      .await?
      .into_iter()
      .map(|q| q.id)
      .collect();
  }
  let question_ids: Vec<QuestionId> = question_ids.into_iter().collect();

  let exam = db.catalog().exam_questions(&question_ids).await?;
  let results = db.results().get_results_for_session(session_id).await?;
  let devices = db.devices().device_serial_map().await?;
  let thresholds = scoring_thresholds(db, admin).await?;

  let stats = session_stats(&detail, &results, &exam, &devices, &thresholds);
  let block_ids: BTreeSet<BlockId> = exam.iter().filter_map(|q| q.block_id).collect();
  let blocks = block_ids
    .into_iter()
    .filter_map(|id| block_performance(id, &detail, &results, &exam, &devices))
    .collect();

  tracing::debug!(
    session_id,
    questions = exam.len(),
    results = results.len(),
    "built session report"
  );
  Ok(SessionReport { session: detail.session, thresholds, stats, blocks })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn janitor_failure_does_not_abort() {
    let dir = tempfile::tempdir().unwrap();
    // Never migrated, so the sessions table lacks its lifecycle columns.
    let db = Database::connect(dir.path().join("certis.db")).await.unwrap();
    assert!(run_janitor(&db, &AdminConfig::default()).await.is_none());

    db.ensure_schema().await.unwrap();
    let archive = run_janitor(&db, &AdminConfig::default()).await.unwrap();
    assert_eq!(archive.archived, 0);
  }
}
