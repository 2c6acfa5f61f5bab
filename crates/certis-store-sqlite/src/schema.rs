//! SQL schema and versioned migrations for the certis SQLite store.
//!
//! Version 1 is the baseline: every table in its original shape, created in
//! one transaction. Later versions are additive steps recorded in
//! `schema_migrations`. Each step runs in its own transaction and checks the
//! live table layout before altering it, so a database created by an older
//! build without migration rows is adopted without errors.

use std::{collections::BTreeSet, sync::RwLock};

use rusqlite::{Connection, OptionalExtension as _, Transaction};
use serde::Serialize;

use crate::{Error, Result};

/// Executed on every new connection.
pub const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
";

pub const BASELINE_VERSION: u32 = 1;

const MIGRATIONS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    name       TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
";

/// Baseline DDL; idempotent thanks to `IF NOT EXISTS`.
const BASELINE: &str = "
CREATE TABLE IF NOT EXISTS referentials (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    code  TEXT NOT NULL UNIQUE,
    label TEXT
);

CREATE TABLE IF NOT EXISTS themes (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    code           TEXT NOT NULL,
    label          TEXT,
    referential_id INTEGER NOT NULL REFERENCES referentials(id) ON DELETE CASCADE,
    UNIQUE (referential_id, code)
);

CREATE TABLE IF NOT EXISTS blocks (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    code     TEXT NOT NULL,
    label    TEXT,
    theme_id INTEGER NOT NULL REFERENCES themes(id) ON DELETE CASCADE,
    UNIQUE (theme_id, code)
);

-- Questions outlive their block.
CREATE TABLE IF NOT EXISTS questions (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    block_id              INTEGER REFERENCES blocks(id) ON DELETE SET NULL,
    text                  TEXT NOT NULL,
    question_type         TEXT NOT NULL,   -- 'single-choice' | 'multiple-choice' | 'true-false'
    options               TEXT NOT NULL DEFAULT '[]',
    correct_answer        TEXT NOT NULL,
    time_limit_seconds    INTEGER,
    is_eliminatory        INTEGER NOT NULL DEFAULT 0,
    slide_guid            TEXT,
    usage_count           INTEGER NOT NULL DEFAULT 0,
    correct_response_rate REAL NOT NULL DEFAULT 0,
    created_at            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trainers (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS device_kits (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL UNIQUE,
    is_default INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS voting_devices (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT,
    serial_number TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS device_kit_assignments (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    kit_id           INTEGER NOT NULL REFERENCES device_kits(id) ON DELETE CASCADE,
    voting_device_id INTEGER NOT NULL REFERENCES voting_devices(id) ON DELETE CASCADE,
    UNIQUE (kit_id, voting_device_id)
);

CREATE TABLE IF NOT EXISTS sessions (
    id                        INTEGER PRIMARY KEY AUTOINCREMENT,
    name                      TEXT NOT NULL,
    date                      TEXT NOT NULL,   -- YYYY-MM-DD
    referential_id            INTEGER REFERENCES referentials(id) ON DELETE SET NULL,
    selected_block_ids        TEXT NOT NULL DEFAULT '[]',
    selected_kit_id           INTEGER REFERENCES device_kits(id) ON DELETE SET NULL,
    trainer_id                INTEGER REFERENCES trainers(id) ON DELETE SET NULL,
    status                    TEXT NOT NULL DEFAULT 'planned',
    ignored_slide_guids       TEXT NOT NULL DEFAULT '[]',
    resolved_import_anomalies TEXT,
    location                  TEXT,
    notes                     TEXT,
    created_at                TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_iterations (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id        INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    iteration_index   INTEGER NOT NULL,
    name              TEXT NOT NULL,
    ors_file_path     TEXT,
    status            TEXT NOT NULL DEFAULT 'planned',
    question_mappings TEXT NOT NULL DEFAULT '[]',
    created_at        TEXT NOT NULL,
    UNIQUE (session_id, iteration_index)
);

CREATE TABLE IF NOT EXISTS participants (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    first_name          TEXT NOT NULL,
    last_name           TEXT NOT NULL,
    organization        TEXT,
    identification_code TEXT
);

CREATE TABLE IF NOT EXISTS participant_assignments (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    session_iteration_id INTEGER NOT NULL REFERENCES session_iterations(id) ON DELETE CASCADE,
    participant_id       INTEGER NOT NULL REFERENCES participants(id) ON DELETE CASCADE,
    voting_device_id     INTEGER NOT NULL REFERENCES voting_devices(id) ON DELETE CASCADE,
    kit_id               INTEGER NOT NULL REFERENCES device_kits(id) ON DELETE CASCADE,
    UNIQUE (session_iteration_id, participant_id),
    UNIQUE (session_iteration_id, voting_device_id)
);

CREATE TABLE IF NOT EXISTS session_results (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id      INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    question_id     INTEGER NOT NULL REFERENCES questions(id) ON DELETE CASCADE,
    device_serial   TEXT NOT NULL,
    answer          TEXT,            -- JSON-encoded Answer or NULL
    is_correct      INTEGER NOT NULL,
    points_obtained INTEGER NOT NULL DEFAULT 0,
    timestamp       INTEGER NOT NULL -- epoch milliseconds
);

CREATE TABLE IF NOT EXISTS admin_settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL              -- JSON
);

CREATE INDEX IF NOT EXISTS themes_referential_idx  ON themes(referential_id);
CREATE INDEX IF NOT EXISTS blocks_theme_idx        ON blocks(theme_id);
CREATE INDEX IF NOT EXISTS questions_block_idx     ON questions(block_id);
CREATE INDEX IF NOT EXISTS kit_assignments_kit_idx ON device_kit_assignments(kit_id);
CREATE INDEX IF NOT EXISTS results_session_idx     ON session_results(session_id);
";

// ─── Migration steps ─────────────────────────────────────────────────────────

/// One additive schema change.
pub struct Migration {
  pub version: u32,
  pub name:    &'static str,
  pub apply:   fn(&Transaction<'_>) -> rusqlite::Result<()>,
}

pub const MIGRATIONS: &[Migration] = &[
  Migration { version: 2, name: "session lifecycle", apply: session_lifecycle },
  Migration { version: 3, name: "iteration file path", apply: iteration_file_path },
  Migration { version: 4, name: "result attribution", apply: result_attribution },
  Migration { version: 5, name: "question identity", apply: question_identity },
  Migration { version: 6, name: "global device kit", apply: global_device_kit },
  Migration { version: 7, name: "assignment status", apply: assignment_status },
  Migration { version: 8, name: "participant lookup", apply: participant_lookup },
];

pub fn migration_name(version: u32) -> &'static str {
  if version == BASELINE_VERSION {
    return "baseline";
  }
  MIGRATIONS
    .iter()
    .find(|m| m.version == version)
    .map_or("unknown", |m| m.name)
}

fn column_exists(
  conn: &Connection,
  table: &str,
  column: &str,
) -> rusqlite::Result<bool> {
  Ok(
    conn
      .query_row(
        "SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2",
        rusqlite::params![table, column],
        |_| Ok(()),
      )
      .optional()?
      .is_some(),
  )
}

fn add_column(
  tx: &Transaction<'_>,
  table: &str,
  column: &str,
  decl: &str,
) -> rusqlite::Result<()> {
  if !column_exists(tx, table, column)? {
    tx.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))?;
  }
  Ok(())
}

fn session_lifecycle(tx: &Transaction<'_>) -> rusqlite::Result<()> {
  add_column(tx, "sessions", "updated_at", "TEXT")?;
  add_column(tx, "sessions", "results_imported_at", "TEXT")?;
  add_column(tx, "sessions", "archived_at", "TEXT")?;
  add_column(tx, "sessions", "iteration_count", "INTEGER NOT NULL DEFAULT 1")?;
  add_column(tx, "sessions", "session_number", "TEXT")?;
  add_column(tx, "sessions", "stage_number", "TEXT")?;
  tx.execute_batch(
    "CREATE INDEX IF NOT EXISTS sessions_status_idx ON sessions(status);
     CREATE INDEX IF NOT EXISTS sessions_date_idx   ON sessions(date);",
  )
}

fn iteration_file_path(tx: &Transaction<'_>) -> rusqlite::Result<()> {
  add_column(tx, "session_iterations", "updated_at", "TEXT")?;
  let legacy = column_exists(tx, "session_iterations", "ors_file_path")?;
  let current = column_exists(tx, "session_iterations", "generated_file_path")?;
  match (legacy, current) {
    (true, false) => tx.execute_batch(
      "ALTER TABLE session_iterations
         RENAME COLUMN ors_file_path TO generated_file_path;",
    ),
    (false, false) => {
      add_column(tx, "session_iterations", "generated_file_path", "TEXT")
    }
    _ => Ok(()),
  }
}

fn result_attribution(tx: &Transaction<'_>) -> rusqlite::Result<()> {
  add_column(
    tx,
    "session_results",
    "session_iteration_id",
    "INTEGER REFERENCES session_iterations(id) ON DELETE CASCADE",
  )?;
  add_column(
    tx,
    "session_results",
    "participant_id",
    "INTEGER REFERENCES participants(id) ON DELETE SET NULL",
  )?;
  tx.execute_batch(
    "CREATE INDEX IF NOT EXISTS results_iteration_idx ON session_results(session_iteration_id);
     CREATE INDEX IF NOT EXISTS results_question_idx  ON session_results(session_id, question_id);",
  )
}

fn question_identity(tx: &Transaction<'_>) -> rusqlite::Result<()> {
  add_column(tx, "questions", "user_question_id", "TEXT")?;
  add_column(tx, "questions", "version", "TEXT")?;
  add_column(tx, "questions", "updated_at", "TEXT")?;
  tx.execute_batch(
    "CREATE UNIQUE INDEX IF NOT EXISTS questions_user_question_id_idx
       ON questions(user_question_id);
     UPDATE questions SET updated_at = created_at WHERE updated_at IS NULL;",
  )
}

fn global_device_kit(tx: &Transaction<'_>) -> rusqlite::Result<()> {
  add_column(tx, "device_kits", "is_global", "INTEGER NOT NULL DEFAULT 0")
}

fn assignment_status(tx: &Transaction<'_>) -> rusqlite::Result<()> {
  add_column(
    tx,
    "participant_assignments",
    "status",
    "TEXT NOT NULL DEFAULT 'present'",
  )?;
  tx.execute_batch(
    "UPDATE participant_assignments SET status = 'present'
      WHERE status IS NULL OR status NOT IN ('present', 'absent');",
  )
}

fn participant_lookup(tx: &Transaction<'_>) -> rusqlite::Result<()> {
  tx.execute_batch(
    "CREATE INDEX IF NOT EXISTS participants_identification_idx
       ON participants(identification_code);",
  )
}

// ─── Runner ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationFailure {
  pub version: u32,
  pub name:    &'static str,
  pub error:   String,
}

/// Outcome of one [`ensure_schema`](crate::Database::ensure_schema) run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaReport {
  /// Versions applied by this run, baseline included.
  pub applied:         Vec<u32>,
  /// Steps that failed and were skipped; they are retried on the next run.
  pub failed:          Vec<MigrationFailure>,
  /// Nothing needed doing.
  pub already_current: bool,
}

fn is_recorded(conn: &Connection, version: u32) -> rusqlite::Result<bool> {
  Ok(
    conn
      .query_row(
        "SELECT 1 FROM schema_migrations WHERE version = ?1",
        rusqlite::params![version],
        |_| Ok(()),
      )
      .optional()?
      .is_some(),
  )
}

fn record(tx: &Transaction<'_>, version: u32, name: &str) -> rusqlite::Result<()> {
  tx.execute(
    "INSERT INTO schema_migrations (version, name, applied_at)
     VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
    rusqlite::params![version, name],
  )?;
  Ok(())
}

/// Creates the metadata table and the baseline tables in one transaction.
/// Returns whether the baseline was applied by this call.
pub fn create_baseline(conn: &mut Connection) -> rusqlite::Result<bool> {
  let tx = conn.transaction()?;
  tx.execute_batch(MIGRATIONS_TABLE)?;
  if is_recorded(&tx, BASELINE_VERSION)? {
    return Ok(false);
  }
  tx.execute_batch(BASELINE)?;
  record(&tx, BASELINE_VERSION, migration_name(BASELINE_VERSION))?;
  tx.commit()?;
  Ok(true)
}

/// Applies every unrecorded step of `steps`, one transaction each.
///
/// A failing step is rolled back, logged and skipped; the next steps still
/// run. Only errors outside a step (opening a transaction, committing) abort
/// the run.
pub fn apply_steps(
  conn: &mut Connection,
  steps: &[Migration],
) -> rusqlite::Result<(Vec<u32>, Vec<MigrationFailure>)> {
  let mut applied = Vec::new();
  let mut failed = Vec::new();

  for step in steps {
    if is_recorded(conn, step.version)? {
      continue;
    }
    let tx = conn.transaction()?;
    match (step.apply)(&tx).and_then(|()| record(&tx, step.version, step.name)) {
      Ok(()) => {
        tx.commit()?;
        tracing::info!(version = step.version, name = step.name, "applied migration");
        applied.push(step.version);
      }
      Err(e) => {
        drop(tx);
        tracing::error!(
          version = step.version,
          name = step.name,
          error = %e,
          "migration failed; skipping"
        );
        failed.push(MigrationFailure {
          version: step.version,
          name:    step.name,
          error:   e.to_string(),
        });
      }
    }
  }

  Ok((applied, failed))
}

pub fn recorded_versions(conn: &Connection) -> rusqlite::Result<BTreeSet<u32>> {
  let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
  let versions = stmt
    .query_map([], |row| row.get(0))?
    .collect::<rusqlite::Result<BTreeSet<u32>>>()?;
  Ok(versions)
}

// ─── Schema state ────────────────────────────────────────────────────────────

/// The set of applied schema versions, shared by every repository.
///
/// Operations that touch columns introduced by a step call
/// [`SchemaState::require`] first, so a skipped step surfaces as
/// [`Error::SchemaNotCurrent`] instead of an SQL error.
#[derive(Debug, Default)]
pub struct SchemaState {
  applied: RwLock<BTreeSet<u32>>,
}

impl SchemaState {
  pub fn applied(&self) -> BTreeSet<u32> {
    self
      .applied
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }

  pub fn is_applied(&self, version: u32) -> bool {
    self
      .applied
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .contains(&version)
  }

  pub fn require(&self, version: u32) -> Result<()> {
    if self.is_applied(version) {
      Ok(())
    } else {
      Err(Error::SchemaNotCurrent { version, name: migration_name(version) })
    }
  }

  pub(crate) fn replace(&self, versions: BTreeSet<u32>) {
    *self
      .applied
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner()) = versions;
  }
}
