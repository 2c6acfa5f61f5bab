//! [`Database`]: the connection owner that hands out repositories.

use std::{path::Path, sync::Arc};

use crate::{
  CatalogRepository, DeviceRepository, Error, Result, ResultRepository,
  SessionRepository, SettingsRepository, TrainerRepository,
  devices::GLOBAL_KIT_STEP,
  schema::{self, MIGRATIONS, PRAGMAS, SchemaReport, SchemaState},
};

/// A certis store backed by a single SQLite file.
///
/// Cloning is cheap: the connection handle and schema state are shared.
#[derive(Clone)]
pub struct Database {
  conn:   tokio_rusqlite::Connection,
  schema: Arc<SchemaState>,
}

impl Database {
  /// Open (or create) a database at `path` without touching its schema.
  /// Every repository operation fails with
  /// [`Error::SchemaNotCurrent`] until [`Database::ensure_schema`] has run.
  pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn).await
  }

  /// Open (or create) a database at `path` and bring its schema up to date.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let db = Self::connect(path).await?;
    db.ensure_schema().await?;
    Ok(db)
  }

  /// Open a migrated in-memory database, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let db = Self::init(conn).await?;
    db.ensure_schema().await?;
    Ok(db)
  }

  async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
    conn
      .call(|conn| {
        conn.execute_batch(PRAGMAS)?;
        Ok(())
      })
      .await?;
    Ok(Self { conn, schema: Arc::new(SchemaState::default()) })
  }

  /// Creates the baseline schema if needed and applies pending migration
  /// steps. Safe to call repeatedly; a current database is left untouched.
  ///
  /// A failure while creating the baseline is fatal and reported as
  /// [`Error::SchemaCreation`]. A failing step is logged, skipped and listed
  /// in the report.
  pub async fn ensure_schema(&self) -> Result<SchemaReport> {
    let baseline_applied = self
      .conn
      .call(|conn| Ok(schema::create_baseline(conn)?))
      .await
      .map_err(Error::SchemaCreation)?;

    let (applied, failed, versions) = self
      .conn
      .call(|conn| {
        let (applied, failed) = schema::apply_steps(conn, MIGRATIONS)?;
        let versions = schema::recorded_versions(conn)?;
        Ok((applied, failed, versions))
      })
      .await?;

    self.schema.replace(versions);

    // A fresh or adopted database gets its global kit right away.
    if self.schema.is_applied(GLOBAL_KIT_STEP) {
      self.devices().reconcile_global_kit().await?;
    }

    let mut report = SchemaReport {
      already_current: !baseline_applied && applied.is_empty() && failed.is_empty(),
      applied,
      failed,
    };
    if baseline_applied {
      report.applied.insert(0, schema::BASELINE_VERSION);
      tracing::info!("created baseline schema");
    }
    if report.already_current {
      tracing::debug!("schema already current");
    }
    Ok(report)
  }

  pub fn schema(&self) -> &SchemaState { &self.schema }

  pub fn catalog(&self) -> CatalogRepository {
    CatalogRepository::new(self.conn.clone(), self.schema.clone())
  }

  pub fn devices(&self) -> DeviceRepository {
    DeviceRepository::new(self.conn.clone(), self.schema.clone())
  }

  pub fn sessions(&self) -> SessionRepository {
    SessionRepository::new(self.conn.clone(), self.schema.clone())
  }

  pub fn results(&self) -> ResultRepository {
    ResultRepository::new(self.conn.clone(), self.schema.clone())
  }

  pub fn trainers(&self) -> TrainerRepository {
    TrainerRepository::new(self.conn.clone())
  }

  pub fn settings(&self) -> SettingsRepository {
    SettingsRepository::new(self.conn.clone())
  }

  /// Closes the underlying connection. Repositories handed out earlier fail
  /// afterwards.
  pub async fn close(self) -> Result<()> {
    self.conn.close().await?;
    Ok(())
  }

  #[cfg(test)]
  pub(crate) fn connection(&self) -> &tokio_rusqlite::Connection { &self.conn }
}
