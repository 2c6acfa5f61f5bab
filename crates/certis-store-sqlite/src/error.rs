//! Error type for `certis-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] certis_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A unique constraint rejected the write. `key` is the offending value.
  #[error("{entity} {key:?} already exists")]
  DuplicateKey { entity: &'static str, key: String },

  #[error("{entity} references a row that does not exist: {detail}")]
  ForeignKey { entity: &'static str, detail: String },

  /// A mutation targeted a row that does not exist. Lookups return `None`
  /// instead.
  #[error("{entity} {id} not found")]
  NotFound { entity: &'static str, id: i64 },

  #[error("the global device kit cannot be modified or deleted")]
  ProtectedKit,

  /// The baseline schema could not be created. The store is unusable.
  #[error("schema creation failed: {0}")]
  SchemaCreation(#[source] tokio_rusqlite::Error),

  #[error("schema not current: migration {version} ({name}) has not been applied")]
  SchemaNotCurrent { version: u32, name: &'static str },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Maps SQLite constraint failures onto the matching variant, naming
/// `entity` and `key`. Anything else stays a [`Error::Database`].
pub(crate) fn constraint_error(
  entity: &'static str,
  key: impl Into<String>,
) -> impl FnOnce(tokio_rusqlite::Error) -> Error {
  let key = key.into();
  move |err| {
    let failure = match &err {
      tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _)) => {
        Some(e.extended_code)
      }
      _ => None,
    };
    match failure {
      Some(code)
        if code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
          || code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
      {
        Error::DuplicateKey { entity, key }
      }
      Some(code) if code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
        Error::ForeignKey { entity, detail: key }
      }
      _ => Error::Database(err),
    }
  }
}
