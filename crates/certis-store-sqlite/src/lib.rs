//! SQLite backend for the certis certification store.
//!
//! One [`Database`] owns a [`tokio_rusqlite`] connection, so all database
//! access runs on a dedicated thread without blocking the async runtime. The
//! repositories it hands out share that connection and the schema state
//! computed by [`Database::ensure_schema`].

mod catalog;
mod database;
mod devices;
mod encode;
mod results;
mod schema;
mod sessions;
mod settings;
mod trainers;

pub mod error;

pub use catalog::CatalogRepository;
pub use database::Database;
pub use devices::DeviceRepository;
pub use error::{Error, Result};
pub use results::ResultRepository;
pub use schema::{MigrationFailure, SchemaReport, SchemaState};
pub use sessions::{ARCHIVE_AFTER_DAYS, Finalization, SessionRepository};
pub use settings::SettingsRepository;
pub use trainers::TrainerRepository;

#[cfg(test)]
mod tests;
