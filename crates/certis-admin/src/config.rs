//! Admin configuration: an optional TOML file layered under `CERTIS_*`
//! environment variables.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use certis_core::scoring::Thresholds;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;

/// Completed sessions are archived this many days after their results were
/// imported unless configured otherwise.
const DEFAULT_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
  /// Database file. Defaults to `certis/certis.db` under the platform's
  /// local data directory.
  pub database_path:  Option<PathBuf>,
  pub retention_days: i64,
  pub scoring:        Thresholds,
}

impl Default for AdminConfig {
  fn default() -> Self {
    Self {
      database_path:  None,
      retention_days: DEFAULT_RETENTION_DAYS,
      scoring:        Thresholds::default(),
    }
  }
}

impl AdminConfig {
  /// Reads `path` if it exists, then applies `CERTIS_*` overrides such as
  /// `CERTIS_RETENTION_DAYS` or `CERTIS_SCORING__GLOBAL`.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let config: Self = ::config::Config::builder()
      .add_source(::config::File::from(path).required(false))
      .add_source(
        ::config::Environment::with_prefix("CERTIS")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()
      .context("failed to read config file")?
      .try_deserialize()
      .context("failed to deserialise AdminConfig")?;

    anyhow::ensure!(
      config.retention_days >= 0,
      "retention_days must not be negative (got {})",
      config.retention_days
    );
    config.archive_cutoff(Utc::now())?;
    Ok(config)
  }

  /// Sessions whose results were imported before this instant get archived.
  pub fn archive_cutoff(&self, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    TimeDelta::try_days(self.retention_days)
      .and_then(|retention| now.checked_sub_signed(retention))
      .with_context(|| {
        format!("retention_days is out of range (got {})", self.retention_days)
      })
  }

  /// The configured database file, with a leading `~` expanded.
  pub fn database_path(&self) -> anyhow::Result<PathBuf> {
    match &self.database_path {
      Some(path) => Ok(expand_tilde(path)),
      None => dirs::data_local_dir()
        .map(|dir| dir.join("certis").join("certis.db"))
        .context("no local data directory; set database_path"),
    }
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  if let Ok(rest) = path.strip_prefix("~")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}
