//! [`SettingsRepository`]: JSON values keyed by name.

use std::collections::BTreeMap;

use rusqlite::OptionalExtension as _;

use crate::{
  Result,
  encode::{decode_setting, encode_setting},
};

#[derive(Clone)]
pub struct SettingsRepository {
  conn: tokio_rusqlite::Connection,
}

impl SettingsRepository {
  pub(crate) fn new(conn: tokio_rusqlite::Connection) -> Self { Self { conn } }

  /// The stored value, or `None` if the key is unset or its value is not
  /// valid JSON.
  pub async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
    let key = key.to_owned();
    let raw: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT value FROM admin_settings WHERE key = ?1",
              rusqlite::params![key],
              |row| row.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    Ok(raw.as_deref().and_then(decode_setting))
  }

  /// Inserts or replaces the value for `key`.
  pub async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<()> {
    let key = key.to_owned();
    let value = encode_setting(value)?;
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO admin_settings (key, value) VALUES (?1, ?2)
           ON CONFLICT(key) DO UPDATE SET value = excluded.value",
          rusqlite::params![key, value],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Every readable setting, keyed by name.
  pub async fn get_all_settings(&self) -> Result<BTreeMap<String, serde_json::Value>> {
    let rows: Vec<(String, String)> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare("SELECT key, value FROM admin_settings ORDER BY key")?;
        let rows = stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(
      rows
        .into_iter()
        .filter_map(|(key, value)| decode_setting(&value).map(|v| (key, v)))
        .collect(),
    )
  }

  pub async fn delete_setting(&self, key: &str) -> Result<bool> {
    let key = key.to_owned();
    let deleted = self
      .conn
      .call(move |conn| {
        Ok(conn.execute("DELETE FROM admin_settings WHERE key = ?1", rusqlite::params![key])?)
      })
      .await?;
    Ok(deleted > 0)
  }
}
