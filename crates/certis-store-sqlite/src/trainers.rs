//! [`TrainerRepository`]: trainers and the default trainer flag.

use rusqlite::OptionalExtension as _;

use certis_core::trainer::{NewTrainer, Trainer, TrainerId};

use crate::{Error, Result};

fn trainer_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trainer> {
  Ok(Trainer { id: row.get(0)?, name: row.get(1)?, is_default: row.get(2)? })
}

#[derive(Clone)]
pub struct TrainerRepository {
  conn: tokio_rusqlite::Connection,
}

impl TrainerRepository {
  pub(crate) fn new(conn: tokio_rusqlite::Connection) -> Self { Self { conn } }

  /// Adds a trainer. When `is_default` is set, every other trainer loses the
  /// flag in the same transaction.
  pub async fn add_trainer(&self, input: NewTrainer) -> Result<Trainer> {
    let NewTrainer { name, is_default } = input;
    let n = name.clone();
    let id = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if is_default {
          tx.execute("UPDATE trainers SET is_default = 0", [])?;
        }
        tx.execute(
          "INSERT INTO trainers (name, is_default) VALUES (?1, ?2)",
          rusqlite::params![n, is_default],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
      })
      .await?;
    Ok(Trainer { id, name, is_default })
  }

  pub async fn get_all_trainers(&self) -> Result<Vec<Trainer>> {
    Ok(
      self
        .conn
        .call(|conn| {
          let mut stmt =
            conn.prepare("SELECT id, name, is_default FROM trainers ORDER BY name, id")?;
          let rows = stmt
            .query_map([], trainer_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
          Ok(rows)
        })
        .await?,
    )
  }

  pub async fn get_trainer_by_id(&self, id: TrainerId) -> Result<Option<Trainer>> {
    Ok(
      self
        .conn
        .call(move |conn| {
          Ok(
            conn
              .query_row(
                "SELECT id, name, is_default FROM trainers WHERE id = ?1",
                rusqlite::params![id],
                trainer_from_row,
              )
              .optional()?,
          )
        })
        .await?,
    )
  }

  pub async fn get_default_trainer(&self) -> Result<Option<Trainer>> {
    Ok(
      self
        .conn
        .call(|conn| {
          Ok(
            conn
              .query_row(
                "SELECT id, name, is_default FROM trainers
                  WHERE is_default = 1 ORDER BY id LIMIT 1",
                [],
                trainer_from_row,
              )
              .optional()?,
          )
        })
        .await?,
    )
  }

  /// Renames in one statement; no row updated means no such trainer.
  pub async fn rename_trainer(&self, id: TrainerId, name: String) -> Result<Trainer> {
    let n = name.clone();
    let is_default = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "UPDATE trainers SET name = ?2 WHERE id = ?1 RETURNING is_default",
              rusqlite::params![id, n],
              |row| row.get::<_, bool>(0),
            )
            .optional()?,
        )
      })
      .await?
      .ok_or(Error::NotFound { entity: "trainer", id })?;
    Ok(Trainer { id, name, is_default })
  }

  /// Makes `id` the only default trainer. An unknown id changes nothing.
  pub async fn set_default_trainer(&self, id: TrainerId) -> Result<()> {
    let found = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute("UPDATE trainers SET is_default = 0", [])?;
        let n = tx.execute(
          "UPDATE trainers SET is_default = 1 WHERE id = ?1",
          rusqlite::params![id],
        )?;
        if n == 0 {
          return Ok(false);
        }
        tx.commit()?;
        Ok(true)
      })
      .await?;
    if !found {
      return Err(Error::NotFound { entity: "trainer", id });
    }
    Ok(())
  }

  /// Sessions taught by the trainer keep existing with no trainer.
  pub async fn delete_trainer(&self, id: TrainerId) -> Result<()> {
    let deleted = self
      .conn
      .call(move |conn| {
        Ok(conn.execute("DELETE FROM trainers WHERE id = ?1", rusqlite::params![id])?)
      })
      .await?;
    if deleted == 0 {
      return Err(Error::NotFound { entity: "trainer", id });
    }
    Ok(())
  }
}
