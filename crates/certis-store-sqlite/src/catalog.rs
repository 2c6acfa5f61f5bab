//! [`CatalogRepository`]: referentials, themes, blocks and questions.

use std::{collections::BTreeSet, sync::Arc};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension as _};

use certis_core::catalog::{
  Block, BlockId, ExamQuestion, NewBlock, NewQuestion, NewReferential, NewTheme,
  Question, QuestionId, QuestionUpdate, Referential, ReferentialId, Theme,
  ThemeId, UNASSIGNED_THEME,
};

use crate::{
  Error, Result,
  encode::{
    QUESTION_COLUMNS, RawQuestion, encode_dt, encode_options,
    encode_question_type,
  },
  error::constraint_error,
  schema::SchemaState,
};

/// Questions gained their stable identity columns in this step.
const QUESTION_STEP: u32 = 5;

#[derive(Clone)]
pub struct CatalogRepository {
  conn:   tokio_rusqlite::Connection,
  schema: Arc<SchemaState>,
}

// ─── Question row parameters ─────────────────────────────────────────────────

/// A [`NewQuestion`] with every column already encoded, ready to move into a
/// connection closure.
struct QuestionParams {
  user_question_id:      Option<String>,
  block_id:              Option<BlockId>,
  text:                  String,
  question_type:         &'static str,
  options:               String,
  correct_answer:        String,
  time_limit_seconds:    Option<u32>,
  is_eliminatory:        bool,
  slide_guid:            Option<String>,
  usage_count:           u32,
  correct_response_rate: f64,
  version:               Option<String>,
}

impl QuestionParams {
  fn encode(q: NewQuestion) -> Result<Self> {
    Ok(Self {
      options:               encode_options(&q.options)?,
      question_type:         encode_question_type(q.question_type),
      user_question_id:      q.user_question_id,
      block_id:              q.block_id,
      text:                  q.text,
      correct_answer:        q.correct_answer,
      time_limit_seconds:    q.time_limit_seconds,
      is_eliminatory:        q.is_eliminatory,
      slide_guid:            q.slide_guid,
      usage_count:           q.usage_count,
      correct_response_rate: q.correct_response_rate,
      version:               q.version,
    })
  }

  /// Identifies the question in constraint errors.
  fn key(&self) -> String {
    self.user_question_id.clone().unwrap_or_else(|| self.text.clone())
  }
}

fn insert_question(
  conn: &Connection,
  q: &QuestionParams,
  now: &str,
) -> rusqlite::Result<QuestionId> {
  conn.execute(
    "INSERT INTO questions (
       user_question_id, block_id, text, question_type, options,
       correct_answer, time_limit_seconds, is_eliminatory, slide_guid,
       usage_count, correct_response_rate, version, created_at, updated_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
    rusqlite::params![
      q.user_question_id,
      q.block_id,
      q.text,
      q.question_type,
      q.options,
      q.correct_answer,
      q.time_limit_seconds,
      q.is_eliminatory,
      q.slide_guid,
      q.usage_count,
      q.correct_response_rate,
      q.version,
      now,
    ],
  )?;
  Ok(conn.last_insert_rowid())
}

/// Inserts, or updates the row carrying the same `user_question_id`.
/// Updates keep `created_at` and the accumulated usage statistics.
fn upsert_question_row(
  conn: &Connection,
  q: &QuestionParams,
  now: &str,
) -> rusqlite::Result<QuestionId> {
  let existing: Option<QuestionId> = match &q.user_question_id {
    Some(uid) => conn
      .query_row(
        "SELECT id FROM questions WHERE user_question_id = ?1",
        rusqlite::params![uid],
        |row| row.get(0),
      )
      .optional()?,
    None => None,
  };

  let Some(id) = existing else {
    return insert_question(conn, q, now);
  };

  conn.execute(
    "UPDATE questions SET
       block_id = ?2, text = ?3, question_type = ?4, options = ?5,
       correct_answer = ?6, time_limit_seconds = ?7, is_eliminatory = ?8,
       slide_guid = ?9, version = ?10, updated_at = ?11
     WHERE id = ?1",
    rusqlite::params![
      id,
      q.block_id,
      q.text,
      q.question_type,
      q.options,
      q.correct_answer,
      q.time_limit_seconds,
      q.is_eliminatory,
      q.slide_guid,
      q.version,
      now,
    ],
  )?;
  Ok(id)
}

fn query_questions(
  conn: &Connection,
  where_clause: &str,
  params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<RawQuestion>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {QUESTION_COLUMNS} FROM questions {where_clause} ORDER BY id"
  ))?;
  let rows = stmt
    .query_map(params, RawQuestion::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

fn ids_json<I: IntoIterator<Item = i64>>(ids: I) -> Result<String> {
  Ok(serde_json::to_string(&ids.into_iter().collect::<Vec<_>>())?)
}

impl CatalogRepository {
  pub(crate) fn new(
    conn: tokio_rusqlite::Connection,
    schema: Arc<SchemaState>,
  ) -> Self {
    Self { conn, schema }
  }

  async fn delete_row(
    &self,
    table: &'static str,
    entity: &'static str,
    id: i64,
  ) -> Result<()> {
    let deleted = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          &format!("DELETE FROM {table} WHERE id = ?1"),
          rusqlite::params![id],
        )?)
      })
      .await?;
    if deleted == 0 {
      return Err(Error::NotFound { entity, id });
    }
    Ok(())
  }

  // ── Referentials ──────────────────────────────────────────────────────────

  pub async fn add_referential(&self, input: NewReferential) -> Result<Referential> {
    let NewReferential { code, label } = input;
    let (c, l) = (code.clone(), label.clone());

    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO referentials (code, label) VALUES (?1, ?2)",
          rusqlite::params![c, l],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await
      .map_err(constraint_error("referential", code.clone()))?;

    Ok(Referential { id, code, label })
  }

  async fn query_referentials(
    &self,
    where_clause: &'static str,
    params: Vec<rusqlite::types::Value>,
  ) -> Result<Vec<Referential>> {
    Ok(
      self
        .conn
        .call(move |conn| {
          let mut stmt = conn.prepare(&format!(
            "SELECT id, code, label FROM referentials {where_clause} ORDER BY code"
          ))?;
          let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
              Ok(Referential {
                id:    row.get(0)?,
                code:  row.get(1)?,
                label: row.get(2)?,
              })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
          Ok(rows)
        })
        .await?,
    )
  }

  pub async fn get_referential_by_id(
    &self,
    id: ReferentialId,
  ) -> Result<Option<Referential>> {
    Ok(self.query_referentials("WHERE id = ?1", vec![id.into()]).await?.pop())
  }

  pub async fn get_referential_by_code(
    &self,
    code: &str,
  ) -> Result<Option<Referential>> {
    Ok(
      self
        .query_referentials("WHERE code = ?1", vec![code.to_owned().into()])
        .await?
        .pop(),
    )
  }

  pub async fn get_all_referentials(&self) -> Result<Vec<Referential>> {
    self.query_referentials("", Vec::new()).await
  }

  /// Deletes the referential with its themes and blocks. Questions of those
  /// blocks are kept, detached from any block.
  pub async fn delete_referential(&self, id: ReferentialId) -> Result<()> {
    self.delete_row("referentials", "referential", id).await
  }

  // ── Themes ────────────────────────────────────────────────────────────────

  pub async fn add_theme(&self, input: NewTheme) -> Result<Theme> {
    let NewTheme { code, label, referential_id } = input;
    let (c, l) = (code.clone(), label.clone());

    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO themes (code, label, referential_id) VALUES (?1, ?2, ?3)",
          rusqlite::params![c, l, referential_id],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await
      .map_err(constraint_error("theme", code.clone()))?;

    Ok(Theme { id, code, label, referential_id })
  }

  async fn query_themes(
    &self,
    where_clause: &'static str,
    params: Vec<rusqlite::types::Value>,
  ) -> Result<Vec<Theme>> {
    Ok(
      self
        .conn
        .call(move |conn| {
          let mut stmt = conn.prepare(&format!(
            "SELECT id, code, label, referential_id FROM themes {where_clause}
             ORDER BY referential_id, code"
          ))?;
          let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
              Ok(Theme {
                id:             row.get(0)?,
                code:           row.get(1)?,
                label:          row.get(2)?,
                referential_id: row.get(3)?,
              })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
          Ok(rows)
        })
        .await?,
    )
  }

  pub async fn get_theme_by_id(&self, id: ThemeId) -> Result<Option<Theme>> {
    Ok(self.query_themes("WHERE id = ?1", vec![id.into()]).await?.pop())
  }

  pub async fn get_theme_by_code(
    &self,
    code: &str,
    referential_id: ReferentialId,
  ) -> Result<Option<Theme>> {
    Ok(
      self
        .query_themes(
          "WHERE code = ?1 AND referential_id = ?2",
          vec![code.to_owned().into(), referential_id.into()],
        )
        .await?
        .pop(),
    )
  }

  pub async fn get_themes_by_referential(
    &self,
    referential_id: ReferentialId,
  ) -> Result<Vec<Theme>> {
    self
      .query_themes("WHERE referential_id = ?1", vec![referential_id.into()])
      .await
  }

  pub async fn get_all_themes(&self) -> Result<Vec<Theme>> {
    self.query_themes("", Vec::new()).await
  }

  pub async fn delete_theme(&self, id: ThemeId) -> Result<()> {
    self.delete_row("themes", "theme", id).await
  }

  // ── Blocks ────────────────────────────────────────────────────────────────

  pub async fn add_block(&self, input: NewBlock) -> Result<Block> {
    let NewBlock { code, label, theme_id } = input;
    let (c, l) = (code.clone(), label.clone());

    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO blocks (code, label, theme_id) VALUES (?1, ?2, ?3)",
          rusqlite::params![c, l, theme_id],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await
      .map_err(constraint_error("block", code.clone()))?;

    Ok(Block { id, code, label, theme_id })
  }

  async fn query_blocks(
    &self,
    where_clause: &'static str,
    params: Vec<rusqlite::types::Value>,
  ) -> Result<Vec<Block>> {
    Ok(
      self
        .conn
        .call(move |conn| {
          let mut stmt = conn.prepare(&format!(
            "SELECT id, code, label, theme_id FROM blocks {where_clause}
             ORDER BY theme_id, code"
          ))?;
          let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
              Ok(Block {
                id:       row.get(0)?,
                code:     row.get(1)?,
                label:    row.get(2)?,
                theme_id: row.get(3)?,
              })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
          Ok(rows)
        })
        .await?,
    )
  }

  pub async fn get_block_by_id(&self, id: BlockId) -> Result<Option<Block>> {
    Ok(self.query_blocks("WHERE id = ?1", vec![id.into()]).await?.pop())
  }

  pub async fn get_block_by_code(
    &self,
    code: &str,
    theme_id: ThemeId,
  ) -> Result<Option<Block>> {
    Ok(
      self
        .query_blocks(
          "WHERE code = ?1 AND theme_id = ?2",
          vec![code.to_owned().into(), theme_id.into()],
        )
        .await?
        .pop(),
    )
  }

  pub async fn get_blocks_by_theme(&self, theme_id: ThemeId) -> Result<Vec<Block>> {
    self.query_blocks("WHERE theme_id = ?1", vec![theme_id.into()]).await
  }

  pub async fn get_all_blocks(&self) -> Result<Vec<Block>> {
    self.query_blocks("", Vec::new()).await
  }

  /// Deletes the block. Its questions survive with no block.
  pub async fn delete_block(&self, id: BlockId) -> Result<()> {
    self.delete_row("blocks", "block", id).await
  }

  // ── Questions ─────────────────────────────────────────────────────────────

  /// Always inserts a new row; see [`Self::upsert_question`] for
  /// deduplication.
  pub async fn add_question(&self, input: NewQuestion) -> Result<Question> {
    self.schema.require(QUESTION_STEP)?;
    let now = Utc::now();
    let params = QuestionParams::encode(input.clone())?;
    let key = params.key();
    let now_str = encode_dt(now);

    let id = self
      .conn
      .call(move |conn| Ok(insert_question(conn, &params, &now_str)?))
      .await
      .map_err(constraint_error("question", key))?;

    Ok(Question {
      id,
      user_question_id: input.user_question_id,
      block_id: input.block_id,
      text: input.text,
      question_type: input.question_type,
      options: input.options,
      correct_answer: input.correct_answer,
      time_limit_seconds: input.time_limit_seconds,
      is_eliminatory: input.is_eliminatory,
      slide_guid: input.slide_guid,
      usage_count: input.usage_count,
      correct_response_rate: input.correct_response_rate,
      version: input.version,
      created_at: now,
      updated_at: Some(now),
    })
  }

  /// Inserts or updates keyed by `user_question_id`. Without one this is
  /// [`Self::add_question`].
  pub async fn upsert_question(&self, input: NewQuestion) -> Result<Question> {
    self.schema.require(QUESTION_STEP)?;
    let params = QuestionParams::encode(input)?;
    let key = params.key();
    let now = encode_dt(Utc::now());

    let id = self
      .conn
      .call(move |conn| Ok(upsert_question_row(conn, &params, &now)?))
      .await
      .map_err(constraint_error("question", key))?;

    self
      .get_question_by_id(id)
      .await?
      .ok_or(Error::NotFound { entity: "question", id })
  }

  /// Upserts every question in one transaction. Any failure leaves the
  /// catalog unchanged.
  pub async fn bulk_upsert_questions(
    &self,
    inputs: Vec<NewQuestion>,
  ) -> Result<Vec<Question>> {
    self.schema.require(QUESTION_STEP)?;
    let params = inputs
      .into_iter()
      .map(QuestionParams::encode)
      .collect::<Result<Vec<_>>>()?;
    let count = params.len();
    let now = encode_dt(Utc::now());

    let ids: Vec<QuestionId> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(params.len());
        for q in &params {
          ids.push(upsert_question_row(&tx, q, &now)?);
        }
        tx.commit()?;
        Ok(ids)
      })
      .await
      .map_err(constraint_error("question", format!("batch of {count}")))?;

    tracing::debug!(count, "upserted questions");

    // Re-read in input order; an id appears twice when the batch repeats a
    // user question id.
    let by_id: std::collections::HashMap<QuestionId, Question> = self
      .get_questions_by_ids(&ids)
      .await?
      .into_iter()
      .map(|q| (q.id, q))
      .collect();
    Ok(ids.iter().filter_map(|id| by_id.get(id).cloned()).collect())
  }

  pub async fn get_question_by_id(&self, id: QuestionId) -> Result<Option<Question>> {
    self.schema.require(QUESTION_STEP)?;
    let raw = self
      .conn
      .call(move |conn| {
        Ok(query_questions(conn, "WHERE id = ?1", rusqlite::params![id])?.pop())
      })
      .await?;
    raw.map(RawQuestion::into_question).transpose()
  }

  pub async fn get_all_questions(&self) -> Result<Vec<Question>> {
    self.schema.require(QUESTION_STEP)?;
    let raws = self
      .conn
      .call(|conn| Ok(query_questions(conn, "", [])?))
      .await?;
    raws.into_iter().map(RawQuestion::into_question).collect()
  }

  pub async fn get_questions_by_block(&self, block_id: BlockId) -> Result<Vec<Question>> {
    self.schema.require(QUESTION_STEP)?;
    let raws = self
      .conn
      .call(move |conn| {
        Ok(query_questions(conn, "WHERE block_id = ?1", rusqlite::params![block_id])?)
      })
      .await?;
    raws.into_iter().map(RawQuestion::into_question).collect()
  }

  /// Questions with the given ids, ordered by id. Unknown ids are skipped.
  pub async fn get_questions_by_ids(&self, ids: &[QuestionId]) -> Result<Vec<Question>> {
    self.schema.require(QUESTION_STEP)?;
    let ids = ids_json(ids.iter().copied())?;
    let raws = self
      .conn
      .call(move |conn| {
        Ok(query_questions(
          conn,
          "WHERE id IN (SELECT value FROM json_each(?1))",
          rusqlite::params![ids],
        )?)
      })
      .await?;
    raws.into_iter().map(RawQuestion::into_question).collect()
  }

  pub async fn get_questions_for_blocks(
    &self,
    block_ids: &BTreeSet<BlockId>,
  ) -> Result<Vec<Question>> {
    self.schema.require(QUESTION_STEP)?;
    let ids = ids_json(block_ids.iter().copied())?;
    let raws = self
      .conn
      .call(move |conn| {
        Ok(query_questions(
          conn,
          "WHERE block_id IN (SELECT value FROM json_each(?1))",
          rusqlite::params![ids],
        )?)
      })
      .await?;
    raws.into_iter().map(RawQuestion::into_question).collect()
  }

  pub async fn update_question(
    &self,
    id: QuestionId,
    update: QuestionUpdate,
  ) -> Result<Question> {
    let mut q = self
      .get_question_by_id(id)
      .await?
      .ok_or(Error::NotFound { entity: "question", id })?;

    if let Some(block_id) = update.block_id {
      q.block_id = block_id;
    }
    if let Some(text) = update.text {
      q.text = text;
    }
    if let Some(question_type) = update.question_type {
      q.question_type = question_type;
    }
    if let Some(options) = update.options {
      q.options = options;
    }
    if let Some(answer) = update.correct_answer {
      q.correct_answer = answer;
    }
    if let Some(limit) = update.time_limit_seconds {
      q.time_limit_seconds = limit;
    }
    if let Some(eliminatory) = update.is_eliminatory {
      q.is_eliminatory = eliminatory;
    }
    if let Some(guid) = update.slide_guid {
      q.slide_guid = guid;
    }
    if let Some(count) = update.usage_count {
      q.usage_count = count;
    }
    if let Some(rate) = update.correct_response_rate {
      q.correct_response_rate = rate;
    }
    if let Some(version) = update.version {
      q.version = version;
    }
    let now = Utc::now();
    q.updated_at = Some(now);

    let options = encode_options(&q.options)?;
    let now_str = encode_dt(now);
    let kind = encode_question_type(q.question_type);
    let (block_id, text, answer, limit, elim, guid, usage, rate, version) = (
      q.block_id,
      q.text.clone(),
      q.correct_answer.clone(),
      q.time_limit_seconds,
      q.is_eliminatory,
      q.slide_guid.clone(),
      q.usage_count,
      q.correct_response_rate,
      q.version.clone(),
    );

    let updated = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE questions SET
             block_id = ?2, text = ?3, question_type = ?4, options = ?5,
             correct_answer = ?6, time_limit_seconds = ?7, is_eliminatory = ?8,
             slide_guid = ?9, usage_count = ?10, correct_response_rate = ?11,
             version = ?12, updated_at = ?13
           WHERE id = ?1",
          rusqlite::params![
            id, block_id, text, kind, options, answer, limit, elim, guid, usage,
            rate, version, now_str,
          ],
        )?)
      })
      .await
      .map_err(constraint_error("question", id.to_string()))?;

    if updated == 0 {
      return Err(Error::NotFound { entity: "question", id });
    }
    Ok(q)
  }

  pub async fn delete_question(&self, id: QuestionId) -> Result<()> {
    self.delete_row("questions", "question", id).await
  }

  pub async fn question_count(&self) -> Result<u64> {
    let count: i64 = self
      .conn
      .call(|conn| {
        Ok(conn.query_row("SELECT COUNT(*) FROM questions", [], |row| row.get(0))?)
      })
      .await?;
    Ok(count.max(0) as u64)
  }

  /// Resolves each question to its theme and block for scoring. Questions
  /// without a block are filed under [`UNASSIGNED_THEME`]. The theme label
  /// is the theme's code.
  pub async fn exam_questions(&self, ids: &[QuestionId]) -> Result<Vec<ExamQuestion>> {
    let ids = ids_json(ids.iter().copied())?;
    Ok(
      self
        .conn
        .call(move |conn| {
          let mut stmt = conn.prepare(
            "SELECT q.id, t.code, q.block_id
               FROM questions q
               LEFT JOIN blocks b ON b.id = q.block_id
               LEFT JOIN themes t ON t.id = b.theme_id
              WHERE q.id IN (SELECT value FROM json_each(?1))
              ORDER BY q.id",
          )?;
          let rows = stmt
            .query_map(rusqlite::params![ids], |row| {
              let theme: Option<String> = row.get(1)?;
              Ok(ExamQuestion {
                question_id: row.get(0)?,
                theme_label: theme.unwrap_or_else(|| UNASSIGNED_THEME.to_owned()),
                block_id:    row.get(2)?,
              })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
          Ok(rows)
        })
        .await?,
    )
  }
}
