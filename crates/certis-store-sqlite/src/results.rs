//! [`ResultRepository`]: answers recorded per session, question and device.

use std::sync::Arc;

use rusqlite::OptionalExtension as _;

use certis_core::{
  catalog::QuestionId,
  result::{NewSessionResult, ResultId, SessionResult, SessionResultUpdate},
  session::{IterationId, SessionId},
};

use crate::{
  Error, Result,
  encode::{RESULT_COLUMNS, RawResult, encode_answer, encode_millis},
  error::constraint_error,
  schema::SchemaState,
};

/// Results gained their iteration and participant attribution in this step.
const RESULT_STEP: u32 = 4;

/// A [`NewSessionResult`] with every column encoded.
struct ResultParams {
  session_id:           SessionId,
  session_iteration_id: Option<IterationId>,
  question_id:          QuestionId,
  device_serial:        String,
  participant_id:       Option<i64>,
  answer:               Option<String>,
  is_correct:           bool,
  points_obtained:      i64,
  timestamp:            i64,
}

impl ResultParams {
  fn encode(r: &NewSessionResult) -> Result<Self> {
    Ok(Self {
      session_id:           r.session_id,
      session_iteration_id: r.session_iteration_id,
      question_id:          r.question_id,
      device_serial:        r.device_serial.clone(),
      participant_id:       r.participant_id,
      answer:               encode_answer(r.answer.as_ref())?,
      is_correct:           r.is_correct,
      points_obtained:      r.points_obtained,
      timestamp:            encode_millis(r.timestamp),
    })
  }
}

const INSERT_RESULT: &str = "INSERT INTO session_results (
    session_id, session_iteration_id, question_id, device_serial,
    participant_id, answer, is_correct, points_obtained, timestamp
  ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

fn insert_result(conn: &rusqlite::Connection, p: &ResultParams) -> rusqlite::Result<ResultId> {
  conn.execute(
    INSERT_RESULT,
    rusqlite::params![
      p.session_id,
      p.session_iteration_id,
      p.question_id,
      p.device_serial,
      p.participant_id,
      p.answer,
      p.is_correct,
      p.points_obtained,
      p.timestamp,
    ],
  )?;
  Ok(conn.last_insert_rowid())
}

fn with_id(id: ResultId, r: NewSessionResult) -> SessionResult {
  SessionResult {
    id,
    session_id: r.session_id,
    session_iteration_id: r.session_iteration_id,
    question_id: r.question_id,
    device_serial: r.device_serial,
    participant_id: r.participant_id,
    answer: r.answer,
    is_correct: r.is_correct,
    points_obtained: r.points_obtained,
    timestamp: r.timestamp,
  }
}

#[derive(Clone)]
pub struct ResultRepository {
  conn:   tokio_rusqlite::Connection,
  schema: Arc<SchemaState>,
}

impl ResultRepository {
  pub(crate) fn new(
    conn: tokio_rusqlite::Connection,
    schema: Arc<SchemaState>,
  ) -> Self {
    Self { conn, schema }
  }

  // ── Writes ────────────────────────────────────────────────────────────────

  pub async fn add_session_result(&self, input: NewSessionResult) -> Result<SessionResult> {
    self.schema.require(RESULT_STEP)?;
    let p = ResultParams::encode(&input)?;
    let key = format!("session {} question {}", p.session_id, p.question_id);
    let id = self
      .conn
      .call(move |conn| Ok(insert_result(conn, &p)?))
      .await
      .map_err(constraint_error("session result", key))?;
    Ok(with_id(id, input))
  }

  /// Inserts every result in one transaction and returns their ids in input
  /// order. If any row is rejected nothing is persisted.
  pub async fn add_bulk_session_results(
    &self,
    inputs: Vec<NewSessionResult>,
  ) -> Result<Vec<ResultId>> {
    self.schema.require(RESULT_STEP)?;
    let count = inputs.len();
    let params = inputs
      .iter()
      .map(ResultParams::encode)
      .collect::<Result<Vec<_>>>()?;

    let ids = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let ids = params
          .iter()
          .map(|p| insert_result(&tx, p))
          .collect::<rusqlite::Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(ids)
      })
      .await
      .map_err(constraint_error("session result", format!("batch of {count}")))?;

    tracing::debug!(count, "stored session results");
    Ok(ids)
  }

  /// Applies a correction to one result.
  pub async fn update_session_result(
    &self,
    id: ResultId,
    update: SessionResultUpdate,
  ) -> Result<SessionResult> {
    self.schema.require(RESULT_STEP)?;
    let mut result = self
      .get_result_by_id(id)
      .await?
      .ok_or(Error::NotFound { entity: "session result", id })?;
    if let Some(v) = update.participant_id {
      result.participant_id = v;
    }
    if let Some(v) = update.answer {
      result.answer = v;
    }
    if let Some(v) = update.is_correct {
      result.is_correct = v;
    }
    if let Some(v) = update.points_obtained {
      result.points_obtained = v;
    }

    let participant_id = result.participant_id;
    let answer = encode_answer(result.answer.as_ref())?;
    let (is_correct, points) = (result.is_correct, result.points_obtained);
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE session_results
              SET participant_id = ?2, answer = ?3, is_correct = ?4,
                  points_obtained = ?5
            WHERE id = ?1",
          rusqlite::params![id, participant_id, answer, is_correct, points],
        )?;
        Ok(())
      })
      .await
      .map_err(constraint_error("session result", id.to_string()))?;
    Ok(result)
  }

  pub async fn delete_results_for_session(&self, session_id: SessionId) -> Result<usize> {
    Ok(
      self
        .conn
        .call(move |conn| {
          Ok(conn.execute(
            "DELETE FROM session_results WHERE session_id = ?1",
            rusqlite::params![session_id],
          )?)
        })
        .await?,
    )
  }

  pub async fn delete_results_for_iteration(
    &self,
    iteration_id: IterationId,
  ) -> Result<usize> {
    self.schema.require(RESULT_STEP)?;
    Ok(
      self
        .conn
        .call(move |conn| {
          Ok(conn.execute(
            "DELETE FROM session_results WHERE session_iteration_id = ?1",
            rusqlite::params![iteration_id],
          )?)
        })
        .await?,
    )
  }

  // ── Reads ─────────────────────────────────────────────────────────────────

  async fn query_results(
    &self,
    where_clause: &'static str,
    params: Vec<rusqlite::types::Value>,
  ) -> Result<Vec<SessionResult>> {
    self.schema.require(RESULT_STEP)?;
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {RESULT_COLUMNS} FROM session_results {where_clause}
            ORDER BY timestamp, id"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), RawResult::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawResult::into_result).collect()
  }

  pub async fn get_result_by_id(&self, id: ResultId) -> Result<Option<SessionResult>> {
    Ok(
      self
        .query_results("WHERE id = ?1", vec![id.into()])
        .await?
        .into_iter()
        .next(),
    )
  }

  /// Every result of a session, oldest first.
  pub async fn get_results_for_session(
    &self,
    session_id: SessionId,
  ) -> Result<Vec<SessionResult>> {
    self
      .query_results("WHERE session_id = ?1", vec![session_id.into()])
      .await
  }

  pub async fn get_results_for_iteration(
    &self,
    iteration_id: IterationId,
  ) -> Result<Vec<SessionResult>> {
    self
      .query_results("WHERE session_iteration_id = ?1", vec![iteration_id.into()])
      .await
  }

  pub async fn get_all_results(&self) -> Result<Vec<SessionResult>> {
    self.query_results("", Vec::new()).await
  }

  /// The latest answer a device gave to a question within a session.
  pub async fn get_result_by_session_and_question(
    &self,
    session_id: SessionId,
    question_id: QuestionId,
    device_serial: &str,
  ) -> Result<Option<SessionResult>> {
    self.schema.require(RESULT_STEP)?;
    let serial = device_serial.to_owned();
    let raw = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {RESULT_COLUMNS} FROM session_results
                  WHERE session_id = ?1 AND question_id = ?2 AND device_serial = ?3
                  ORDER BY timestamp DESC, id DESC LIMIT 1"
              ),
              rusqlite::params![session_id, question_id, serial],
              RawResult::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawResult::into_result).transpose()
  }
}
