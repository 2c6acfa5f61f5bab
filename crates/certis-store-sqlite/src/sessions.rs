//! [`SessionRepository`]: sessions, iterations and their lifecycle.
//!
//! Participants and assignments live in `participants.rs` as a second `impl`
//! block on the same repository.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension as _};
use serde::Serialize;

use certis_core::{
  participant::{AssignedParticipant, Participant},
  session::{
    IterationDetail, IterationId, IterationStatus, NewSession,
    NewSessionIteration, Session, SessionDetail, SessionId, SessionIteration,
    SessionStatus, SessionSummary, SessionUpdate,
  },
};

use crate::{
  Error, Result,
  encode::{
    ITERATION_COLUMNS, RawIteration, RawSession, SESSION_COLUMN_COUNT,
    SESSION_COLUMNS, decode_assignment_status, decode_iteration_status,
    encode_anomalies,
    encode_block_ids, encode_date, encode_dt, encode_iteration_status,
    encode_mappings, encode_session_status, encode_slide_guids,
  },
  error::constraint_error,
  schema::SchemaState,
};

mod participants;

/// Sessions gained their lifecycle columns in this step.
pub(crate) const SESSION_STEP: u32 = 2;
/// Iterations gained `updated_at` and `generated_file_path`.
pub(crate) const ITERATION_STEP: u32 = 3;
/// Assignments gained their presence status.
pub(crate) const ASSIGNMENT_STEP: u32 = 7;

/// Completed sessions are archived this long after their results were
/// imported.
pub const ARCHIVE_AFTER_DAYS: i64 = 7;

/// Status of a session after a finalization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "kebab-case")]
pub enum Finalization {
  /// Every iteration was settled; the session is now completed.
  Completed,
  /// Already completed or cancelled; nothing changed.
  Unchanged(SessionStatus),
  /// Some iteration is still open, or there are none.
  Pending(SessionStatus),
}

fn session_row(conn: &Connection, id: SessionId) -> rusqlite::Result<Option<RawSession>> {
  conn
    .query_row(
      &format!("SELECT {SESSION_COLUMNS} FROM sessions s WHERE s.id = ?1"),
      rusqlite::params![id],
      RawSession::from_row,
    )
    .optional()
}

fn iteration_rows(
  conn: &Connection,
  session_id: SessionId,
) -> rusqlite::Result<Vec<RawIteration>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {ITERATION_COLUMNS} FROM session_iterations
      WHERE session_id = ?1 ORDER BY iteration_index"
  ))?;
  let rows = stmt
    .query_map(rusqlite::params![session_id], RawIteration::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

/// An assignment joined with participant and device, status still raw.
struct RawAssigned {
  participant:      Participant,
  voting_device_id: i64,
  device_serial:    String,
  kit_id:           i64,
  status:           String,
}

impl RawAssigned {
  fn into_assigned(self) -> Result<AssignedParticipant> {
    Ok(AssignedParticipant {
      participant:      self.participant,
      voting_device_id: self.voting_device_id,
      device_serial:    self.device_serial,
      kit_id:           self.kit_id,
      status:           decode_assignment_status(&self.status)?,
    })
  }
}

fn assigned_rows(
  conn: &Connection,
  iteration_id: i64,
) -> rusqlite::Result<Vec<RawAssigned>> {
  let mut stmt = conn.prepare(
    "SELECT p.id, p.first_name, p.last_name, p.organization,
            p.identification_code, pa.voting_device_id, v.serial_number,
            pa.kit_id, pa.status
       FROM participant_assignments pa
       JOIN participants   p ON p.id = pa.participant_id
       JOIN voting_devices v ON v.id = pa.voting_device_id
      WHERE pa.session_iteration_id = ?1
      ORDER BY p.last_name, p.first_name, p.id",
  )?;
  let rows = stmt
    .query_map(rusqlite::params![iteration_id], |row| {
      Ok(RawAssigned {
        participant:      Participant {
          id:                  row.get(0)?,
          first_name:          row.get(1)?,
          last_name:           row.get(2)?,
          organization:        row.get(3)?,
          identification_code: row.get(4)?,
        },
        voting_device_id: row.get(5)?,
        device_serial:    row.get(6)?,
        kit_id:           row.get(7)?,
        status:           row.get(8)?,
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

/// Every column of a session row, encoded.
struct SessionParams {
  name:                      String,
  date:                      String,
  referential_id:            Option<i64>,
  selected_block_ids:        String,
  selected_kit_id:           Option<i64>,
  trainer_id:                Option<i64>,
  status:                    &'static str,
  ignored_slide_guids:       String,
  resolved_import_anomalies: Option<String>,
  iteration_count:           u32,
  location:                  Option<String>,
  notes:                     Option<String>,
  session_number:            Option<String>,
  stage_number:              Option<String>,
  results_imported_at:       Option<String>,
}

impl SessionParams {
  fn encode(s: &Session) -> Result<Self> {
    Ok(Self {
      name:                      s.name.clone(),
      date:                      encode_date(s.date),
      referential_id:            s.referential_id,
      selected_block_ids:        encode_block_ids(&s.selected_block_ids)?,
      selected_kit_id:           s.selected_kit_id,
      trainer_id:                s.trainer_id,
      status:                    encode_session_status(s.status),
      ignored_slide_guids:       encode_slide_guids(&s.ignored_slide_guids)?,
      resolved_import_anomalies: encode_anomalies(
        s.resolved_import_anomalies.as_ref(),
      )?,
      iteration_count:           s.iteration_count,
      location:                  s.location.clone(),
      notes:                     s.notes.clone(),
      session_number:            s.session_number.clone(),
      stage_number:              s.stage_number.clone(),
      results_imported_at:       s.results_imported_at.map(encode_dt),
    })
  }
}

#[derive(Clone)]
pub struct SessionRepository {
  conn:   tokio_rusqlite::Connection,
  schema: Arc<SchemaState>,
}

impl SessionRepository {
  pub(crate) fn new(
    conn: tokio_rusqlite::Connection,
    schema: Arc<SchemaState>,
  ) -> Self {
    Self { conn, schema }
  }

  // ── Sessions ──────────────────────────────────────────────────────────────

  /// Creates a session in the `planned` state.
  pub async fn add_session(&self, input: NewSession) -> Result<Session> {
    self.schema.require(SESSION_STEP)?;
    let now = Utc::now();
    let mut session = Session {
      id:                        0,
      name:                      input.name,
      date:                      input.date,
      referential_id:            input.referential_id,
      selected_block_ids:        input.selected_block_ids,
      selected_kit_id:           input.selected_kit_id,
      trainer_id:                input.trainer_id,
      status:                    SessionStatus::Planned,
      ignored_slide_guids:       Default::default(),
      resolved_import_anomalies: None,
      iteration_count:           input.iteration_count,
      location:                  input.location,
      notes:                     input.notes,
      session_number:            input.session_number,
      stage_number:              input.stage_number,
      created_at:                now,
      updated_at:                Some(now),
      results_imported_at:       None,
      archived_at:               None,
    };

    let p = SessionParams::encode(&session)?;
    let now_str = encode_dt(now);
    session.id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO sessions (
             name, date, referential_id, selected_block_ids, selected_kit_id,
             trainer_id, status, ignored_slide_guids, resolved_import_anomalies,
             iteration_count, location, notes, session_number, stage_number,
             created_at, updated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
          rusqlite::params![
            p.name,
            p.date,
            p.referential_id,
            p.selected_block_ids,
            p.selected_kit_id,
            p.trainer_id,
            p.status,
            p.ignored_slide_guids,
            p.resolved_import_anomalies,
            p.iteration_count,
            p.location,
            p.notes,
            p.session_number,
            p.stage_number,
            now_str,
          ],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await
      .map_err(constraint_error("session", session.name.clone()))?;

    Ok(session)
  }

  /// Every session with its derived participant count and average score,
  /// newest first.
  pub async fn get_all_sessions(&self) -> Result<Vec<SessionSummary>> {
    self.schema.require(SESSION_STEP)?;
    let rows: Vec<(RawSession, u32, Option<f64>)> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SESSION_COLUMNS},
             (SELECT COUNT(DISTINCT pa.participant_id)
                FROM participant_assignments pa
                JOIN session_iterations si ON si.id = pa.session_iteration_id
               WHERE si.session_id = s.id),
             (SELECT AVG(r.is_correct) * 100.0
                FROM session_results r
               WHERE r.session_id = s.id)
           FROM sessions s
           ORDER BY s.date DESC, s.created_at DESC, s.id DESC"
        ))?;
        let rows = stmt
          .query_map([], |row| {
            Ok((
              RawSession::from_row(row)?,
              row.get(SESSION_COLUMN_COUNT)?,
              row.get(SESSION_COLUMN_COUNT + 1)?,
            ))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(raw, participant_count, average_score)| {
        Ok(SessionSummary {
          session: raw.into_session()?,
          participant_count,
          average_score,
        })
      })
      .collect()
  }

  /// The bare session row.
  pub async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
    self.schema.require(SESSION_STEP)?;
    let raw = self
      .conn
      .call(move |conn| Ok(session_row(conn, id)?))
      .await?;
    raw.map(RawSession::into_session).transpose()
  }

  /// The session with its iterations in index order, each iteration's
  /// assignments, and every participant assigned in any iteration.
  pub async fn get_session_by_id(&self, id: SessionId) -> Result<Option<SessionDetail>> {
    self.schema.require(SESSION_STEP)?;
    self.schema.require(ITERATION_STEP)?;
    self.schema.require(ASSIGNMENT_STEP)?;

    let raw = self
      .conn
      .call(move |conn| {
        let Some(session) = session_row(conn, id)? else {
          return Ok(None);
        };
        let mut iterations = Vec::new();
        for iteration in iteration_rows(conn, id)? {
          let assigned = assigned_rows(conn, iteration.id)?;
          iterations.push((iteration, assigned));
        }
        Ok(Some((session, iterations)))
      })
      .await?;

    let Some((session, raw_iterations)) = raw else {
      return Ok(None);
    };

    let mut participants: Vec<Participant> = Vec::new();
    let mut iterations = Vec::with_capacity(raw_iterations.len());
    for (iteration, assigned) in raw_iterations {
      let assignments = assigned
        .into_iter()
        .map(RawAssigned::into_assigned)
        .collect::<Result<Vec<_>>>()?;
      for a in &assignments {
        if !participants.iter().any(|p| p.id == a.participant.id) {
          participants.push(a.participant.clone());
        }
      }
      iterations.push(IterationDetail {
        iteration: iteration.into_iteration()?,
        assignments,
      });
    }
    participants.sort_by(|a, b| {
      (&a.last_name, &a.first_name, a.id).cmp(&(&b.last_name, &b.first_name, b.id))
    });

    Ok(Some(SessionDetail {
      session: session.into_session()?,
      iterations,
      participants,
    }))
  }

  /// Applies `update`. A status change must be a legal transition; the
  /// `completed` state is only reachable through
  /// [`Self::check_and_finalize_session_status`].
  pub async fn update_session(
    &self,
    id: SessionId,
    update: SessionUpdate,
  ) -> Result<Session> {
    let mut s = self
      .get_session(id)
      .await?
      .ok_or(Error::NotFound { entity: "session", id })?;

    if let Some(status) = update.status {
      s.status = s.status.transition_to(status)?;
    }
    if let Some(name) = update.name {
      s.name = name;
    }
    if let Some(date) = update.date {
      s.date = date;
    }
    if let Some(v) = update.referential_id {
      s.referential_id = v;
    }
    if let Some(v) = update.selected_block_ids {
      s.selected_block_ids = v;
    }
    if let Some(v) = update.selected_kit_id {
      s.selected_kit_id = v;
    }
    if let Some(v) = update.trainer_id {
      s.trainer_id = v;
    }
    if let Some(v) = update.ignored_slide_guids {
      s.ignored_slide_guids = v;
    }
    if let Some(v) = update.resolved_import_anomalies {
      s.resolved_import_anomalies = v;
    }
    if let Some(v) = update.iteration_count {
      s.iteration_count = v;
    }
    if let Some(v) = update.location {
      s.location = v;
    }
    if let Some(v) = update.notes {
      s.notes = v;
    }
    if let Some(v) = update.session_number {
      s.session_number = v;
    }
    if let Some(v) = update.stage_number {
      s.stage_number = v;
    }
    if let Some(v) = update.results_imported_at {
      s.results_imported_at = v;
    }
    let now = Utc::now();
    s.updated_at = Some(now);

    let p = SessionParams::encode(&s)?;
    let now_str = encode_dt(now);
    let updated = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE sessions SET
             name = ?2, date = ?3, referential_id = ?4, selected_block_ids = ?5,
             selected_kit_id = ?6, trainer_id = ?7, status = ?8,
             ignored_slide_guids = ?9, resolved_import_anomalies = ?10,
             iteration_count = ?11, location = ?12, notes = ?13,
             session_number = ?14, stage_number = ?15,
             results_imported_at = ?16, updated_at = ?17
           WHERE id = ?1",
          rusqlite::params![
            id,
            p.name,
            p.date,
            p.referential_id,
            p.selected_block_ids,
            p.selected_kit_id,
            p.trainer_id,
            p.status,
            p.ignored_slide_guids,
            p.resolved_import_anomalies,
            p.iteration_count,
            p.location,
            p.notes,
            p.session_number,
            p.stage_number,
            p.results_imported_at,
            now_str,
          ],
        )?)
      })
      .await
      .map_err(constraint_error("session", s.name.clone()))?;

    if updated == 0 {
      return Err(Error::NotFound { entity: "session", id });
    }
    Ok(s)
  }

  /// Deletes the session with its iterations, assignments and results.
  pub async fn delete_session(&self, id: SessionId) -> Result<()> {
    let deleted = self
      .conn
      .call(move |conn| {
        Ok(conn.execute("DELETE FROM sessions WHERE id = ?1", rusqlite::params![id])?)
      })
      .await?;
    if deleted == 0 {
      return Err(Error::NotFound { entity: "session", id });
    }
    Ok(())
  }

  // ── Iterations ────────────────────────────────────────────────────────────

  /// Upserts the iteration keyed by `(session_id, iteration_index)`. An
  /// update only touches the file path, status and question mappings; the
  /// name is set once, on insert.
  pub async fn add_or_update_session_iteration(
    &self,
    input: NewSessionIteration,
  ) -> Result<SessionIteration> {
    self.schema.require(ITERATION_STEP)?;
    let NewSessionIteration {
      session_id,
      iteration_index,
      name,
      generated_file_path,
      status,
      question_mappings,
    } = input;
    let mappings = encode_mappings(&question_mappings)?;
    let status = encode_iteration_status(status);
    let now = encode_dt(Utc::now());

    let raw = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
          .query_row(
            "SELECT id FROM session_iterations
              WHERE session_id = ?1 AND iteration_index = ?2",
            rusqlite::params![session_id, iteration_index],
            |row| row.get(0),
          )
          .optional()?;

        let id = match existing {
          Some(id) => {
            tx.execute(
              "UPDATE session_iterations SET
                 generated_file_path = ?2, status = ?3, question_mappings = ?4,
                 updated_at = ?5
               WHERE id = ?1",
              rusqlite::params![id, generated_file_path, status, mappings, now],
            )?;
            id
          }
          None => {
            let name = name
              .unwrap_or_else(|| NewSessionIteration::default_name(iteration_index));
            tx.execute(
              "INSERT INTO session_iterations (
                 session_id, iteration_index, name, generated_file_path,
                 status, question_mappings, created_at, updated_at
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
              rusqlite::params![
                session_id,
                iteration_index,
                name,
                generated_file_path,
                status,
                mappings,
                now,
              ],
            )?;
            tx.last_insert_rowid()
          }
        };

        let raw = tx.query_row(
          &format!("SELECT {ITERATION_COLUMNS} FROM session_iterations WHERE id = ?1"),
          rusqlite::params![id],
          RawIteration::from_row,
        )?;
        tx.commit()?;
        Ok(raw)
      })
      .await
      .map_err(constraint_error("session iteration", format!("session {session_id}")))?;

    raw.into_iteration()
  }

  pub async fn get_session_iterations(
    &self,
    session_id: SessionId,
  ) -> Result<Vec<SessionIteration>> {
    self.schema.require(ITERATION_STEP)?;
    let raws = self
      .conn
      .call(move |conn| Ok(iteration_rows(conn, session_id)?))
      .await?;
    raws.into_iter().map(RawIteration::into_iteration).collect()
  }

  pub async fn set_iteration_status(
    &self,
    iteration_id: IterationId,
    status: IterationStatus,
  ) -> Result<()> {
    self.schema.require(ITERATION_STEP)?;
    let status = encode_iteration_status(status);
    let now = encode_dt(Utc::now());
    let updated = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE session_iterations SET status = ?2, updated_at = ?3 WHERE id = ?1",
          rusqlite::params![iteration_id, status, now],
        )?)
      })
      .await?;
    if updated == 0 {
      return Err(Error::NotFound { entity: "session iteration", id: iteration_id });
    }
    Ok(())
  }

  // ── Lifecycle ─────────────────────────────────────────────────────────────

  /// Completes the session once it has at least one iteration and every
  /// iteration is completed or cancelled, stamping `results_imported_at`.
  pub async fn check_and_finalize_session_status(
    &self,
    id: SessionId,
  ) -> Result<Finalization> {
    self.schema.require(SESSION_STEP)?;
    self.schema.require(ITERATION_STEP)?;
    let now = encode_dt(Utc::now());

    let found = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let Some(status) = tx
          .query_row(
            "SELECT status FROM sessions WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get::<_, String>(0),
          )
          .optional()?
        else {
          return Ok(None);
        };

        let iteration_statuses = {
          let mut stmt =
            tx.prepare("SELECT status FROM session_iterations WHERE session_id = ?1")?;
          stmt
            .query_map(rusqlite::params![id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        // An unreadable iteration status counts as unsettled.
        let settled_all = !iteration_statuses.is_empty()
          && iteration_statuses
            .iter()
            .all(|s| decode_iteration_status(s).is_ok_and(IterationStatus::is_settled));
        let terminal = status
          .parse::<SessionStatus>()
          .is_ok_and(SessionStatus::is_terminal);
        if settled_all && !terminal {
          tx.execute(
            "UPDATE sessions
                SET status = 'completed', results_imported_at = ?2, updated_at = ?2
              WHERE id = ?1",
            rusqlite::params![id, now],
          )?;
        }
        tx.commit()?;
        Ok(Some((status, settled_all)))
      })
      .await?;

    let Some((status, settled_all)) = found else {
      return Err(Error::NotFound { entity: "session", id });
    };
    let status: SessionStatus = status.parse()?;
    Ok(if status.is_terminal() {
      Finalization::Unchanged(status)
    } else if settled_all {
      tracing::info!(session_id = id, "session completed");
      Finalization::Completed
    } else {
      Finalization::Pending(status)
    })
  }

  /// Archives completed sessions whose results were imported more than
  /// [`ARCHIVE_AFTER_DAYS`] days ago.
  pub async fn archive_old_sessions(&self) -> Result<usize> {
    self
      .archive_sessions_imported_before(Utc::now() - Duration::days(ARCHIVE_AFTER_DAYS))
      .await
  }

  /// Stamps `archived_at` on completed, unarchived sessions whose results
  /// were imported before `cutoff`. Sessions are never deleted.
  pub async fn archive_sessions_imported_before(
    &self,
    cutoff: DateTime<Utc>,
  ) -> Result<usize> {
    self.schema.require(SESSION_STEP)?;
    let cutoff = encode_dt(cutoff);
    let now = encode_dt(Utc::now());

    let archived = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE sessions SET archived_at = ?2
            WHERE status = 'completed'
              AND archived_at IS NULL
              AND results_imported_at IS NOT NULL
              AND julianday(results_imported_at) < julianday(?1)",
          rusqlite::params![cutoff, now],
        )?)
      })
      .await?;

    if archived > 0 {
      tracing::info!(archived, "archived old sessions");
    }
    Ok(archived)
  }
}
