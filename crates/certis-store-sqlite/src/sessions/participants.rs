//! Participants and their per-iteration device assignments.

use rusqlite::OptionalExtension as _;

use certis_core::{
  participant::{
    AssignmentStatus, NewParticipant, NewParticipantAssignment, Participant,
    ParticipantAssignment, ParticipantId,
  },
  session::IterationId,
};

use super::{ASSIGNMENT_STEP, SessionRepository};
use crate::{
  Error, Result,
  encode::{decode_assignment_status, encode_assignment_status},
  error::constraint_error,
};

fn participant_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
  Ok(Participant {
    id:                  row.get(0)?,
    first_name:          row.get(1)?,
    last_name:           row.get(2)?,
    organization:        row.get(3)?,
    identification_code: row.get(4)?,
  })
}

const PARTICIPANT_COLUMNS: &str =
  "id, first_name, last_name, organization, identification_code";

impl SessionRepository {
  // ── Participants ──────────────────────────────────────────────────────────

  /// Inserts a participant unconditionally.
  pub async fn add_participant(&self, input: NewParticipant) -> Result<Participant> {
    let NewParticipant { first_name, last_name, organization, identification_code } =
      input;
    let (first, last, org, code) = (
      first_name.clone(),
      last_name.clone(),
      organization.clone(),
      identification_code.clone(),
    );
    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO participants
             (first_name, last_name, organization, identification_code)
           VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![first, last, org, code],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(Participant { id, first_name, last_name, organization, identification_code })
  }

  /// Updates the first participant carrying the same non-blank
  /// identification code, or inserts a new one. The stored code is trimmed.
  pub async fn upsert_participant(&self, input: NewParticipant) -> Result<Participant> {
    let Some(code) = input.dedupe_key().map(str::to_owned) else {
      return self.add_participant(input).await;
    };
    let NewParticipant { first_name, last_name, organization, .. } = input;
    let (first, last, org, key) =
      (first_name.clone(), last_name.clone(), organization.clone(), code.clone());

    let id = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
          .query_row(
            "SELECT id FROM participants WHERE identification_code = ?1
              ORDER BY id LIMIT 1",
            rusqlite::params![key],
            |row| row.get(0),
          )
          .optional()?;
        let id = match existing {
          Some(id) => {
            tx.execute(
              "UPDATE participants
                  SET first_name = ?2, last_name = ?3, organization = ?4
                WHERE id = ?1",
              rusqlite::params![id, first, last, org],
            )?;
            id
          }
          None => {
            tx.execute(
              "INSERT INTO participants
                 (first_name, last_name, organization, identification_code)
               VALUES (?1, ?2, ?3, ?4)",
              rusqlite::params![first, last, org, key],
            )?;
            tx.last_insert_rowid()
          }
        };
        tx.commit()?;
        Ok(id)
      })
      .await?;

    Ok(Participant {
      id,
      first_name,
      last_name,
      organization,
      identification_code: Some(code),
    })
  }

  pub async fn get_participant_by_id(
    &self,
    id: ParticipantId,
  ) -> Result<Option<Participant>> {
    Ok(
      self
        .conn
        .call(move |conn| {
          Ok(
            conn
              .query_row(
                &format!("SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE id = ?1"),
                rusqlite::params![id],
                participant_from_row,
              )
              .optional()?,
          )
        })
        .await?,
    )
  }

  // ── Assignments ───────────────────────────────────────────────────────────

  /// Assigns a participant a device for one iteration. A participant or a
  /// device already booked in that iteration is a [`Error::DuplicateKey`].
  pub async fn add_participant_assignment(
    &self,
    input: NewParticipantAssignment,
  ) -> Result<ParticipantAssignment> {
    self.schema.require(ASSIGNMENT_STEP)?;
    let NewParticipantAssignment {
      session_iteration_id,
      participant_id,
      voting_device_id,
      kit_id,
      status,
    } = input;
    let status_str = encode_assignment_status(status);

    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO participant_assignments
             (session_iteration_id, participant_id, voting_device_id, kit_id, status)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![
            session_iteration_id,
            participant_id,
            voting_device_id,
            kit_id,
            status_str,
          ],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await
      .map_err(constraint_error(
        "participant assignment",
        format!(
          "iteration {session_iteration_id}: participant {participant_id} / \
           device {voting_device_id}"
        ),
      ))?;

    Ok(ParticipantAssignment {
      id,
      session_iteration_id,
      participant_id,
      voting_device_id,
      kit_id,
      status,
    })
  }

  pub async fn get_assignments_for_iteration(
    &self,
    iteration_id: IterationId,
  ) -> Result<Vec<ParticipantAssignment>> {
    self.schema.require(ASSIGNMENT_STEP)?;
    let rows: Vec<(i64, i64, i64, i64, String)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT id, participant_id, voting_device_id, kit_id, status
             FROM participant_assignments
            WHERE session_iteration_id = ?1
            ORDER BY id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![iteration_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(id, participant_id, voting_device_id, kit_id, status)| {
        Ok(ParticipantAssignment {
          id,
          session_iteration_id: iteration_id,
          participant_id,
          voting_device_id,
          kit_id,
          status: decode_assignment_status(&status)?,
        })
      })
      .collect()
  }

  /// Marks a participant present or absent in one iteration.
  pub async fn update_participant_status_in_iteration(
    &self,
    iteration_id: IterationId,
    participant_id: ParticipantId,
    status: AssignmentStatus,
  ) -> Result<()> {
    self.schema.require(ASSIGNMENT_STEP)?;
    let status = encode_assignment_status(status);
    let updated = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE participant_assignments SET status = ?3
            WHERE session_iteration_id = ?1 AND participant_id = ?2",
          rusqlite::params![iteration_id, participant_id, status],
        )?)
      })
      .await?;
    if updated == 0 {
      return Err(Error::NotFound { entity: "participant assignment", id: participant_id });
    }
    Ok(())
  }

  /// Removes every assignment of an iteration, returning how many there were.
  pub async fn clear_assignments_for_iteration(
    &self,
    iteration_id: IterationId,
  ) -> Result<usize> {
    Ok(
      self
        .conn
        .call(move |conn| {
          Ok(conn.execute(
            "DELETE FROM participant_assignments WHERE session_iteration_id = ?1",
            rusqlite::params![iteration_id],
          )?)
        })
        .await?,
    )
  }
}
