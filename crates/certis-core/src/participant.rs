//! Participants and their per-iteration device assignments.

use serde::{Deserialize, Serialize};

use crate::{
  device::{DeviceId, KitId},
  session::IterationId,
};

pub type ParticipantId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
  pub id:                  ParticipantId,
  pub first_name:          String,
  pub last_name:           String,
  pub organization:        Option<String>,
  /// External identifier. Not unique; `upsert_participant` keys on it when
  /// non-blank.
  pub identification_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewParticipant {
  pub first_name:          String,
  pub last_name:           String,
  pub organization:        Option<String>,
  pub identification_code: Option<String>,
}

impl NewParticipant {
  pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
    Self {
      first_name:          first_name.into(),
      last_name:           last_name.into(),
      organization:        None,
      identification_code: None,
    }
  }

  /// The identification code if it carries anything besides whitespace.
  pub fn dedupe_key(&self) -> Option<&str> {
    self
      .identification_code
      .as_deref()
      .map(str::trim)
      .filter(|code| !code.is_empty())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentStatus {
  #[default]
  Present,
  Absent,
}

/// A participant holding a device from a kit for one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantAssignment {
  pub id:                   i64,
  pub session_iteration_id: IterationId,
  pub participant_id:       ParticipantId,
  pub voting_device_id:     DeviceId,
  pub kit_id:               KitId,
  pub status:               AssignmentStatus,
}

#[derive(Debug, Clone)]
pub struct NewParticipantAssignment {
  pub session_iteration_id: IterationId,
  pub participant_id:       ParticipantId,
  pub voting_device_id:     DeviceId,
  pub kit_id:               KitId,
  pub status:               AssignmentStatus,
}

/// An assignment joined with its participant and the device's serial, as
/// returned inside a session detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedParticipant {
  pub participant:      Participant,
  pub voting_device_id: DeviceId,
  pub device_serial:    String,
  pub kit_id:           KitId,
  pub status:           AssignmentStatus,
}
