//! Recorded answers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  catalog::QuestionId,
  participant::ParticipantId,
  session::{IterationId, SessionId},
};

pub type ResultId = i64;

/// The raw answer a device sent for one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Answer {
  Choice(String),
  Choices(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
  pub id:                   ResultId,
  pub session_id:           SessionId,
  pub session_iteration_id: Option<IterationId>,
  pub question_id:          QuestionId,
  pub device_serial:        String,
  pub participant_id:       Option<ParticipantId>,
  pub answer:               Option<Answer>,
  pub is_correct:           bool,
  pub points_obtained:      i64,
  pub timestamp:            DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSessionResult {
  pub session_id:           SessionId,
  pub session_iteration_id: Option<IterationId>,
  pub question_id:          QuestionId,
  pub device_serial:        String,
  pub participant_id:       Option<ParticipantId>,
  pub answer:               Option<Answer>,
  pub is_correct:           bool,
  pub points_obtained:      i64,
  pub timestamp:            DateTime<Utc>,
}

impl NewSessionResult {
  pub fn new(
    session_id: SessionId,
    question_id: QuestionId,
    device_serial: impl Into<String>,
    is_correct: bool,
    timestamp: DateTime<Utc>,
  ) -> Self {
    Self {
      session_id,
      session_iteration_id: None,
      question_id,
      device_serial: device_serial.into(),
      participant_id: None,
      answer: None,
      is_correct,
      points_obtained: if is_correct { 1 } else { 0 },
      timestamp,
    }
  }
}

/// Correction applied to an already imported result.
#[derive(Debug, Clone, Default)]
pub struct SessionResultUpdate {
  pub participant_id:  Option<Option<ParticipantId>>,
  pub answer:          Option<Option<Answer>>,
  pub is_correct:      Option<bool>,
  pub points_obtained: Option<i64>,
}
