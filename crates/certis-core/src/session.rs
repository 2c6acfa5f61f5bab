//! Sessions, their iterations and the status state machine.

use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  catalog::{BlockId, QuestionId, ReferentialId},
  device::KitId,
  error::{Error, Result},
  participant::{AssignedParticipant, Participant},
  trainer::TrainerId,
};

pub type SessionId = i64;
pub type IterationId = i64;

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
  Planned,
  Ready,
  InProgress,
  Completed,
  Cancelled,
}

impl SessionStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Planned => "planned",
      Self::Ready => "ready",
      Self::InProgress => "in-progress",
      Self::Completed => "completed",
      Self::Cancelled => "cancelled",
    }
  }

  /// Whether no further transition is possible.
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Completed | Self::Cancelled)
  }

  /// Whether a caller may move a session from `self` to `next` through a
  /// plain update. Staying on the same status is always allowed.
  ///
  /// `Completed` is never reachable this way; it is set only by
  /// finalization once every iteration is settled.
  pub fn can_transition_to(self, next: SessionStatus) -> bool {
    use SessionStatus::*;
    if self == next {
      return true;
    }
    matches!(
      (self, next),
      (Planned, Ready)
        | (Planned, InProgress)
        | (Planned, Cancelled)
        | (Ready, Planned)
        | (Ready, InProgress)
        | (Ready, Cancelled)
        | (InProgress, Cancelled)
    )
  }

  /// Checks a requested transition, returning the target on success.
  pub fn transition_to(self, next: SessionStatus) -> Result<SessionStatus> {
    if self.can_transition_to(next) {
      Ok(next)
    } else {
      Err(Error::InvalidStatusTransition { from: self, to: next })
    }
  }
}

impl fmt::Display for SessionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SessionStatus {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    Ok(match s {
      "planned" => Self::Planned,
      "ready" => Self::Ready,
      "in-progress" => Self::InProgress,
      "completed" => Self::Completed,
      "cancelled" => Self::Cancelled,
      other => {
        return Err(Error::UnknownVariant {
          kind:  "session status",
          value: other.to_owned(),
        });
      }
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IterationStatus {
  Planned,
  Ready,
  Completed,
  Cancelled,
}

impl IterationStatus {
  /// Completed and cancelled iterations no longer block finalization.
  pub fn is_settled(self) -> bool {
    matches!(self, Self::Completed | Self::Cancelled)
  }
}

// ─── Import anomalies ────────────────────────────────────────────────────────

/// How an expected device that produced no answers was handled on import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ExpectedIssueAction {
  Pending,
  MarkAbsent,
  AggregateWithUnknown { source_serial: String },
  IgnoreDevice,
}

/// How answers from a device nobody was assigned to were handled on import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum UnknownDeviceAction {
  Pending,
  IgnoreResponses,
  AddAsNewParticipant { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedIssue {
  pub serial_number: String,
  pub resolution:    ExpectedIssueAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownDevice {
  pub serial_number: String,
  pub resolution:    UnknownDeviceAction,
}

/// The record of how result-import anomalies were resolved for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportAnomalies {
  #[serde(default)]
  pub expected_issues: Vec<ExpectedIssue>,
  #[serde(default)]
  pub unknown_devices: Vec<UnknownDevice>,
  pub resolved_at:     Option<DateTime<Utc>>,
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
  pub id:                        SessionId,
  pub name:                      String,
  pub date:                      NaiveDate,
  pub referential_id:            Option<ReferentialId>,
  pub selected_block_ids:        BTreeSet<BlockId>,
  pub selected_kit_id:           Option<KitId>,
  pub trainer_id:                Option<TrainerId>,
  pub status:                    SessionStatus,
  pub ignored_slide_guids:       BTreeSet<String>,
  pub resolved_import_anomalies: Option<ImportAnomalies>,
  pub iteration_count:           u32,
  pub location:                  Option<String>,
  pub notes:                     Option<String>,
  pub session_number:            Option<String>,
  pub stage_number:              Option<String>,
  pub created_at:                DateTime<Utc>,
  pub updated_at:                Option<DateTime<Utc>>,
  pub results_imported_at:       Option<DateTime<Utc>>,
  pub archived_at:               Option<DateTime<Utc>>,
}

/// Input to `add_session`. New sessions always start `planned`.
#[derive(Debug, Clone)]
pub struct NewSession {
  pub name:               String,
  pub date:               NaiveDate,
  pub referential_id:     Option<ReferentialId>,
  pub selected_block_ids: BTreeSet<BlockId>,
  pub selected_kit_id:    Option<KitId>,
  pub trainer_id:         Option<TrainerId>,
  pub iteration_count:    u32,
  pub location:           Option<String>,
  pub notes:              Option<String>,
  pub session_number:     Option<String>,
  pub stage_number:       Option<String>,
}

impl NewSession {
  pub fn new(name: impl Into<String>, date: NaiveDate) -> Self {
    Self {
      name: name.into(),
      date,
      referential_id: None,
      selected_block_ids: BTreeSet::new(),
      selected_kit_id: None,
      trainer_id: None,
      iteration_count: 1,
      location: None,
      notes: None,
      session_number: None,
      stage_number: None,
    }
  }
}

/// Partial update for `update_session`; `None` leaves a field untouched and
/// `Some(None)` clears a nullable one.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
  pub name:                      Option<String>,
  pub date:                      Option<NaiveDate>,
  pub referential_id:            Option<Option<ReferentialId>>,
  pub selected_block_ids:        Option<BTreeSet<BlockId>>,
  pub selected_kit_id:           Option<Option<KitId>>,
  pub trainer_id:                Option<Option<TrainerId>>,
  pub status:                    Option<SessionStatus>,
  pub ignored_slide_guids:       Option<BTreeSet<String>>,
  pub resolved_import_anomalies: Option<Option<ImportAnomalies>>,
  pub iteration_count:           Option<u32>,
  pub location:                  Option<Option<String>>,
  pub notes:                     Option<Option<String>>,
  pub session_number:            Option<Option<String>>,
  pub stage_number:              Option<Option<String>>,
  pub results_imported_at:       Option<Option<DateTime<Utc>>>,
}

/// A session row plus the aggregates derived at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
  pub session:           Session,
  pub participant_count: u32,
  /// Percentage of correct results, `None` when there are none.
  pub average_score:     Option<f64>,
}

// ─── Iterations ──────────────────────────────────────────────────────────────

/// Where a catalog question landed in a generated presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionMapping {
  pub question_id:   QuestionId,
  pub slide_guid:    Option<String>,
  pub order_in_file: u32,
  pub theme_label:   String,
  pub block_code:    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionIteration {
  pub id:                  IterationId,
  pub session_id:          SessionId,
  pub iteration_index:     u32,
  pub name:                String,
  pub generated_file_path: Option<String>,
  pub status:              IterationStatus,
  pub question_mappings:   Vec<QuestionMapping>,
  pub created_at:          DateTime<Utc>,
  pub updated_at:          Option<DateTime<Utc>>,
}

/// Input to `add_or_update_session_iteration`, keyed by
/// `(session_id, iteration_index)`.
#[derive(Debug, Clone)]
pub struct NewSessionIteration {
  pub session_id:          SessionId,
  pub iteration_index:     u32,
  /// Defaults to `Iteration <index + 1>` when inserting.
  pub name:                Option<String>,
  pub generated_file_path: Option<String>,
  pub status:              IterationStatus,
  pub question_mappings:   Vec<QuestionMapping>,
}

impl NewSessionIteration {
  pub fn new(session_id: SessionId, iteration_index: u32) -> Self {
    Self {
      session_id,
      iteration_index,
      name: None,
      generated_file_path: None,
      status: IterationStatus::Planned,
      question_mappings: Vec::new(),
    }
  }

  pub fn default_name(iteration_index: u32) -> String {
    format!("Iteration {}", iteration_index + 1)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationDetail {
  pub iteration:   SessionIteration,
  pub assignments: Vec<AssignedParticipant>,
}

/// A session with its iterations (ordered by index), each iteration's
/// assignments, and the deduplicated union of its participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDetail {
  pub session:      Session,
  pub iterations:   Vec<IterationDetail>,
  pub participants: Vec<Participant>,
}
