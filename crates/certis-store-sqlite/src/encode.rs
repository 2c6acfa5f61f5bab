//! Encoding and decoding helpers between domain types and the plain values
//! stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings with millisecond precision, calendar dates
//! are `YYYY-MM-DD`, and result timestamps are epoch milliseconds. Structured
//! columns hold compact JSON; every JSON column has exactly one encode/decode
//! pair here. A JSON column that fails to decode is logged and read back as
//! its empty default so one corrupt row never makes a listing unreadable.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Serialize, de::DeserializeOwned};

use certis_core::{
  catalog::{BlockId, Question, QuestionType},
  participant::AssignmentStatus,
  result::{Answer, SessionResult},
  session::{
    ImportAnomalies, IterationStatus, QuestionMapping, Session, SessionIteration,
    SessionStatus,
  },
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

fn decode_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
  s.as_deref().map(decode_dt).transpose()
}

pub fn encode_millis(dt: DateTime<Utc>) -> i64 { dt.timestamp_millis() }

pub fn decode_millis(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms)
    .ok_or_else(|| Error::DateParse(format!("timestamp out of range: {ms}")))
}

// ─── NaiveDate ───────────────────────────────────────────────────────────────

const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn encode_date(d: NaiveDate) -> String { d.format(DATE_FORMAT).to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, DATE_FORMAT)
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

// ─── Discriminants ───────────────────────────────────────────────────────────

fn unknown(kind: &'static str, value: &str) -> Error {
  Error::Core(certis_core::Error::UnknownVariant {
    kind,
    value: value.to_owned(),
  })
}

pub fn encode_question_type(t: QuestionType) -> &'static str {
  match t {
    QuestionType::SingleChoice => "single-choice",
    QuestionType::MultipleChoice => "multiple-choice",
    QuestionType::TrueFalse => "true-false",
  }
}

pub fn decode_question_type(s: &str) -> Result<QuestionType> {
  match s {
    "single-choice" => Ok(QuestionType::SingleChoice),
    "multiple-choice" => Ok(QuestionType::MultipleChoice),
    "true-false" => Ok(QuestionType::TrueFalse),
    other => Err(unknown("question type", other)),
  }
}

pub fn encode_iteration_status(s: IterationStatus) -> &'static str {
  match s {
    IterationStatus::Planned => "planned",
    IterationStatus::Ready => "ready",
    IterationStatus::Completed => "completed",
    IterationStatus::Cancelled => "cancelled",
  }
}

pub fn decode_iteration_status(s: &str) -> Result<IterationStatus> {
  match s {
    "planned" => Ok(IterationStatus::Planned),
    "ready" => Ok(IterationStatus::Ready),
    "completed" => Ok(IterationStatus::Completed),
    "cancelled" => Ok(IterationStatus::Cancelled),
    other => Err(unknown("iteration status", other)),
  }
}

pub fn encode_assignment_status(s: AssignmentStatus) -> &'static str {
  match s {
    AssignmentStatus::Present => "present",
    AssignmentStatus::Absent => "absent",
  }
}

pub fn decode_assignment_status(s: &str) -> Result<AssignmentStatus> {
  match s {
    "present" => Ok(AssignmentStatus::Present),
    "absent" => Ok(AssignmentStatus::Absent),
    other => Err(unknown("assignment status", other)),
  }
}

pub fn encode_session_status(s: SessionStatus) -> &'static str { s.as_str() }

pub fn decode_session_status(s: &str) -> Result<SessionStatus> { Ok(s.parse()?) }

// ─── JSON columns ────────────────────────────────────────────────────────────

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
  Ok(serde_json::to_string(value)?)
}

/// Decodes a JSON column, falling back to `T::default()` on malformed input.
fn from_json_lenient<T: DeserializeOwned + Default>(
  column: &'static str,
  raw: Option<&str>,
) -> T {
  let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
    return T::default();
  };
  match serde_json::from_str(raw) {
    Ok(value) => value,
    Err(e) => {
      tracing::warn!(column, error = %e, "malformed JSON column; using default");
      T::default()
    }
  }
}

pub fn encode_options(options: &[String]) -> Result<String> { to_json(options) }

pub fn decode_options(s: Option<&str>) -> Vec<String> {
  from_json_lenient("questions.options", s)
}

pub fn encode_block_ids(ids: &BTreeSet<BlockId>) -> Result<String> { to_json(ids) }

pub fn decode_block_ids(s: Option<&str>) -> BTreeSet<BlockId> {
  from_json_lenient("sessions.selected_block_ids", s)
}

pub fn encode_slide_guids(guids: &BTreeSet<String>) -> Result<String> {
  to_json(guids)
}

pub fn decode_slide_guids(s: Option<&str>) -> BTreeSet<String> {
  from_json_lenient("sessions.ignored_slide_guids", s)
}

pub fn encode_anomalies(a: Option<&ImportAnomalies>) -> Result<Option<String>> {
  a.map(to_json).transpose()
}

pub fn decode_anomalies(s: Option<&str>) -> Option<ImportAnomalies> {
  from_json_lenient("sessions.resolved_import_anomalies", s)
}

pub fn encode_mappings(mappings: &[QuestionMapping]) -> Result<String> {
  to_json(mappings)
}

pub fn decode_mappings(s: Option<&str>) -> Vec<QuestionMapping> {
  from_json_lenient("session_iterations.question_mappings", s)
}

pub fn encode_answer(answer: Option<&Answer>) -> Result<Option<String>> {
  answer.map(to_json).transpose()
}

pub fn decode_answer(s: Option<&str>) -> Option<Answer> {
  from_json_lenient("session_results.answer", s)
}

pub fn encode_setting(value: &serde_json::Value) -> Result<String> {
  to_json(value)
}

pub fn decode_setting(s: &str) -> Option<serde_json::Value> {
  from_json_lenient("admin_settings.value", Some(s))
}

// ─── Row types ───────────────────────────────────────────────────────────────

pub const QUESTION_COLUMNS: &str = "id, user_question_id, block_id, text, \
  question_type, options, correct_answer, time_limit_seconds, is_eliminatory, \
  slide_guid, usage_count, correct_response_rate, version, created_at, \
  updated_at";

/// Raw values read directly from a `questions` row.
pub struct RawQuestion {
  pub id:                    i64,
  pub user_question_id:      Option<String>,
  pub block_id:              Option<i64>,
  pub text:                  String,
  pub question_type:         String,
  pub options:               Option<String>,
  pub correct_answer:        String,
  pub time_limit_seconds:    Option<u32>,
  pub is_eliminatory:        bool,
  pub slide_guid:            Option<String>,
  pub usage_count:           u32,
  pub correct_response_rate: f64,
  pub version:               Option<String>,
  pub created_at:            String,
  pub updated_at:            Option<String>,
}

impl RawQuestion {
  /// Reads a row selected with [`QUESTION_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                    row.get(0)?,
      user_question_id:      row.get(1)?,
      block_id:              row.get(2)?,
      text:                  row.get(3)?,
      question_type:         row.get(4)?,
      options:               row.get(5)?,
      correct_answer:        row.get(6)?,
      time_limit_seconds:    row.get(7)?,
      is_eliminatory:        row.get(8)?,
      slide_guid:            row.get(9)?,
      usage_count:           row.get(10)?,
      correct_response_rate: row.get(11)?,
      version:               row.get(12)?,
      created_at:            row.get(13)?,
      updated_at:            row.get(14)?,
    })
  }

  pub fn into_question(self) -> Result<Question> {
    Ok(Question {
      id:                    self.id,
      user_question_id:      self.user_question_id,
      block_id:              self.block_id,
      text:                  self.text,
      question_type:         decode_question_type(&self.question_type)?,
      options:               decode_options(self.options.as_deref()),
      correct_answer:        self.correct_answer,
      time_limit_seconds:    self.time_limit_seconds,
      is_eliminatory:        self.is_eliminatory,
      slide_guid:            self.slide_guid,
      usage_count:           self.usage_count,
      correct_response_rate: self.correct_response_rate,
      version:               self.version,
      created_at:            decode_dt(&self.created_at)?,
      updated_at:            decode_opt_dt(self.updated_at)?,
    })
  }
}

pub const SESSION_COLUMNS: &str = "s.id, s.name, s.date, s.referential_id, \
  s.selected_block_ids, s.selected_kit_id, s.trainer_id, s.status, \
  s.ignored_slide_guids, s.resolved_import_anomalies, s.iteration_count, \
  s.location, s.notes, s.session_number, s.stage_number, s.created_at, \
  s.updated_at, s.results_imported_at, s.archived_at";

/// Number of columns in [`SESSION_COLUMNS`]; derived aggregates follow.
pub const SESSION_COLUMN_COUNT: usize = 19;

/// Raw values read directly from a `sessions` row (aliased `s`).
pub struct RawSession {
  pub id:                        i64,
  pub name:                      String,
  pub date:                      String,
  pub referential_id:            Option<i64>,
  pub selected_block_ids:        Option<String>,
  pub selected_kit_id:           Option<i64>,
  pub trainer_id:                Option<i64>,
  pub status:                    String,
  pub ignored_slide_guids:       Option<String>,
  pub resolved_import_anomalies: Option<String>,
  pub iteration_count:           u32,
  pub location:                  Option<String>,
  pub notes:                     Option<String>,
  pub session_number:            Option<String>,
  pub stage_number:              Option<String>,
  pub created_at:                String,
  pub updated_at:                Option<String>,
  pub results_imported_at:       Option<String>,
  pub archived_at:               Option<String>,
}

impl RawSession {
  /// Reads a row selected with [`SESSION_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                        row.get(0)?,
      name:                      row.get(1)?,
      date:                      row.get(2)?,
      referential_id:            row.get(3)?,
      selected_block_ids:        row.get(4)?,
      selected_kit_id:           row.get(5)?,
      trainer_id:                row.get(6)?,
      status:                    row.get(7)?,
      ignored_slide_guids:       row.get(8)?,
      resolved_import_anomalies: row.get(9)?,
      iteration_count:           row.get(10)?,
      location:                  row.get(11)?,
      notes:                     row.get(12)?,
      session_number:            row.get(13)?,
      stage_number:              row.get(14)?,
      created_at:                row.get(15)?,
      updated_at:                row.get(16)?,
      results_imported_at:       row.get(17)?,
      archived_at:               row.get(18)?,
    })
  }

  pub fn into_session(self) -> Result<Session> {
    Ok(Session {
      id:                        self.id,
      name:                      self.name,
      date:                      decode_date(&self.date)?,
      referential_id:            self.referential_id,
      selected_block_ids:        decode_block_ids(self.selected_block_ids.as_deref()),
      selected_kit_id:           self.selected_kit_id,
      trainer_id:                self.trainer_id,
      status:                    decode_session_status(&self.status)?,
      ignored_slide_guids:       decode_slide_guids(self.ignored_slide_guids.as_deref()),
      resolved_import_anomalies: decode_anomalies(
        self.resolved_import_anomalies.as_deref(),
      ),
      iteration_count:           self.iteration_count,
      location:                  self.location,
      notes:                     self.notes,
      session_number:            self.session_number,
      stage_number:              self.stage_number,
      created_at:                decode_dt(&self.created_at)?,
      updated_at:                decode_opt_dt(self.updated_at)?,
      results_imported_at:       decode_opt_dt(self.results_imported_at)?,
      archived_at:               decode_opt_dt(self.archived_at)?,
    })
  }
}

pub const ITERATION_COLUMNS: &str = "id, session_id, iteration_index, name, \
  generated_file_path, status, question_mappings, created_at, updated_at";

pub struct RawIteration {
  pub id:                  i64,
  pub session_id:          i64,
  pub iteration_index:     u32,
  pub name:                String,
  pub generated_file_path: Option<String>,
  pub status:              String,
  pub question_mappings:   Option<String>,
  pub created_at:          String,
  pub updated_at:          Option<String>,
}

impl RawIteration {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                  row.get(0)?,
      session_id:          row.get(1)?,
      iteration_index:     row.get(2)?,
      name:                row.get(3)?,
      generated_file_path: row.get(4)?,
      status:              row.get(5)?,
      question_mappings:   row.get(6)?,
      created_at:          row.get(7)?,
      updated_at:          row.get(8)?,
    })
  }

  pub fn into_iteration(self) -> Result<SessionIteration> {
    Ok(SessionIteration {
      id:                  self.id,
      session_id:          self.session_id,
      iteration_index:     self.iteration_index,
      name:                self.name,
      generated_file_path: self.generated_file_path,
      status:              decode_iteration_status(&self.status)?,
      question_mappings:   decode_mappings(self.question_mappings.as_deref()),
      created_at:          decode_dt(&self.created_at)?,
      updated_at:          decode_opt_dt(self.updated_at)?,
    })
  }
}

pub const RESULT_COLUMNS: &str = "id, session_id, session_iteration_id, \
  question_id, device_serial, participant_id, answer, is_correct, \
  points_obtained, timestamp";

pub struct RawResult {
  pub id:                   i64,
  pub session_id:           i64,
  pub session_iteration_id: Option<i64>,
  pub question_id:          i64,
  pub device_serial:        String,
  pub participant_id:       Option<i64>,
  pub answer:               Option<String>,
  pub is_correct:           bool,
  pub points_obtained:      i64,
  pub timestamp:            i64,
}

impl RawResult {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                   row.get(0)?,
      session_id:           row.get(1)?,
      session_iteration_id: row.get(2)?,
      question_id:          row.get(3)?,
      device_serial:        row.get(4)?,
      participant_id:       row.get(5)?,
      answer:               row.get(6)?,
      is_correct:           row.get(7)?,
      points_obtained:      row.get(8)?,
      timestamp:            row.get(9)?,
    })
  }

  pub fn into_result(self) -> Result<SessionResult> {
    Ok(SessionResult {
      id:                   self.id,
      session_id:           self.session_id,
      session_iteration_id: self.session_iteration_id,
      question_id:          self.question_id,
      device_serial:        self.device_serial,
      participant_id:       self.participant_id,
      answer:               decode_answer(self.answer.as_deref()),
      is_correct:           self.is_correct,
      points_obtained:      self.points_obtained,
      timestamp:            decode_millis(self.timestamp)?,
    })
  }
}
