//! The question catalog: Referential → Theme → Block → Question.
//!
//! The hierarchy is fixed at four levels. Referentials own themes, themes own
//! blocks; questions point at a block but survive its deletion (their
//! `block_id` becomes `None`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ReferentialId = i64;
pub type ThemeId = i64;
pub type BlockId = i64;
pub type QuestionId = i64;

/// Theme label used for questions whose block is unknown.
pub const UNASSIGNED_THEME: &str = "unassigned";

// ─── Taxonomy ────────────────────────────────────────────────────────────────

/// A certification standard, e.g. `R489`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referential {
  pub id:    ReferentialId,
  pub code:  String,
  pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewReferential {
  pub code:  String,
  pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Theme {
  pub id:             ThemeId,
  /// Unique within the owning referential.
  pub code:           String,
  pub label:          Option<String>,
  pub referential_id: ReferentialId,
}

#[derive(Debug, Clone)]
pub struct NewTheme {
  pub code:           String,
  pub label:          Option<String>,
  pub referential_id: ReferentialId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
  pub id:       BlockId,
  /// Unique within the owning theme.
  pub code:     String,
  pub label:    Option<String>,
  pub theme_id: ThemeId,
}

#[derive(Debug, Clone)]
pub struct NewBlock {
  pub code:     String,
  pub label:    Option<String>,
  pub theme_id: ThemeId,
}

// ─── Questions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionType {
  SingleChoice,
  MultipleChoice,
  TrueFalse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
  pub id:                    QuestionId,
  /// Caller-supplied idempotency key used by `upsert_question`.
  pub user_question_id:      Option<String>,
  pub block_id:              Option<BlockId>,
  pub text:                  String,
  pub question_type:         QuestionType,
  pub options:               Vec<String>,
  pub correct_answer:        String,
  pub time_limit_seconds:    Option<u32>,
  pub is_eliminatory:        bool,
  pub slide_guid:            Option<String>,
  pub usage_count:           u32,
  pub correct_response_rate: f64,
  pub version:               Option<String>,
  pub created_at:            DateTime<Utc>,
  pub updated_at:            Option<DateTime<Utc>>,
}

/// Input to `add_question` / `upsert_question`. Timestamps are set by the
/// store.
#[derive(Debug, Clone)]
pub struct NewQuestion {
  pub user_question_id:      Option<String>,
  pub block_id:              Option<BlockId>,
  pub text:                  String,
  pub question_type:         QuestionType,
  pub options:               Vec<String>,
  pub correct_answer:        String,
  pub time_limit_seconds:    Option<u32>,
  pub is_eliminatory:        bool,
  pub slide_guid:            Option<String>,
  pub usage_count:           u32,
  pub correct_response_rate: f64,
  pub version:               Option<String>,
}

impl NewQuestion {
  /// Convenience constructor with all optional fields set to their defaults.
  pub fn new(
    block_id: Option<BlockId>,
    text: impl Into<String>,
    question_type: QuestionType,
    options: Vec<String>,
    correct_answer: impl Into<String>,
  ) -> Self {
    Self {
      user_question_id: None,
      block_id,
      text: text.into(),
      question_type,
      options,
      correct_answer: correct_answer.into(),
      time_limit_seconds: None,
      is_eliminatory: false,
      slide_guid: None,
      usage_count: 0,
      correct_response_rate: 0.0,
      version: None,
    }
  }
}

/// Partial update for `update_question`; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct QuestionUpdate {
  /// `Some(None)` detaches the question from its block.
  pub block_id:              Option<Option<BlockId>>,
  pub text:                  Option<String>,
  pub question_type:         Option<QuestionType>,
  pub options:               Option<Vec<String>>,
  pub correct_answer:        Option<String>,
  pub time_limit_seconds:    Option<Option<u32>>,
  pub is_eliminatory:        Option<bool>,
  pub slide_guid:            Option<Option<String>>,
  pub usage_count:           Option<u32>,
  pub correct_response_rate: Option<f64>,
  pub version:               Option<Option<String>>,
}

/// A question as the scoring engine sees it: identity plus the theme and
/// block it resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamQuestion {
  pub question_id: QuestionId,
  pub theme_label: String,
  pub block_id:    Option<BlockId>,
}

impl ExamQuestion {
  pub fn new(
    question_id: QuestionId,
    theme_label: impl Into<String>,
    block_id: Option<BlockId>,
  ) -> Self {
    Self { question_id, theme_label: theme_label.into(), block_id }
  }
}
