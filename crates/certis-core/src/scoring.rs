//! The scoring engine.
//!
//! Every function here is pure: callers read sessions, results and questions
//! out of the store and hand them in. Scores are percentages in `[0, 100]`.
//! A question with no matching result counts as answered incorrectly, and an
//! empty question set scores 0.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
  catalog::{
    Block, BlockId, ExamQuestion, QuestionId, Referential, ReferentialId, Theme,
    ThemeId,
  },
  device::DeviceId,
  participant::{AssignmentStatus, ParticipantId},
  result::SessionResult,
  session::{IterationDetail, IterationId, Session, SessionDetail, SessionStatus},
};

/// Score a participant needs on a block's own questions for the block to
/// count as passed.
pub const BLOCK_SUCCESS_THRESHOLD: f64 = 50.0;

/// Pass thresholds for individual success.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
  pub global:    f64,
  pub per_theme: f64,
}

impl Default for Thresholds {
  fn default() -> Self { Self { global: 70.0, per_theme: 50.0 } }
}

// ─── Per-participant scores ──────────────────────────────────────────────────

/// Keeps the most recent result per question. Ties on timestamp go to the
/// later row.
fn latest_by_question(
  results: &[SessionResult],
) -> HashMap<QuestionId, &SessionResult> {
  let mut latest: HashMap<QuestionId, &SessionResult> = HashMap::new();
  for result in results {
    latest
      .entry(result.question_id)
      .and_modify(|current| {
        if (result.timestamp, result.id) > (current.timestamp, current.id) {
          *current = result;
        }
      })
      .or_insert(result);
  }
  latest
}

fn percentage(correct: u32, total: u32) -> f64 {
  if total == 0 {
    0.0
  } else {
    f64::from(correct) / f64::from(total) * 100.0
  }
}

fn count_correct(
  latest: &HashMap<QuestionId, &SessionResult>,
  questions: &[ExamQuestion],
) -> u32 {
  questions
    .iter()
    .filter(|q| latest.get(&q.question_id).is_some_and(|r| r.is_correct))
    .count() as u32
}

/// Global score of one participant over `questions`.
///
/// `results` must already be restricted to that participant.
pub fn participant_score(
  results: &[SessionResult],
  questions: &[ExamQuestion],
) -> f64 {
  let latest = latest_by_question(results);
  percentage(count_correct(&latest, questions), questions.len() as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThemeScore {
  pub correct: u32,
  pub total:   u32,
  pub score:   f64,
}

/// Per-theme scores, keyed by theme label.
pub fn theme_scores(
  results: &[SessionResult],
  questions: &[ExamQuestion],
) -> BTreeMap<String, ThemeScore> {
  let latest = latest_by_question(results);
  let mut counts: BTreeMap<String, (u32, u32)> = BTreeMap::new();
  for question in questions {
    let entry = counts.entry(question.theme_label.clone()).or_default();
    entry.1 += 1;
    if latest.get(&question.question_id).is_some_and(|r| r.is_correct) {
      entry.0 += 1;
    }
  }
  counts
    .into_iter()
    .map(|(theme, (correct, total))| {
      (theme, ThemeScore { correct, total, score: percentage(correct, total) })
    })
    .collect()
}

/// A participant passes when the global score reaches its threshold and no
/// single theme falls below the per-theme threshold.
pub fn determine_individual_success(
  global_score: f64,
  theme_scores: &BTreeMap<String, ThemeScore>,
  thresholds: &Thresholds,
) -> bool {
  global_score >= thresholds.global
    && theme_scores.values().all(|t| t.score >= thresholds.per_theme)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
  pub global_score: f64,
  pub theme_scores: BTreeMap<String, ThemeScore>,
  pub passed:       bool,
}

pub fn evaluate_participant(
  results: &[SessionResult],
  questions: &[ExamQuestion],
  thresholds: &Thresholds,
) -> Evaluation {
  let global_score = participant_score(results, questions);
  let theme_scores = theme_scores(results, questions);
  let passed =
    determine_individual_success(global_score, &theme_scores, thresholds);
  Evaluation { global_score, theme_scores, passed }
}

// ─── Session-level aggregation ───────────────────────────────────────────────

/// Results a device produced during one iteration. Results imported before
/// iterations were tracked carry no iteration and match any.
fn results_for_device(
  results: &[SessionResult],
  iteration_id: IterationId,
  serial: &str,
) -> Vec<SessionResult> {
  results
    .iter()
    .filter(|r| r.device_serial == serial)
    .filter(|r| r.session_iteration_id.is_none_or(|id| id == iteration_id))
    .cloned()
    .collect()
}

/// The questions an iteration actually asked: its mapped questions when it
/// has mappings, the whole set otherwise.
fn questions_for_iteration(
  iteration: &IterationDetail,
  questions: &[ExamQuestion],
) -> Vec<ExamQuestion> {
  let mappings = &iteration.iteration.question_mappings;
  if mappings.is_empty() {
    return questions.to_vec();
  }
  let mapped: BTreeSet<QuestionId> =
    mappings.iter().map(|m| m.question_id).collect();
  questions
    .iter()
    .filter(|q| mapped.contains(&q.question_id))
    .cloned()
    .collect()
}

/// A present participant of one iteration, with the results resolved
/// through the device map.
struct Attendee<'a> {
  iteration:      &'a IterationDetail,
  participant_id: ParticipantId,
  device_serial:  Option<String>,
  results:        Vec<SessionResult>,
}

/// A device missing from the map yields an attendee with no results.
fn attendees<'a>(
  detail: &'a SessionDetail,
  results: &'a [SessionResult],
  device_map: &'a HashMap<DeviceId, String>,
) -> impl Iterator<Item = Attendee<'a>> + 'a {
  detail.iterations.iter().flat_map(move |iteration| {
    iteration
      .assignments
      .iter()
      .filter(|a| a.status == AssignmentStatus::Present)
      .map(move |a| {
        let device_serial = device_map.get(&a.voting_device_id).cloned();
        let own = device_serial
          .as_deref()
          .map(|s| results_for_device(results, iteration.iteration.id, s))
          .unwrap_or_default();
        Attendee {
          iteration,
          participant_id: a.participant.id,
          device_serial,
          results: own,
        }
      })
  })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantOutcome {
  pub participant_id: ParticipantId,
  pub iteration_id:   IterationId,
  pub device_serial:  Option<String>,
  pub evaluation:     Evaluation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
  pub participant_count: u32,
  pub average_score:     f64,
  pub success_rate:      f64,
  pub outcomes:          Vec<ParticipantOutcome>,
}

/// Evaluates every present participant of every iteration.
pub fn session_stats(
  detail: &SessionDetail,
  results: &[SessionResult],
  questions: &[ExamQuestion],
  device_map: &HashMap<DeviceId, String>,
  thresholds: &Thresholds,
) -> SessionStats {
  let outcomes: Vec<ParticipantOutcome> =
    attendees(detail, results, device_map)
      .map(|attendee| {
        let asked = questions_for_iteration(attendee.iteration, questions);
        ParticipantOutcome {
          participant_id: attendee.participant_id,
          iteration_id:   attendee.iteration.iteration.id,
          evaluation:     evaluate_participant(
            &attendee.results,
            &asked,
            thresholds,
          ),
          device_serial:  attendee.device_serial,
        }
      })
      .collect();

  let count = outcomes.len() as u32;
  let total: f64 = outcomes.iter().map(|o| o.evaluation.global_score).sum();
  let passed = outcomes.iter().filter(|o| o.evaluation.passed).count() as u32;
  SessionStats {
    participant_count: count,
    average_score: if count == 0 { 0.0 } else { total / f64::from(count) },
    success_rate: percentage(passed, count),
    outcomes,
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockPerformance {
  pub block_id:          BlockId,
  pub average_score:     f64,
  /// Share of participants scoring at least [`BLOCK_SUCCESS_THRESHOLD`] on
  /// the block's questions.
  pub success_rate:      f64,
  pub question_count:    u32,
  pub participant_count: u32,
}

/// How a session's participants did on one block. `None` when the session
/// asked no question from the block or had nobody present.
pub fn block_performance(
  block_id: BlockId,
  detail: &SessionDetail,
  results: &[SessionResult],
  questions: &[ExamQuestion],
  device_map: &HashMap<DeviceId, String>,
) -> Option<BlockPerformance> {
  let mut asked: BTreeSet<QuestionId> = BTreeSet::new();
  let mut scores = Vec::new();

  for attendee in attendees(detail, results, device_map) {
    let block_questions: Vec<ExamQuestion> =
      questions_for_iteration(attendee.iteration, questions)
        .into_iter()
        .filter(|q| q.block_id == Some(block_id))
        .collect();
    if block_questions.is_empty() {
      continue;
    }
    asked.extend(block_questions.iter().map(|q| q.question_id));
    scores.push(participant_score(&attendee.results, &block_questions));
  }

  if asked.is_empty() || scores.is_empty() {
    return None;
  }

  let count = scores.len() as u32;
  let passed =
    scores.iter().filter(|s| **s >= BLOCK_SUCCESS_THRESHOLD).count() as u32;
  Some(BlockPerformance {
    block_id,
    average_score: scores.iter().sum::<f64>() / f64::from(count),
    success_rate: percentage(passed, count),
    question_count: asked.len() as u32,
    participant_count: count,
  })
}

// ─── Draw statistics ─────────────────────────────────────────────────────────

/// Inclusive date bounds; an open side is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
  pub from: Option<NaiveDate>,
  pub to:   Option<NaiveDate>,
}

impl DateWindow {
  pub fn contains(&self, date: NaiveDate) -> bool {
    self.from.is_none_or(|from| date >= from) && self.to.is_none_or(|to| date <= to)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDraws {
  pub block_id:   BlockId,
  pub code:       String,
  pub draw_count: u32,
  /// Percentage of the referential's sessions that drew the block.
  pub share:      f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeDraws {
  pub theme_id:   ThemeId,
  pub code:       String,
  pub draw_count: u32,
  pub share:      f64,
  pub blocks:     Vec<BlockDraws>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferentialDraws {
  pub referential_id: ReferentialId,
  pub code:           String,
  pub session_count:  u32,
  /// Percentage of all counted sessions.
  pub share:          f64,
  pub themes:         Vec<ThemeDraws>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawStatistics {
  pub window:         DateWindow,
  pub total_sessions: u32,
  pub referentials:   Vec<ReferentialDraws>,
}

/// How often each referential, theme and block was drawn by completed
/// sessions inside `window`.
///
/// A selected block only counts when it belongs to the session's
/// referential. Every known referential, theme and block is reported, so
/// blocks that were never drawn show up with a count of 0.
pub fn draw_statistics(
  sessions: &[Session],
  referentials: &[Referential],
  themes: &[Theme],
  blocks: &[Block],
  window: DateWindow,
) -> DrawStatistics {
  let counted: Vec<&Session> = sessions
    .iter()
    .filter(|s| s.status == SessionStatus::Completed && window.contains(s.date))
    .collect();
  let total = counted.len() as u32;

  let theme_of: HashMap<BlockId, ThemeId> =
    blocks.iter().map(|b| (b.id, b.theme_id)).collect();
  let referential_of: HashMap<ThemeId, ReferentialId> =
    themes.iter().map(|t| (t.id, t.referential_id)).collect();

  let mut session_counts: HashMap<ReferentialId, u32> = HashMap::new();
  let mut theme_counts: HashMap<ThemeId, u32> = HashMap::new();
  let mut block_counts: HashMap<BlockId, u32> = HashMap::new();

  for session in &counted {
    let Some(referential_id) = session.referential_id else {
      continue;
    };
    *session_counts.entry(referential_id).or_default() += 1;

    let mut drawn_themes = BTreeSet::new();
    for block_id in &session.selected_block_ids {
      let Some(theme_id) = theme_of.get(block_id) else {
        continue;
      };
      if referential_of.get(theme_id) != Some(&referential_id) {
        continue;
      }
      *block_counts.entry(*block_id).or_default() += 1;
      drawn_themes.insert(*theme_id);
    }
    for theme_id in drawn_themes {
      *theme_counts.entry(theme_id).or_default() += 1;
    }
  }

  let mut sorted_referentials: Vec<&Referential> = referentials.iter().collect();
  sorted_referentials.sort_by(|a, b| a.code.cmp(&b.code));

  let referentials = sorted_referentials
    .into_iter()
    .map(|referential| {
      let session_count =
        session_counts.get(&referential.id).copied().unwrap_or(0);
      let mut own_themes: Vec<&Theme> = themes
        .iter()
        .filter(|t| t.referential_id == referential.id)
        .collect();
      own_themes.sort_by(|a, b| a.code.cmp(&b.code));

      let themes = own_themes
        .into_iter()
        .map(|theme| {
          let mut own_blocks: Vec<&Block> =
            blocks.iter().filter(|b| b.theme_id == theme.id).collect();
          own_blocks.sort_by(|a, b| a.code.cmp(&b.code));
          let draw_count = theme_counts.get(&theme.id).copied().unwrap_or(0);
          ThemeDraws {
            theme_id: theme.id,
            code: theme.code.clone(),
            draw_count,
            share: percentage(draw_count, session_count),
            blocks: own_blocks
              .into_iter()
              .map(|block| {
                let draw_count =
                  block_counts.get(&block.id).copied().unwrap_or(0);
                BlockDraws {
                  block_id: block.id,
                  code: block.code.clone(),
                  draw_count,
                  share: percentage(draw_count, session_count),
                }
              })
              .collect(),
          }
        })
        .collect();

      ReferentialDraws {
        referential_id: referential.id,
        code: referential.code.clone(),
        session_count,
        share: percentage(session_count, total),
        themes,
      }
    })
    .collect();

  DrawStatistics { window, total_sessions: total, referentials }
}
