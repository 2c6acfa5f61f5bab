//! Trainers assigned to sessions.

use serde::{Deserialize, Serialize};

pub type TrainerId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trainer {
  pub id:         TrainerId,
  pub name:       String,
  /// At most one trainer carries the flag.
  pub is_default: bool,
}

#[derive(Debug, Clone)]
pub struct NewTrainer {
  pub name:       String,
  pub is_default: bool,
}
