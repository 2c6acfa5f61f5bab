//! Error types for `certis-core`.

use thiserror::Error;

use crate::session::SessionStatus;

#[derive(Debug, Error)]
pub enum Error {
  /// A persisted discriminant string did not match any known variant.
  #[error("unknown {kind} value: {value:?}")]
  UnknownVariant { kind: &'static str, value: String },

  #[error("invalid session status transition: {from} -> {to}")]
  InvalidStatusTransition {
    from: SessionStatus,
    to:   SessionStatus,
  },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
