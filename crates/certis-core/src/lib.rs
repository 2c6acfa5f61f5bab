//! Core types and the scoring engine for the certis certification store.
//!
//! This crate is deliberately free of database dependencies. The storage
//! crate depends on it; the scoring engine only ever sees values that have
//! already been read out of a repository.

pub mod catalog;
pub mod device;
pub mod error;
pub mod participant;
pub mod result;
pub mod scoring;
pub mod session;
pub mod trainer;

pub use error::{Error, Result};
