//! Structured error types for the credibility engine.

use thiserror::Error;

use crate::types::FollowUpId;

/// Errors surfaced to callers of the engine.
///
/// `Conflict` is an internal retry signal: the engine retries the transaction
/// and only reports `Contended` once the retry budget is spent.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error("validation: {field}: {reason}")]
  Validation { field: String, reason: String },

  #[error("not found: {entity} {id}")]
  NotFound { entity: &'static str, id: String },

  #[error("forbidden: {reason}")]
  Forbidden {
    reason: String,
    /// Set when a follow-up was recorded even though its status change was rejected.
    recorded_follow_up: Option<FollowUpId>,
  },

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("store contention: gave up after {attempts} attempts, try again")]
  Contended { attempts: u32 },

  #[error("scheduling: {0}")]
  Scheduling(String),

  #[error("store invariant violated: {0}")]
  Invariant(String),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),

  #[error("io: {0}")]
  Io(#[from] std::io::Error),
}

impl EngineError {
  pub fn validation(field: &str, reason: &str) -> Self {
    Self::Validation {
      field: field.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
    Self::NotFound {
      entity,
      id: id.to_string(),
    }
  }

  pub fn forbidden(reason: impl Into<String>) -> Self {
    Self::Forbidden {
      reason: reason.into(),
      recorded_follow_up: None,
    }
  }

  /// Short machine-readable kind, used on the wire.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Validation { .. } => "validation",
      Self::NotFound { .. } => "not_found",
      Self::Forbidden { .. } => "forbidden",
      // Never reaches callers through the engine; kept for completeness of the mapping.
      Self::Conflict(_) | Self::Contended { .. } => "contended",
      Self::Scheduling(_) => "scheduling",
      Self::Invariant(_) => "invariant",
      Self::Json(_) => "json",
      Self::Io(_) => "io",
    }
  }
}

/// Errors raised at the persistence boundary.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("{entity} {id} not found")]
  NotFound { entity: &'static str, id: String },

  /// A guard no longer holds: a concurrent writer changed the snapshot.
  #[error("{0}")]
  Conflict(String),

  #[error("{0}")]
  Invariant(String),

  #[error("snapshot io: {0}")]
  Io(#[from] std::io::Error),

  #[error("snapshot json: {0}")]
  Json(#[from] serde_json::Error),
}

impl StoreError {
  pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
    Self::NotFound {
      entity,
      id: id.to_string(),
    }
  }
}

impl From<StoreError> for EngineError {
  fn from(err: StoreError) -> Self {
    match err {
      StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
      StoreError::Conflict(msg) => Self::Conflict(msg),
      StoreError::Invariant(msg) => Self::Invariant(msg),
      StoreError::Io(e) => Self::Io(e),
      StoreError::Json(e) => Self::Json(e),
    }
  }
}
