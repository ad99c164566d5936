//! Outbound events and the notification collaborator interface.
//!
//! Delivery transport is somebody else's problem: the engine hands events over after
//! its transaction commits and never waits on delivery.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::{FollowUpId, IncidentId, IncidentStatus, LedgerEntryId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
  /// A scheduled check-in elapsed without a human follow-up.
  CheckInDue {
    incident_id: IncidentId,
    due_at: DateTime<Utc>,
    reporter_id: UserId,
  },
  StatusChanged {
    incident_id: IncidentId,
    from: IncidentStatus,
    to: IncidentStatus,
    at: DateTime<Utc>,
  },
  ReportMerged {
    incident_id: IncidentId,
    follow_up_id: FollowUpId,
    submitter_id: UserId,
  },
  RewardPosted {
    user_id: UserId,
    entry_id: LedgerEntryId,
    delta: i64,
    incident_id: Option<IncidentId>,
  },
}

/// Pluggable notification sink. Implementations must return promptly.
pub trait NotificationDispatcher: Send + Sync {
  fn notify(&self, event: EngineEvent);
}

/// Discards everything.
pub struct NoopDispatcher;

impl NotificationDispatcher for NoopDispatcher {
  fn notify(&self, _event: EngineEvent) {}
}

/// Forwards events to an async consumer over an unbounded channel.
pub struct ChannelDispatcher {
  tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelDispatcher {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl NotificationDispatcher for ChannelDispatcher {
  fn notify(&self, event: EngineEvent) {
    if let Err(e) = self.tx.send(event) {
      warn!(event = ?e.0, "notification consumer is gone, dropping event");
    }
  }
}

/// Keeps every event in memory; handy for tests and replay tooling.
#[derive(Default)]
pub struct RecordingDispatcher {
  events: Mutex<Vec<EngineEvent>>,
}

impl RecordingDispatcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<EngineEvent> {
    self.events.lock().map(|e| e.clone()).unwrap_or_default()
  }

  pub fn check_ins(&self) -> Vec<(IncidentId, DateTime<Utc>)> {
    self
      .events()
      .into_iter()
      .filter_map(|e| match e {
        EngineEvent::CheckInDue {
          incident_id, due_at, ..
        } => Some((incident_id, due_at)),
        _ => None,
      })
      .collect()
  }
}

impl NotificationDispatcher for RecordingDispatcher {
  fn notify(&self, event: EngineEvent) {
    if let Ok(mut events) = self.events.lock() {
      events.push(event);
    }
  }
}
