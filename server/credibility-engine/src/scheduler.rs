//! Follow-up check-in scheduling: when the next prompt is due, and whether a due
//! prompt should still fire.

use chrono::{DateTime, Duration, Utc};

use crate::config::Config;
use crate::types::{FollowUp, Incident, IncidentStatus, Prompts, TriState};

/// First check-in after submission. A reporter who says it is already over gets none.
pub fn initial_due(created_at: DateTime<Utc>, prompts: &Prompts, config: &Config) -> Option<DateTime<Utc>> {
  if prompts.still_happening == TriState::No {
    return None;
  }
  Some(created_at + Duration::minutes(config.follow_up_initial_minutes))
}

/// Next check-in after entering `status` at `entered_at`. Resolution cancels scheduling.
pub fn after_status_change(
  status: IncidentStatus,
  entered_at: DateTime<Utc>,
  config: &Config,
) -> Option<DateTime<Utc>> {
  if status == IncidentStatus::Resolved {
    return None;
  }
  Some(entered_at + Duration::minutes(config.follow_up_extended_minutes))
}

/// A human follow-up cancels the pending prompt and schedules the next one from its own
/// timestamp, unless it reports the incident is over.
pub fn after_follow_up(status: IncidentStatus, follow_up: &FollowUp, config: &Config) -> Option<DateTime<Utc>> {
  if follow_up.prompts.still_happening == TriState::No {
    return None;
  }
  after_status_change(status, follow_up.created_at, config)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueState {
  NotDue,
  /// Fire the check-in for this due timestamp.
  Due(DateTime<Utc>),
  /// A human follow-up arrived at or after the due time; drop the prompt without firing.
  Superseded(DateTime<Utc>),
  /// The incident was hidden while the prompt was pending; drop it without firing.
  Withdrawn(DateTime<Utc>),
}

pub fn due_state(
  incident: &Incident,
  last_human_follow_up: Option<DateTime<Utc>>,
  now: DateTime<Utc>,
) -> DueState {
  let due_at = match incident.follow_up_due_at {
    Some(due_at) if due_at <= now => due_at,
    _ => return DueState::NotDue,
  };
  if incident.is_hidden {
    return DueState::Withdrawn(due_at);
  }
  if !incident.is_open() {
    return DueState::NotDue;
  }
  match last_human_follow_up {
    Some(at) if at >= due_at => DueState::Superseded(due_at),
    _ => DueState::Due(due_at),
  }
}
