//! JSON-lines command protocol spoken by the binary: one command object in, one
//! response object out.

use serde::Deserialize;
use serde_json::Value;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::types::*;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
  Submit {
    actor: Actor,
    report: Report,
  },
  FollowUp {
    actor: Actor,
    incident_id: IncidentId,
    follow_up: FollowUpInput,
  },
  SetStatus {
    actor: Actor,
    incident_id: IncidentId,
    status: IncidentStatus,
  },
  SetVisibility {
    actor: Actor,
    target: VisibilityTarget,
    hidden: bool,
  },
  MergeIncidents {
    actor: Actor,
    source: IncidentId,
    target: IncidentId,
  },
  AddComment {
    actor: Actor,
    incident_id: IncidentId,
    comment: CommentInput,
  },
  React {
    actor: Actor,
    target: ReactionTarget,
    action: ReactionAction,
  },
  Redeem {
    actor: Actor,
    request: RedemptionRequest,
  },
  DecideRedemption {
    actor: Actor,
    entry_id: LedgerEntryId,
    decision: Decision,
    #[serde(default)]
    note: Option<String>,
  },
  AdjustPoints {
    actor: Actor,
    user_id: UserId,
    delta: i64,
    #[serde(default)]
    description: String,
  },
  RewardPartners,
  PendingRedemptions {
    actor: Actor,
    #[serde(default)]
    limit: Option<usize>,
  },
  RewardSummary {
    actor: Actor,
    user_id: UserId,
  },
  Ledger {
    actor: Actor,
    user_id: UserId,
  },
  RequestRole {
    actor: Actor,
    role: Role,
    #[serde(default)]
    justification: Option<String>,
  },
  DecideRoleRequest {
    actor: Actor,
    request_id: RoleRequestId,
    decision: Decision,
    #[serde(default)]
    role_override: Option<Role>,
    #[serde(default)]
    notes: Option<String>,
  },
  Incident {
    actor: Actor,
    incident_id: IncidentId,
  },
  FollowUps {
    actor: Actor,
    incident_id: IncidentId,
  },
  Comments {
    actor: Actor,
    incident_id: IncidentId,
  },
  ExplainScore {
    actor: Actor,
    incident_id: IncidentId,
  },
  List {
    actor: Actor,
    #[serde(default)]
    filter: IncidentFilter,
  },
  Stats,
  Sweep,
}

/// Run one command against the engine.
pub fn execute(engine: &Engine, command: Command) -> Result<Value, EngineError> {
  let value = match command {
    Command::Submit { actor, report } => serde_json::to_value(engine.submit(&actor, &report)?)?,
    Command::FollowUp {
      actor,
      incident_id,
      follow_up,
    } => serde_json::to_value(engine.record_follow_up(&actor, incident_id, &follow_up)?)?,
    Command::SetStatus {
      actor,
      incident_id,
      status,
    } => serde_json::to_value(engine.set_status(&actor, incident_id, status)?)?,
    Command::SetVisibility { actor, target, hidden } => {
      serde_json::to_value(engine.set_visibility(&actor, target, hidden)?)?
    }
    Command::MergeIncidents { actor, source, target } => {
      serde_json::to_value(engine.merge_incidents(&actor, source, target)?)?
    }
    Command::AddComment {
      actor,
      incident_id,
      comment,
    } => serde_json::to_value(engine.add_comment(&actor, incident_id, &comment)?)?,
    Command::React { actor, target, action } => serde_json::to_value(engine.set_reaction(&actor, target, action)?)?,
    Command::Redeem { actor, request } => serde_json::to_value(engine.redeem(&actor, &request)?)?,
    Command::DecideRedemption {
      actor,
      entry_id,
      decision,
      note,
    } => serde_json::to_value(engine.decide_redemption(&actor, entry_id, decision, note)?)?,
    Command::AdjustPoints {
      actor,
      user_id,
      delta,
      description,
    } => serde_json::to_value(engine.adjust_points(&actor, user_id, delta, &description)?)?,
    Command::RewardPartners => serde_json::to_value(engine.reward_partners())?,
    Command::PendingRedemptions { actor, limit } => serde_json::to_value(engine.pending_redemptions(&actor, limit)?)?,
    Command::RewardSummary { actor, user_id } => serde_json::to_value(engine.reward_summary(&actor, user_id)?)?,
    Command::Ledger { actor, user_id } => serde_json::to_value(engine.ledger(&actor, user_id)?)?,
    Command::RequestRole {
      actor,
      role,
      justification,
    } => serde_json::to_value(engine.request_role(&actor, role, justification)?)?,
    Command::DecideRoleRequest {
      actor,
      request_id,
      decision,
      role_override,
      notes,
    } => serde_json::to_value(engine.decide_role_request(&actor, request_id, decision, role_override, notes)?)?,
    Command::Incident { actor, incident_id } => serde_json::to_value(engine.incident(&actor, incident_id)?)?,
    Command::FollowUps { actor, incident_id } => serde_json::to_value(engine.follow_ups(&actor, incident_id)?)?,
    Command::Comments { actor, incident_id } => serde_json::to_value(engine.comments(&actor, incident_id)?)?,
    Command::ExplainScore { actor, incident_id } => serde_json::to_value(engine.explain_score(&actor, incident_id)?)?,
    Command::List { actor, filter } => serde_json::to_value(engine.list_incidents(&actor, &filter)?)?,
    Command::Stats => serde_json::to_value(engine.stats()?)?,
    Command::Sweep => serde_json::to_value(engine.sweep_due()?)?,
  };
  Ok(value)
}

/// Parse, execute and serialize one input line. Failures become an `ErrorOutput` line.
pub fn handle_line(engine: &Engine, line: &str) -> String {
  let response = serde_json::from_str::<Command>(line)
    .map_err(|e| ErrorOutput::new("json", format!("json parse: {}", e)))
    .and_then(|command| execute(engine, command).map_err(|e| error_output(&e)));
  let rendered = match response {
    Ok(value) => serde_json::to_string(&value),
    Err(err) => serde_json::to_string(&err),
  };
  rendered.unwrap_or_else(|e| format!(r#"{{"error":true,"kind":"json","message":"{}"}}"#, e))
}

pub fn error_output(err: &EngineError) -> ErrorOutput {
  match err {
    EngineError::Validation { field, reason } => ErrorOutput::new(err.kind(), reason.clone()).with_field(field.clone()),
    EngineError::Forbidden {
      reason,
      recorded_follow_up,
    } => ErrorOutput {
      recorded_follow_up: *recorded_follow_up,
      ..ErrorOutput::new(err.kind(), reason.clone())
    },
    _ => ErrorOutput::new(err.kind(), err.to_string()),
  }
}
