//! Role capabilities and the incident status state machine.

use crate::error::EngineError;
use crate::types::{IncidentStatus, Role};

/// Everything a caller may attempt that needs a capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  SubmitReport,
  AddFollowUp,
  React,
  Comment,
  Redeem,
  RequestRole,
  SetStatus(IncidentStatus),
  SetVisibility,
  MergeIncidents,
  DecideRedemption,
  ReviewLedger,
  DecideRoleRequest,
  AdjustPoints,
}

/// The single place role strings turn into permissions.
pub fn capability(role: Role, operation: Operation) -> bool {
  use Role::*;
  match operation {
    Operation::SubmitReport
    | Operation::AddFollowUp
    | Operation::React
    | Operation::Comment
    | Operation::Redeem
    | Operation::RequestRole => true,
    Operation::SetStatus(IncidentStatus::OfficialConfirmed) => matches!(role, Officer | Admin),
    Operation::SetStatus(_) => matches!(role, Moderator | Staff | Officer | Admin),
    Operation::SetVisibility | Operation::MergeIncidents => matches!(role, Moderator | Staff | Admin),
    Operation::DecideRedemption | Operation::ReviewLedger => matches!(role, Staff | Admin),
    Operation::DecideRoleRequest => matches!(role, Officer | Admin),
    Operation::AdjustPoints => matches!(role, Admin),
  }
}

pub fn require(role: Role, operation: Operation) -> Result<(), EngineError> {
  if capability(role, operation) {
    Ok(())
  } else {
    Err(EngineError::forbidden(format!(
      "role {} may not perform {:?}",
      role, operation
    )))
  }
}

/// How a status change was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
  /// Direct status operation (PATCH status).
  Direct,
  /// Proposal carried on a follow-up.
  FollowUp,
}

/// Result of checking a requested status against the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  /// Requested status equals the current one.
  Unchanged,
  Apply { from: IncidentStatus, to: IncidentStatus },
}

/// Validate a transition for `role`.
///
/// Elevated roles may skip states or revert to `unverified`. `resolved` is terminal
/// except for an explicit reversion through the direct operation.
pub fn transition(
  current: IncidentStatus,
  requested: IncidentStatus,
  role: Role,
  via: Via,
) -> Result<Transition, EngineError> {
  if current == requested {
    return Ok(Transition::Unchanged);
  }
  require(role, Operation::SetStatus(requested))?;
  if current == IncidentStatus::Resolved && via == Via::FollowUp {
    return Err(EngineError::forbidden(
      "resolved incidents can only be reopened through a direct status change",
    ));
  }
  Ok(Transition::Apply {
    from: current,
    to: requested,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use IncidentStatus::*;

  #[test]
  fn residents_cannot_change_status() {
    for to in [CommunityConfirmed, OfficialConfirmed, Resolved] {
      let err = transition(Unverified, to, Role::Resident, Via::FollowUp).unwrap_err();
      assert!(matches!(err, EngineError::Forbidden { .. }));
    }
  }

  #[test]
  fn same_status_needs_no_capability() {
    assert_eq!(
      transition(Unverified, Unverified, Role::Resident, Via::FollowUp).unwrap(),
      Transition::Unchanged
    );
  }

  #[test]
  fn moderators_confirm_but_not_officially() {
    assert!(transition(Unverified, CommunityConfirmed, Role::Moderator, Via::Direct).is_ok());
    assert!(transition(Unverified, OfficialConfirmed, Role::Moderator, Via::Direct).is_err());
    assert!(transition(Unverified, OfficialConfirmed, Role::Officer, Via::Direct).is_ok());
  }

  #[test]
  fn elevated_roles_may_skip_and_revert() {
    assert!(transition(Unverified, Resolved, Role::Staff, Via::Direct).is_ok());
    assert!(transition(OfficialConfirmed, Unverified, Role::Moderator, Via::FollowUp).is_ok());
  }

  #[test]
  fn resolved_reopens_only_directly() {
    assert!(transition(Resolved, Unverified, Role::Officer, Via::FollowUp).is_err());
    assert_eq!(
      transition(Resolved, Unverified, Role::Officer, Via::Direct).unwrap(),
      Transition::Apply {
        from: Resolved,
        to: Unverified
      }
    );
  }

  #[test]
  fn capability_table() {
    assert!(capability(Role::Resident, Operation::Redeem));
    assert!(!capability(Role::Resident, Operation::SetVisibility));
    assert!(capability(Role::Moderator, Operation::SetVisibility));
    assert!(!capability(Role::Officer, Operation::SetVisibility));
    assert!(capability(Role::Staff, Operation::DecideRedemption));
    assert!(!capability(Role::Moderator, Operation::DecideRedemption));
    assert!(capability(Role::Officer, Operation::DecideRoleRequest));
    assert!(!capability(Role::Staff, Operation::DecideRoleRequest));
    assert!(capability(Role::Admin, Operation::AdjustPoints));
    assert!(!capability(Role::Staff, Operation::AdjustPoints));
  }
}
