//! Reward ledger rules: points table, tiers, derived balances.
//!
//! Entries are append-only. The only in-place change the store allows is a pending
//! redemption moving to `fulfilled` or `cancelled`. Balances are never stored.

use chrono::{DateTime, Utc};

use crate::normalize::truncate_description;
use crate::types::*;

/// (tier label, points needed), ascending.
pub const TIER_LADDER: &[(&str, i64)] = &[
  ("Neighbor Scout", 0),
  ("Signal Verified", 50),
  ("Community Sentinel", 120),
  ("Civic Guardian", 250),
];

/// Partners that accept manual redemptions out of the box.
pub fn default_partners() -> Vec<RewardPartner> {
  [
    ("corner-cafe", "Corner Cafe", 40),
    ("juniper-books", "Juniper Books", 60),
    ("maple-hardware", "Maple Hardware", 90),
    ("atlas-cinema", "Atlas Cinema", 120),
  ]
  .into_iter()
  .map(|(id, name, points_cost)| RewardPartner {
    id: id.to_string(),
    name: name.to_string(),
    points_cost,
  })
  .collect()
}

/// Look up a partner by id, ignoring case and surrounding whitespace.
pub fn find_partner<'a>(catalog: &'a [RewardPartner], id: &str) -> Option<&'a RewardPartner> {
  let id = id.trim();
  catalog.iter().find(|p| p.id.eq_ignore_ascii_case(id))
}

/// Credibility at or above this earns the bonus.
pub const HIGH_CREDIBILITY: f64 = 0.65;
pub const HIGH_CREDIBILITY_BONUS: i64 = 5;

/// Cumulative points an incident has earned its reporter once it reaches `status`.
pub fn reward_target(status: IncidentStatus, credibility_score: f64) -> i64 {
  let base = match status {
    IncidentStatus::Unverified => return 0,
    IncidentStatus::CommunityConfirmed => 10,
    IncidentStatus::OfficialConfirmed => 20,
    IncidentStatus::Resolved => 25,
  };
  let bonus = if credibility_score >= HIGH_CREDIBILITY {
    HIGH_CREDIBILITY_BONUS
  } else {
    0
  };
  base + bonus
}

/// Sum of report-confirmed points already posted for `incident`.
pub fn awarded_for(entries: &[LedgerEntry], incident: IncidentId) -> i64 {
  entries
    .iter()
    .filter(|e| {
      e.incident_id == Some(incident)
        && e.source == LedgerSource::ReportConfirmed
        && e.status.counts_toward_balance()
    })
    .map(|e| e.delta)
    .sum()
}

/// The entry owed to the reporter after `incident` entered its current status, if any.
///
/// Only the gap between the cumulative target and what was already posted is paid, so
/// reverting and re-confirming never pays twice. Resolution only pays on top of an
/// earlier confirmation.
pub fn confirmation_reward(
  reporter_entries: &[LedgerEntry],
  incident: &Incident,
  now: DateTime<Utc>,
) -> Option<LedgerEntry> {
  let awarded = awarded_for(reporter_entries, incident.id);
  if incident.status == IncidentStatus::Resolved && awarded == 0 {
    return None;
  }
  let delta = reward_target(incident.status, incident.credibility_score) - awarded;
  if delta <= 0 {
    return None;
  }
  Some(LedgerEntry {
    id: LedgerEntryId::new(),
    user_id: incident.reporter_id,
    delta,
    source: LedgerSource::ReportConfirmed,
    description: truncate_description(&format!(
      "{} report {}",
      incident.category,
      incident.status.as_str()
    )),
    partner: None,
    incident_id: Some(incident.id),
    status: LedgerStatus::Posted,
    created_at: now,
    decided_at: None,
  })
}

/// Sum of posted + fulfilled deltas.
pub fn balance(entries: &[LedgerEntry]) -> i64 {
  entries
    .iter()
    .filter(|e| e.status.counts_toward_balance())
    .map(|e| e.delta)
    .sum()
}

/// Points already promised to pending redemptions (a non-positive number).
pub fn pending_debits(entries: &[LedgerEntry]) -> i64 {
  entries
    .iter()
    .filter(|e| e.status == LedgerStatus::Pending && e.delta < 0)
    .map(|e| e.delta)
    .sum()
}

pub fn tier_for(points: i64) -> &'static str {
  TIER_LADDER
    .iter()
    .take_while(|(_, threshold)| points >= *threshold)
    .last()
    .map_or(TIER_LADDER[0].0, |(name, _)| *name)
}

pub fn summary(user_id: UserId, entries: &[LedgerEntry]) -> RewardSummary {
  let balance = balance(entries);
  let next = TIER_LADDER.iter().find(|(_, threshold)| balance < *threshold);
  RewardSummary {
    user_id,
    balance,
    available: balance + pending_debits(entries),
    tier: tier_for(balance),
    next_tier: next.map(|(name, _)| *name),
    points_to_next: next.map(|(_, threshold)| threshold - balance),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap()
  }

  fn entry(delta: i64, status: LedgerStatus) -> LedgerEntry {
    LedgerEntry {
      id: LedgerEntryId::new(),
      user_id: UserId::new(),
      delta,
      source: LedgerSource::ManualAdjustment,
      description: "x".into(),
      partner: None,
      incident_id: None,
      status,
      created_at: now(),
      decided_at: None,
    }
  }

  fn incident(status: IncidentStatus, score: f64) -> Incident {
    Incident {
      id: IncidentId::new(),
      category: "Package Theft".into(),
      incident_type: IncidentType::Community,
      description: "d".into(),
      location: Location::default(),
      prompts: Prompts::default(),
      status,
      status_entered_at: now(),
      credibility_score: score,
      reporter_id: UserId::new(),
      reporter_alias: None,
      created_at: now(),
      updated_at: now(),
      follow_up_due_at: None,
      merged_into: None,
      is_hidden: false,
      likes_count: 0,
      unlikes_count: 0,
      content_fingerprint: Fingerprint("x".into()),
      version: 0,
    }
  }

  #[test]
  fn balance_counts_posted_and_fulfilled_only() {
    let entries = vec![
      entry(30, LedgerStatus::Posted),
      entry(-10, LedgerStatus::Fulfilled),
      entry(-5, LedgerStatus::Pending),
      entry(-7, LedgerStatus::Cancelled),
    ];
    assert_eq!(balance(&entries), 20);
    assert_eq!(pending_debits(&entries), -5);
  }

  #[test]
  fn tiers_follow_ladder() {
    assert_eq!(tier_for(0), "Neighbor Scout");
    assert_eq!(tier_for(49), "Neighbor Scout");
    assert_eq!(tier_for(50), "Signal Verified");
    assert_eq!(tier_for(300), "Civic Guardian");
    assert_eq!(tier_for(-3), "Neighbor Scout");
  }

  #[test]
  fn summary_reports_next_tier() {
    let s = summary(UserId::new(), &[entry(60, LedgerStatus::Posted)]);
    assert_eq!(s.tier, "Signal Verified");
    assert_eq!(s.next_tier, Some("Community Sentinel"));
    assert_eq!(s.points_to_next, Some(60));
  }

  #[test]
  fn reconfirmation_pays_only_the_gap() {
    let inc = incident(IncidentStatus::CommunityConfirmed, 0.6);
    let first = confirmation_reward(&[], &inc, now()).unwrap();
    assert_eq!(first.delta, 10);
    // Same status again: nothing more.
    assert!(confirmation_reward(&[first.clone()], &inc, now()).is_none());
    // Official with bonus: 25 total, 15 more.
    let official = Incident {
      status: IncidentStatus::OfficialConfirmed,
      credibility_score: 0.8,
      ..inc
    };
    let second = confirmation_reward(&[first], &official, now()).unwrap();
    assert_eq!(second.delta, 15);
  }

  #[test]
  fn resolution_without_confirmation_pays_nothing() {
    let inc = incident(IncidentStatus::Resolved, 0.9);
    assert!(confirmation_reward(&[], &inc, now()).is_none());
  }
}
