//! Credibility scoring: a pure function of an incident thread and an evaluation instant.
//!
//! Components:
//! - structure: bonus for answered prompts, location detail and contacted authorities
//! - corroboration: recency-weighted confirming minus disconfirming independent signals
//! - reporter trust: Beta(1,1)-smoothed confirmed / (confirmed + rejected)
//! - time decay: the deviation from neutral halves every `decay_half_life_hours`
//!   without a new corroborating signal
//! - status floor: confirmation raises the minimum
//!
//! Iteration order is fixed (ordered maps, sorted rows) so float sums replay bit-for-bit.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::types::*;

/// Every term that went into a score, for audit trails and tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
  pub structure: f64,
  pub corroboration: f64,
  pub net_signals: f64,
  pub reporter_trust: f64,
  pub decay_factor: f64,
  pub floor: f64,
  pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stance {
  Confirming,
  Disconfirming,
  Neutral,
}

pub fn score(thread: &IncidentThread, as_of: DateTime<Utc>, config: &Config) -> f64 {
  breakdown(thread, as_of, config).score
}

pub fn breakdown(thread: &IncidentThread, as_of: DateTime<Utc>, config: &Config) -> ScoreBreakdown {
  let incident = &thread.incident;

  let structure = config.structure_weight * structure_fraction(incident);

  let signals = independent_signals(thread);
  let net_signals: f64 = signals
    .iter()
    .map(|(at, sign)| sign * half_life_weight(as_of, *at, config.signal_half_life_hours))
    .sum();
  let corroboration = config.corroboration_weight * (net_signals / config.corroboration_scale).tanh();

  let history = thread.reporter_history;
  let trust_ratio =
    (f64::from(history.confirmed) + 1.0) / (f64::from(history.confirmed) + f64::from(history.rejected) + 2.0);
  let reporter_trust = config.reporter_trust_weight * (trust_ratio - 0.5) * 2.0;

  let last_corroboration = signals
    .iter()
    .filter(|(_, sign)| *sign > 0.0)
    .map(|(at, _)| *at)
    .max()
    .map_or(incident.created_at, |at| at.max(incident.created_at));
  let decay_factor = half_life_weight(as_of, last_corroboration, config.decay_half_life_hours);

  let floor = status_floor(incident.status, config);
  let raw = config.neutral_score + (structure + corroboration + reporter_trust) * decay_factor;
  let score = round3(raw.max(floor).clamp(0.0, 1.0));

  ScoreBreakdown {
    structure,
    corroboration,
    net_signals,
    reporter_trust,
    decay_factor,
    floor,
    score,
  }
}

/// 0..1: how much structured detail the reporter supplied.
fn structure_fraction(incident: &Incident) -> f64 {
  let prompts = &incident.prompts;
  let answered = prompts.answered() as f64 / 3.0;
  let location = if incident.location.is_empty() { 0.0 } else { 1.0 };
  let authorities = if prompts.contacted_authorities.reached_authority() {
    1.0
  } else {
    0.0
  };
  let sentiment = if prompts.safety_sentiment.is_some() { 1.0 } else { 0.0 };
  0.4 * answered + 0.25 * location + 0.25 * authorities + 0.1 * sentiment
}

fn stance(follow_up: &FollowUp) -> Stance {
  let prompts = &follow_up.prompts;
  if follow_up.origin == FollowUpOrigin::MergedReport
    || prompts.still_happening == TriState::Yes
    || follow_up.status.is_confirmed()
  {
    Stance::Confirming
  } else if prompts.still_happening == TriState::No
    && prompts.safety_sentiment == Some(SafetySentiment::Safe)
  {
    Stance::Disconfirming
  } else {
    Stance::Neutral
  }
}

/// (timestamp, +1 / -1) per independent voice. The reporter never corroborates
/// their own incident; each other author counts once, by their latest stance.
fn independent_signals(thread: &IncidentThread) -> Vec<(DateTime<Utc>, f64)> {
  let reporter = thread.incident.reporter_id;
  let mut latest: BTreeMap<UserId, (DateTime<Utc>, Stance)> = BTreeMap::new();
  for follow_up in &thread.follow_ups {
    if follow_up.author_id == reporter {
      continue;
    }
    let entry = (follow_up.created_at, stance(follow_up));
    latest
      .entry(follow_up.author_id)
      .and_modify(|slot| {
        if entry.0 >= slot.0 {
          *slot = entry;
        }
      })
      .or_insert(entry);
  }

  let mut signals: Vec<(DateTime<Utc>, f64)> = latest
    .into_values()
    .filter_map(|(at, stance)| match stance {
      Stance::Confirming => Some((at, 1.0)),
      Stance::Disconfirming => Some((at, -1.0)),
      Stance::Neutral => None,
    })
    .collect();

  let mut reactions: Vec<&Reaction> = thread
    .reactions
    .iter()
    .filter(|r| r.user_id != reporter)
    .collect();
  reactions.sort_by_key(|r| r.user_id);
  signals.extend(reactions.into_iter().map(|r| match r.kind {
    ReactionKind::Like => (r.updated_at, 1.0),
    ReactionKind::Unlike => (r.updated_at, -1.0),
  }));
  signals
}

fn half_life_weight(as_of: DateTime<Utc>, at: DateTime<Utc>, half_life_hours: f64) -> f64 {
  let age_hours = ((as_of - at).num_seconds().max(0) as f64) / 3600.0;
  0.5_f64.powf(age_hours / half_life_hours)
}

fn status_floor(status: IncidentStatus, config: &Config) -> f64 {
  match status {
    IncidentStatus::Unverified => 0.0,
    IncidentStatus::CommunityConfirmed => config.community_confirmed_floor,
    IncidentStatus::OfficialConfirmed => config.official_confirmed_floor,
    IncidentStatus::Resolved => config.resolved_floor,
  }
}

fn round3(v: f64) -> f64 {
  (v * 1000.0).round() / 1000.0
}
