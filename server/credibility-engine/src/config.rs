//! Engine configuration with sane defaults, overridable from the environment.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::EngineError;
use crate::ledger;
use crate::types::RewardPartner;

/// Tunable parameters. None of these are invariants; they are validated empirically.
#[derive(Debug, Clone)]
pub struct Config {
  // Deduplication envelope
  /// How far back (minutes) a prior incident can be and still absorb a new report.
  pub dedup_window_minutes: i64,
  /// Max great-circle distance (meters) between two coordinate pairs.
  pub dedup_radius_meters: f64,
  /// Min token overlap (0..1) between two free-text locations when coordinates are missing.
  pub dedup_location_similarity: f64,
  /// Min token overlap (0..1) between category + description token sets.
  pub dedup_text_similarity: f64,

  // Follow-up scheduling
  /// Offset of the first check-in after submission.
  pub follow_up_initial_minutes: i64,
  /// Offset of later check-ins after a status change or a human follow-up.
  pub follow_up_extended_minutes: i64,
  /// Background sweep period.
  pub sweep_interval_secs: u64,

  // Credibility scoring
  /// Score of an incident nobody has said anything about yet.
  pub neutral_score: f64,
  /// Weight of the structured-report bonus (prompt answers, location detail).
  pub structure_weight: f64,
  /// Max swing from corroboration (confirming minus disconfirming signals).
  pub corroboration_weight: f64,
  /// Net weighted signals at which corroboration reaches ~76% of its max swing.
  pub corroboration_scale: f64,
  /// Half-life (hours) of a single corroborating signal.
  pub signal_half_life_hours: f64,
  /// Max swing from reporter trust.
  pub reporter_trust_weight: f64,
  /// Half-life (hours) of the score's deviation from neutral without new corroboration.
  pub decay_half_life_hours: f64,
  pub community_confirmed_floor: f64,
  pub official_confirmed_floor: f64,
  pub resolved_floor: f64,

  // Rewards
  /// Partners a redemption may name; the price always comes from here.
  pub reward_partners: Vec<RewardPartner>,

  // Concurrency + persistence
  /// Attempts per transaction before a conflict is reported as contention.
  pub max_conflict_retries: u32,
  /// Where the JSON snapshot lives; `None` keeps state in memory only.
  pub state_path: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      dedup_window_minutes: 180,
      dedup_radius_meters: 150.0,
      dedup_location_similarity: 0.5,
      dedup_text_similarity: 0.3,
      follow_up_initial_minutes: 30,
      follow_up_extended_minutes: 120,
      sweep_interval_secs: 60,
      neutral_score: 0.5,
      structure_weight: 0.1,
      corroboration_weight: 0.3,
      corroboration_scale: 3.0,
      signal_half_life_hours: 12.0,
      reporter_trust_weight: 0.2,
      decay_half_life_hours: 48.0,
      community_confirmed_floor: 0.6,
      official_confirmed_floor: 0.8,
      resolved_floor: 0.5,
      reward_partners: ledger::default_partners(),
      max_conflict_retries: 8,
      state_path: None,
    }
  }
}

impl Config {
  /// Defaults, with any `CREDIBILITY_*` variable that is set taking precedence.
  pub fn from_env() -> Result<Self, EngineError> {
    let mut config = Self::default();
    override_from_env(&mut config.dedup_window_minutes, "CREDIBILITY_DEDUP_WINDOW_MINUTES")?;
    override_from_env(&mut config.dedup_radius_meters, "CREDIBILITY_DEDUP_RADIUS_METERS")?;
    override_from_env(&mut config.dedup_location_similarity, "CREDIBILITY_DEDUP_LOCATION_SIMILARITY")?;
    override_from_env(&mut config.dedup_text_similarity, "CREDIBILITY_DEDUP_TEXT_SIMILARITY")?;
    override_from_env(&mut config.follow_up_initial_minutes, "CREDIBILITY_FOLLOW_UP_INITIAL_MINUTES")?;
    override_from_env(&mut config.follow_up_extended_minutes, "CREDIBILITY_FOLLOW_UP_EXTENDED_MINUTES")?;
    override_from_env(&mut config.sweep_interval_secs, "CREDIBILITY_SWEEP_INTERVAL_SECS")?;
    override_from_env(&mut config.neutral_score, "CREDIBILITY_NEUTRAL_SCORE")?;
    override_from_env(&mut config.decay_half_life_hours, "CREDIBILITY_DECAY_HALF_LIFE_HOURS")?;
    override_from_env(&mut config.max_conflict_retries, "CREDIBILITY_MAX_CONFLICT_RETRIES")?;
    if let Ok(path) = env::var("CREDIBILITY_STATE_PATH") {
      if !path.trim().is_empty() {
        config.state_path = Some(PathBuf::from(path));
      }
    }
    config.validate()?;
    Ok(config)
  }

  /// Reject combinations that would break the engine's invariants.
  pub fn validate(&self) -> Result<(), EngineError> {
    if !(0.0..=1.0).contains(&self.neutral_score) {
      return Err(EngineError::validation("neutral_score", "must be within 0..=1"));
    }
    if self.dedup_window_minutes < 0 {
      return Err(EngineError::validation("dedup_window_minutes", "must not be negative"));
    }
    if self.follow_up_initial_minutes <= 0 || self.follow_up_extended_minutes <= 0 {
      return Err(EngineError::validation("follow_up_minutes", "offsets must be positive"));
    }
    if self.decay_half_life_hours <= 0.0 || self.signal_half_life_hours <= 0.0 {
      return Err(EngineError::validation("half_life_hours", "must be positive"));
    }
    if self.corroboration_scale <= 0.0 {
      return Err(EngineError::validation("corroboration_scale", "must be positive"));
    }
    if self.max_conflict_retries == 0 {
      return Err(EngineError::validation("max_conflict_retries", "must be at least 1"));
    }
    for (i, partner) in self.reward_partners.iter().enumerate() {
      if partner.id.trim().is_empty() || partner.points_cost == 0 {
        return Err(EngineError::validation("reward_partners", "needs an id and a positive cost"));
      }
      if ledger::find_partner(&self.reward_partners[..i], &partner.id).is_some() {
        return Err(EngineError::validation("reward_partners", &format!("duplicate id {:?}", partner.id)));
      }
    }
    Ok(())
  }
}

fn override_from_env<T: FromStr>(slot: &mut T, key: &str) -> Result<(), EngineError> {
  if let Ok(raw) = env::var(key) {
    *slot = raw
      .trim()
      .parse()
      .map_err(|_| EngineError::validation(key, &format!("cannot parse {:?}", raw)))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    assert!(Config::default().validate().is_ok());
  }

  #[test]
  fn out_of_range_neutral_is_rejected() {
    let config = Config {
      neutral_score: 1.5,
      ..Config::default()
    };
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("neutral_score"));
  }

  #[test]
  fn free_or_duplicate_partners_are_rejected() {
    let mut config = Config::default();
    config.reward_partners[0].points_cost = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    let twin = config.reward_partners[0].clone();
    config.reward_partners.push(twin);
    assert!(config.validate().is_err());
  }

  #[test]
  fn zero_retry_budget_is_rejected() {
    let config = Config {
      max_conflict_retries: 0,
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }
}
