//! Match incoming reports against recent open incidents.
//!
//! A candidate must share the incident type, fall inside the time window, be close
//! (great-circle distance when both sides have coordinates, location-token overlap
//! otherwise) and describe the same thing (category + description token overlap).
//! Survivors are ranked by spatial + temporal proximity, then earliest created_at,
//! then id, so the same inputs always pick the same incident.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

use crate::config::Config;
use crate::locations;
use crate::types::{Coordinates, Incident, IncidentId, Location, NewReport};

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Text overlap required when neither side says where it happened.
pub const UNLOCATED_TEXT_SIMILARITY: f64 = 0.6;

const TEXT_STOPWORDS: &[&str] = &[
  "a", "an", "and", "at", "by", "for", "in", "is", "it", "of", "on", "or", "the", "to", "was", "near",
];

/// How the two locations were compared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SpatialEvidence {
  Distance { meters: f64 },
  LocationText { similarity: f64 },
  /// Neither report carries a location.
  Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
  pub incident_id: IncidentId,
  pub created_at: DateTime<Utc>,
  pub spatial: SpatialEvidence,
  pub text_similarity: f64,
  pub minutes_apart: i64,
  /// 0..1, higher is closer in space and time.
  pub proximity: f64,
}

/// The incident a report should merge into, if any.
pub fn find_match(report: &NewReport, now: DateTime<Utc>, candidates: &[Incident], config: &Config) -> Option<MatchCandidate> {
  rank_candidates(report, now, candidates, config).into_iter().next()
}

/// Every candidate inside the envelope, best first.
pub fn rank_candidates(
  report: &NewReport,
  now: DateTime<Utc>,
  candidates: &[Incident],
  config: &Config,
) -> Vec<MatchCandidate> {
  let report_text = text_tokens(&report.category, &report.description);
  let window = config.dedup_window_minutes;

  let mut matches: Vec<MatchCandidate> = candidates
    .iter()
    .filter(|c| c.is_open() && c.incident_type == report.incident_type)
    .filter_map(|candidate| {
      let minutes_apart = (now - candidate.created_at).num_minutes();
      if minutes_apart < 0 || minutes_apart > window {
        return None;
      }

      let text_similarity = jaccard(&report_text, &text_tokens(&candidate.category, &candidate.description));
      if text_similarity < config.dedup_text_similarity {
        return None;
      }

      let (spatial, spatial_score) = match compare_locations(&report.location, &candidate.location) {
        Some(SpatialEvidence::Distance { meters }) => {
          if meters > config.dedup_radius_meters {
            return None;
          }
          let score = if config.dedup_radius_meters > 0.0 {
            1.0 - meters / config.dedup_radius_meters
          } else {
            1.0
          };
          (SpatialEvidence::Distance { meters }, score)
        }
        Some(SpatialEvidence::LocationText { similarity }) => {
          if similarity < config.dedup_location_similarity {
            return None;
          }
          (SpatialEvidence::LocationText { similarity }, similarity)
        }
        Some(SpatialEvidence::Unknown) => {
          if text_similarity < UNLOCATED_TEXT_SIMILARITY.max(config.dedup_text_similarity) {
            return None;
          }
          (SpatialEvidence::Unknown, 0.0)
        }
        // One side is located and the other cannot be compared with it.
        None => return None,
      };

      let temporal_score = if window > 0 {
        1.0 - minutes_apart as f64 / window as f64
      } else {
        1.0
      };

      Some(MatchCandidate {
        incident_id: candidate.id,
        created_at: candidate.created_at,
        spatial,
        text_similarity: round3(text_similarity),
        minutes_apart,
        proximity: round3(0.5 * spatial_score + 0.5 * temporal_score),
      })
    })
    .collect();

  // Deterministic sort: proximity desc, then created_at asc, then id asc.
  matches.sort_by(|a, b| {
    b.proximity
      .partial_cmp(&a.proximity)
      .unwrap_or(std::cmp::Ordering::Equal)
      .then_with(|| a.created_at.cmp(&b.created_at))
      .then_with(|| a.incident_id.cmp(&b.incident_id))
  });
  matches
}

fn compare_locations(a: &Location, b: &Location) -> Option<SpatialEvidence> {
  if let (Some(ca), Some(cb)) = (a.coordinates, b.coordinates) {
    return Some(SpatialEvidence::Distance {
      meters: haversine_meters(ca, cb),
    });
  }
  if let (Some(ta), Some(tb)) = (a.text.as_deref(), b.text.as_deref()) {
    return Some(SpatialEvidence::LocationText {
      similarity: jaccard(&locations::tokens(ta), &locations::tokens(tb)),
    });
  }
  if a.is_empty() && b.is_empty() {
    return Some(SpatialEvidence::Unknown);
  }
  None
}

/// Great-circle distance in meters.
pub fn haversine_meters(a: Coordinates, b: Coordinates) -> f64 {
  let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
  let d_lat = (b.lat - a.lat).to_radians();
  let d_lng = (b.lng - a.lng).to_radians();
  let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
  2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

/// Normalized word set of category + description.
pub fn text_tokens(category: &str, description: &str) -> BTreeSet<String> {
  locations::normalize(&format!("{} {}", category, description))
    .split(' ')
    .filter(|t| !t.is_empty() && !TEXT_STOPWORDS.contains(t))
    .map(str::to_string)
    .collect()
}

/// |A ∩ B| / |A ∪ B|; two empty sets are not similar.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
  let union = a.union(b).count();
  if union == 0 {
    return 0.0;
  }
  a.intersection(b).count() as f64 / union as f64
}

fn round3(v: f64) -> f64 {
  (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::*;
  use chrono::{Duration, TimeZone};

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap()
  }

  fn at(lat: f64, lng: f64) -> Location {
    Location {
      text: None,
      coordinates: Some(Coordinates { lat, lng }),
    }
  }

  fn report(location: Location) -> NewReport {
    NewReport {
      category: "Package Theft".into(),
      incident_type: IncidentType::Community,
      description: "package theft from porch".into(),
      location,
      prompts: Prompts::default(),
      reporter_alias: None,
    }
  }

  fn incident(location: Location, created_at: DateTime<Utc>) -> Incident {
    Incident {
      id: IncidentId::new(),
      category: "Package Theft".into(),
      incident_type: IncidentType::Community,
      description: "package theft".into(),
      location,
      prompts: Prompts::default(),
      status: IncidentStatus::Unverified,
      status_entered_at: created_at,
      credibility_score: 0.5,
      reporter_id: UserId::new(),
      reporter_alias: None,
      created_at,
      updated_at: created_at,
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
  fn haversine_known_distance() {
    // ~0.0004 degrees of latitude is ~44.5 m.
    let d = haversine_meters(
      Coordinates { lat: 38.9, lng: -77.03 },
      Coordinates {
        lat: 38.9004,
        lng: -77.03,
      },
    );
    assert!((d - 44.5).abs() < 1.0, "got {}", d);
  }

  #[test]
  fn nearby_recent_report_matches() {
    let existing = incident(at(38.90, -77.03), t0());
    let found = find_match(
      &report(at(38.9003, -77.0302)),
      t0() + Duration::minutes(10),
      &[existing.clone()],
      &Config::default(),
    )
    .unwrap();
    assert_eq!(found.incident_id, existing.id);
    assert!(matches!(found.spatial, SpatialEvidence::Distance { meters } if meters < 50.0));
  }

  #[test]
  fn far_or_stale_or_other_type_does_not_match() {
    let config = Config::default();
    let now = t0() + Duration::minutes(10);
    let far = incident(at(38.92, -77.03), t0());
    let stale = incident(at(38.90, -77.03), t0() - Duration::hours(4));
    let other_type = Incident {
      incident_type: IncidentType::Police,
      ..incident(at(38.90, -77.03), t0())
    };
    let resolved = Incident {
      status: IncidentStatus::Resolved,
      ..incident(at(38.90, -77.03), t0())
    };
    let candidates = [far, stale, other_type, resolved];
    assert!(find_match(&report(at(38.90, -77.03)), now, &candidates, &config).is_none());
  }

  #[test]
  fn unrelated_description_does_not_match() {
    let existing = Incident {
      category: "Graffiti".into(),
      description: "spray paint on wall".into(),
      ..incident(at(38.90, -77.03), t0())
    };
    assert!(find_match(&report(at(38.90, -77.03)), t0(), &[existing], &Config::default()).is_none());
  }

  #[test]
  fn location_text_used_without_coordinates() {
    let text = |t: &str| Location {
      text: Some(t.into()),
      coordinates: None,
    };
    let existing = incident(text("Oak Street and 3rd"), t0());
    let found = find_match(&report(text("3rd & Oak")), t0(), &[existing.clone()], &Config::default());
    assert_eq!(found.map(|m| m.incident_id), Some(existing.id));
  }

  #[test]
  fn unlocated_needs_strong_text() {
    let existing = incident(Location::default(), t0());
    let weak = NewReport {
      description: "saw someone take a box and a bike".into(),
      ..report(Location::default())
    };
    assert!(find_match(&weak, t0(), &[existing.clone()], &Config::default()).is_none());
    let strong = NewReport {
      description: "package theft".into(),
      ..report(Location::default())
    };
    assert!(find_match(&strong, t0(), &[existing], &Config::default()).is_some());
  }

  #[test]
  fn closest_wins_then_earliest_then_id() {
    let now = t0() + Duration::minutes(20);
    let near = incident(at(38.9001, -77.03), t0());
    let farther = incident(at(38.9010, -77.03), t0());
    let ranked = rank_candidates(&report(at(38.90, -77.03)), now, &[farther.clone(), near.clone()], &Config::default());
    assert_eq!(ranked[0].incident_id, near.id);

    let mut a = incident(at(38.90, -77.03), t0());
    let mut b = incident(at(38.90, -77.03), t0());
    if b.id < a.id {
      std::mem::swap(&mut a, &mut b);
    }
    let ranked = rank_candidates(&report(at(38.90, -77.03)), now, &[b.clone(), a.clone()], &Config::default());
    assert_eq!(ranked[0].incident_id, a.id);
  }

  #[test]
  fn jaccard_edges() {
    let empty = BTreeSet::new();
    assert_eq!(jaccard(&empty, &empty), 0.0);
    let a = text_tokens("Package Theft", "the package");
    assert_eq!(jaccard(&a, &a), 1.0);
  }
}
