//! Validate inbound payloads into canonical internal models.
//!
//! Everything here runs before the store is touched; failures are `Validation` errors
//! naming the offending field.

use crate::error::EngineError;
use crate::locations;
use crate::taxonomy;
use crate::types::*;

pub const MAX_CATEGORY_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 2000;
pub const MAX_LOCATION_LEN: usize = 255;
pub const MAX_ALIAS_LEN: usize = 50;
pub const MAX_NOTES_LEN: usize = 2000;
pub const MAX_COMMENT_LEN: usize = 2000;
pub const MAX_LEDGER_DESCRIPTION_LEN: usize = 255;

/// Parse and normalize a submitted report.
pub fn normalize_report(raw: &Report) -> Result<NewReport, EngineError> {
  let category = raw.category.trim();
  if category.is_empty() {
    return Err(EngineError::validation("category", "must not be empty"));
  }
  check_len("category", category, MAX_CATEGORY_LEN)?;
  let (category, group_type) = taxonomy::lookup(category)
    .ok_or_else(|| EngineError::validation("category", "not a taxonomy item"))?;

  let incident_type = match raw.incident_type {
    Some(t) if t != group_type => {
      return Err(EngineError::validation(
        "incident_type",
        &format!("{} does not match category group {}", t.as_str(), group_type.as_str()),
      ))
    }
    _ => group_type,
  };

  let description = raw.description.trim();
  if description.is_empty() {
    return Err(EngineError::validation("description", "must not be empty"));
  }
  check_len("description", description, MAX_DESCRIPTION_LEN)?;

  let text = trimmed(raw.location_text.as_deref());
  if let Some(t) = &text {
    check_len("location_text", t, MAX_LOCATION_LEN)?;
  }

  let coordinates = match (raw.lat, raw.lng) {
    (Some(lat), Some(lng)) => Some(validate_coordinates(lat, lng)?),
    (None, None) => text.as_deref().and_then(locations::lookup),
    _ => {
      return Err(EngineError::validation(
        "lat/lng",
        "both coordinates or neither must be given",
      ))
    }
  };

  let reporter_alias = trimmed(raw.reporter_alias.as_deref());
  if let Some(alias) = &reporter_alias {
    check_len("reporter_alias", alias, MAX_ALIAS_LEN)?;
  }

  Ok(NewReport {
    category: category.to_string(),
    incident_type,
    description: description.to_string(),
    location: Location { text, coordinates },
    prompts: raw.prompts,
    reporter_alias,
  })
}

pub fn normalize_follow_up(raw: &FollowUpInput) -> Result<NewFollowUp, EngineError> {
  let notes = trimmed(raw.notes.as_deref());
  if let Some(n) = &notes {
    check_len("notes", n, MAX_NOTES_LEN)?;
  }
  let created_by = trimmed(raw.created_by.as_deref());
  if let Some(c) = &created_by {
    check_len("created_by", c, MAX_ALIAS_LEN)?;
  }
  Ok(NewFollowUp {
    status: raw.status,
    notes,
    prompts: raw.prompts,
    created_by,
  })
}

pub fn normalize_comment(raw: &CommentInput) -> Result<CommentInput, EngineError> {
  let body = raw.body.trim();
  if body.is_empty() {
    return Err(EngineError::validation("body", "must not be empty"));
  }
  check_len("body", body, MAX_COMMENT_LEN)?;
  for attachment in &raw.attachments {
    if attachment.storage_key.trim().is_empty() {
      return Err(EngineError::validation("attachments[].storage_key", "must not be empty"));
    }
  }
  Ok(CommentInput {
    body: body.to_string(),
    attachments: raw.attachments.clone(),
  })
}

/// Total cost in points of `quantity` units from `partner`.
pub fn redemption_cost(partner: &RewardPartner, quantity: u32) -> Result<i64, EngineError> {
  if partner.points_cost == 0 {
    return Err(EngineError::validation("partner_id", "partner configuration invalid"));
  }
  Ok(i64::from(partner.points_cost) * i64::from(quantity.max(1)))
}

/// Ledger descriptions are capped; overflow is cut and marked with "...".
pub fn truncate_description(value: &str) -> String {
  let trimmed = value.trim();
  let trimmed = if trimmed.is_empty() { "Reward update" } else { trimmed };
  if trimmed.chars().count() <= MAX_LEDGER_DESCRIPTION_LEN {
    return trimmed.to_string();
  }
  let cut: String = trimmed.chars().take(MAX_LEDGER_DESCRIPTION_LEN - 3).collect();
  format!("{}...", cut.trim_end())
}

fn validate_coordinates(lat: f64, lng: f64) -> Result<Coordinates, EngineError> {
  if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
    return Err(EngineError::validation("lat", "must be within -90..=90"));
  }
  if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
    return Err(EngineError::validation("lng", "must be within -180..=180"));
  }
  Ok(Coordinates { lat, lng })
}

fn trimmed(value: Option<&str>) -> Option<String> {
  value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), EngineError> {
  if value.chars().count() > max {
    return Err(EngineError::validation(field, &format!("longer than {} characters", max)));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn report() -> Report {
    Report {
      category: "package theft".into(),
      description: "  Box taken from porch  ".into(),
      incident_type: None,
      location_text: Some(" 5th & Juniper ".into()),
      lat: None,
      lng: None,
      prompts: Prompts::default(),
      reporter_alias: Some("   ".into()),
    }
  }

  #[test]
  fn normalize_valid_report() {
    let r = normalize_report(&report()).unwrap();
    assert_eq!(r.category, "Package Theft");
    assert_eq!(r.incident_type, IncidentType::Community);
    assert_eq!(r.description, "Box taken from porch");
    assert_eq!(r.location.text.as_deref(), Some("5th & Juniper"));
    // Geocoded from the landmark table.
    assert!(r.location.coordinates.is_some());
    assert_eq!(r.reporter_alias, None);
  }

  #[test]
  fn normalize_rejects_unknown_category() {
    let mut raw = report();
    raw.category = "Weather".into();
    let err = normalize_report(&raw).unwrap_err();
    assert!(err.to_string().contains("category"));
  }

  #[test]
  fn normalize_rejects_mismatched_type() {
    let mut raw = report();
    raw.incident_type = Some(IncidentType::Police);
    let err = normalize_report(&raw).unwrap_err();
    assert!(err.to_string().contains("incident_type"));
  }

  #[test]
  fn normalize_rejects_half_coordinates() {
    let mut raw = report();
    raw.lat = Some(38.9);
    let err = normalize_report(&raw).unwrap_err();
    assert!(err.to_string().contains("lat/lng"));
  }

  #[test]
  fn normalize_rejects_out_of_range_lat() {
    let mut raw = report();
    raw.lat = Some(91.0);
    raw.lng = Some(0.0);
    assert!(normalize_report(&raw).is_err());
  }

  #[test]
  fn normalize_rejects_blank_description() {
    let mut raw = report();
    raw.description = "   ".into();
    let err = normalize_report(&raw).unwrap_err();
    assert!(err.to_string().contains("description"));
  }

  #[test]
  fn comment_body_is_required() {
    let raw = CommentInput {
      body: " ".into(),
      attachments: vec![],
    };
    assert!(normalize_comment(&raw).is_err());
  }

  #[test]
  fn redemption_cost_multiplies_quantity() {
    let partner = RewardPartner {
      id: "cafe".into(),
      name: "Cafe".into(),
      points_cost: 15,
    };
    assert_eq!(redemption_cost(&partner, 3).unwrap(), 45);
    assert_eq!(redemption_cost(&partner, 0).unwrap(), 15);
    let free = RewardPartner { points_cost: 0, ..partner };
    assert!(redemption_cost(&free, 1).is_err());
  }

  #[test]
  fn long_descriptions_are_truncated() {
    let long = "x".repeat(400);
    let out = truncate_description(&long);
    assert_eq!(out.chars().count(), MAX_LEDGER_DESCRIPTION_LEN);
    assert!(out.ends_with("..."));
    assert_eq!(truncate_description("  "), "Reward update");
  }
}
