//! Stable content fingerprints for idempotent merges.

use crate::locations;
use crate::types::{Fingerprint, IncidentId, UserId};

/// Compute the fingerprint of one piece of content submitted by one reporter to one incident.
///
/// Key components: incident + reporter + normalized content. Whitespace, case and
/// punctuation differences do not change the result.
/// Uses blake3 for a fast, deterministic hash.
pub fn compute(incident: IncidentId, reporter: UserId, content: &str) -> Fingerprint {
  let mut hasher = blake3::Hasher::new();
  hasher.update(incident.0.as_bytes());
  hasher.update(b"|");
  hasher.update(reporter.0.as_bytes());
  hasher.update(b"|");
  hasher.update(locations::normalize(content).as_bytes());

  let hash = hasher.finalize();
  // First 16 bytes (32 hex chars): compact but collision-resistant.
  let hex = hash.to_hex();
  Fingerprint(hex[..32].to_string())
}

/// Content key for a report: category and description together.
pub fn report_content(category: &str, description: &str) -> String {
  format!("{}\n{}", category, description)
}
