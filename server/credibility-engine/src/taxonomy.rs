//! Incident category taxonomy, grouped by incident type.

use crate::types::IncidentType;

pub struct TaxonomyGroup {
  pub label: &'static str,
  pub incident_type: IncidentType,
  pub items: &'static [&'static str],
}

pub const TAXONOMY: &[TaxonomyGroup] = &[
  TaxonomyGroup {
    label: "Police-Related",
    incident_type: IncidentType::Police,
    items: &[
      "Burglary",
      "Theft From Auto",
      "Non-Fatal Shooting",
      "Homicide",
      "Suspicious Vehicle",
      "Suspicious Person",
      "Robbery",
    ],
  },
  TaxonomyGroup {
    label: "Community & Civic",
    incident_type: IncidentType::Community,
    items: &[
      "Package Theft",
      "Mailbox Tampering",
      "Noise / Neighborhood Dispute",
      "Lost / Found Pet",
      "Streetlight Outage",
      "Pothole / Road Hazard",
      "Sanitation / Illegal Dumping",
      "Homelessness Encampment",
    ],
  },
  TaxonomyGroup {
    label: "Public Order",
    incident_type: IncidentType::PublicOrder,
    items: &[
      "Street Racing",
      "Fireworks",
      "Loud Gathering",
      "Public Intoxication",
      "Sidewalk Obstruction",
    ],
  },
];

/// Resolve a category case-insensitively to its canonical spelling and group.
pub fn lookup(category: &str) -> Option<(&'static str, IncidentType)> {
  let wanted = category.trim();
  TAXONOMY.iter().find_map(|group| {
    group
      .items
      .iter()
      .find(|item| item.eq_ignore_ascii_case(wanted))
      .map(|item| (*item, group.incident_type))
  })
}
