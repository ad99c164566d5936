//! Known-landmark geocoding for reports that only carry a free-text location.

use std::collections::BTreeSet;

use crate::types::Coordinates;

struct KnownLocation {
  aliases: &'static [&'static str],
  lat: f64,
  lng: f64,
}

const KNOWN_LOCATIONS: &[KnownLocation] = &[
  KnownLocation {
    aliases: &[
      "5th & Juniper",
      "5th and Juniper",
      "Juniper & 5th",
      "Juniper and 5th",
      "Juniper at 5th",
      "5th at Juniper",
      "Juniper Street and 5th Street",
    ],
    lat: 38.9093,
    lng: -77.0337,
  },
  KnownLocation {
    aliases: &[
      "Atlas Lounge, Midtown",
      "Atlas Lounge Midtown",
      "Atlas Lounge",
      "Midtown Atlas Lounge",
    ],
    lat: 38.9058,
    lng: -77.0446,
  },
  KnownLocation {
    aliases: &[
      "Maple & 18th",
      "Maple and 18th",
      "18th & Maple",
      "18th and Maple",
      "Maple Street and 18th Street",
    ],
    lat: 38.9014,
    lng: -77.0412,
  },
];

/// Lowercase, `&` → `and`, collapse every non-alphanumeric run to one space.
pub fn normalize(value: &str) -> String {
  let lowered = value.trim().to_lowercase().replace('&', " and ");
  let mut out = String::with_capacity(lowered.len());
  let mut pending_space = false;
  for ch in lowered.chars() {
    if ch.is_ascii_alphanumeric() {
      if pending_space && !out.is_empty() {
        out.push(' ');
      }
      pending_space = false;
      out.push(ch);
    } else {
      pending_space = true;
    }
  }
  out
}

/// Exact alias match first, then the first alias contained in the text.
pub fn lookup(location_text: &str) -> Option<Coordinates> {
  let normalized = normalize(location_text);
  if normalized.is_empty() {
    return None;
  }
  let aliases = || {
    KNOWN_LOCATIONS
      .iter()
      .flat_map(|loc| loc.aliases.iter().map(move |alias| (normalize(alias), loc)))
  };
  aliases()
    .find(|(alias, _)| *alias == normalized)
    .or_else(|| aliases().find(|(alias, _)| !alias.is_empty() && normalized.contains(alias.as_str())))
    .map(|(_, loc)| Coordinates {
      lat: loc.lat,
      lng: loc.lng,
    })
}

/// Word set of a normalized location, used for textual proximity.
pub fn tokens(location_text: &str) -> BTreeSet<String> {
  normalize(location_text)
    .split(' ')
    .filter(|t| !t.is_empty() && !matches!(*t, "and" | "at" | "the" | "street" | "st"))
    .map(str::to_string)
    .collect()
}
