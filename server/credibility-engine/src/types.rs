//! Core types for the credibility engine (wire contracts + persisted records).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! id_type {
  ($(#[$meta:meta])* $name:ident) => {
    $(#[$meta])*
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct $name(pub Uuid);

    impl $name {
      pub fn new() -> Self {
        Self(Uuid::new_v4())
      }
    }

    impl Default for $name {
      fn default() -> Self {
        Self::new()
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
      }
    }
  };
}

id_type!(IncidentId);
id_type!(FollowUpId);
id_type!(CommentId);
id_type!(
  /// Issued by the identity collaborator; the engine never mints these outside tests.
  UserId
);
id_type!(LedgerEntryId);
id_type!(RoleRequestId);

/// Stable hex digest of submitted content, used to make merges idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

// ---------------------------------------------------------------------------
// Enumerations (wire strings match the reporting app)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IncidentType {
  Community,
  Police,
  PublicOrder,
}

impl IncidentType {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Community => "community",
      Self::Police => "police",
      Self::PublicOrder => "public-order",
    }
  }
}

/// Verification status. Declaration order is the confirmation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IncidentStatus {
  Unverified,
  CommunityConfirmed,
  OfficialConfirmed,
  Resolved,
}

impl IncidentStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Unverified => "unverified",
      Self::CommunityConfirmed => "community-confirmed",
      Self::OfficialConfirmed => "official-confirmed",
      Self::Resolved => "resolved",
    }
  }

  pub fn is_confirmed(self) -> bool {
    matches!(self, Self::CommunityConfirmed | Self::OfficialConfirmed)
  }
}

impl fmt::Display for IncidentStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Prompt answer. `Unsure` doubles as "not answered".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
  Yes,
  No,
  #[default]
  Unsure,
}

impl TriState {
  pub fn is_answered(self) -> bool {
    self != Self::Unsure
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContactedAuthorities {
  #[default]
  Unknown,
  None,
  ServiceRequest,
  #[serde(rename = "911")]
  Emergency,
  NotNeeded,
}

impl ContactedAuthorities {
  /// True when the reporter actually reached an authority.
  pub fn reached_authority(self) -> bool {
    matches!(self, Self::ServiceRequest | Self::Emergency)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetySentiment {
  Safe,
  Uneasy,
  Unsafe,
  Unsure,
}

impl SafetySentiment {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Safe => "safe",
      Self::Uneasy => "uneasy",
      Self::Unsafe => "unsafe",
      Self::Unsure => "unsure",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
  Resident,
  Reporter,
  Moderator,
  Staff,
  Officer,
  Admin,
}

impl Role {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Resident => "resident",
      Self::Reporter => "reporter",
      Self::Moderator => "moderator",
      Self::Staff => "staff",
      Self::Officer => "officer",
      Self::Admin => "admin",
    }
  }

  /// Roles that need a reviewer's approval before they are granted.
  pub fn requires_approval(self) -> bool {
    !matches!(self, Self::Resident)
  }
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The authenticated caller, as resolved by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
  pub user_id: UserId,
  pub role: Role,
}

impl Actor {
  pub fn new(user_id: UserId, role: Role) -> Self {
    Self { user_id, role }
  }
}

// ---------------------------------------------------------------------------
// Location + prompts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
  pub lat: f64,
  pub lng: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub text: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub coordinates: Option<Coordinates>,
}

impl Location {
  pub fn is_empty(&self) -> bool {
    self.text.is_none() && self.coordinates.is_none()
  }
}

/// Structured prompt answers carried by reports and follow-ups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompts {
  #[serde(default)]
  pub still_happening: TriState,
  #[serde(default)]
  pub feel_safe_now: TriState,
  #[serde(default)]
  pub police_seen: TriState,
  #[serde(default)]
  pub contacted_authorities: ContactedAuthorities,
  #[serde(default)]
  pub safety_sentiment: Option<SafetySentiment>,
}

impl Prompts {
  /// Number of yes/no prompts with a definite answer.
  pub fn answered(&self) -> usize {
    [self.still_happening, self.feel_safe_now, self.police_seen]
      .iter()
      .filter(|a| a.is_answered())
      .count()
  }

  /// Fold newer answers over older ones; unanswered fields keep the old value.
  pub fn overlay(&mut self, newer: &Prompts) {
    if newer.still_happening.is_answered() {
      self.still_happening = newer.still_happening;
    }
    if newer.feel_safe_now.is_answered() {
      self.feel_safe_now = newer.feel_safe_now;
    }
    if newer.police_seen.is_answered() {
      self.police_seen = newer.police_seen;
    }
    if newer.contacted_authorities != ContactedAuthorities::Unknown {
      self.contacted_authorities = newer.contacted_authorities;
    }
    if newer.safety_sentiment.is_some() {
      self.safety_sentiment = newer.safety_sentiment;
    }
  }
}

// ---------------------------------------------------------------------------
// Inbound types (what the routing layer hands us)
// ---------------------------------------------------------------------------

/// A new incident report. Unknown fields are silently ignored.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Report {
  pub category: String,
  pub description: String,
  /// Inferred from the category's taxonomy group when omitted.
  #[serde(default)]
  pub incident_type: Option<IncidentType>,
  #[serde(default)]
  pub location_text: Option<String>,
  #[serde(default)]
  pub lat: Option<f64>,
  #[serde(default)]
  pub lng: Option<f64>,
  #[serde(flatten)]
  pub prompts: Prompts,
  #[serde(default)]
  pub reporter_alias: Option<String>,
}

/// A follow-up on an existing incident.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FollowUpInput {
  /// Proposed status; `None` means "unchanged".
  #[serde(default)]
  pub status: Option<IncidentStatus>,
  #[serde(default)]
  pub notes: Option<String>,
  #[serde(flatten)]
  pub prompts: Prompts,
  #[serde(default)]
  pub created_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
  Image,
  Video,
}

/// Reference to a blob owned by the media collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
  pub media_type: MediaType,
  pub storage_key: String,
  #[serde(default)]
  pub content_type: Option<String>,
  #[serde(default)]
  pub filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommentInput {
  pub body: String,
  #[serde(default)]
  pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
  Like,
  Unlike,
  Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
  Like,
  Unlike,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum ReactionTarget {
  Incident(IncidentId),
  Comment(CommentId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum VisibilityTarget {
  Incident(IncidentId),
  Comment(CommentId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
  Approve,
  Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerRef {
  pub id: String,
  pub name: String,
}

/// A merchant accepting manual redemptions, priced in points per unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardPartner {
  pub id: String,
  pub name: String,
  pub points_cost: u32,
}

impl RewardPartner {
  pub fn to_ref(&self) -> PartnerRef {
    PartnerRef {
      id: self.id.clone(),
      name: self.name.clone(),
    }
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedemptionRequest {
  pub partner_id: String,
  #[serde(default = "default_quantity")]
  pub quantity: u32,
  #[serde(default)]
  pub notes: Option<String>,
}

fn default_quantity() -> u32 {
  1
}

// ---------------------------------------------------------------------------
// Internal normalized types
// ---------------------------------------------------------------------------

/// A report after validation: canonical category, trimmed text, geocoded location.
#[derive(Debug, Clone)]
pub struct NewReport {
  pub category: String,
  pub incident_type: IncidentType,
  pub description: String,
  pub location: Location,
  pub prompts: Prompts,
  pub reporter_alias: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewFollowUp {
  pub status: Option<IncidentStatus>,
  pub notes: Option<String>,
  pub prompts: Prompts,
  pub created_by: Option<String>,
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
  pub id: IncidentId,
  pub category: String,
  pub incident_type: IncidentType,
  pub description: String,
  pub location: Location,
  /// Latest known prompt answers (submission overlaid with follow-ups).
  pub prompts: Prompts,
  pub status: IncidentStatus,
  pub status_entered_at: DateTime<Utc>,
  pub credibility_score: f64,
  pub reporter_id: UserId,
  #[serde(default)]
  pub reporter_alias: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub follow_up_due_at: Option<DateTime<Utc>>,
  pub merged_into: Option<IncidentId>,
  pub is_hidden: bool,
  pub likes_count: u32,
  pub unlikes_count: u32,
  pub content_fingerprint: Fingerprint,
  /// Optimistic-concurrency version, bumped by the store on every update.
  pub version: u64,
}

impl Incident {
  /// Open for matching and scheduling: canonical, visible, not resolved.
  pub fn is_open(&self) -> bool {
    self.merged_into.is_none() && !self.is_hidden && self.status != IncidentStatus::Resolved
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FollowUpOrigin {
  /// Submitted directly on the incident.
  Human,
  /// A duplicate report folded into the incident thread.
  MergedReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
  pub id: FollowUpId,
  pub incident_id: IncidentId,
  /// Proposed status (equals the incident's status at the time when nothing was proposed).
  pub status: IncidentStatus,
  /// Whether the proposed status was applied. False when it was rejected or was a no-op.
  pub status_applied: bool,
  pub notes: Option<String>,
  pub prompts: Prompts,
  pub created_by: Option<String>,
  pub author_id: UserId,
  pub origin: FollowUpOrigin,
  pub fingerprint: Fingerprint,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
  pub id: CommentId,
  pub incident_id: IncidentId,
  pub author_id: UserId,
  pub body: String,
  pub attachments: Vec<AttachmentRef>,
  pub is_hidden: bool,
  pub likes_count: u32,
  pub unlikes_count: u32,
  pub created_at: DateTime<Utc>,
  pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
  pub user_id: UserId,
  pub target: ReactionTarget,
  pub kind: ReactionKind,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReactionTotals {
  pub likes_count: u32,
  pub unlikes_count: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub viewer_reaction: Option<ReactionKind>,
}

impl ReactionTotals {
  /// Count active rows. This is the only way aggregates are produced.
  pub fn tally<'a>(rows: impl IntoIterator<Item = &'a Reaction>, viewer: Option<UserId>) -> Self {
    let mut totals = Self::default();
    for row in rows {
      match row.kind {
        ReactionKind::Like => totals.likes_count += 1,
        ReactionKind::Unlike => totals.unlikes_count += 1,
      }
      if Some(row.user_id) == viewer {
        totals.viewer_reaction = Some(row.kind);
      }
    }
    totals
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerSource {
  ReportConfirmed,
  Redemption,
  ManualAdjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
  Posted,
  Pending,
  Fulfilled,
  Cancelled,
}

impl LedgerStatus {
  pub fn counts_toward_balance(self) -> bool {
    matches!(self, Self::Posted | Self::Fulfilled)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
  pub id: LedgerEntryId,
  pub user_id: UserId,
  pub delta: i64,
  pub source: LedgerSource,
  pub description: String,
  #[serde(default)]
  pub partner: Option<PartnerRef>,
  #[serde(default)]
  pub incident_id: Option<IncidentId>,
  pub status: LedgerStatus,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleRequestStatus {
  Pending,
  Approved,
  Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRequest {
  pub id: RoleRequestId,
  pub user_id: UserId,
  pub requested_role: Role,
  pub justification: Option<String>,
  pub status: RoleRequestStatus,
  pub reviewer_id: Option<UserId>,
  pub reviewer_notes: Option<String>,
  pub created_at: DateTime<Utc>,
  pub decided_at: Option<DateTime<Utc>>,
}

/// A reporter's track record across their other incidents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReporterHistory {
  pub confirmed: u32,
  pub rejected: u32,
}

/// An incident together with everything the scorer needs.
#[derive(Debug, Clone)]
pub struct IncidentThread {
  pub incident: Incident,
  pub follow_ups: Vec<FollowUp>,
  pub reactions: Vec<Reaction>,
  pub reporter_history: ReporterHistory,
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disposition {
  Created,
  Merged { follow_up_id: FollowUpId },
  /// Same reporter, same content, same incident: nothing new was written.
  AlreadyMerged,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
  pub incident: Incident,
  pub disposition: Disposition,
}

#[derive(Debug, Clone, Serialize)]
pub struct FollowUpReceipt {
  pub incident: Incident,
  pub follow_up: FollowUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VisibilityChange {
  pub target: VisibilityTarget,
  pub is_hidden: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IncidentFilter {
  #[serde(default)]
  pub status: Option<IncidentStatus>,
  #[serde(default)]
  pub incident_type: Option<IncidentType>,
  #[serde(default)]
  pub category: Option<String>,
  #[serde(default)]
  pub needs_follow_up: bool,
  #[serde(default)]
  pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IncidentStats {
  pub total: usize,
  pub by_status: std::collections::BTreeMap<String, usize>,
  pub by_type: std::collections::BTreeMap<String, usize>,
  pub active_follow_up: usize,
  pub prompt_completion_rate: f64,
  pub sentiment_breakdown: std::collections::BTreeMap<String, usize>,
  pub avg_credibility: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewardSummary {
  pub user_id: UserId,
  pub balance: i64,
  /// Balance minus outstanding pending debits.
  pub available: i64,
  pub tier: &'static str,
  pub next_tier: Option<&'static str>,
  pub points_to_next: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
  pub examined: usize,
  pub fired: usize,
  /// Skipped because a follow-up landed after the due time was set.
  pub superseded: usize,
  /// Left for the next sweep because persisting the fire failed.
  pub deferred: usize,
}

// ---------------------------------------------------------------------------
// CLI stream wrappers
// ---------------------------------------------------------------------------

/// Structured error output for failed commands.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorOutput {
  pub error: bool,
  pub kind: &'static str,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub field: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub recorded_follow_up: Option<FollowUpId>,
}

impl ErrorOutput {
  pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
    Self {
      error: true,
      kind,
      message: message.into(),
      field: None,
      recorded_follow_up: None,
    }
  }

  pub fn with_field(mut self, field: impl Into<String>) -> Self {
    self.field = Some(field.into());
    self
  }
}
