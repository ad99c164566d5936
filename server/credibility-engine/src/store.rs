//! Incident repository with optimistic, all-or-nothing transactions.
//!
//! Reads hand out snapshots carrying a `version`. Writers build a [`Transaction`] from
//! those snapshots; `commit` re-checks every guard under the write lock, validates the
//! resulting state, then applies all writes or none. A stale guard yields
//! `StoreError::Conflict` and the caller re-reads and retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::StoreError;
use crate::types::*;

/// Precondition checked atomically at commit time.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
  IncidentVersion { id: IncidentId, version: u64 },
  CommentVersion { id: CommentId, version: u64 },
  /// No incident was created since the matcher looked at the candidate set.
  Generation(u64),
  /// The user's ledger has exactly this many entries.
  LedgerLength { user: UserId, len: usize },
  LedgerPending(LedgerEntryId),
  RoleRequestPending(RoleRequestId),
  /// This due timestamp has not fired yet.
  NotFired { incident: IncidentId, due_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
  InsertIncident(Incident),
  /// Carries the version it was read at; that version is checked like a guard.
  UpdateIncident(Incident),
  AppendFollowUp(FollowUp),
  InsertComment(Comment),
  /// Carries the version it was read at; that version is checked like a guard.
  UpdateComment(Comment),
  SetReaction {
    user: UserId,
    target: ReactionTarget,
    kind: Option<ReactionKind>,
    at: DateTime<Utc>,
  },
  AppendLedger(LedgerEntry),
  DecideLedger {
    id: LedgerEntryId,
    status: LedgerStatus,
    note: Option<String>,
    at: DateTime<Utc>,
  },
  SetRole { user: UserId, role: Role },
  PutRoleRequest(RoleRequest),
  MarkFired { incident: IncidentId, due_at: DateTime<Utc> },
}

#[derive(Debug, Default, Clone)]
pub struct Transaction {
  pub guards: Vec<Guard>,
  pub writes: Vec<Write>,
}

impl Transaction {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn guard(&mut self, guard: Guard) -> &mut Self {
    self.guards.push(guard);
    self
  }

  pub fn write(&mut self, write: Write) -> &mut Self {
    self.writes.push(write);
    self
  }

}

/// Open incidents of one type, plus the incident-set generation they were read at.
#[derive(Debug, Clone)]
pub struct CandidateSet {
  pub generation: u64,
  pub incidents: Vec<Incident>,
}

#[derive(Debug, Clone)]
pub struct DueCandidate {
  pub incident: Incident,
  pub last_follow_up_at: Option<DateTime<Utc>>,
}

pub trait IncidentStore: Send + Sync {
  fn incident(&self, id: IncidentId) -> Result<Incident, StoreError>;
  /// Incident plus follow-ups, reactions and the reporter's history, read atomically.
  fn thread(&self, id: IncidentId) -> Result<IncidentThread, StoreError>;
  fn follow_ups(&self, id: IncidentId) -> Result<Vec<FollowUp>, StoreError>;
  fn comment(&self, id: CommentId) -> Result<Comment, StoreError>;
  fn comments(&self, incident: IncidentId) -> Result<Vec<Comment>, StoreError>;
  fn reactions(&self, target: ReactionTarget) -> Result<Vec<Reaction>, StoreError>;
  /// Open incidents of `incident_type` created at or after `since`.
  fn candidates(&self, incident_type: IncidentType, since: DateTime<Utc>) -> Result<CandidateSet, StoreError>;
  /// Every canonical (non-merged) incident.
  fn incidents(&self) -> Result<Vec<Incident>, StoreError>;
  fn due(&self, now: DateTime<Utc>) -> Result<Vec<DueCandidate>, StoreError>;
  fn ledger(&self, user: UserId) -> Result<Vec<LedgerEntry>, StoreError>;
  fn ledger_entry(&self, id: LedgerEntryId) -> Result<LedgerEntry, StoreError>;
  /// Pending redemptions of every user, oldest first.
  fn pending_redemptions(&self) -> Result<Vec<LedgerEntry>, StoreError>;
  fn role(&self, user: UserId) -> Result<Option<Role>, StoreError>;
  fn role_request(&self, id: RoleRequestId) -> Result<RoleRequest, StoreError>;
  fn pending_role_request(&self, user: UserId) -> Result<Option<RoleRequest>, StoreError>;
  fn commit(&self, tx: Transaction) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Tables {
  incidents: HashMap<IncidentId, Incident>,
  follow_ups: HashMap<IncidentId, Vec<FollowUp>>,
  comments: HashMap<CommentId, Comment>,
  reactions: HashMap<ReactionTarget, BTreeMap<UserId, Reaction>>,
  ledger: HashMap<UserId, Vec<LedgerEntry>>,
  ledger_index: HashMap<LedgerEntryId, (UserId, usize)>,
  roles: HashMap<UserId, Role>,
  role_requests: HashMap<RoleRequestId, RoleRequest>,
  fired: HashSet<(IncidentId, DateTime<Utc>)>,
  generation: u64,
}

/// Serialized form of the whole store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
  pub generation: u64,
  pub incidents: Vec<Incident>,
  pub follow_ups: Vec<FollowUp>,
  pub comments: Vec<Comment>,
  pub reactions: Vec<Reaction>,
  pub ledger: Vec<LedgerEntry>,
  pub roles: Vec<(UserId, Role)>,
  pub role_requests: Vec<RoleRequest>,
  pub fired: Vec<FiredMarker>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiredMarker {
  pub incident_id: IncidentId,
  pub due_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
  tables: RwLock<Tables>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Load a snapshot file; a missing file yields an empty store.
  pub fn load(path: &Path) -> Result<Self, StoreError> {
    if !path.exists() {
      return Ok(Self::new());
    }
    let bytes = fs::read(path)?;
    let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
    Ok(Self::from_snapshot(snapshot))
  }

  /// Write a snapshot file via a sibling temp file and rename.
  pub fn save(&self, path: &Path) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(&self.snapshot()?)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
  }

  pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
    let t = self.read()?;
    let mut incidents: Vec<Incident> = t.incidents.values().cloned().collect();
    incidents.sort_by_key(|i| (i.created_at, i.id));
    let mut ledger: Vec<LedgerEntry> = t.ledger.values().flatten().cloned().collect();
    ledger.sort_by_key(|e| (e.created_at, e.id));
    let mut comments: Vec<Comment> = t.comments.values().cloned().collect();
    comments.sort_by_key(|c| (c.created_at, c.id));
    let mut fired: Vec<FiredMarker> = t
      .fired
      .iter()
      .map(|(incident_id, due_at)| FiredMarker {
        incident_id: *incident_id,
        due_at: *due_at,
      })
      .collect();
    fired.sort_by_key(|m| (m.due_at, m.incident_id));
    Ok(Snapshot {
      generation: t.generation,
      incidents,
      follow_ups: t.follow_ups.values().flatten().cloned().collect(),
      comments,
      reactions: t.reactions.values().flat_map(|rows| rows.values().cloned()).collect(),
      ledger,
      roles: t.roles.iter().map(|(u, r)| (*u, *r)).collect(),
      role_requests: t.role_requests.values().cloned().collect(),
      fired,
    })
  }

  pub fn from_snapshot(snapshot: Snapshot) -> Self {
    let mut t = Tables {
      generation: snapshot.generation,
      ..Tables::default()
    };
    for incident in snapshot.incidents {
      t.incidents.insert(incident.id, incident);
    }
    for follow_up in snapshot.follow_ups {
      t.follow_ups.entry(follow_up.incident_id).or_default().push(follow_up);
    }
    for rows in t.follow_ups.values_mut() {
      rows.sort_by_key(|f| (f.created_at, f.id));
    }
    for comment in snapshot.comments {
      t.comments.insert(comment.id, comment);
    }
    for reaction in snapshot.reactions {
      t.reactions
        .entry(reaction.target)
        .or_default()
        .insert(reaction.user_id, reaction);
    }
    for entry in snapshot.ledger {
      t.append_ledger(entry);
    }
    t.roles.extend(snapshot.roles);
    for request in snapshot.role_requests {
      t.role_requests.insert(request.id, request);
    }
    t.fired.extend(snapshot.fired.into_iter().map(|m| (m.incident_id, m.due_at)));
    Self {
      tables: RwLock::new(t),
    }
  }

  fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
    self
      .tables
      .read()
      .map_err(|_| StoreError::Invariant("store lock poisoned".into()))
  }

  fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
    self
      .tables
      .write()
      .map_err(|_| StoreError::Invariant("store lock poisoned".into()))
  }
}

impl Tables {
  fn incident(&self, id: IncidentId) -> Result<&Incident, StoreError> {
    self
      .incidents
      .get(&id)
      .ok_or_else(|| StoreError::not_found("incident", id))
  }

  fn reporter_history(&self, incident: &Incident) -> ReporterHistory {
    let mut history = ReporterHistory::default();
    for other in self.incidents.values() {
      if other.reporter_id != incident.reporter_id || other.id == incident.id || other.merged_into.is_some() {
        continue;
      }
      if other.is_hidden {
        history.rejected += 1;
      } else if other.status != IncidentStatus::Unverified {
        history.confirmed += 1;
      }
    }
    history
  }

  fn reaction_rows(&self, target: ReactionTarget) -> Vec<Reaction> {
    self
      .reactions
      .get(&target)
      .map(|rows| rows.values().cloned().collect())
      .unwrap_or_default()
  }

  fn append_ledger(&mut self, entry: LedgerEntry) {
    let rows = self.ledger.entry(entry.user_id).or_default();
    self.ledger_index.insert(entry.id, (entry.user_id, rows.len()));
    rows.push(entry);
  }

  fn ledger_entry_mut(&mut self, id: LedgerEntryId) -> Option<&mut LedgerEntry> {
    let (user, idx) = *self.ledger_index.get(&id)?;
    self.ledger.get_mut(&user)?.get_mut(idx)
  }

  fn check_guard(&self, guard: &Guard) -> Result<(), StoreError> {
    match guard {
      Guard::IncidentVersion { id, version } => {
        let current = self.incident(*id)?.version;
        if current != *version {
          return Err(StoreError::Conflict(format!(
            "incident {} moved from version {} to {}",
            id, version, current
          )));
        }
      }
      Guard::CommentVersion { id, version } => {
        let current = self
          .comments
          .get(id)
          .ok_or_else(|| StoreError::not_found("comment", id))?
          .version;
        if current != *version {
          return Err(StoreError::Conflict(format!(
            "comment {} moved from version {} to {}",
            id, version, current
          )));
        }
      }
      Guard::Generation(generation) => {
        if self.generation != *generation {
          return Err(StoreError::Conflict(format!(
            "incident set moved from generation {} to {}",
            generation, self.generation
          )));
        }
      }
      Guard::LedgerLength { user, len } => {
        let current = self.ledger.get(user).map_or(0, Vec::len);
        if current != *len {
          return Err(StoreError::Conflict(format!("ledger of {} changed concurrently", user)));
        }
      }
      Guard::LedgerPending(id) => {
        let (user, idx) = self
          .ledger_index
          .get(id)
          .ok_or_else(|| StoreError::not_found("ledger entry", id))?;
        let pending = self.ledger[user][*idx].status == LedgerStatus::Pending;
        if !pending {
          return Err(StoreError::Conflict(format!("ledger entry {} already decided", id)));
        }
      }
      Guard::RoleRequestPending(id) => {
        let request = self
          .role_requests
          .get(id)
          .ok_or_else(|| StoreError::not_found("role request", id))?;
        if request.status != RoleRequestStatus::Pending {
          return Err(StoreError::Conflict(format!("role request {} already decided", id)));
        }
      }
      Guard::NotFired { incident, due_at } => {
        if self.fired.contains(&(*incident, *due_at)) {
          return Err(StoreError::Conflict(format!(
            "check-in for {} at {} already fired",
            incident, due_at
          )));
        }
      }
    }
    Ok(())
  }

  /// Validate the state the writes would produce, without touching anything.
  fn validate(&self, writes: &[Write]) -> Result<(), StoreError> {
    let inserted: HashSet<IncidentId> = writes
      .iter()
      .filter_map(|w| match w {
        Write::InsertIncident(i) => Some(i.id),
        _ => None,
      })
      .collect();
    let inserted_comments: HashSet<CommentId> = writes
      .iter()
      .filter_map(|w| match w {
        Write::InsertComment(c) => Some(c.id),
        _ => None,
      })
      .collect();
    let incident_exists = |id: &IncidentId| self.incidents.contains_key(id) || inserted.contains(id);

    let mut touched_targets: HashSet<ReactionTarget> = HashSet::new();
    let mut updated_targets: HashSet<ReactionTarget> = HashSet::new();

    for write in writes {
      match write {
        Write::InsertIncident(incident) => {
          if self.incidents.contains_key(&incident.id) {
            return Err(StoreError::Invariant(format!("incident {} already exists", incident.id)));
          }
          check_incident(incident)?;
          check_totals(incident.likes_count, incident.unlikes_count, 0, 0, "incident")?;
        }
        Write::UpdateIncident(incident) => {
          self.check_guard(&Guard::IncidentVersion {
            id: incident.id,
            version: incident.version,
          })?;
          check_incident(incident)?;
          let target = ReactionTarget::Incident(incident.id);
          let projected = self.projected_totals(target, writes);
          check_totals(
            incident.likes_count,
            incident.unlikes_count,
            projected.likes_count,
            projected.unlikes_count,
            "incident",
          )?;
          updated_targets.insert(target);
        }
        Write::AppendFollowUp(follow_up) => {
          if !incident_exists(&follow_up.incident_id) {
            return Err(StoreError::not_found("incident", follow_up.incident_id));
          }
        }
        Write::InsertComment(comment) => {
          if !incident_exists(&comment.incident_id) {
            return Err(StoreError::not_found("incident", comment.incident_id));
          }
        }
        Write::UpdateComment(comment) => {
          self.check_guard(&Guard::CommentVersion {
            id: comment.id,
            version: comment.version,
          })?;
          let target = ReactionTarget::Comment(comment.id);
          let projected = self.projected_totals(target, writes);
          check_totals(
            comment.likes_count,
            comment.unlikes_count,
            projected.likes_count,
            projected.unlikes_count,
            "comment",
          )?;
          updated_targets.insert(target);
        }
        Write::SetReaction { target, .. } => {
          let exists = match target {
            ReactionTarget::Incident(id) => incident_exists(id),
            ReactionTarget::Comment(id) => self.comments.contains_key(id) || inserted_comments.contains(id),
          };
          if !exists {
            return Err(StoreError::NotFound {
              entity: "reaction target",
              id: format!("{:?}", target),
            });
          }
          touched_targets.insert(*target);
        }
        Write::AppendLedger(entry) => {
          if entry.delta == 0 {
            return Err(StoreError::Invariant("ledger delta must be non-zero".into()));
          }
        }
        Write::DecideLedger { id, status, .. } => {
          self.check_guard(&Guard::LedgerPending(*id))?;
          if !matches!(status, LedgerStatus::Fulfilled | LedgerStatus::Cancelled) {
            return Err(StoreError::Invariant(format!(
              "pending entries can only become fulfilled or cancelled, not {:?}",
              status
            )));
          }
        }
        Write::SetRole { .. } | Write::PutRoleRequest(_) | Write::MarkFired { .. } => {}
      }
    }

    // Aggregates are derived: a reaction change without the matching recount is refused.
    if let Some(target) = touched_targets.difference(&updated_targets).next() {
      return Err(StoreError::Invariant(format!(
        "reaction change on {:?} without an aggregate update",
        target
      )));
    }
    Ok(())
  }

  fn projected_totals(&self, target: ReactionTarget, writes: &[Write]) -> ReactionTotals {
    let mut rows: BTreeMap<UserId, ReactionKind> = self
      .reactions
      .get(&target)
      .map(|rows| rows.iter().map(|(u, r)| (*u, r.kind)).collect())
      .unwrap_or_default();
    for write in writes {
      if let Write::SetReaction {
        user,
        target: t,
        kind,
        ..
      } = write
      {
        if *t != target {
          continue;
        }
        match kind {
          Some(kind) => {
            rows.insert(*user, *kind);
          }
          None => {
            rows.remove(user);
          }
        }
      }
    }
    let mut totals = ReactionTotals::default();
    for kind in rows.values() {
      match kind {
        ReactionKind::Like => totals.likes_count += 1,
        ReactionKind::Unlike => totals.unlikes_count += 1,
      }
    }
    totals
  }

  fn apply(&mut self, write: Write) {
    match write {
      Write::InsertIncident(mut incident) => {
        incident.version = 0;
        self.generation += 1;
        self.incidents.insert(incident.id, incident);
      }
      Write::UpdateIncident(mut incident) => {
        incident.version += 1;
        self.incidents.insert(incident.id, incident);
      }
      Write::AppendFollowUp(follow_up) => {
        self.follow_ups.entry(follow_up.incident_id).or_default().push(follow_up);
      }
      Write::InsertComment(mut comment) => {
        comment.version = 0;
        self.comments.insert(comment.id, comment);
      }
      Write::UpdateComment(mut comment) => {
        comment.version += 1;
        self.comments.insert(comment.id, comment);
      }
      Write::SetReaction { user, target, kind, at } => {
        let rows = self.reactions.entry(target).or_default();
        match kind {
          Some(kind) => {
            rows.insert(
              user,
              Reaction {
                user_id: user,
                target,
                kind,
                updated_at: at,
              },
            );
          }
          None => {
            rows.remove(&user);
          }
        }
      }
      Write::AppendLedger(entry) => self.append_ledger(entry),
      Write::DecideLedger { id, status, note, at } => {
        if let Some(entry) = self.ledger_entry_mut(id) {
          entry.status = status;
          entry.decided_at = Some(at);
          if let Some(note) = note {
            entry.description = crate::normalize::truncate_description(&format!("{} · {}", entry.description, note));
          }
        }
      }
      Write::SetRole { user, role } => {
        self.roles.insert(user, role);
      }
      Write::PutRoleRequest(request) => {
        self.role_requests.insert(request.id, request);
      }
      Write::MarkFired { incident, due_at } => {
        self.fired.insert((incident, due_at));
      }
    }
  }
}

fn check_incident(incident: &Incident) -> Result<(), StoreError> {
  if !(0.0..=1.0).contains(&incident.credibility_score) {
    return Err(StoreError::Invariant(format!(
      "credibility {} out of range for {}",
      incident.credibility_score, incident.id
    )));
  }
  if incident.status == IncidentStatus::Resolved && incident.follow_up_due_at.is_some() {
    return Err(StoreError::Invariant(format!(
      "resolved incident {} still has a follow-up scheduled",
      incident.id
    )));
  }
  if incident.merged_into.is_some() && incident.follow_up_due_at.is_some() {
    return Err(StoreError::Invariant(format!(
      "merged incident {} still has a follow-up scheduled",
      incident.id
    )));
  }
  if incident.merged_into == Some(incident.id) {
    return Err(StoreError::Invariant(format!("incident {} merged into itself", incident.id)));
  }
  Ok(())
}

fn check_totals(likes: u32, unlikes: u32, want_likes: u32, want_unlikes: u32, what: &str) -> Result<(), StoreError> {
  if likes != want_likes || unlikes != want_unlikes {
    return Err(StoreError::Invariant(format!(
      "{} aggregates {}/{} do not match reaction rows {}/{}",
      what, likes, unlikes, want_likes, want_unlikes
    )));
  }
  Ok(())
}

impl IncidentStore for MemoryStore {
  fn incident(&self, id: IncidentId) -> Result<Incident, StoreError> {
    self.read()?.incident(id).cloned()
  }

  fn thread(&self, id: IncidentId) -> Result<IncidentThread, StoreError> {
    let t = self.read()?;
    let incident = t.incident(id)?.clone();
    let reporter_history = t.reporter_history(&incident);
    Ok(IncidentThread {
      follow_ups: t.follow_ups.get(&id).cloned().unwrap_or_default(),
      reactions: t.reaction_rows(ReactionTarget::Incident(id)),
      reporter_history,
      incident,
    })
  }

  fn follow_ups(&self, id: IncidentId) -> Result<Vec<FollowUp>, StoreError> {
    let t = self.read()?;
    t.incident(id)?;
    Ok(t.follow_ups.get(&id).cloned().unwrap_or_default())
  }

  fn comment(&self, id: CommentId) -> Result<Comment, StoreError> {
    self
      .read()?
      .comments
      .get(&id)
      .cloned()
      .ok_or_else(|| StoreError::not_found("comment", id))
  }

  fn comments(&self, incident: IncidentId) -> Result<Vec<Comment>, StoreError> {
    let t = self.read()?;
    t.incident(incident)?;
    let mut rows: Vec<Comment> = t
      .comments
      .values()
      .filter(|c| c.incident_id == incident)
      .cloned()
      .collect();
    rows.sort_by_key(|c| (c.created_at, c.id));
    Ok(rows)
  }

  fn reactions(&self, target: ReactionTarget) -> Result<Vec<Reaction>, StoreError> {
    Ok(self.read()?.reaction_rows(target))
  }

  fn candidates(&self, incident_type: IncidentType, since: DateTime<Utc>) -> Result<CandidateSet, StoreError> {
    let t = self.read()?;
    let incidents = t
      .incidents
      .values()
      .filter(|i| i.is_open() && i.incident_type == incident_type && i.created_at >= since)
      .cloned()
      .collect();
    Ok(CandidateSet {
      generation: t.generation,
      incidents,
    })
  }

  fn incidents(&self) -> Result<Vec<Incident>, StoreError> {
    let t = self.read()?;
    let mut rows: Vec<Incident> = t
      .incidents
      .values()
      .filter(|i| i.merged_into.is_none())
      .cloned()
      .collect();
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(rows)
  }

  fn due(&self, now: DateTime<Utc>) -> Result<Vec<DueCandidate>, StoreError> {
    let t = self.read()?;
    let mut rows: Vec<DueCandidate> = t
      .incidents
      .values()
      .filter(|i| i.merged_into.is_none() && i.follow_up_due_at.is_some_and(|due| due <= now))
      .map(|i| DueCandidate {
        incident: i.clone(),
        last_follow_up_at: t
          .follow_ups
          .get(&i.id)
          .and_then(|rows| rows.iter().map(|f| f.created_at).max()),
      })
      .collect();
    rows.sort_by_key(|c| (c.incident.follow_up_due_at, c.incident.id));
    Ok(rows)
  }

  fn ledger(&self, user: UserId) -> Result<Vec<LedgerEntry>, StoreError> {
    Ok(self.read()?.ledger.get(&user).cloned().unwrap_or_default())
  }

  fn ledger_entry(&self, id: LedgerEntryId) -> Result<LedgerEntry, StoreError> {
    let t = self.read()?;
    let (user, idx) = t
      .ledger_index
      .get(&id)
      .ok_or_else(|| StoreError::not_found("ledger entry", id))?;
    Ok(t.ledger[user][*idx].clone())
  }

  fn pending_redemptions(&self) -> Result<Vec<LedgerEntry>, StoreError> {
    let t = self.read()?;
    let mut rows: Vec<LedgerEntry> = t
      .ledger
      .values()
      .flatten()
      .filter(|e| e.source == LedgerSource::Redemption && e.status == LedgerStatus::Pending)
      .cloned()
      .collect();
    rows.sort_by_key(|e| (e.created_at, e.id));
    Ok(rows)
  }

  fn role(&self, user: UserId) -> Result<Option<Role>, StoreError> {
    Ok(self.read()?.roles.get(&user).copied())
  }

  fn role_request(&self, id: RoleRequestId) -> Result<RoleRequest, StoreError> {
    self
      .read()?
      .role_requests
      .get(&id)
      .cloned()
      .ok_or_else(|| StoreError::not_found("role request", id))
  }

  fn pending_role_request(&self, user: UserId) -> Result<Option<RoleRequest>, StoreError> {
    Ok(
      self
        .read()?
        .role_requests
        .values()
        .filter(|r| r.user_id == user && r.status == RoleRequestStatus::Pending)
        .max_by_key(|r| r.created_at)
        .cloned(),
    )
  }

  fn commit(&self, tx: Transaction) -> Result<(), StoreError> {
    let mut t = self.write()?;
    for guard in &tx.guards {
      t.check_guard(guard)?;
    }
    t.validate(&tx.writes)?;
    let count = tx.writes.len();
    for write in tx.writes {
      t.apply(write);
    }
    debug!(writes = count, generation = t.generation, "committed transaction");
    Ok(())
  }
}
