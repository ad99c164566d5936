//! Core engine: validates requests, runs them as optimistic transactions against the
//! store, and hands events to the dispatcher once a transaction has committed.
//!
//! Every mutating operation follows the same shape: read a snapshot, compute the new
//! state (rescoring, rescheduling, rewarding), commit it guarded by the versions that
//! were read. A guard that no longer holds surfaces as `EngineError::Conflict`, and
//! the whole read-compute-commit is retried up to `max_conflict_retries` times.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::dedup;
use crate::error::EngineError;
use crate::fingerprint;
use crate::ledger;
use crate::normalize;
use crate::notify::{EngineEvent, NotificationDispatcher};
use crate::scheduler::{self, DueState};
use crate::scoring::{self, ScoreBreakdown};
use crate::status::{self, Operation, Transition, Via};
use crate::store::{Guard, IncidentStore, Transaction, Write};
use crate::types::*;

const DEFAULT_QUEUE_LIMIT: usize = 50;
const MAX_QUEUE_LIMIT: usize = 200;

/// Value produced by one successful attempt, plus the events to dispatch for it.
struct Committed<T> {
  value: T,
  events: Vec<EngineEvent>,
}

impl<T> Committed<T> {
  fn quiet(value: T) -> Self {
    Self {
      value,
      events: Vec::new(),
    }
  }

  fn with(value: T, events: Vec<EngineEvent>) -> Self {
    Self { value, events }
  }
}

pub struct Engine {
  config: Config,
  store: Arc<dyn IncidentStore>,
  dispatcher: Arc<dyn NotificationDispatcher>,
  clock: Arc<dyn Clock>,
}

impl Engine {
  pub fn new(
    config: Config,
    store: Arc<dyn IncidentStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      config,
      store,
      dispatcher,
      clock,
    }
  }

  // -------------------------------------------------------------------------
  // Reports and follow-ups
  // -------------------------------------------------------------------------

  /// Submit a report: merge it into a matching open incident, or create a new one.
  pub fn submit(&self, actor: &Actor, report: &Report) -> Result<SubmitOutcome, EngineError> {
    status::require(self.role(actor)?, Operation::SubmitReport)?;
    let new = normalize::normalize_report(report)?;

    self.run("submit", || {
      let now = self.clock.now();
      let since = now - chrono::Duration::minutes(self.config.dedup_window_minutes);
      let candidates = self.store.candidates(new.incident_type, since)?;

      if let Some(found) = dedup::find_match(&new, now, &candidates.incidents, &self.config) {
        debug!(
          incident_id = %found.incident_id,
          proximity = found.proximity,
          text_similarity = found.text_similarity,
          "report matches open incident"
        );
        return self.merge_report(actor, &new, found.incident_id, now);
      }

      let id = IncidentId::new();
      let content = fingerprint::report_content(&new.category, &new.description);
      let incident = Incident {
        id,
        category: new.category.clone(),
        incident_type: new.incident_type,
        description: new.description.clone(),
        location: new.location.clone(),
        prompts: new.prompts,
        status: IncidentStatus::Unverified,
        status_entered_at: now,
        credibility_score: self.config.neutral_score,
        reporter_id: actor.user_id,
        reporter_alias: new.reporter_alias.clone(),
        created_at: now,
        updated_at: now,
        follow_up_due_at: scheduler::initial_due(now, &new.prompts, &self.config),
        merged_into: None,
        is_hidden: false,
        likes_count: 0,
        unlikes_count: 0,
        content_fingerprint: fingerprint::compute(id, actor.user_id, &content),
        version: 0,
      };
      let mut thread = IncidentThread {
        reporter_history: self.reporter_history(actor.user_id)?,
        incident,
        follow_ups: Vec::new(),
        reactions: Vec::new(),
      };
      self.rescore(&mut thread, now);

      let mut tx = Transaction::new();
      tx.guard(Guard::Generation(candidates.generation));
      tx.write(Write::InsertIncident(thread.incident.clone()));
      self.store.commit(tx)?;

      info!(
        incident_id = %id,
        category = %thread.incident.category,
        score = thread.incident.credibility_score,
        "incident created"
      );
      Ok(Committed::quiet(SubmitOutcome {
        incident: self.store.incident(id)?,
        disposition: Disposition::Created,
      }))
    })
  }

  /// Fold a duplicate report into `target` as a merged-report follow-up.
  fn merge_report(
    &self,
    actor: &Actor,
    new: &NewReport,
    target: IncidentId,
    now: DateTime<Utc>,
  ) -> Result<Committed<SubmitOutcome>, EngineError> {
    let mut thread = self.store.thread(target)?;
    if !thread.incident.is_open() {
      return Err(EngineError::Conflict(format!("match {} closed before merge", target)));
    }
    let fp = fingerprint::compute(
      target,
      actor.user_id,
      &fingerprint::report_content(&new.category, &new.description),
    );
    if thread.incident.content_fingerprint == fp || thread.follow_ups.iter().any(|f| f.fingerprint == fp) {
      debug!(incident_id = %target, "report already merged");
      return Ok(Committed::quiet(SubmitOutcome {
        incident: thread.incident,
        disposition: Disposition::AlreadyMerged,
      }));
    }

    let follow_up = FollowUp {
      id: FollowUpId::new(),
      incident_id: target,
      status: thread.incident.status,
      status_applied: false,
      notes: Some(new.description.clone()),
      prompts: new.prompts,
      created_by: new.reporter_alias.clone(),
      author_id: actor.user_id,
      origin: FollowUpOrigin::MergedReport,
      fingerprint: fp,
      created_at: now,
    };

    let incident = &mut thread.incident;
    incident.prompts.overlay(&new.prompts);
    if incident.location.coordinates.is_none() {
      incident.location.coordinates = new.location.coordinates;
    }
    if incident.location.text.is_none() {
      incident.location.text = new.location.text.clone();
    }
    incident.updated_at = now;
    incident.follow_up_due_at = scheduler::after_follow_up(incident.status, &follow_up, &self.config);
    thread.follow_ups.push(follow_up.clone());
    self.rescore(&mut thread, now);

    let mut tx = Transaction::new();
    tx.write(Write::UpdateIncident(thread.incident.clone()));
    tx.write(Write::AppendFollowUp(follow_up.clone()));
    self.store.commit(tx)?;

    info!(
      incident_id = %target,
      follow_up_id = %follow_up.id,
      score = thread.incident.credibility_score,
      "report merged into existing incident"
    );
    Ok(Committed::with(
      SubmitOutcome {
        incident: self.store.incident(target)?,
        disposition: Disposition::Merged {
          follow_up_id: follow_up.id,
        },
      },
      vec![EngineEvent::ReportMerged {
        incident_id: target,
        follow_up_id: follow_up.id,
        submitter_id: actor.user_id,
      }],
    ))
  }

  /// Record a follow-up. A status proposal the caller may not make is rejected with
  /// `Forbidden`, but the follow-up's notes and prompts are still stored and the
  /// error names the recorded follow-up.
  pub fn record_follow_up(
    &self,
    actor: &Actor,
    incident_id: IncidentId,
    input: &FollowUpInput,
  ) -> Result<FollowUpReceipt, EngineError> {
    let role = self.role(actor)?;
    status::require(role, Operation::AddFollowUp)?;
    let new = normalize::normalize_follow_up(input)?;

    let (receipt, rejection) = self.run("record_follow_up", || {
      let now = self.clock.now();
      let canonical = self.visible_canonical(incident_id, role)?;
      let mut thread = self.store.thread(canonical.id)?;
      let current = thread.incident.status;
      let requested = new.status.unwrap_or(current);

      let (transition, rejection) = match status::transition(current, requested, role, Via::FollowUp) {
        Ok(t) => (t, None),
        Err(EngineError::Forbidden { reason, .. }) => (Transition::Unchanged, Some(reason)),
        Err(e) => return Err(e),
      };

      let follow_up = FollowUp {
        id: FollowUpId::new(),
        incident_id: canonical.id,
        status: requested,
        status_applied: matches!(transition, Transition::Apply { .. }),
        notes: new.notes.clone(),
        prompts: new.prompts,
        created_by: new.created_by.clone(),
        author_id: actor.user_id,
        origin: FollowUpOrigin::Human,
        fingerprint: fingerprint::compute(canonical.id, actor.user_id, new.notes.as_deref().unwrap_or("")),
        created_at: now,
      };

      let mut events = Vec::new();
      let incident = &mut thread.incident;
      incident.prompts.overlay(&new.prompts);
      incident.updated_at = now;
      if let Transition::Apply { from, to } = transition {
        incident.status = to;
        incident.status_entered_at = now;
        events.push(EngineEvent::StatusChanged {
          incident_id: canonical.id,
          from,
          to,
          at: now,
        });
      }
      incident.follow_up_due_at = scheduler::after_follow_up(incident.status, &follow_up, &self.config);
      thread.follow_ups.push(follow_up.clone());
      self.rescore(&mut thread, now);

      let mut tx = Transaction::new();
      tx.write(Write::UpdateIncident(thread.incident.clone()));
      tx.write(Write::AppendFollowUp(follow_up.clone()));
      if follow_up.status_applied {
        self.stage_reward(&mut tx, &thread.incident, now, &mut events)?;
      }
      self.store.commit(tx)?;

      info!(
        incident_id = %canonical.id,
        follow_up_id = %follow_up.id,
        status = %thread.incident.status,
        applied = follow_up.status_applied,
        score = thread.incident.credibility_score,
        "follow-up recorded"
      );
      let receipt = FollowUpReceipt {
        incident: self.store.incident(canonical.id)?,
        follow_up,
      };
      Ok(Committed::with((receipt, rejection.clone()), events))
    })?;

    match rejection {
      Some(reason) => {
        warn!(
          incident_id = %receipt.incident.id,
          follow_up_id = %receipt.follow_up.id,
          %reason,
          "status proposal rejected, follow-up kept"
        );
        Err(EngineError::Forbidden {
          reason,
          recorded_follow_up: Some(receipt.follow_up.id),
        })
      }
      None => Ok(receipt),
    }
  }

  /// Direct status change by an elevated role.
  pub fn set_status(&self, actor: &Actor, incident_id: IncidentId, to: IncidentStatus) -> Result<Incident, EngineError> {
    let role = self.role(actor)?;
    status::require(role, Operation::SetStatus(to))?;

    self.run("set_status", || {
      let now = self.clock.now();
      let canonical = self.canonical(incident_id)?;
      let mut thread = self.store.thread(canonical.id)?;
      let (from, to) = match status::transition(thread.incident.status, to, role, Via::Direct)? {
        Transition::Unchanged => return Ok(Committed::quiet(thread.incident)),
        Transition::Apply { from, to } => (from, to),
      };

      let incident = &mut thread.incident;
      incident.status = to;
      incident.status_entered_at = now;
      incident.updated_at = now;
      incident.follow_up_due_at = scheduler::after_status_change(to, now, &self.config);
      self.rescore(&mut thread, now);

      let mut events = vec![EngineEvent::StatusChanged {
        incident_id: canonical.id,
        from,
        to,
        at: now,
      }];
      let mut tx = Transaction::new();
      tx.write(Write::UpdateIncident(thread.incident.clone()));
      self.stage_reward(&mut tx, &thread.incident, now, &mut events)?;
      self.store.commit(tx)?;

      info!(
        incident_id = %canonical.id,
        %from,
        %to,
        score = thread.incident.credibility_score,
        "status changed"
      );
      Ok(Committed::with(self.store.incident(canonical.id)?, events))
    })
  }

  /// Hide or unhide an incident or comment. Scores are untouched.
  pub fn set_visibility(&self, actor: &Actor, target: VisibilityTarget, hidden: bool) -> Result<VisibilityChange, EngineError> {
    status::require(self.role(actor)?, Operation::SetVisibility)?;

    self.run("set_visibility", || {
      let now = self.clock.now();
      let mut tx = Transaction::new();
      let target = match target {
        VisibilityTarget::Incident(id) => {
          let mut incident = self.canonical(id)?;
          if incident.is_hidden == hidden {
            return Ok(Committed::quiet(VisibilityChange {
              target: VisibilityTarget::Incident(incident.id),
              is_hidden: hidden,
            }));
          }
          incident.is_hidden = hidden;
          incident.updated_at = now;
          let resolved = VisibilityTarget::Incident(incident.id);
          tx.write(Write::UpdateIncident(incident));
          resolved
        }
        VisibilityTarget::Comment(id) => {
          let mut comment = self.store.comment(id)?;
          if comment.is_hidden == hidden {
            return Ok(Committed::quiet(VisibilityChange { target, is_hidden: hidden }));
          }
          comment.is_hidden = hidden;
          tx.write(Write::UpdateComment(comment));
          target
        }
      };
      self.store.commit(tx)?;
      info!(?target, hidden, "visibility changed");
      Ok(Committed::quiet(VisibilityChange {
        target,
        is_hidden: hidden,
      }))
    })
  }

  /// Moderator merge of two existing incidents. `source` redirects to `target` from
  /// now on and its report joins the target's thread.
  pub fn merge_incidents(&self, actor: &Actor, source: IncidentId, target: IncidentId) -> Result<Incident, EngineError> {
    status::require(self.role(actor)?, Operation::MergeIncidents)?;

    self.run("merge_incidents", || {
      let now = self.clock.now();
      let mut source = self.canonical(source)?;
      let mut thread = self.store.thread(self.canonical(target)?.id)?;
      let target_id = thread.incident.id;
      if thread.incident.merged_into.is_some() {
        return Err(EngineError::Conflict(format!("target {} merged while resolving", target_id)));
      }
      if source.id == target_id {
        return Err(EngineError::validation("source", "already part of the target incident"));
      }

      source.merged_into = Some(target_id);
      source.follow_up_due_at = None;
      source.updated_at = now;

      let mut tx = Transaction::new();
      tx.guard(Guard::IncidentVersion {
        id: target_id,
        version: thread.incident.version,
      });
      tx.write(Write::UpdateIncident(source.clone()));

      let fp = fingerprint::compute(
        target_id,
        source.reporter_id,
        &fingerprint::report_content(&source.category, &source.description),
      );
      let mut events = Vec::new();
      let duplicate = thread.incident.content_fingerprint == fp || thread.follow_ups.iter().any(|f| f.fingerprint == fp);
      if !duplicate {
        let follow_up = FollowUp {
          id: FollowUpId::new(),
          incident_id: target_id,
          status: thread.incident.status,
          status_applied: false,
          notes: Some(source.description.clone()),
          prompts: source.prompts,
          created_by: source.reporter_alias.clone(),
          author_id: source.reporter_id,
          origin: FollowUpOrigin::MergedReport,
          fingerprint: fp,
          created_at: now,
        };
        let incident = &mut thread.incident;
        incident.prompts.overlay(&source.prompts);
        incident.updated_at = now;
        incident.follow_up_due_at = scheduler::after_follow_up(incident.status, &follow_up, &self.config);
        thread.follow_ups.push(follow_up.clone());
        self.rescore(&mut thread, now);
        events.push(EngineEvent::ReportMerged {
          incident_id: target_id,
          follow_up_id: follow_up.id,
          submitter_id: source.reporter_id,
        });
        tx.write(Write::AppendFollowUp(follow_up));
        tx.write(Write::UpdateIncident(thread.incident.clone()));
      }
      self.store.commit(tx)?;

      info!(source = %source.id, target = %target_id, "incidents merged");
      Ok(Committed::with(self.store.incident(target_id)?, events))
    })
  }

  // -------------------------------------------------------------------------
  // Comments and reactions
  // -------------------------------------------------------------------------

  pub fn add_comment(&self, actor: &Actor, incident_id: IncidentId, input: &CommentInput) -> Result<Comment, EngineError> {
    let role = self.role(actor)?;
    status::require(role, Operation::Comment)?;
    let input = normalize::normalize_comment(input)?;

    self.run("add_comment", || {
      let incident = self.visible_canonical(incident_id, role)?;
      let comment = Comment {
        id: CommentId::new(),
        incident_id: incident.id,
        author_id: actor.user_id,
        body: input.body.clone(),
        attachments: input.attachments.clone(),
        is_hidden: false,
        likes_count: 0,
        unlikes_count: 0,
        created_at: self.clock.now(),
        version: 0,
      };
      let mut tx = Transaction::new();
      tx.write(Write::InsertComment(comment.clone()));
      self.store.commit(tx)?;
      debug!(incident_id = %incident.id, comment_id = %comment.id, "comment added");
      Ok(Committed::quiet(comment))
    })
  }

  /// Like, unlike or clear. Aggregates are recounted from the reaction rows in the
  /// same transaction; incident reactions also move the credibility score.
  pub fn set_reaction(
    &self,
    actor: &Actor,
    target: ReactionTarget,
    action: ReactionAction,
  ) -> Result<ReactionTotals, EngineError> {
    let role = self.role(actor)?;
    status::require(role, Operation::React)?;
    let kind = match action {
      ReactionAction::Like => Some(ReactionKind::Like),
      ReactionAction::Unlike => Some(ReactionKind::Unlike),
      ReactionAction::Clear => None,
    };
    let user = actor.user_id;

    self.run("set_reaction", || {
      let now = self.clock.now();
      let mut tx = Transaction::new();
      match target {
        ReactionTarget::Incident(id) => {
          let canonical = self.visible_canonical(id, role)?;
          let target = ReactionTarget::Incident(canonical.id);
          let mut thread = self.store.thread(canonical.id)?;
          if !apply_reaction(&mut thread.reactions, user, target, kind, now) {
            return Ok(Committed::quiet(ReactionTotals::tally(&thread.reactions, Some(user))));
          }
          let totals = ReactionTotals::tally(&thread.reactions, Some(user));
          thread.incident.likes_count = totals.likes_count;
          thread.incident.unlikes_count = totals.unlikes_count;
          self.rescore(&mut thread, now);
          tx.write(Write::SetReaction { user, target, kind, at: now });
          tx.write(Write::UpdateIncident(thread.incident));
          self.store.commit(tx)?;
          debug!(incident_id = %canonical.id, ?kind, likes = totals.likes_count, unlikes = totals.unlikes_count, "incident reaction set");
          Ok(Committed::quiet(totals))
        }
        ReactionTarget::Comment(id) => {
          let mut comment = self.store.comment(id)?;
          self.visible_canonical(comment.incident_id, role)?;
          if comment.is_hidden && !status::capability(role, Operation::SetVisibility) {
            return Err(EngineError::not_found("comment", id));
          }
          let mut rows = self.store.reactions(target)?;
          if !apply_reaction(&mut rows, user, target, kind, now) {
            return Ok(Committed::quiet(ReactionTotals::tally(&rows, Some(user))));
          }
          let totals = ReactionTotals::tally(&rows, Some(user));
          comment.likes_count = totals.likes_count;
          comment.unlikes_count = totals.unlikes_count;
          tx.write(Write::SetReaction { user, target, kind, at: now });
          tx.write(Write::UpdateComment(comment));
          self.store.commit(tx)?;
          debug!(comment_id = %id, ?kind, "comment reaction set");
          Ok(Committed::quiet(totals))
        }
      }
    })
  }

  // -------------------------------------------------------------------------
  // Scheduling
  // -------------------------------------------------------------------------

  /// Fire every elapsed check-in at most once. Each fire is its own commit; one that
  /// cannot be persisted is left for the next sweep.
  pub fn sweep_due(&self) -> Result<SweepReport, EngineError> {
    let now = self.clock.now();
    let mut report = SweepReport::default();

    for candidate in self.store.due(now)? {
      report.examined += 1;
      let mut incident = candidate.incident;
      let id = incident.id;
      let (due_at, fire) = match scheduler::due_state(&incident, candidate.last_follow_up_at, now) {
        DueState::NotDue => continue,
        DueState::Due(due_at) => (due_at, true),
        DueState::Superseded(due_at) | DueState::Withdrawn(due_at) => (due_at, false),
      };

      incident.follow_up_due_at = None;
      let reporter_id = incident.reporter_id;
      let mut tx = Transaction::new();
      tx.write(Write::UpdateIncident(incident));
      if fire {
        tx.guard(Guard::NotFired { incident: id, due_at });
        tx.write(Write::MarkFired { incident: id, due_at });
      }

      match self.store.commit(tx).map_err(EngineError::from) {
        Ok(()) if fire => {
          report.fired += 1;
          info!(incident_id = %id, %due_at, "check-in due");
          self.dispatcher.notify(EngineEvent::CheckInDue {
            incident_id: id,
            due_at,
            reporter_id,
          });
        }
        Ok(()) => {
          report.superseded += 1;
          debug!(incident_id = %id, %due_at, "check-in dropped without firing");
        }
        Err(EngineError::Conflict(reason)) => {
          report.deferred += 1;
          debug!(incident_id = %id, %reason, "check-in raced another writer, deferring");
        }
        Err(e) => {
          report.deferred += 1;
          let err = EngineError::Scheduling(format!("could not persist check-in for {}: {}", id, e));
          warn!(incident_id = %id, error = %err, "deferring check-in");
        }
      }
    }

    if report.examined > 0 {
      debug!(
        examined = report.examined,
        fired = report.fired,
        superseded = report.superseded,
        deferred = report.deferred,
        "sweep finished"
      );
    }
    Ok(report)
  }

  // -------------------------------------------------------------------------
  // Rewards
  // -------------------------------------------------------------------------

  /// Reserve points for a partner reward, priced from the partner catalog. The entry
  /// stays pending until decided.
  pub fn redeem(&self, actor: &Actor, request: &RedemptionRequest) -> Result<LedgerEntry, EngineError> {
    status::require(self.role(actor)?, Operation::Redeem)?;
    let partner = ledger::find_partner(&self.config.reward_partners, &request.partner_id)
      .ok_or_else(|| EngineError::not_found("partner", request.partner_id.trim()))?;
    let quantity = request.quantity.max(1);
    let cost = normalize::redemption_cost(partner, quantity)?;
    let user = actor.user_id;

    self.run("redeem", || {
      let entries = self.store.ledger(user)?;
      let summary = ledger::summary(user, &entries);
      if summary.available < cost {
        return Err(EngineError::validation(
          "quantity",
          &format!("needs {} points, {} available", cost, summary.available),
        ));
      }

      let mut description = format!("Redeemed {} x{}", partner.name, quantity);
      if let Some(notes) = request.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        description = format!("{} · {}", description, notes);
      }
      let entry = LedgerEntry {
        id: LedgerEntryId::new(),
        user_id: user,
        delta: -cost,
        source: LedgerSource::Redemption,
        description: normalize::truncate_description(&description),
        partner: Some(partner.to_ref()),
        incident_id: None,
        status: LedgerStatus::Pending,
        created_at: self.clock.now(),
        decided_at: None,
      };
      let mut tx = Transaction::new();
      tx.guard(Guard::LedgerLength {
        user,
        len: entries.len(),
      });
      tx.write(Write::AppendLedger(entry.clone()));
      self.store.commit(tx)?;
      info!(user_id = %user, entry_id = %entry.id, partner = %partner.id, cost, "redemption requested");
      Ok(Committed::quiet(entry))
    })
  }

  pub fn reward_partners(&self) -> &[RewardPartner] {
    &self.config.reward_partners
  }

  /// Review queue: pending redemptions across all users, oldest first.
  pub fn pending_redemptions(&self, actor: &Actor, limit: Option<usize>) -> Result<Vec<LedgerEntry>, EngineError> {
    status::require(self.role(actor)?, Operation::DecideRedemption)?;
    let limit = limit.unwrap_or(DEFAULT_QUEUE_LIMIT).clamp(1, MAX_QUEUE_LIMIT);
    let mut entries = self.store.pending_redemptions()?;
    entries.truncate(limit);
    Ok(entries)
  }

  pub fn decide_redemption(
    &self,
    actor: &Actor,
    entry_id: LedgerEntryId,
    decision: Decision,
    note: Option<String>,
  ) -> Result<LedgerEntry, EngineError> {
    status::require(self.role(actor)?, Operation::DecideRedemption)?;

    self.run("decide_redemption", || {
      let entry = self.store.ledger_entry(entry_id)?;
      if entry.source != LedgerSource::Redemption {
        return Err(EngineError::validation("entry_id", "not a redemption"));
      }
      if entry.status != LedgerStatus::Pending {
        return Err(EngineError::validation("entry_id", "request already processed"));
      }
      let status = match decision {
        Decision::Approve => LedgerStatus::Fulfilled,
        Decision::Deny => LedgerStatus::Cancelled,
      };
      let mut tx = Transaction::new();
      tx.write(Write::DecideLedger {
        id: entry_id,
        status,
        note: note.clone().filter(|n| !n.trim().is_empty()),
        at: self.clock.now(),
      });
      self.store.commit(tx)?;
      info!(entry_id = %entry_id, ?status, reviewer = %actor.user_id, "redemption decided");
      Ok(Committed::quiet(self.store.ledger_entry(entry_id)?))
    })
  }

  /// Admin correction, posted immediately.
  pub fn adjust_points(&self, actor: &Actor, user: UserId, delta: i64, description: &str) -> Result<LedgerEntry, EngineError> {
    status::require(self.role(actor)?, Operation::AdjustPoints)?;
    if delta == 0 {
      return Err(EngineError::validation("delta", "must be non-zero"));
    }

    self.run("adjust_points", || {
      let entries = self.store.ledger(user)?;
      let entry = LedgerEntry {
        id: LedgerEntryId::new(),
        user_id: user,
        delta,
        source: LedgerSource::ManualAdjustment,
        description: normalize::truncate_description(description),
        partner: None,
        incident_id: None,
        status: LedgerStatus::Posted,
        created_at: self.clock.now(),
        decided_at: None,
      };
      let mut tx = Transaction::new();
      tx.guard(Guard::LedgerLength {
        user,
        len: entries.len(),
      });
      tx.write(Write::AppendLedger(entry.clone()));
      self.store.commit(tx)?;
      info!(user_id = %user, delta, admin = %actor.user_id, "points adjusted");
      let event = EngineEvent::RewardPosted {
        user_id: user,
        entry_id: entry.id,
        delta,
        incident_id: None,
      };
      Ok(Committed::with(entry, vec![event]))
    })
  }

  pub fn reward_summary(&self, actor: &Actor, user: UserId) -> Result<RewardSummary, EngineError> {
    self.require_ledger_access(actor, user)?;
    Ok(ledger::summary(user, &self.store.ledger(user)?))
  }

  /// Ledger entries, newest first.
  pub fn ledger(&self, actor: &Actor, user: UserId) -> Result<Vec<LedgerEntry>, EngineError> {
    self.require_ledger_access(actor, user)?;
    let mut entries = self.store.ledger(user)?;
    entries.reverse();
    Ok(entries)
  }

  /// Users read their own ledger; reviewers read anyone's.
  fn require_ledger_access(&self, actor: &Actor, user: UserId) -> Result<(), EngineError> {
    if actor.user_id == user {
      return Ok(());
    }
    status::require(self.role(actor)?, Operation::ReviewLedger)
  }

  // -------------------------------------------------------------------------
  // Roles
  // -------------------------------------------------------------------------

  /// Ask for an elevated role. A second request while one is pending replaces it.
  pub fn request_role(&self, actor: &Actor, requested: Role, justification: Option<String>) -> Result<RoleRequest, EngineError> {
    let current = self.role(actor)?;
    status::require(current, Operation::RequestRole)?;
    if !requested.requires_approval() {
      return Err(EngineError::validation("role", "does not need approval"));
    }
    if current == requested {
      return Err(EngineError::validation("role", "already granted"));
    }
    let justification = justification.map(|j| j.trim().to_string()).filter(|j| !j.is_empty());

    self.run("request_role", || {
      let now = self.clock.now();
      let mut tx = Transaction::new();
      let request = match self.store.pending_role_request(actor.user_id)? {
        Some(existing) => {
          tx.guard(Guard::RoleRequestPending(existing.id));
          RoleRequest {
            requested_role: requested,
            justification: justification.clone(),
            created_at: now,
            ..existing
          }
        }
        None => RoleRequest {
          id: RoleRequestId::new(),
          user_id: actor.user_id,
          requested_role: requested,
          justification: justification.clone(),
          status: RoleRequestStatus::Pending,
          reviewer_id: None,
          reviewer_notes: None,
          created_at: now,
          decided_at: None,
        },
      };
      tx.write(Write::PutRoleRequest(request.clone()));
      self.store.commit(tx)?;
      info!(user_id = %actor.user_id, role = %requested, request_id = %request.id, "role requested");
      Ok(Committed::quiet(request))
    })
  }

  /// Approve (optionally granting a different role than asked) or deny.
  pub fn decide_role_request(
    &self,
    actor: &Actor,
    request_id: RoleRequestId,
    decision: Decision,
    role_override: Option<Role>,
    notes: Option<String>,
  ) -> Result<RoleRequest, EngineError> {
    status::require(self.role(actor)?, Operation::DecideRoleRequest)?;

    self.run("decide_role_request", || {
      let mut request = self.store.role_request(request_id)?;
      if request.status != RoleRequestStatus::Pending {
        return Err(EngineError::validation("request_id", "request already processed"));
      }
      let mut tx = Transaction::new();
      tx.guard(Guard::RoleRequestPending(request_id));
      match decision {
        Decision::Approve => {
          let granted = role_override.unwrap_or(request.requested_role);
          request.requested_role = granted;
          request.status = RoleRequestStatus::Approved;
          tx.write(Write::SetRole {
            user: request.user_id,
            role: granted,
          });
        }
        Decision::Deny => request.status = RoleRequestStatus::Denied,
      }
      request.reviewer_id = Some(actor.user_id);
      request.reviewer_notes = notes.clone().filter(|n| !n.trim().is_empty());
      request.decided_at = Some(self.clock.now());
      tx.write(Write::PutRoleRequest(request.clone()));
      self.store.commit(tx)?;
      info!(request_id = %request_id, status = ?request.status, reviewer = %actor.user_id, "role request decided");
      Ok(Committed::quiet(request))
    })
  }

  /// Role granted through an approved request, if any.
  pub fn role_of(&self, user: UserId) -> Result<Option<Role>, EngineError> {
    Ok(self.store.role(user)?)
  }

  // -------------------------------------------------------------------------
  // Reads
  // -------------------------------------------------------------------------

  pub fn incident(&self, actor: &Actor, id: IncidentId) -> Result<Incident, EngineError> {
    self.visible_canonical(id, self.role(actor)?)
  }

  pub fn follow_ups(&self, actor: &Actor, id: IncidentId) -> Result<Vec<FollowUp>, EngineError> {
    let incident = self.visible_canonical(id, self.role(actor)?)?;
    Ok(self.store.follow_ups(incident.id)?)
  }

  pub fn comments(&self, actor: &Actor, id: IncidentId) -> Result<Vec<Comment>, EngineError> {
    let role = self.role(actor)?;
    let incident = self.visible_canonical(id, role)?;
    let moderator = status::capability(role, Operation::SetVisibility);
    Ok(
      self
        .store
        .comments(incident.id)?
        .into_iter()
        .filter(|c| moderator || !c.is_hidden)
        .collect(),
    )
  }

  /// Current score terms for an incident, evaluated now.
  pub fn explain_score(&self, actor: &Actor, id: IncidentId) -> Result<ScoreBreakdown, EngineError> {
    let incident = self.visible_canonical(id, self.role(actor)?)?;
    let thread = self.store.thread(incident.id)?;
    Ok(scoring::breakdown(&thread, self.clock.now(), &self.config))
  }

  /// Canonical incidents, newest first.
  pub fn list_incidents(&self, actor: &Actor, filter: &IncidentFilter) -> Result<Vec<Incident>, EngineError> {
    let moderator = status::capability(self.role(actor)?, Operation::SetVisibility);
    let category = filter.category.as_deref().map(str::trim).filter(|c| !c.is_empty());
    let rows = self
      .store
      .incidents()?
      .into_iter()
      .filter(|i| moderator || !i.is_hidden)
      .filter(|i| filter.status.map_or(true, |s| i.status == s))
      .filter(|i| filter.incident_type.map_or(true, |t| i.incident_type == t))
      .filter(|i| category.map_or(true, |c| i.category.eq_ignore_ascii_case(c)))
      .filter(|i| !filter.needs_follow_up || i.follow_up_due_at.is_some())
      .take(filter.limit.unwrap_or(usize::MAX))
      .collect();
    Ok(rows)
  }

  /// Aggregate view over visible canonical incidents.
  pub fn stats(&self) -> Result<IncidentStats, EngineError> {
    let incidents: Vec<Incident> = self.store.incidents()?.into_iter().filter(|i| !i.is_hidden).collect();
    let mut stats = IncidentStats {
      total: incidents.len(),
      ..IncidentStats::default()
    };
    if incidents.is_empty() {
      return Ok(stats);
    }

    let mut answered = 0usize;
    let mut credibility = 0.0;
    for incident in &incidents {
      *stats.by_status.entry(incident.status.as_str().to_string()).or_insert(0) += 1;
      *stats.by_type.entry(incident.incident_type.as_str().to_string()).or_insert(0) += 1;
      if incident.follow_up_due_at.is_some() {
        stats.active_follow_up += 1;
      }
      if let Some(sentiment) = incident.prompts.safety_sentiment {
        *stats.sentiment_breakdown.entry(sentiment.as_str().to_string()).or_insert(0) += 1;
      }
      answered += incident.prompts.answered();
      credibility += incident.credibility_score;
    }
    let n = incidents.len() as f64;
    stats.prompt_completion_rate = round3(answered as f64 / (n * 3.0));
    stats.avg_credibility = round3(credibility / n);
    Ok(stats)
  }

  // -------------------------------------------------------------------------
  // Internals
  // -------------------------------------------------------------------------

  /// Run one read-compute-commit attempt until it stops conflicting.
  fn run<T>(&self, op: &'static str, mut attempt: impl FnMut() -> Result<Committed<T>, EngineError>) -> Result<T, EngineError> {
    let max = self.config.max_conflict_retries;
    for n in 1..=max {
      match attempt() {
        Ok(Committed { value, events }) => {
          for event in events {
            self.dispatcher.notify(event);
          }
          return Ok(value);
        }
        Err(EngineError::Conflict(reason)) => {
          debug!(op, attempt = n, %reason, "snapshot changed underneath, retrying");
        }
        Err(e) => return Err(e),
      }
    }
    warn!(op, attempts = max, "giving up after repeated conflicts");
    Err(EngineError::Contended { attempts: max })
  }

  /// Granted role wins over the one the identity layer reported.
  fn role(&self, actor: &Actor) -> Result<Role, EngineError> {
    Ok(self.store.role(actor.user_id)?.unwrap_or(actor.role))
  }

  /// Follow `merged_into` to the end of the chain.
  fn canonical(&self, id: IncidentId) -> Result<Incident, EngineError> {
    let mut incident = self.store.incident(id)?;
    let mut seen = HashSet::from([incident.id]);
    while let Some(next) = incident.merged_into {
      if !seen.insert(next) {
        return Err(EngineError::Invariant(format!("merge chain of {} loops at {}", id, next)));
      }
      incident = self.store.incident(next)?;
    }
    Ok(incident)
  }

  /// Canonical incident, unless it is hidden from this role.
  fn visible_canonical(&self, id: IncidentId, role: Role) -> Result<Incident, EngineError> {
    let incident = self.canonical(id)?;
    if incident.is_hidden && !status::capability(role, Operation::SetVisibility) {
      return Err(EngineError::not_found("incident", id));
    }
    Ok(incident)
  }

  fn reporter_history(&self, reporter: UserId) -> Result<ReporterHistory, EngineError> {
    let mut history = ReporterHistory::default();
    for incident in self.store.incidents()? {
      if incident.reporter_id != reporter {
        continue;
      }
      if incident.is_hidden {
        history.rejected += 1;
      } else if incident.status != IncidentStatus::Unverified {
        history.confirmed += 1;
      }
    }
    Ok(history)
  }

  fn rescore(&self, thread: &mut IncidentThread, now: DateTime<Utc>) {
    thread.incident.credibility_score = scoring::score(thread, now, &self.config);
  }

  /// Add the reporter's confirmation reward (if one is owed) to `tx`.
  fn stage_reward(
    &self,
    tx: &mut Transaction,
    incident: &Incident,
    now: DateTime<Utc>,
    events: &mut Vec<EngineEvent>,
  ) -> Result<(), EngineError> {
    if incident.status == IncidentStatus::Unverified {
      return Ok(());
    }
    let entries = self.store.ledger(incident.reporter_id)?;
    tx.guard(Guard::LedgerLength {
      user: incident.reporter_id,
      len: entries.len(),
    });
    if let Some(entry) = ledger::confirmation_reward(&entries, incident, now) {
      events.push(EngineEvent::RewardPosted {
        user_id: entry.user_id,
        entry_id: entry.id,
        delta: entry.delta,
        incident_id: entry.incident_id,
      });
      tx.write(Write::AppendLedger(entry));
    }
    Ok(())
  }
}

/// Replace `user`'s row in `rows`. Returns false when nothing changes.
fn apply_reaction(
  rows: &mut Vec<Reaction>,
  user: UserId,
  target: ReactionTarget,
  kind: Option<ReactionKind>,
  now: DateTime<Utc>,
) -> bool {
  let existing = rows.iter().position(|r| r.user_id == user);
  match (existing, kind) {
    (Some(idx), Some(kind)) if rows[idx].kind == kind => false,
    (None, None) => false,
    (Some(idx), None) => {
      rows.remove(idx);
      true
    }
    (existing, Some(kind)) => {
      if let Some(idx) = existing {
        rows.remove(idx);
      }
      rows.push(Reaction {
        user_id: user,
        target,
        kind,
        updated_at: now,
      });
      true
    }
  }
}

fn round3(v: f64) -> f64 {
  (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::error::StoreError;
  use crate::notify::RecordingDispatcher;
  use crate::store::{CandidateSet, DueCandidate, MemoryStore};
  use chrono::{Duration, TimeZone};
  use std::sync::Mutex;

  struct Harness {
    engine: Engine,
    clock: Arc<ManualClock>,
    events: Arc<RecordingDispatcher>,
  }

  fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap()));
    let events = Arc::new(RecordingDispatcher::new());
    let engine = Engine::new(Config::default(), Arc::new(MemoryStore::new()), events.clone(), clock.clone());
    Harness { engine, clock, events }
  }

  fn resident() -> Actor {
    Actor::new(UserId::new(), Role::Resident)
  }

  fn report(lat: f64, lng: f64) -> Report {
    Report {
      category: "Package Theft".into(),
      description: "package theft from porch".into(),
      incident_type: Some(IncidentType::Community),
      location_text: None,
      lat: Some(lat),
      lng: Some(lng),
      prompts: Prompts::default(),
      reporter_alias: None,
    }
  }

  #[test]
  fn submit_creates_unverified_incident_with_first_check_in() {
    let h = harness();
    let outcome = h.engine.submit(&resident(), &report(38.90, -77.03)).unwrap();
    assert_eq!(outcome.disposition, Disposition::Created);
    let incident = outcome.incident;
    assert_eq!(incident.status, IncidentStatus::Unverified);
    assert_eq!(incident.follow_up_due_at, Some(h.clock.now() + Duration::minutes(30)));
    assert!((incident.credibility_score - 0.5).abs() < 0.05);
  }

  #[test]
  fn invalid_report_never_reaches_store() {
    let h = harness();
    let mut bad = report(38.90, -77.03);
    bad.description = "   ".into();
    let err = h.engine.submit(&resident(), &bad).unwrap_err();
    assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "description"));
    assert!(h.engine.list_incidents(&resident(), &IncidentFilter::default()).unwrap().is_empty());
  }

  #[test]
  fn duplicate_report_merges_once() {
    let h = harness();
    let a = h.engine.submit(&resident(), &report(38.90, -77.03)).unwrap().incident;
    h.clock.advance(Duration::minutes(5));
    let second = resident();
    let merged = h.engine.submit(&second, &report(38.9002, -77.03)).unwrap();
    assert!(matches!(merged.disposition, Disposition::Merged { .. }));
    assert_eq!(merged.incident.id, a.id);
    assert!(merged.incident.credibility_score > a.credibility_score);

    let again = h.engine.submit(&second, &report(38.9002, -77.03)).unwrap();
    assert_eq!(again.disposition, Disposition::AlreadyMerged);
    assert_eq!(h.engine.follow_ups(&second, a.id).unwrap().len(), 1);
  }

  #[test]
  fn resident_status_proposal_is_forbidden_but_recorded() {
    let h = harness();
    let a = h.engine.submit(&resident(), &report(38.90, -77.03)).unwrap().incident;
    let input = FollowUpInput {
      status: Some(IncidentStatus::Resolved),
      notes: Some("looks over".into()),
      ..FollowUpInput::default()
    };
    let err = h.engine.record_follow_up(&resident(), a.id, &input).unwrap_err();
    let recorded = match err {
      EngineError::Forbidden {
        recorded_follow_up: Some(id),
        ..
      } => id,
      other => panic!("unexpected {:?}", other),
    };
    let follow_ups = h.engine.follow_ups(&resident(), a.id).unwrap();
    assert_eq!(follow_ups.len(), 1);
    assert_eq!(follow_ups[0].id, recorded);
    assert!(!follow_ups[0].status_applied);
    assert_eq!(follow_ups[0].notes.as_deref(), Some("looks over"));
    assert_eq!(h.engine.incident(&resident(), a.id).unwrap().status, IncidentStatus::Unverified);
  }

  #[test]
  fn direct_resolution_clears_schedule_and_stays_terminal_for_follow_ups() {
    let h = harness();
    let a = h.engine.submit(&resident(), &report(38.90, -77.03)).unwrap().incident;
    let moderator = Actor::new(UserId::new(), Role::Moderator);
    let resolved = h.engine.set_status(&moderator, a.id, IncidentStatus::Resolved).unwrap();
    assert_eq!(resolved.follow_up_due_at, None);

    let officer = Actor::new(UserId::new(), Role::Officer);
    let reopen = FollowUpInput {
      status: Some(IncidentStatus::Unverified),
      ..FollowUpInput::default()
    };
    assert!(matches!(
      h.engine.record_follow_up(&officer, a.id, &reopen),
      Err(EngineError::Forbidden { .. })
    ));
    let reopened = h.engine.set_status(&officer, a.id, IncidentStatus::Unverified).unwrap();
    assert_eq!(reopened.status, IncidentStatus::Unverified);
    assert!(reopened.follow_up_due_at.is_some());
  }

  #[test]
  fn reactions_recount_and_toggle() {
    let h = harness();
    let a = h.engine.submit(&resident(), &report(38.90, -77.03)).unwrap().incident;
    let target = ReactionTarget::Incident(a.id);
    let fan = resident();
    let totals = h.engine.set_reaction(&fan, target, ReactionAction::Like).unwrap();
    assert_eq!((totals.likes_count, totals.unlikes_count), (1, 0));
    assert_eq!(totals.viewer_reaction, Some(ReactionKind::Like));
    let totals = h.engine.set_reaction(&fan, target, ReactionAction::Unlike).unwrap();
    assert_eq!((totals.likes_count, totals.unlikes_count), (0, 1));
    let totals = h.engine.set_reaction(&fan, target, ReactionAction::Clear).unwrap();
    assert_eq!((totals.likes_count, totals.unlikes_count), (0, 0));
    let incident = h.engine.incident(&fan, a.id).unwrap();
    assert_eq!((incident.likes_count, incident.unlikes_count), (0, 0));
  }

  #[test]
  fn comment_reactions_update_comment_only() {
    let h = harness();
    let a = h.engine.submit(&resident(), &report(38.90, -77.03)).unwrap().incident;
    let comment = h
      .engine
      .add_comment(
        &resident(),
        a.id,
        &CommentInput {
          body: "saw it too".into(),
          attachments: Vec::new(),
        },
      )
      .unwrap();
    h.engine
      .set_reaction(&resident(), ReactionTarget::Comment(comment.id), ReactionAction::Like)
      .unwrap();
    let comments = h.engine.comments(&resident(), a.id).unwrap();
    assert_eq!(comments[0].likes_count, 1);
    assert_eq!(h.engine.incident(&resident(), a.id).unwrap().likes_count, 0);
  }

  #[test]
  fn hidden_incident_disappears_for_residents() {
    let h = harness();
    let a = h.engine.submit(&resident(), &report(38.90, -77.03)).unwrap().incident;
    let moderator = Actor::new(UserId::new(), Role::Moderator);
    assert!(matches!(
      h.engine.set_visibility(&resident(), VisibilityTarget::Incident(a.id), true),
      Err(EngineError::Forbidden { .. })
    ));
    h.engine
      .set_visibility(&moderator, VisibilityTarget::Incident(a.id), true)
      .unwrap();
    assert!(matches!(
      h.engine.incident(&resident(), a.id),
      Err(EngineError::NotFound { .. })
    ));
    assert!(h.engine.incident(&moderator, a.id).unwrap().is_hidden);
  }

  #[test]
  fn moderator_merge_redirects_source() {
    let h = harness();
    let a = h.engine.submit(&resident(), &report(38.90, -77.03)).unwrap().incident;
    let mut far = report(38.95, -77.03);
    far.description = "box taken from doorstep".into();
    let b = h.engine.submit(&resident(), &far).unwrap().incident;
    assert_ne!(a.id, b.id);

    let moderator = Actor::new(UserId::new(), Role::Moderator);
    let target = h.engine.merge_incidents(&moderator, b.id, a.id).unwrap();
    assert_eq!(target.id, a.id);
    assert_eq!(h.engine.incident(&moderator, b.id).unwrap().id, a.id);
    assert_eq!(h.engine.follow_ups(&moderator, a.id).unwrap().len(), 1);
    assert!(matches!(
      h.engine.merge_incidents(&moderator, b.id, a.id),
      Err(EngineError::Validation { .. })
    ));
  }

  #[test]
  fn sweep_fires_once_per_due_time() {
    let h = harness();
    let a = h.engine.submit(&resident(), &report(38.90, -77.03)).unwrap().incident;
    h.clock.advance(Duration::minutes(31));
    let report = h.engine.sweep_due().unwrap();
    assert_eq!(report.fired, 1);
    assert_eq!(h.engine.sweep_due().unwrap().fired, 0);
    assert_eq!(h.events.check_ins(), vec![(a.id, a.follow_up_due_at.unwrap())]);
    assert_eq!(h.engine.incident(&resident(), a.id).unwrap().follow_up_due_at, None);
  }

  fn cafe(quantity: u32) -> RedemptionRequest {
    RedemptionRequest {
      partner_id: "corner-cafe".into(),
      quantity,
      notes: None,
    }
  }

  #[test]
  fn redemption_reserves_points_until_decided() {
    let h = harness();
    let admin = Actor::new(UserId::new(), Role::Admin);
    let user = resident();
    h.engine.adjust_points(&admin, user.user_id, 50, "welcome bonus").unwrap();

    let pending = h.engine.redeem(&user, &cafe(1)).unwrap();
    assert_eq!(pending.status, LedgerStatus::Pending);
    assert_eq!(pending.delta, -40);
    assert_eq!(pending.partner.as_ref().map(|p| p.name.as_str()), Some("Corner Cafe"));
    let summary = h.engine.reward_summary(&user, user.user_id).unwrap();
    assert_eq!((summary.balance, summary.available), (50, 10));
    assert!(matches!(
      h.engine.redeem(&user, &cafe(1)),
      Err(EngineError::Validation { .. })
    ));

    let staff = Actor::new(UserId::new(), Role::Staff);
    let decided = h
      .engine
      .decide_redemption(&staff, pending.id, Decision::Approve, None)
      .unwrap();
    assert_eq!(decided.status, LedgerStatus::Fulfilled);
    assert_eq!(h.engine.reward_summary(&user, user.user_id).unwrap().balance, 10);
    assert!(h
      .engine
      .decide_redemption(&staff, pending.id, Decision::Deny, None)
      .is_err());
  }

  #[test]
  fn redemption_price_comes_from_catalog() {
    let h = harness();
    let admin = Actor::new(UserId::new(), Role::Admin);
    let user = resident();
    h.engine.adjust_points(&admin, user.user_id, 100, "seed").unwrap();

    let unknown = RedemptionRequest {
      partner_id: "free-lunch".into(),
      quantity: 1,
      notes: None,
    };
    assert!(matches!(
      h.engine.redeem(&user, &unknown),
      Err(EngineError::NotFound { entity: "partner", .. })
    ));

    let entry = h.engine.redeem(&user, &cafe(2)).unwrap();
    assert_eq!(entry.delta, -80);
    assert_eq!(h.engine.reward_summary(&user, user.user_id).unwrap().available, 20);
  }

  #[test]
  fn review_queue_lists_pending_redemptions_oldest_first() {
    let h = harness();
    let admin = Actor::new(UserId::new(), Role::Admin);
    let staff = Actor::new(UserId::new(), Role::Staff);
    let (first, second) = (resident(), resident());
    h.engine.adjust_points(&admin, first.user_id, 100, "seed").unwrap();
    h.engine.adjust_points(&admin, second.user_id, 100, "seed").unwrap();

    let older = h.engine.redeem(&first, &cafe(1)).unwrap();
    h.clock.advance(Duration::minutes(1));
    let newer = h.engine.redeem(&second, &cafe(1)).unwrap();
    h.clock.advance(Duration::minutes(1));
    let decided = h.engine.redeem(&first, &cafe(1)).unwrap();
    h.engine
      .decide_redemption(&staff, decided.id, Decision::Deny, None)
      .unwrap();

    let queue = h.engine.pending_redemptions(&staff, None).unwrap();
    assert_eq!(queue.iter().map(|e| e.id).collect::<Vec<_>>(), vec![older.id, newer.id]);
    assert_eq!(h.engine.pending_redemptions(&staff, Some(1)).unwrap().len(), 1);
    assert!(matches!(
      h.engine.pending_redemptions(&first, None),
      Err(EngineError::Forbidden { .. })
    ));
  }

  #[test]
  fn ledger_is_private_to_owner_and_reviewers() {
    let h = harness();
    let admin = Actor::new(UserId::new(), Role::Admin);
    let owner = resident();
    h.engine.adjust_points(&admin, owner.user_id, 15, "seed").unwrap();

    assert_eq!(h.engine.ledger(&owner, owner.user_id).unwrap().len(), 1);
    assert!(matches!(
      h.engine.ledger(&resident(), owner.user_id),
      Err(EngineError::Forbidden { .. })
    ));
    assert!(matches!(
      h.engine.reward_summary(&Actor::new(UserId::new(), Role::Moderator), owner.user_id),
      Err(EngineError::Forbidden { .. })
    ));
    let staff = Actor::new(UserId::new(), Role::Staff);
    assert_eq!(h.engine.reward_summary(&staff, owner.user_id).unwrap().balance, 15);
  }

  #[test]
  fn hidden_incident_check_in_is_dropped_not_deferred() {
    let h = harness();
    let a = h.engine.submit(&resident(), &report(38.90, -77.03)).unwrap().incident;
    let moderator = Actor::new(UserId::new(), Role::Moderator);
    h.engine
      .set_visibility(&moderator, VisibilityTarget::Incident(a.id), true)
      .unwrap();

    h.clock.advance(Duration::minutes(31));
    let report = h.engine.sweep_due().unwrap();
    assert_eq!((report.examined, report.fired, report.superseded), (1, 0, 1));
    assert_eq!(h.engine.sweep_due().unwrap().examined, 0);

    h.clock.advance(Duration::days(3));
    h.engine
      .set_visibility(&moderator, VisibilityTarget::Incident(a.id), false)
      .unwrap();
    assert_eq!(h.engine.sweep_due().unwrap().fired, 0);
    assert!(h.events.check_ins().is_empty());
  }

  type Interleave = Box<dyn FnOnce(&MemoryStore) + Send>;

  #[derive(Clone, Copy, PartialEq)]
  enum Point {
    Thread(IncidentId),
    Commit,
  }

  /// Runs one competing write against the inner store at a chosen point of the
  /// engine's read-compute-commit.
  struct InterleavingStore {
    inner: MemoryStore,
    pending: Mutex<Option<(Point, Interleave)>>,
  }

  impl InterleavingStore {
    fn new() -> Self {
      Self {
        inner: MemoryStore::new(),
        pending: Mutex::new(None),
      }
    }

    fn at(&self, point: Point, hook: impl FnOnce(&MemoryStore) + Send + 'static) {
      *self.pending.lock().unwrap() = Some((point, Box::new(hook)));
    }

    fn fire(&self, point: Point) {
      let hook = {
        let mut pending = self.pending.lock().unwrap();
        match pending.take() {
          Some((at, hook)) if at == point => Some(hook),
          other => {
            *pending = other;
            None
          }
        }
      };
      if let Some(hook) = hook {
        hook(&self.inner);
      }
    }
  }

  impl IncidentStore for InterleavingStore {
    fn incident(&self, id: IncidentId) -> Result<Incident, StoreError> {
      self.inner.incident(id)
    }
    fn thread(&self, id: IncidentId) -> Result<IncidentThread, StoreError> {
      self.fire(Point::Thread(id));
      self.inner.thread(id)
    }
    fn follow_ups(&self, id: IncidentId) -> Result<Vec<FollowUp>, StoreError> {
      self.inner.follow_ups(id)
    }
    fn comment(&self, id: CommentId) -> Result<Comment, StoreError> {
      self.inner.comment(id)
    }
    fn comments(&self, incident: IncidentId) -> Result<Vec<Comment>, StoreError> {
      self.inner.comments(incident)
    }
    fn reactions(&self, target: ReactionTarget) -> Result<Vec<Reaction>, StoreError> {
      self.inner.reactions(target)
    }
    fn candidates(&self, incident_type: IncidentType, since: DateTime<Utc>) -> Result<CandidateSet, StoreError> {
      self.inner.candidates(incident_type, since)
    }
    fn incidents(&self) -> Result<Vec<Incident>, StoreError> {
      self.inner.incidents()
    }
    fn due(&self, now: DateTime<Utc>) -> Result<Vec<DueCandidate>, StoreError> {
      self.inner.due(now)
    }
    fn ledger(&self, user: UserId) -> Result<Vec<LedgerEntry>, StoreError> {
      self.inner.ledger(user)
    }
    fn ledger_entry(&self, id: LedgerEntryId) -> Result<LedgerEntry, StoreError> {
      self.inner.ledger_entry(id)
    }
    fn pending_redemptions(&self) -> Result<Vec<LedgerEntry>, StoreError> {
      self.inner.pending_redemptions()
    }
    fn role(&self, user: UserId) -> Result<Option<Role>, StoreError> {
      self.inner.role(user)
    }
    fn role_request(&self, id: RoleRequestId) -> Result<RoleRequest, StoreError> {
      self.inner.role_request(id)
    }
    fn pending_role_request(&self, user: UserId) -> Result<Option<RoleRequest>, StoreError> {
      self.inner.pending_role_request(user)
    }
    fn commit(&self, tx: Transaction) -> Result<(), StoreError> {
      self.fire(Point::Commit);
      self.inner.commit(tx)
    }
  }

  fn interleaved() -> (Engine, Arc<InterleavingStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap()));
    let store = Arc::new(InterleavingStore::new());
    let engine = Engine::new(
      Config::default(),
      store.clone(),
      Arc::new(RecordingDispatcher::new()),
      clock.clone(),
    );
    (engine, store, clock)
  }

  /// Commit `source.merged_into = target` straight to the store.
  fn merge_behind_engine(store: &MemoryStore, source: IncidentId, target: IncidentId) {
    let mut incident = store.incident(source).unwrap();
    incident.merged_into = Some(target);
    incident.follow_up_due_at = None;
    let mut tx = Transaction::new();
    tx.write(Write::UpdateIncident(incident));
    store.commit(tx).unwrap();
  }

  #[test]
  fn match_merged_away_before_reread_is_rematched() {
    let (engine, store, clock) = interleaved();
    let a = engine.submit(&resident(), &report(38.90, -77.03)).unwrap().incident;
    let mut far = report(38.95, -77.03);
    far.description = "box taken from doorstep".into();
    let b = engine.submit(&resident(), &far).unwrap().incident;
    clock.advance(Duration::minutes(5));

    store.at(Point::Thread(a.id), move |inner| merge_behind_engine(inner, a.id, b.id));
    let mut over = report(38.9002, -77.03);
    over.prompts.still_happening = TriState::No;
    let outcome = engine.submit(&resident(), &over).unwrap();

    assert_eq!(outcome.disposition, Disposition::Created);
    assert_ne!(outcome.incident.id, a.id);
    assert_ne!(outcome.incident.id, b.id);
    assert_eq!(store.incident(a.id).unwrap().merged_into, Some(b.id));
    assert!(store.follow_ups(a.id).unwrap().is_empty());
    assert!(store.follow_ups(b.id).unwrap().is_empty());
  }

  #[test]
  fn reciprocal_merges_never_form_a_cycle() {
    let (engine, store, _clock) = interleaved();
    let reporter = resident();
    // Same reporter, same words, far apart: two incidents whose merge is a fingerprint duplicate.
    let y = engine.submit(&reporter, &report(38.90, -77.03)).unwrap().incident;
    let x = engine.submit(&reporter, &report(38.95, -77.03)).unwrap().incident;
    assert_ne!(x.id, y.id);

    store.at(Point::Commit, move |inner| merge_behind_engine(inner, y.id, x.id));
    let moderator = Actor::new(UserId::new(), Role::Moderator);
    assert!(matches!(
      engine.merge_incidents(&moderator, x.id, y.id),
      Err(EngineError::Validation { .. })
    ));
    assert_eq!(store.incident(x.id).unwrap().merged_into, None);
    assert_eq!(store.incident(y.id).unwrap().merged_into, Some(x.id));
    assert_eq!(engine.incident(&moderator, y.id).unwrap().id, x.id);
  }

  #[test]
  fn role_request_refreshes_then_grants() {
    let h = harness();
    let user = resident();
    let first = h.engine.request_role(&user, Role::Reporter, None).unwrap();
    let second = h
      .engine
      .request_role(&user, Role::Moderator, Some("run the block watch".into()))
      .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.requested_role, Role::Moderator);

    let officer = Actor::new(UserId::new(), Role::Officer);
    let decided = h
      .engine
      .decide_role_request(&officer, second.id, Decision::Approve, Some(Role::Reporter), None)
      .unwrap();
    assert_eq!(decided.status, RoleRequestStatus::Approved);
    assert_eq!(h.engine.role_of(user.user_id).unwrap(), Some(Role::Reporter));
  }

  #[test]
  fn stats_summarize_visible_incidents() {
    let h = harness();
    let mut r = report(38.90, -77.03);
    r.prompts.still_happening = TriState::Yes;
    r.prompts.safety_sentiment = Some(SafetySentiment::Uneasy);
    h.engine.submit(&resident(), &r).unwrap();
    let stats = h.engine.stats().unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.by_status.get("unverified"), Some(&1));
    assert_eq!(stats.by_type.get("community"), Some(&1));
    assert_eq!(stats.sentiment_breakdown.get("uneasy"), Some(&1));
    assert_eq!(stats.active_follow_up, 1);
    assert!((stats.prompt_completion_rate - 0.333).abs() < 1e-9);
  }
}
