//! Entitlement accounting and lifecycle.
//!
//! The free functions are pure and operate on an after-image the caller
//! owns. The `Engine` methods below lock, apply one of them, and commit the
//! result as a single `EntitlementSaved` (or `EntitlementRenewed`) record.

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Months, NaiveDate};
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::effects::{Intent, Template};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError};

/// `remaining = allowed − used + rollover`, floor 0. Unlimited carries 0.
pub fn reconcile(e: &mut Entitlement) {
    e.remaining = if e.is_unlimited() {
        0
    } else {
        e.allowed.saturating_add(e.rollover).saturating_sub(e.used)
    };
}

/// Consume `qty` units. Fails rather than going below zero.
pub fn decrement(e: &mut Entitlement, qty: u32) -> Result<(), EngineError> {
    if e.is_unlimited() {
        return Ok(());
    }
    if e.remaining < qty {
        return Err(EngineError::EntitlementExhausted(e.id));
    }
    e.used += qty;
    reconcile(e);
    Ok(())
}

/// Give back `qty` units. `used` never drops below zero.
pub fn restore(e: &mut Entitlement, qty: u32) {
    if e.is_unlimited() {
        return;
    }
    e.used = e.used.saturating_sub(qty);
    reconcile(e);
}

/// One package visit on `on`: the entitlement must be active, then one unit goes.
pub(crate) fn consume_visit(e: &mut Entitlement, on: NaiveDate) -> Result<(), EngineError> {
    if e.status != EntitlementStatus::Active {
        return Err(EngineError::EntitlementInactive {
            id: e.id,
            status: e.status,
        });
    }
    decrement(e, 1)?;
    e.last_used_on = Some(on);
    Ok(())
}

fn transition_error(e: &Entitlement, action: &'static str) -> EngineError {
    EngineError::EntitlementTransition {
        id: e.id,
        from: e.status,
        action,
    }
}

/// Draft → Active. Starts a fresh period with everything rolled over available.
pub fn activate(e: &mut Entitlement, today: NaiveDate) -> Result<(), EngineError> {
    if e.status != EntitlementStatus::Draft {
        return Err(transition_error(e, "activate"));
    }
    e.status = EntitlementStatus::Active;
    e.used = 0;
    e.period_start = e.valid_from.max(today.min(e.valid_until));
    reconcile(e);
    Ok(())
}

pub fn pause(e: &mut Entitlement, on: NaiveDate) -> Result<(), EngineError> {
    if e.status != EntitlementStatus::Active {
        return Err(transition_error(e, "pause"));
    }
    e.status = EntitlementStatus::Paused;
    e.paused_on = Some(on);
    Ok(())
}

/// Paused → Active, pushing the end date out by the days spent paused.
pub fn resume(e: &mut Entitlement, on: NaiveDate) -> Result<(), EngineError> {
    if e.status != EntitlementStatus::Paused {
        return Err(transition_error(e, "resume"));
    }
    let paused_days = e.paused_on.map_or(0, |since| (on - since).num_days().max(0));
    e.valid_until += Duration::days(paused_days);
    e.status = EntitlementStatus::Active;
    e.paused_on = None;
    Ok(())
}

pub fn expire(e: &mut Entitlement) -> Result<(), EngineError> {
    if e.status == EntitlementStatus::Expired {
        return Err(transition_error(e, "expire"));
    }
    e.status = EntitlementStatus::Expired;
    e.paused_on = None;
    Ok(())
}

/// Units carried into a successor or the next period, capped by `max_rollover`.
fn carry_over(e: &Entitlement) -> u32 {
    if e.is_unlimited() {
        return 0;
    }
    let carry = e.allowed.saturating_add(e.rollover).saturating_sub(e.used);
    match e.max_rollover {
        Some(cap) => carry.min(cap),
        None => carry,
    }
}

/// Build the Draft successor of `prev` and link the two.
///
/// The successor starts the day after `prev` ends and runs for the same
/// number of days.
pub fn renew(prev: &mut Entitlement, successor_id: Ulid) -> Result<Entitlement, EngineError> {
    if prev.renewed_to.is_some() {
        return Err(transition_error(prev, "renew"));
    }
    let length = prev.valid_until - prev.valid_from;
    let valid_from = prev.valid_until + Duration::days(1);

    let mut next = Entitlement::new(
        successor_id,
        prev.holder_id,
        prev.mode,
        prev.allowed,
        valid_from,
        valid_from + length,
    );
    next.rollover = carry_over(prev);
    next.max_rollover = prev.max_rollover;
    next.price = prev.price;
    next.scope = prev.scope.clone();
    next.auto_renew = prev.auto_renew;
    next.renewed_from = Some(prev.id);
    reconcile(&mut next);

    prev.renewed_to = Some(successor_id);
    Ok(next)
}

/// Start a new usage period: what was left rolls over (capped), usage resets.
pub fn reset_period(e: &mut Entitlement, period_start: NaiveDate) {
    e.rollover = carry_over(e);
    e.used = 0;
    e.period_start = period_start;
    reconcile(e);
}

/// The most recent monthly anniversary of `period_start` that is on or before
/// `today`, if a new period has begun.
pub(crate) fn due_period_start(e: &Entitlement, today: NaiveDate) -> Option<NaiveDate> {
    let mut next = e.period_start.checked_add_months(Months::new(1))?;
    if next > today {
        return None;
    }
    while let Some(after) = next.checked_add_months(Months::new(1)) {
        if after > today {
            break;
        }
        next = after;
    }
    Some(next)
}

/// The reminder threshold due today, if one has not been sent yet. Marks every
/// threshold already passed so a missed sweep sends one reminder, not several.
pub(crate) fn take_due_reminder(e: &mut Entitlement, today: NaiveDate, thresholds: &[u32]) -> Option<u32> {
    let days_left = (e.valid_until - today).num_days();
    if days_left < 0 {
        return None;
    }
    let due: Vec<u32> = thresholds
        .iter()
        .copied()
        .filter(|d| i64::from(*d) >= days_left && !e.reminders_sent.contains(d))
        .collect();
    let nearest = due.iter().copied().min()?;
    e.reminders_sent.extend(due);
    e.reminders_sent.sort_unstable();
    Some(nearest)
}

fn validate_new(e: &Entitlement) -> Result<(), EngineError> {
    if e.valid_until < e.valid_from {
        return Err(EngineError::validation("entitlement must end on or after its start date"));
    }
    if (e.valid_until - e.valid_from).num_days() > MAX_ENTITLEMENT_DAYS {
        return Err(EngineError::LimitExceeded("entitlement validity window too long"));
    }
    if e.scope.len() > MAX_ENTITLEMENT_SCOPE {
        return Err(EngineError::LimitExceeded("entitlement scope too large"));
    }
    if e.price.is_sign_negative() {
        return Err(EngineError::validation("entitlement price must not be negative"));
    }
    if e.mode == AccessMode::LimitedEntries && e.allowed == 0 && e.rollover == 0 {
        return Err(EngineError::validation("limited entitlement must allow at least one entry"));
    }
    Ok(())
}

impl Engine {
    /// Register a new entitlement. It starts as a Draft with nothing used.
    pub async fn create_entitlement(&self, mut entitlement: Entitlement) -> Result<Entitlement, EngineError> {
        let started = Instant::now();
        let result: Result<Entitlement, EngineError> = async {
            validate_new(&entitlement)?;
            let _catalog = self.catalog.read().await;
            if self.entitlements.len() >= MAX_ENTITLEMENTS {
                return Err(EngineError::LimitExceeded("too many entitlements"));
            }
            if self.entitlements.contains_key(&entitlement.id) {
                return Err(EngineError::AlreadyExists(entitlement.id));
            }
            entitlement.status = EntitlementStatus::Draft;
            entitlement.used = 0;
            entitlement.paused_on = None;
            entitlement.renewed_to = None;
            entitlement.reminders_sent.clear();
            entitlement.period_start = entitlement.valid_from;
            reconcile(&mut entitlement);

            let event = Event::EntitlementSaved(entitlement.clone());
            self.wal_append(&event).await?;
            self.entitlements
                .insert(entitlement.id, Arc::new(RwLock::new(entitlement.clone())));
            self.notify.send(entitlement.id, &event);
            info!(entitlement = %entitlement.id, holder = %entitlement.holder_id, "entitlement created");
            Ok(entitlement)
        }
        .await;
        observability::record("create_entitlement", started, &result);
        result
    }

    /// Lock one entitlement, let `f` edit a copy, and commit the copy if `f`
    /// reports a change. Returns the after-image, or `None` when unchanged.
    pub(super) async fn update_entitlement<F>(&self, id: Ulid, f: F) -> Result<Option<Entitlement>, EngineError>
    where
        F: FnOnce(&mut Entitlement) -> Result<bool, EngineError>,
    {
        let handle = self.entitlement_handle(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = handle.write().await;
        let mut after = guard.clone();
        if !f(&mut after)? {
            return Ok(None);
        }
        let event = Event::EntitlementSaved(after.clone());
        self.wal_append(&event).await?;
        *guard = after.clone();
        self.notify.send(id, &event);
        Ok(Some(after))
    }

    async fn entitlement_transition<F>(&self, op: &'static str, id: Ulid, f: F) -> Result<Entitlement, EngineError>
    where
        F: FnOnce(&mut Entitlement) -> Result<(), EngineError>,
    {
        let started = Instant::now();
        let result = self
            .update_entitlement(id, |e| f(e).map(|()| true))
            .await
            .and_then(|after| after.ok_or(EngineError::NotFound(id)));
        observability::record(op, started, &result);
        if let Ok(e) = &result {
            info!(entitlement = %id, status = ?e.status, "{op}");
        }
        result
    }

    pub async fn activate_entitlement(&self, id: Ulid) -> Result<Entitlement, EngineError> {
        let today = self.clock.today();
        self.entitlement_transition("activate_entitlement", id, |e| activate(e, today))
            .await
    }

    pub async fn pause_entitlement(&self, id: Ulid) -> Result<Entitlement, EngineError> {
        let today = self.clock.today();
        self.entitlement_transition("pause_entitlement", id, |e| pause(e, today))
            .await
    }

    pub async fn resume_entitlement(&self, id: Ulid) -> Result<Entitlement, EngineError> {
        let today = self.clock.today();
        self.entitlement_transition("resume_entitlement", id, |e| resume(e, today))
            .await
    }

    pub async fn expire_entitlement(&self, id: Ulid) -> Result<Entitlement, EngineError> {
        let expired = self.entitlement_transition("expire_entitlement", id, expire).await?;
        self.effects.dispatch(vec![Intent::Notify {
            recipient: expired.holder_id,
            template: Template::EntitlementExpired,
            data: serde_json::json!({
                "entitlement_id": expired.id.to_string(),
                "valid_until": expired.valid_until.to_string(),
            }),
        }]);
        Ok(expired)
    }

    /// Start a new usage period now, whatever the calendar says.
    pub async fn reset_entitlement_period(&self, id: Ulid) -> Result<Entitlement, EngineError> {
        let today = self.clock.today();
        self.entitlement_transition("reset_entitlement_period", id, |e| {
            if e.status != EntitlementStatus::Active {
                return Err(transition_error(e, "reset"));
            }
            reset_period(e, today);
            Ok(())
        })
        .await
    }

    /// Create the successor of `id` as a Draft and link both records in one commit.
    pub async fn renew_entitlement(&self, id: Ulid) -> Result<Entitlement, EngineError> {
        let started = Instant::now();
        let result: Result<Entitlement, EngineError> = async {
            let _catalog = self.catalog.read().await;
            if self.entitlements.len() >= MAX_ENTITLEMENTS {
                return Err(EngineError::LimitExceeded("too many entitlements"));
            }
            let handle = self.entitlement_handle(&id).ok_or(EngineError::NotFound(id))?;
            let mut guard = handle.write().await;
            let mut previous = guard.clone();
            let successor = renew(&mut previous, Ulid::new())?;

            let event = Event::EntitlementRenewed {
                previous: previous.clone(),
                successor: successor.clone(),
            };
            self.wal_append(&event).await?;
            *guard = previous;
            self.entitlements
                .insert(successor.id, Arc::new(RwLock::new(successor.clone())));
            drop(guard);

            self.notify.send(id, &event);
            self.notify.send(successor.id, &event);
            info!(entitlement = %id, successor = %successor.id, rollover = successor.rollover, "entitlement renewed");
            Ok(successor)
        }
        .await;
        observability::record("renew_entitlement", started, &result);

        if let Ok(successor) = &result {
            self.effects.dispatch(vec![Intent::Notify {
                recipient: successor.holder_id,
                template: Template::EntitlementRenewed,
                data: serde_json::json!({
                    "previous_id": id.to_string(),
                    "entitlement_id": successor.id.to_string(),
                    "valid_from": successor.valid_from.to_string(),
                    "valid_until": successor.valid_until.to_string(),
                    "rollover": successor.rollover,
                }),
            }]);
        }
        result
    }
}
