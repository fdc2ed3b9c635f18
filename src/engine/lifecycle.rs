use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, NaiveDateTime};
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::config::BillingMode;
use crate::effects::{Intent, InvoiceLine, Template};
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::occupancy::{self, OccupancyChange};

use super::availability::check_available;
use super::pricing::{self, PriceRequest};
use super::{ledger, Engine, EngineError};

/// What `mark_no_show` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoShowOutcome {
    Marked,
    /// The reservation had already left `Confirmed`; nothing changed.
    AlreadySettled(ReservationStatus),
}

fn illegal(r: &Reservation, action: &'static str) -> EngineError {
    EngineError::IllegalTransition {
        id: r.id,
        from: r.status,
        action,
    }
}

/// One record per transition: the reservation after-image, plus the
/// entitlement after-image and resource status when they changed.
fn updated(
    reservation: Reservation,
    entitlement: Option<Entitlement>,
    resource_status: Option<ResourceStatus>,
) -> Event {
    Event::ReservationUpdated {
        reservation,
        entitlement,
        resource_status,
    }
}

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn validate_rates(rates: &RateCard) -> Result<(), EngineError> {
    let prices = [rates.hourly, rates.daily, rates.monthly, rates.minimum_charge];
    if prices.iter().flatten().any(|p| p.is_sign_negative()) {
        return Err(EngineError::validation("rates must not be negative"));
    }
    if prices.iter().flatten().any(|p| *p > MAX_PRICE) {
        return Err(EngineError::LimitExceeded("rate too large"));
    }
    if rates.min_booking_hours.is_some_and(|h| h <= Decimal::ZERO) {
        return Err(EngineError::validation("minimum booking hours must be positive"));
    }
    Ok(())
}

fn validate_request(req: &ReservationRequest) -> Result<(), EngineError> {
    if !req.slot.is_well_formed() {
        return Err(EngineError::validation("slot must end after it starts"));
    }
    if req.attendees == 0 {
        return Err(EngineError::validation("at least one attendee is required"));
    }
    if req.attendees > MAX_ATTENDEES {
        return Err(EngineError::LimitExceeded("too many attendees"));
    }
    if req.services.len() > MAX_SERVICE_LINES {
        return Err(EngineError::LimitExceeded("too many service lines"));
    }
    for line in &req.services {
        check_len(&line.description, MAX_DESCRIPTION_LEN, "service description too long")?;
        if line.unit_price.is_sign_negative() {
            return Err(EngineError::validation("service prices must not be negative"));
        }
        if line.unit_price > MAX_PRICE {
            return Err(EngineError::LimitExceeded("service price too large"));
        }
    }
    match (req.rate_plan, req.entitlement_id) {
        (RatePlan::Package, None) => Err(EngineError::validation("package plan requires an entitlement")),
        (RatePlan::Hourly | RatePlan::Daily, Some(_)) => Err(EngineError::validation(
            "an entitlement can only be used with the package plan",
        )),
        _ => Ok(()),
    }
}

/// Lines for everything a reservation costs except overtime.
fn booking_lines(r: &Reservation) -> Vec<InvoiceLine> {
    let mut lines = vec![InvoiceLine {
        description: match r.rate_plan {
            RatePlan::Hourly => format!("Hourly reservation, {} h", r.duration_hours.normalize()),
            RatePlan::Daily => "Daily reservation".to_string(),
            RatePlan::Package => "Package visit".to_string(),
        },
        quantity: Decimal::ONE,
        rate: r.charges.subtotal,
        amount: r.charges.subtotal,
    }];
    if r.charges.discount > Decimal::ZERO {
        lines.push(InvoiceLine {
            description: format!("Discount {}%", r.discount_percent.normalize()),
            quantity: Decimal::ONE,
            rate: -r.charges.discount,
            amount: -r.charges.discount,
        });
    }
    for service in &r.services {
        lines.push(InvoiceLine {
            description: service.description.clone(),
            quantity: Decimal::from(service.quantity),
            rate: service.unit_price,
            // Priced at creation, so the amount is known to fit.
            amount: service.amount().unwrap_or(Decimal::ZERO),
        });
    }
    if r.charges.tax > Decimal::ZERO {
        lines.push(InvoiceLine {
            description: "Tax".to_string(),
            quantity: Decimal::ONE,
            rate: r.charges.tax,
            amount: r.charges.tax,
        });
    }
    lines
}

fn overtime_line(r: &Reservation, multiplier: Decimal) -> Option<InvoiceLine> {
    if r.charges.overtime <= Decimal::ZERO {
        return None;
    }
    Some(InvoiceLine {
        description: "Overtime".to_string(),
        quantity: r.overtime_hours,
        rate: r
            .hourly_rate
            .and_then(|rate| rate.checked_mul(multiplier))
            .map_or(Decimal::ZERO, |rate| rate.round_dp(2)),
        amount: r.charges.overtime,
    })
}

fn reservation_data(r: &Reservation) -> serde_json::Value {
    serde_json::json!({
        "reservation_id": r.id.to_string(),
        "resource_id": r.resource_id.to_string(),
        "date": r.slot.date.to_string(),
        "start": r.slot.start.to_string(),
        "end": r.slot.end.to_string(),
        "all_day": r.slot.all_day,
        "status": r.status.as_str(),
        "total": r.charges.total.to_string(),
    })
}

impl Engine {
    // ── Resource administration ──────────────────────────────────

    pub async fn create_resource(&self, mut resource: Resource) -> Result<(), EngineError> {
        check_len(&resource.name, MAX_NAME_LEN, "resource name too long")?;
        if resource.capacity == 0 {
            return Err(EngineError::validation("capacity must be at least one"));
        }
        validate_rates(&resource.rates)?;

        let _catalog = self.catalog.read().await;
        if self.books.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.books.contains_key(&resource.id) {
            return Err(EngineError::AlreadyExists(resource.id));
        }
        // Status belongs to the occupancy updater; a new resource starts free.
        resource.status = ResourceStatus::Available;

        let id = resource.id;
        let event = Event::ResourceCreated(resource.clone());
        self.wal_append(&event).await?;
        self.books.insert(id, Arc::new(RwLock::new(ResourceBook::new(resource))));
        self.notify.send(id, &event);
        info!(resource = %id, "resource created");
        Ok(())
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: String,
        capacity: u32,
        rates: RateCard,
        bookable: bool,
    ) -> Result<(), EngineError> {
        check_len(&name, MAX_NAME_LEN, "resource name too long")?;
        if capacity == 0 {
            return Err(EngineError::validation("capacity must be at least one"));
        }
        validate_rates(&rates)?;
        let book = self.book(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = book.write().await;

        let event = Event::ResourceUpdated {
            id,
            name,
            capacity,
            rates,
            bookable,
        };
        self.persist_and_apply(&mut guard, None, &event).await
    }

    /// Take a resource out of service, or put it back.
    pub async fn set_maintenance(&self, id: Ulid, on: bool) -> Result<ResourceStatus, EngineError> {
        let book = self.book(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = book.write().await;
        let change = if on {
            OccupancyChange::MaintenanceStarted
        } else {
            OccupancyChange::MaintenanceEnded
        };
        let Some(status) = occupancy::next_status(&guard, change) else {
            return Ok(guard.resource.status);
        };
        let event = Event::ResourceStatusChanged { id, status };
        self.persist_and_apply(&mut guard, None, &event).await?;
        info!(resource = %id, ?status, "maintenance {}", if on { "started" } else { "ended" });
        Ok(status)
    }

    // ── Reservation transitions ──────────────────────────────────

    /// Validate, check availability, price, and record a Draft.
    pub async fn create_reservation(&self, req: ReservationRequest) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.create_reservation_inner(req).await;
        observability::record("create", started, &result);
        result
    }

    async fn create_reservation_inner(&self, req: ReservationRequest) -> Result<Reservation, EngineError> {
        validate_request(&req)?;
        let book = self
            .book(&req.resource_id)
            .ok_or(EngineError::NotFound(req.resource_id))?;
        let mut guard = book.write().await;

        // The id is claimed under the book lock and released if no draft commits.
        match self.reservation_index.entry(req.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(req.id)),
            Entry::Vacant(slot) => {
                slot.insert(req.resource_id);
            }
        }
        let id = req.id;
        let result = self.draft_locked(&mut guard, req).await;
        if result.is_err() {
            self.reservation_index.remove(&id);
        }
        result
    }

    async fn draft_locked(&self, guard: &mut ResourceBook, req: ReservationRequest) -> Result<Reservation, EngineError> {
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }
        let resource = &guard.resource;
        if req.attendees > resource.capacity {
            return Err(EngineError::validation(format!(
                "{} attendees exceed capacity {}",
                req.attendees, resource.capacity
            )));
        }
        if let Some(min) = resource.rates.min_booking_hours
            && !req.slot.all_day
            && req.slot.duration_hours() < min
        {
            return Err(EngineError::validation(format!(
                "reservation must be at least {} hours",
                min.normalize()
            )));
        }

        let entitlement = match req.entitlement_id {
            Some(eid) => {
                let handle = self.entitlement_handle(&eid).ok_or(EngineError::NotFound(eid))?;
                let snapshot = handle.read().await.clone();
                if snapshot.holder_id != req.requester_id {
                    return Err(EngineError::validation("entitlement belongs to another holder"));
                }
                if !snapshot.covers_resource(&req.resource_id) {
                    return Err(EngineError::validation("entitlement does not cover this resource"));
                }
                Some(snapshot)
            }
            None => None,
        };

        let now = self.clock.now();
        check_available(guard, &req.slot, None, now.date()).into_result(req.resource_id)?;

        let quote = pricing::price(
            &PriceRequest {
                slot: &req.slot,
                rates: &resource.rates,
                plan: req.rate_plan,
                entitlement: entitlement.as_ref(),
                discount_percent: req.discount_percent,
                services: &req.services,
            },
            &self.policy,
        )?;

        let reservation = Reservation {
            id: req.id,
            resource_id: req.resource_id,
            requester_id: req.requester_id,
            slot: req.slot,
            rate_plan: quote.rate_plan,
            entitlement_id: req.entitlement_id,
            attendees: req.attendees,
            discount_percent: req.discount_percent,
            services: req.services,
            hourly_rate: resource.rates.hourly,
            duration_hours: req.slot.duration_hours(),
            charges: quote.charges(),
            overtime_hours: Decimal::ZERO,
            status: ReservationStatus::Draft,
            created_at: now,
            confirmed_at: None,
            checked_in_at: None,
            checked_in_by: None,
            checked_out_at: None,
            cancelled_at: None,
            cancel_reason: None,
            entitlement_consumed: false,
            notes: Vec::new(),
        };

        let event = Event::ReservationCreated(reservation.clone());
        self.persist_and_apply(guard, None, &event).await?;
        info!(
            reservation = %reservation.id,
            resource = %reservation.resource_id,
            date = %reservation.slot.date,
            total = %reservation.charges.total,
            "reservation drafted"
        );
        Ok(reservation)
    }

    /// Draft → Confirmed. Availability is checked again, ignoring this draft.
    pub async fn confirm(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.confirm_inner(id).await;
        observability::record("confirm", started, &result);
        result
    }

    async fn confirm_inner(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status != ReservationStatus::Draft {
            return Err(illegal(&current, "confirm"));
        }
        let now = self.clock.now();
        check_available(&guard, &current.slot, Some(id), now.date()).into_result(current.resource_id)?;

        let mut next = current;
        next.status = ReservationStatus::Confirmed;
        next.confirmed_at = Some(now);
        let event = updated(next.clone(), None, None);
        self.persist_and_apply(&mut guard, None, &event).await?;
        drop(guard);

        let mut intents = vec![Intent::Notify {
            recipient: next.requester_id,
            template: Template::ReservationConfirmed,
            data: reservation_data(&next),
        }];
        if self.policy.billing == BillingMode::Prepaid && next.charges.total > Decimal::ZERO {
            intents.push(Intent::Invoice {
                reservation: next.id,
                payer: next.requester_id,
                lines: booking_lines(&next),
            });
        }
        self.effects.dispatch(intents);
        info!(reservation = %id, "reservation confirmed");
        Ok(next)
    }

    /// Confirmed → CheckedIn, on the booking date only. Package reservations
    /// consume one entitlement unit in the same commit.
    pub async fn check_in(&self, id: Ulid, operator: Option<String>) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.check_in_inner(id, operator).await;
        observability::record("check_in", started, &result);
        result
    }

    async fn check_in_inner(&self, id: Ulid, operator: Option<String>) -> Result<Reservation, EngineError> {
        if let Some(op) = &operator {
            check_len(op, MAX_OPERATOR_LEN, "operator name too long")?;
        }
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status != ReservationStatus::Confirmed {
            return Err(illegal(&current, "check in"));
        }
        let now = self.clock.now();
        if now.date() != current.slot.date {
            return Err(EngineError::validation(format!(
                "check-in is only allowed on {}",
                current.slot.date
            )));
        }

        let mut next = current;
        next.status = ReservationStatus::CheckedIn;
        next.checked_in_at = Some(now);
        next.checked_in_by = operator;

        let mut ent_guard = None;
        let mut ent_after = None;
        if next.rate_plan == RatePlan::Package {
            let eid = next
                .entitlement_id
                .ok_or_else(|| EngineError::validation("package reservation has no entitlement"))?;
            let handle = self.entitlement_handle(&eid).ok_or(EngineError::NotFound(eid))?;
            let eg = handle.write_owned().await;
            let mut after = eg.clone();
            ledger::consume_visit(&mut after, now.date())?;
            next.entitlement_consumed = !after.is_unlimited();
            ent_guard = Some(eg);
            ent_after = Some(after);
        }

        let status = occupancy::next_status(&guard, OccupancyChange::Occupied { reservation_id: id });
        let event = updated(next.clone(), ent_after, status);
        self.persist_and_apply(&mut guard, ent_guard.as_deref_mut(), &event)
            .await?;
        drop(ent_guard);
        drop(guard);

        self.effects.dispatch(vec![Intent::Grant {
            user: next.requester_id,
            resource: next.resource_id,
            slot: next.slot,
        }]);
        info!(reservation = %id, resource_status = ?status, "checked in");
        Ok(next)
    }

    /// CheckedIn → Completed. Time past the planned end is billed as overtime.
    pub async fn check_out(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.check_out_inner(id).await;
        observability::record("check_out", started, &result);
        result
    }

    async fn check_out_inner(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status != ReservationStatus::CheckedIn {
            return Err(illegal(&current, "check out"));
        }
        let now = self.clock.now();
        let overtime_hours = hours_between(current.slot.planned_end(), now).round_dp(2);
        let overtime = pricing::overtime_charge(overtime_hours, current.hourly_rate, self.policy.overtime_multiplier)?;

        let mut next = current;
        next.status = ReservationStatus::Completed;
        next.checked_out_at = Some(now);
        next.overtime_hours = overtime_hours;
        next.charges = pricing::with_overtime(&next.charges, overtime)?;

        let status = occupancy::next_status(&guard, OccupancyChange::Released { reservation_id: id });
        let event = updated(next.clone(), None, status);
        self.persist_and_apply(&mut guard, None, &event).await?;
        drop(guard);

        let mut intents = vec![Intent::Revoke {
            user: next.requester_id,
            resource: next.resource_id,
        }];
        let lines = match self.policy.billing {
            BillingMode::Postpaid => {
                let mut lines = booking_lines(&next);
                lines.extend(overtime_line(&next, self.policy.overtime_multiplier));
                lines
            }
            BillingMode::Prepaid => overtime_line(&next, self.policy.overtime_multiplier)
                .into_iter()
                .collect(),
        };
        if lines.iter().any(|l| l.amount != Decimal::ZERO) {
            intents.push(Intent::Invoice {
                reservation: next.id,
                payer: next.requester_id,
                lines,
            });
        }
        self.effects.dispatch(intents);
        info!(reservation = %id, overtime_hours = %overtime_hours, total = %next.charges.total, "checked out");
        Ok(next)
    }

    /// Draft, Confirmed or CheckedIn → Cancelled. A consumed entitlement unit
    /// is given back in the same commit.
    pub async fn cancel(&self, id: Ulid, reason: Option<String>) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.cancel_inner(id, reason, |_| true).await;
        observability::record("cancel", started, &result);
        result.and_then(|r| r.ok_or(EngineError::NotFound(id)))
    }

    /// Cancel `id` if `still_applies` holds under the lock; `Ok(None)` otherwise.
    async fn cancel_inner(
        &self,
        id: Ulid,
        reason: Option<String>,
        still_applies: impl FnOnce(&Reservation) -> bool,
    ) -> Result<Option<Reservation>, EngineError> {
        if let Some(r) = &reason {
            check_len(r, MAX_REASON_LEN, "cancel reason too long")?;
        }
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if !still_applies(&current) {
            return Ok(None);
        }
        if !current.status.is_blocking() {
            return Err(illegal(&current, "cancel"));
        }
        let was_checked_in = current.status == ReservationStatus::CheckedIn;

        let mut next = current;
        next.status = ReservationStatus::Cancelled;
        next.cancelled_at = Some(self.clock.now());
        next.cancel_reason = reason;

        let mut ent_guard = None;
        let mut ent_after = None;
        if next.entitlement_consumed
            && let Some(eid) = next.entitlement_id
        {
            let handle = self.entitlement_handle(&eid).ok_or(EngineError::NotFound(eid))?;
            let eg = handle.write_owned().await;
            let mut after = eg.clone();
            ledger::restore(&mut after, 1);
            next.entitlement_consumed = false;
            ent_guard = Some(eg);
            ent_after = Some(after);
        }

        let status = if was_checked_in {
            occupancy::next_status(&guard, OccupancyChange::Released { reservation_id: id })
        } else {
            None
        };
        let event = updated(next.clone(), ent_after, status);
        self.persist_and_apply(&mut guard, ent_guard.as_deref_mut(), &event)
            .await?;
        drop(ent_guard);
        drop(guard);

        let mut intents = Vec::new();
        if was_checked_in {
            intents.push(Intent::Revoke {
                user: next.requester_id,
                resource: next.resource_id,
            });
        }
        intents.push(Intent::Notify {
            recipient: next.requester_id,
            template: Template::ReservationCancelled,
            data: reservation_data(&next),
        });
        self.effects.dispatch(intents);
        info!(reservation = %id, reason = next.cancel_reason.as_deref().unwrap_or(""), "reservation cancelled");
        Ok(Some(next))
    }

    /// Confirmed → NoShow once the planned end plus the grace period has
    /// passed. Any other status is left alone.
    pub async fn mark_no_show(&self, id: Ulid) -> Result<NoShowOutcome, EngineError> {
        let started = Instant::now();
        let result = self.mark_no_show_inner(id).await;
        observability::record("no_show", started, &result);
        result
    }

    async fn mark_no_show_inner(&self, id: Ulid) -> Result<NoShowOutcome, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status != ReservationStatus::Confirmed {
            debug!(reservation = %id, status = current.status.as_str(), "no-show skipped");
            return Ok(NoShowOutcome::AlreadySettled(current.status));
        }
        let now = self.clock.now();
        let due_at = self.no_show_due_at(&current);
        if now <= due_at {
            return Err(EngineError::NoShowNotDue { id, due_at });
        }

        let mut next = current;
        next.status = ReservationStatus::NoShow;
        let event = updated(next.clone(), None, None);
        self.persist_and_apply(&mut guard, None, &event).await?;
        drop(guard);

        self.effects.dispatch(vec![Intent::Notify {
            recipient: next.requester_id,
            template: Template::ReservationNoShow,
            data: reservation_data(&next),
        }]);
        info!(reservation = %id, "marked no-show");
        Ok(NoShowOutcome::Marked)
    }

    pub(super) fn no_show_due_at(&self, r: &Reservation) -> NaiveDateTime {
        r.slot.planned_end() + self.policy.grace_period()
    }

    /// A Draft is overdue once its planned end has passed or it has sat
    /// unconfirmed longer than the draft TTL.
    pub(super) fn draft_overdue(&self, r: &Reservation, now: NaiveDateTime) -> bool {
        if r.status != ReservationStatus::Draft {
            return false;
        }
        let ttl_elapsed = self
            .policy
            .draft_ttl_minutes
            .is_some_and(|ttl| now >= r.created_at + Duration::minutes(ttl));
        ttl_elapsed || r.slot.planned_end() <= now
    }

    /// Cancel an abandoned draft. `Ok(false)` if it is no longer an overdue draft.
    pub(super) async fn expire_draft(&self, id: Ulid) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let expired = self
            .cancel_inner(id, Some("expired".to_string()), |r| self.draft_overdue(r, now))
            .await?;
        Ok(expired.is_some())
    }

    /// Append an audit note. Allowed in every status, terminal ones included.
    pub async fn annotate(&self, id: Ulid, note: String) -> Result<Reservation, EngineError> {
        let note = note.trim().to_string();
        if note.is_empty() {
            return Err(EngineError::validation("note must not be empty"));
        }
        check_len(&note, MAX_NOTE_LEN, "note too long")?;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let mut next = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if next.notes.len() >= MAX_NOTES_PER_RESERVATION {
            return Err(EngineError::LimitExceeded("too many notes on reservation"));
        }
        next.notes.push(note);
        let event = updated(next.clone(), None, None);
        self.persist_and_apply(&mut guard, None, &event).await?;
        Ok(next)
    }
}
