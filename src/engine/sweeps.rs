//! Idempotent batch operations driven by the scheduler.
//!
//! Each sweep picks its candidates under read locks, then runs the real
//! transition per item. The transition re-checks its precondition under the
//! write lock, so a candidate that changed in between is skipped, and a
//! failing item never stops the rest of the batch.

use tracing::{info, warn};
use ulid::Ulid;

use crate::effects::{Intent, Template};
use crate::model::*;
use crate::observability;

use super::{ledger, Engine, EngineError, NoShowOutcome, SharedBook, SharedEntitlement};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Items the sweep changed.
    pub processed: usize,
    /// Candidates that no longer needed the change.
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    fn tally(&mut self, sweep: &'static str, id: Ulid, outcome: Result<bool, EngineError>) {
        let label = match outcome {
            Ok(true) => {
                self.processed += 1;
                "processed"
            }
            Ok(false) => {
                self.skipped += 1;
                "skipped"
            }
            Err(e) => {
                warn!(sweep, item = %id, "sweep item failed: {e}");
                self.failed += 1;
                "failed"
            }
        };
        observability::sweep_item(sweep, label);
    }

    fn log(self, sweep: &'static str) -> Self {
        if self.processed > 0 || self.failed > 0 {
            info!(sweep, processed = self.processed, skipped = self.skipped, failed = self.failed, "sweep finished");
        }
        self
    }
}

impl Engine {
    async fn reservations_where(&self, pred: impl Fn(&Reservation) -> bool) -> Vec<Ulid> {
        let books: Vec<SharedBook> = self.books.iter().map(|e| e.value().clone()).collect();
        let mut ids = Vec::new();
        for book in books {
            let guard = book.read().await;
            ids.extend(guard.reservations.iter().filter(|r| pred(r)).map(|r| r.id));
        }
        ids
    }

    async fn entitlements_where(&self, pred: impl Fn(&Entitlement) -> bool) -> Vec<Ulid> {
        let handles: Vec<SharedEntitlement> = self.entitlements.iter().map(|e| e.value().clone()).collect();
        let mut ids = Vec::new();
        for handle in handles {
            let guard = handle.read().await;
            if pred(&guard) {
                ids.push(guard.id);
            }
        }
        ids
    }

    /// Mark every Confirmed reservation whose grace period has run out.
    pub async fn sweep_no_shows(&self) -> SweepReport {
        let now = self.clock.now();
        let candidates = self
            .reservations_where(|r| r.status == ReservationStatus::Confirmed && now > self.no_show_due_at(r))
            .await;
        let mut report = SweepReport::default();
        for id in candidates {
            let outcome = self
                .mark_no_show(id)
                .await
                .map(|o| o == NoShowOutcome::Marked);
            report.tally("no_shows", id, outcome);
        }
        report.log("no_shows")
    }

    /// Cancel drafts that outlived the draft TTL or whose slot has ended.
    pub async fn expire_overdue_reservations(&self) -> SweepReport {
        let now = self.clock.now();
        let candidates = self.reservations_where(|r| self.draft_overdue(r, now)).await;
        let mut report = SweepReport::default();
        for id in candidates {
            let outcome = self.expire_draft(id).await;
            report.tally("overdue_drafts", id, outcome);
        }
        report.log("overdue_drafts")
    }

    /// Active entitlements past their end date become Expired.
    pub async fn expire_entitlements(&self) -> SweepReport {
        let today = self.clock.today();
        let candidates = self
            .entitlements_where(|e| e.status == EntitlementStatus::Active && e.valid_until < today)
            .await;
        let mut report = SweepReport::default();
        for id in candidates {
            let outcome = self
                .update_entitlement(id, |e| {
                    if e.status != EntitlementStatus::Active || e.valid_until >= today {
                        return Ok(false);
                    }
                    ledger::expire(e).map(|()| true)
                })
                .await;
            if let Ok(Some(expired)) = &outcome {
                self.effects.dispatch(vec![Intent::Notify {
                    recipient: expired.holder_id,
                    template: Template::EntitlementExpired,
                    data: serde_json::json!({
                        "entitlement_id": expired.id.to_string(),
                        "valid_until": expired.valid_until.to_string(),
                    }),
                }]);
            }
            report.tally("expire_entitlements", id, outcome.map(|e| e.is_some()));
        }
        report.log("expire_entitlements")
    }

    /// Renewal successors start as Drafts; switch them on when their period begins.
    pub async fn activate_due_entitlements(&self) -> SweepReport {
        let today = self.clock.today();
        let due = |e: &Entitlement| {
            e.status == EntitlementStatus::Draft && e.renewed_from.is_some() && e.valid_from <= today
        };
        let candidates = self.entitlements_where(due).await;
        let mut report = SweepReport::default();
        for id in candidates {
            let outcome = self
                .update_entitlement(id, |e| {
                    if !due(e) {
                        return Ok(false);
                    }
                    ledger::activate(e, today).map(|()| true)
                })
                .await;
            report.tally("activate_entitlements", id, outcome.map(|e| e.is_some()));
        }
        report.log("activate_entitlements")
    }

    /// Notify holders as their entitlement approaches its end date.
    pub async fn send_expiry_reminders(&self) -> SweepReport {
        let today = self.clock.today();
        let thresholds = self.policy.reminder_days.clone();
        let Some(&furthest) = thresholds.iter().max() else {
            return SweepReport::default();
        };
        let candidates = self
            .entitlements_where(|e| {
                let days_left = (e.valid_until - today).num_days();
                e.status == EntitlementStatus::Active && (0..=i64::from(furthest)).contains(&days_left)
            })
            .await;
        let mut report = SweepReport::default();
        for id in candidates {
            let mut sent = None;
            let outcome = self
                .update_entitlement(id, |e| {
                    if e.status != EntitlementStatus::Active {
                        return Ok(false);
                    }
                    sent = ledger::take_due_reminder(e, today, &thresholds);
                    Ok(sent.is_some())
                })
                .await;
            if let (Ok(Some(e)), Some(days)) = (&outcome, sent) {
                self.effects.dispatch(vec![Intent::Notify {
                    recipient: e.holder_id,
                    template: Template::EntitlementExpiring,
                    data: serde_json::json!({
                        "entitlement_id": e.id.to_string(),
                        "valid_until": e.valid_until.to_string(),
                        "days_left": (e.valid_until - today).num_days(),
                        "threshold": days,
                    }),
                }]);
            }
            report.tally("expiry_reminders", id, outcome.map(|e| e.is_some()));
        }
        report.log("expiry_reminders")
    }

    /// Renew auto-renewing entitlements that end within the renewal window.
    pub async fn auto_renew_entitlements(&self) -> SweepReport {
        let today = self.clock.today();
        let window = self.policy.auto_renew_window_days;
        let candidates = self
            .entitlements_where(|e| {
                e.status == EntitlementStatus::Active
                    && e.auto_renew
                    && e.renewed_to.is_none()
                    && (e.valid_until - today).num_days() <= window
            })
            .await;
        let mut report = SweepReport::default();
        for id in candidates {
            let outcome = match self.renew_entitlement(id).await {
                Ok(_) => Ok(true),
                // Renewed concurrently since the candidate scan.
                Err(EngineError::EntitlementTransition { .. }) => Ok(false),
                Err(e) => Err(e),
            };
            report.tally("auto_renew", id, outcome);
        }
        report.log("auto_renew")
    }

    /// Start a new monthly usage period for limited entitlements whose period ran out.
    pub async fn reset_entitlement_periods(&self) -> SweepReport {
        let today = self.clock.today();
        let due = |e: &Entitlement| {
            e.status == EntitlementStatus::Active
                && !e.is_unlimited()
                && ledger::due_period_start(e, today).is_some()
        };
        let candidates = self.entitlements_where(due).await;
        let mut report = SweepReport::default();
        for id in candidates {
            let outcome = self
                .update_entitlement(id, |e| {
                    if !due(e) {
                        return Ok(false);
                    }
                    let Some(start) = ledger::due_period_start(e, today) else {
                        return Ok(false);
                    };
                    ledger::reset_period(e, start);
                    Ok(true)
                })
                .await;
            report.tally("period_reset", id, outcome.map(|e| e.is_some()));
        }
        report.log("period_reset")
    }

    /// Every sweep, in dependency order: reservations first, then
    /// entitlements so a renewal made today can also be activated today.
    pub async fn run_sweeps(&self) -> Vec<(&'static str, SweepReport)> {
        vec![
            ("expire_overdue_reservations", self.expire_overdue_reservations().await),
            ("sweep_no_shows", self.sweep_no_shows().await),
            ("expire_entitlements", self.expire_entitlements().await),
            ("auto_renew_entitlements", self.auto_renew_entitlements().await),
            ("activate_due_entitlements", self.activate_due_entitlements().await),
            ("send_expiry_reminders", self.send_expiry_reminders().await),
            ("reset_entitlement_periods", self.reset_entitlement_periods().await),
        ]
    }
}
