use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::availability::{check_available, free_windows, AvailabilityCheck};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_resource(&self, id: &Ulid) -> Option<Resource> {
        let book = self.book(id)?;
        let guard = book.read().await;
        Some(guard.resource.clone())
    }

    pub async fn list_resources(&self) -> Vec<Resource> {
        let books: Vec<_> = self.books.iter().map(|e| e.value().clone()).collect();
        let mut resources = Vec::with_capacity(books.len());
        for book in books {
            resources.push(book.read().await.resource.clone());
        }
        resources.sort_by_key(|r| r.id);
        resources
    }

    pub async fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        let resource_id = self.resource_for_reservation(id)?;
        let book = self.book(&resource_id)?;
        let guard = book.read().await;
        guard.reservation(id).cloned()
    }

    /// Reservations on a resource in slot order, optionally for one date.
    pub async fn list_reservations(
        &self,
        resource_id: &Ulid,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let book = self.book(resource_id).ok_or(EngineError::NotFound(*resource_id))?;
        let guard = book.read().await;
        Ok(match date {
            Some(date) => guard.on_date(date).to_vec(),
            None => guard.reservations.clone(),
        })
    }

    /// A requester's reservations across every resource, in date and start
    /// order. `status` and the inclusive `from`/`to` dates narrow the list.
    pub async fn list_reservations_for(
        &self,
        requester_id: &Ulid,
        status: Option<ReservationStatus>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Vec<Reservation> {
        let books: Vec<_> = self.books.iter().map(|e| e.value().clone()).collect();
        let mut found = Vec::new();
        for book in books {
            let guard = book.read().await;
            found.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.requester_id == *requester_id)
                    .filter(|r| status.is_none_or(|s| r.status == s))
                    .filter(|r| from.is_none_or(|d| r.slot.date >= d))
                    .filter(|r| to.is_none_or(|d| r.slot.date <= d))
                    .cloned(),
            );
        }
        found.sort_by_key(|r| (r.slot.date, r.slot.start, r.id));
        found
    }

    pub async fn get_entitlement(&self, id: &Ulid) -> Option<Entitlement> {
        let handle = self.entitlement_handle(id)?;
        let guard = handle.read().await;
        Some(guard.clone())
    }

    pub async fn list_entitlements(&self, holder_id: &Ulid) -> Vec<Entitlement> {
        let handles: Vec<_> = self.entitlements.iter().map(|e| e.value().clone()).collect();
        let mut found = Vec::new();
        for handle in handles {
            let guard = handle.read().await;
            if guard.holder_id == *holder_id {
                found.push(guard.clone());
            }
        }
        found.sort_by_key(|e| e.valid_from);
        found
    }

    /// Could `slot` be reserved on this resource right now? `exclude` lets a
    /// caller ignore one of its own reservations.
    pub async fn check_availability(
        &self,
        resource_id: &Ulid,
        slot: &TimeSlot,
        exclude: Option<Ulid>,
    ) -> Result<AvailabilityCheck, EngineError> {
        if !slot.is_well_formed() {
            return Err(EngineError::validation("slot must end after it starts"));
        }
        let book = self.book(resource_id).ok_or(EngineError::NotFound(*resource_id))?;
        let guard = book.read().await;
        Ok(check_available(&guard, slot, exclude, self.clock.today()))
    }

    /// Open windows between `open` and `close` on `date`.
    pub async fn free_windows(
        &self,
        resource_id: &Ulid,
        date: NaiveDate,
        open: NaiveTime,
        close: NaiveTime,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let book = self.book(resource_id).ok_or(EngineError::NotFound(*resource_id))?;
        let guard = book.read().await;
        Ok(free_windows(&guard, date, open, close))
    }
}
