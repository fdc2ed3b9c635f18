use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::error::Unavailability;
use super::EngineError;

/// Outcome of an availability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityCheck {
    pub available: bool,
    pub reason: Option<Unavailability>,
}

impl AvailabilityCheck {
    fn ok() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    fn blocked(reason: Unavailability) -> Self {
        Self {
            available: false,
            reason: Some(reason),
        }
    }

    pub fn conflicts(&self) -> &[ReservationRef] {
        match &self.reason {
            Some(reason) => reason.conflicts(),
            None => &[],
        }
    }

    pub fn into_result(self, resource_id: Ulid) -> Result<(), EngineError> {
        match self.reason {
            None => Ok(()),
            Some(reason) => Err(EngineError::Conflict { resource_id, reason }),
        }
    }
}

/// A resource that is switched off or not currently `Available` takes no
/// bookings at all.
fn space_disabled(resource: &Resource) -> Option<Unavailability> {
    if resource.bookable && resource.status == ResourceStatus::Available {
        return None;
    }
    Some(Unavailability::SpaceDisabled {
        status: resource.status,
        bookable: resource.bookable,
    })
}

/// Can `slot` be taken on this resource?
///
/// Hard blocks (space disabled, date in the past) are reported before time
/// conflicts. Every blocking reservation that overlaps is collected, except
/// `exclude` (a draft re-checking itself on confirm).
pub fn check_available(
    book: &ResourceBook,
    slot: &TimeSlot,
    exclude: Option<Ulid>,
    today: NaiveDate,
) -> AvailabilityCheck {
    if let Some(reason) = space_disabled(&book.resource) {
        return AvailabilityCheck::blocked(reason);
    }
    if slot.date < today {
        return AvailabilityCheck::blocked(Unavailability::DateInPast {
            date: slot.date,
            today,
        });
    }

    let conflicts: Vec<ReservationRef> = book
        .on_date(slot.date)
        .iter()
        .filter(|r| r.status.is_blocking())
        .filter(|r| Some(r.id) != exclude)
        .filter(|r| r.slot.overlaps(slot))
        .map(ReservationRef::from)
        .collect();

    if conflicts.is_empty() {
        AvailabilityCheck::ok()
    } else {
        AvailabilityCheck::blocked(Unavailability::TimeTaken { conflicts })
    }
}

/// Free windows within `[open, close)` on `date`, in order. A disabled
/// resource has none.
pub fn free_windows(book: &ResourceBook, date: NaiveDate, open: NaiveTime, close: NaiveTime) -> Vec<TimeSlot> {
    if open >= close || space_disabled(&book.resource).is_some() {
        return Vec::new();
    }
    let mut taken: Vec<(NaiveTime, NaiveTime)> = Vec::new();
    for r in book.on_date(date).iter().filter(|r| r.status.is_blocking()) {
        if r.slot.all_day {
            return Vec::new();
        }
        taken.push((r.slot.start, r.slot.end));
    }
    taken.sort_by_key(|w| w.0);
    let taken = merge_overlapping(&taken);

    subtract_windows(&[(open, close)], &taken)
        .into_iter()
        .map(|(start, end)| TimeSlot::new(date, start, end))
        .collect()
}

/// Merge sorted overlapping/adjacent windows into disjoint windows.
pub fn merge_overlapping(sorted: &[(NaiveTime, NaiveTime)]) -> Vec<(NaiveTime, NaiveTime)> {
    let mut merged: Vec<(NaiveTime, NaiveTime)> = Vec::new();
    for &window in sorted {
        if let Some(last) = merged.last_mut()
            && window.0 <= last.1 {
                last.1 = last.1.max(window.1);
                continue;
            }
        merged.push(window);
    }
    merged
}

/// Remove sorted, disjoint `to_remove` windows from sorted `base` windows.
pub fn subtract_windows(
    base: &[(NaiveTime, NaiveTime)],
    to_remove: &[(NaiveTime, NaiveTime)],
) -> Vec<(NaiveTime, NaiveTime)> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &(start, end) in base {
        let mut current_start = start;

        while ri < to_remove.len() && to_remove[ri].1 <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].0 < end {
            let r = to_remove[j];
            if r.0 > current_start {
                result.push((current_start, r.0));
            }
            current_start = current_start.max(r.1);
            j += 1;
        }

        if current_start < end {
            result.push((current_start, end));
        }
    }

    result
}
