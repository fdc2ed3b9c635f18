//! The only code that decides a resource's status.
//!
//! Transitions do not touch `Resource::status`. They describe what happened as
//! an [`OccupancyChange`], and [`next_status`] turns that into the status the
//! commit records.

use ulid::Ulid;

use crate::model::{ResourceBook, ResourceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupancyChange {
    /// A reservation was checked in.
    Occupied { reservation_id: Ulid },
    /// A checked-in reservation was checked out or cancelled.
    Released { reservation_id: Ulid },
    MaintenanceStarted,
    MaintenanceEnded,
}

/// Status after applying `change`, or `None` if it stays the same.
pub fn next_status(book: &ResourceBook, change: OccupancyChange) -> Option<ResourceStatus> {
    let current = book.resource.status;
    let next = match change {
        OccupancyChange::Occupied { .. } => ResourceStatus::Occupied,
        OccupancyChange::Released { reservation_id } => {
            if current == ResourceStatus::Maintenance {
                ResourceStatus::Maintenance
            } else if book.other_occupants(reservation_id).next().is_some() {
                ResourceStatus::Occupied
            } else {
                ResourceStatus::Available
            }
        }
        OccupancyChange::MaintenanceStarted => ResourceStatus::Maintenance,
        OccupancyChange::MaintenanceEnded => {
            if book.other_occupants(Ulid::nil()).next().is_some() {
                ResourceStatus::Occupied
            } else {
                ResourceStatus::Available
            }
        }
    };
    (next != current).then_some(next)
}

pub fn apply(book: &mut ResourceBook, status: ResourceStatus) {
    if book.resource.status != status {
        tracing::debug!(resource = %book.resource.id, from = ?book.resource.status, to = ?status, "occupancy");
        book.resource.status = status;
    }
}
