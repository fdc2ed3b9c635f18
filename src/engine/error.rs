use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;
use ulid::Ulid;

use crate::model::{EntitlementStatus, ReservationRef, ReservationStatus, ResourceStatus};

/// Why a resource cannot take a reservation for the requested slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unavailability {
    /// Not `Available` or not bookable. Retrying another slot will not help.
    SpaceDisabled {
        status: ResourceStatus,
        bookable: bool,
    },
    DateInPast {
        date: NaiveDate,
        today: NaiveDate,
    },
    /// The caller may pick another slot.
    TimeTaken { conflicts: Vec<ReservationRef> },
}

impl Unavailability {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Unavailability::TimeTaken { .. })
    }

    pub fn conflicts(&self) -> &[ReservationRef] {
        match self {
            Unavailability::TimeTaken { conflicts } => conflicts,
            _ => &[],
        }
    }
}

impl std::fmt::Display for Unavailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unavailability::SpaceDisabled { status, bookable } => {
                write!(f, "space disabled (status {status:?}, bookable {bookable})")
            }
            Unavailability::DateInPast { date, today } => {
                write!(f, "date {date} is before today ({today})")
            }
            Unavailability::TimeTaken { conflicts } => {
                let ids: Vec<String> = conflicts.iter().map(|c| c.id.to_string()).collect();
                write!(f, "time taken by {}", ids.join(", "))
            }
        }
    }
}

/// Coarse classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
    EntitlementExhausted,
    IllegalTransition,
    Dependency,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::EntitlementExhausted => "entitlement_exhausted",
            ErrorKind::IllegalTransition => "illegal_transition",
            ErrorKind::Dependency => "dependency",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("resource {resource_id} unavailable: {reason}")]
    Conflict {
        resource_id: Ulid,
        reason: Unavailability,
    },
    #[error("entitlement {0} has no remaining access units")]
    EntitlementExhausted(Ulid),
    #[error("entitlement {id} is {status:?}, not active")]
    EntitlementInactive { id: Ulid, status: EntitlementStatus },
    #[error("reservation {id}: cannot {action} from {from:?}")]
    IllegalTransition {
        id: Ulid,
        from: ReservationStatus,
        action: &'static str,
    },
    #[error("entitlement {id}: cannot {action} from {from:?}")]
    EntitlementTransition {
        id: Ulid,
        from: EntitlementStatus,
        action: &'static str,
    },
    #[error("reservation {id} cannot be marked no-show before {due_at}")]
    NoShowNotDue { id: Ulid, due_at: NaiveDateTime },
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_)
            | EngineError::Validation(_)
            | EngineError::LimitExceeded(_)
            | EngineError::EntitlementInactive { .. } => ErrorKind::Validation,
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::EntitlementExhausted(_) => ErrorKind::EntitlementExhausted,
            EngineError::IllegalTransition { .. }
            | EngineError::EntitlementTransition { .. }
            | EngineError::NoShowNotDue { .. } => ErrorKind::IllegalTransition,
            EngineError::WalError(_) => ErrorKind::Dependency,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Conflicting reservations, if this is a time conflict.
    pub fn conflicts(&self) -> &[ReservationRef] {
        match self {
            EngineError::Conflict { reason, .. } => reason.conflicts(),
            _ => &[],
        }
    }
}
