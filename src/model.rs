use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Money amounts, always in the operator's currency.
pub type Money = Decimal;

const SECONDS_PER_HOUR: i64 = 3_600;

/// A requested stretch of time on one calendar date.
///
/// Half-open: `[start, end)`. An all-day slot ignores `start`/`end` and
/// claims the whole date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub all_day: bool,
}

impl TimeSlot {
    pub fn new(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            date,
            start,
            end,
            all_day: false,
        }
    }

    pub fn all_day(date: NaiveDate) -> Self {
        Self {
            date,
            start: NaiveTime::MIN,
            end: NaiveTime::MIN,
            all_day: true,
        }
    }

    /// `end > start`, or all-day. Zero-length slots are not well formed.
    pub fn is_well_formed(&self) -> bool {
        self.all_day || self.end > self.start
    }

    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        if self.date != other.date {
            return false;
        }
        if self.all_day || other.all_day {
            return true;
        }
        !(self.end <= other.start || self.start >= other.end)
    }

    pub fn duration_hours(&self) -> Decimal {
        if self.all_day {
            return Decimal::from(24);
        }
        let secs = (self.end - self.start).num_seconds().max(0);
        Decimal::from(secs) / Decimal::from(SECONDS_PER_HOUR)
    }

    pub fn planned_start(&self) -> NaiveDateTime {
        self.date.and_time(self.start)
    }

    /// All-day slots end at the following midnight.
    pub fn planned_end(&self) -> NaiveDateTime {
        if self.all_day {
            self.date.and_time(NaiveTime::MIN) + Duration::days(1)
        } else {
            self.date.and_time(self.end)
        }
    }

    pub fn contains_instant(&self, t: NaiveDateTime) -> bool {
        self.planned_start() <= t && t < self.planned_end()
    }
}

/// Fractional hours between two instants, zero if `to` is not after `from`.
pub fn hours_between(from: NaiveDateTime, to: NaiveDateTime) -> Decimal {
    let secs = (to - from).num_seconds().max(0);
    Decimal::from(secs) / Decimal::from(SECONDS_PER_HOUR)
}

// ── Resources ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Desk,
    Office,
    MeetingRoom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Available,
    Occupied,
    Reserved,
    Maintenance,
}

/// Every price field a resource can carry. Unset means "not offered".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateCard {
    pub hourly: Option<Money>,
    pub daily: Option<Money>,
    pub monthly: Option<Money>,
    pub minimum_charge: Option<Money>,
    pub min_booking_hours: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    pub kind: ResourceKind,
    /// Max attendees per reservation.
    pub capacity: u32,
    pub rates: RateCard,
    pub bookable: bool,
    pub status: ResourceStatus,
}

impl Resource {
    pub fn new(id: Ulid, name: impl Into<String>, kind: ResourceKind, capacity: u32, rates: RateCard) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            capacity,
            rates,
            bookable: true,
            status: ResourceStatus::Available,
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatePlan {
    Hourly,
    Daily,
    Package,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Draft,
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
    NoShow,
}

impl ReservationStatus {
    /// Counts toward overlap conflicts.
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Draft | Self::Confirmed | Self::CheckedIn)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoShow)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Confirmed => "confirmed",
            Self::CheckedIn => "checked_in",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
        }
    }
}

/// An add-on billed with the reservation (catering, projector, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLine {
    pub description: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl ServiceLine {
    /// `quantity × unit_price`, `None` on overflow.
    pub fn amount(&self) -> Option<Money> {
        Decimal::from(self.quantity).checked_mul(self.unit_price)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charges {
    pub subtotal: Money,
    pub discount: Money,
    pub services: Money,
    pub tax: Money,
    pub overtime: Money,
    pub total: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester_id: Ulid,
    pub slot: TimeSlot,
    /// Effective plan after any auto-switch.
    pub rate_plan: RatePlan,
    pub entitlement_id: Option<Ulid>,
    pub attendees: u32,
    pub discount_percent: Decimal,
    pub services: Vec<ServiceLine>,
    /// Hourly rate at booking time, used for overtime.
    pub hourly_rate: Option<Money>,
    pub duration_hours: Decimal,
    pub charges: Charges,
    pub overtime_hours: Decimal,
    pub status: ReservationStatus,
    pub created_at: NaiveDateTime,
    pub confirmed_at: Option<NaiveDateTime>,
    pub checked_in_at: Option<NaiveDateTime>,
    pub checked_in_by: Option<String>,
    pub checked_out_at: Option<NaiveDateTime>,
    pub cancelled_at: Option<NaiveDateTime>,
    pub cancel_reason: Option<String>,
    /// An entitlement unit was decremented at check-in.
    pub entitlement_consumed: bool,
    pub notes: Vec<String>,
}

/// What a conflict report hands back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRef {
    pub id: Ulid,
    pub slot: TimeSlot,
    pub status: ReservationStatus,
}

impl From<&Reservation> for ReservationRef {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            slot: r.slot,
            status: r.status,
        }
    }
}

/// Everything a caller supplies to create a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester_id: Ulid,
    pub slot: TimeSlot,
    pub rate_plan: RatePlan,
    pub entitlement_id: Option<Ulid>,
    pub attendees: u32,
    pub discount_percent: Decimal,
    pub services: Vec<ServiceLine>,
}

impl ReservationRequest {
    pub fn new(resource_id: Ulid, requester_id: Ulid, slot: TimeSlot, rate_plan: RatePlan) -> Self {
        Self {
            id: Ulid::new(),
            resource_id,
            requester_id,
            slot,
            rate_plan,
            entitlement_id: None,
            attendees: 1,
            discount_percent: Decimal::ZERO,
            services: Vec::new(),
        }
    }

    pub fn with_entitlement(mut self, entitlement_id: Ulid) -> Self {
        self.entitlement_id = Some(entitlement_id);
        self
    }
}

// ── Entitlements ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    Unlimited,
    LimitedEntries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntitlementStatus {
    Draft,
    Active,
    Paused,
    Expired,
}

/// A prepaid allowance (membership or subscription) held by a requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: Ulid,
    pub holder_id: Ulid,
    pub mode: AccessMode,
    pub allowed: u32,
    pub used: u32,
    pub rollover: u32,
    /// Derived: `allowed - used + rollover`, floor 0. Zero when unlimited.
    pub remaining: u32,
    pub max_rollover: Option<u32>,
    pub price: Money,
    pub valid_from: NaiveDate,
    pub valid_until: NaiveDate,
    /// Start of the current usage period, advanced by the periodic reset.
    pub period_start: NaiveDate,
    pub status: EntitlementStatus,
    pub paused_on: Option<NaiveDate>,
    /// Resources this allowance may be used on. Empty means all.
    pub scope: Vec<Ulid>,
    pub auto_renew: bool,
    pub renewed_from: Option<Ulid>,
    pub renewed_to: Option<Ulid>,
    /// Days-before-expiry values a reminder has already been sent for.
    pub reminders_sent: Vec<u32>,
    pub last_used_on: Option<NaiveDate>,
}

impl Entitlement {
    pub fn new(
        id: Ulid,
        holder_id: Ulid,
        mode: AccessMode,
        allowed: u32,
        valid_from: NaiveDate,
        valid_until: NaiveDate,
    ) -> Self {
        Self {
            id,
            holder_id,
            mode,
            allowed,
            used: 0,
            rollover: 0,
            remaining: 0,
            max_rollover: None,
            price: Decimal::ZERO,
            valid_from,
            valid_until,
            period_start: valid_from,
            status: EntitlementStatus::Draft,
            paused_on: None,
            scope: Vec::new(),
            auto_renew: false,
            renewed_from: None,
            renewed_to: None,
            reminders_sent: Vec::new(),
            last_used_on: None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.mode == AccessMode::Unlimited
    }

    pub fn covers_date(&self, date: NaiveDate) -> bool {
        self.valid_from <= date && date <= self.valid_until
    }

    pub fn covers_resource(&self, resource_id: &Ulid) -> bool {
        self.scope.is_empty() || self.scope.contains(resource_id)
    }
}

/// A resource together with every reservation ever made on it.
#[derive(Debug, Clone)]
pub struct ResourceBook {
    pub resource: Resource,
    /// Sorted by `(slot.date, slot.start)`.
    pub reservations: Vec<Reservation>,
}

impl ResourceBook {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let key = (reservation.slot.date, reservation.slot.start);
        let pos = self
            .reservations
            .partition_point(|r| (r.slot.date, r.slot.start) <= key);
        self.reservations.insert(pos, reservation);
    }

    /// Replace a reservation's after-image. The slot never changes, so order holds.
    pub fn replace_reservation(&mut self, reservation: Reservation) -> bool {
        match self.reservations.iter_mut().find(|r| r.id == reservation.id) {
            Some(slot) => {
                *slot = reservation;
                true
            }
            None => false,
        }
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    /// Reservations on one date, found by binary search.
    pub fn on_date(&self, date: NaiveDate) -> &[Reservation] {
        let lo = self.reservations.partition_point(|r| r.slot.date < date);
        let hi = self.reservations.partition_point(|r| r.slot.date <= date);
        &self.reservations[lo..hi]
    }

    /// Checked-in reservations other than `except`.
    pub fn other_occupants(&self, except: Ulid) -> impl Iterator<Item = &Reservation> {
        self.reservations
            .iter()
            .filter(move |r| r.id != except && r.status == ReservationStatus::CheckedIn)
    }
}

/// The event types. This is the WAL record format.
///
/// Reservation and entitlement events carry after-images, so a single record
/// is the whole commit of one transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated(Resource),
    ResourceUpdated {
        id: Ulid,
        name: String,
        capacity: u32,
        rates: RateCard,
        bookable: bool,
    },
    ResourceStatusChanged {
        id: Ulid,
        status: ResourceStatus,
    },
    ReservationCreated(Reservation),
    ReservationUpdated {
        reservation: Reservation,
        entitlement: Option<Entitlement>,
        resource_status: Option<ResourceStatus>,
    },
    EntitlementSaved(Entitlement),
    EntitlementRenewed {
        previous: Entitlement,
        successor: Entitlement,
    },
}
