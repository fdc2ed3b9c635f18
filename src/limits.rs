// Hard caps on input sizes and collection growth.

use rust_decimal::Decimal;

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;
pub const MAX_SERVICE_LINES: usize = 32;
pub const MAX_DESCRIPTION_LEN: usize = 256;
pub const MAX_ATTENDEES: u32 = 10_000;
/// Largest rate or unit price accepted, 1 000 000 000.
pub const MAX_PRICE: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

pub const MAX_NOTE_LEN: usize = 2_000;
pub const MAX_NOTES_PER_RESERVATION: usize = 200;
pub const MAX_REASON_LEN: usize = 512;
pub const MAX_OPERATOR_LEN: usize = 128;

pub const MAX_ENTITLEMENTS: usize = 100_000;
pub const MAX_ENTITLEMENT_SCOPE: usize = 1_000;
/// Longest validity window an entitlement may carry.
pub const MAX_ENTITLEMENT_DAYS: i64 = 3_660;
