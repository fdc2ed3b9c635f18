use rust_decimal::Decimal;

use crate::config::Policy;
use crate::model::*;

use super::EngineError;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

fn out_of_range() -> EngineError {
    EngineError::validation("amount out of range")
}

/// `a × b / 100`, checked.
fn percent_of(percent: Decimal, amount: Money) -> Result<Money, EngineError> {
    percent
        .checked_mul(amount)
        .and_then(|v| v.checked_div(HUNDRED))
        .ok_or_else(out_of_range)
}

/// Inputs to a price computation. Borrowed so callers keep ownership.
pub struct PriceRequest<'a> {
    pub slot: &'a TimeSlot,
    pub rates: &'a RateCard,
    pub plan: RatePlan,
    pub entitlement: Option<&'a Entitlement>,
    pub discount_percent: Decimal,
    pub services: &'a [ServiceLine],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    /// Plan actually priced, after any auto-switch.
    pub rate_plan: RatePlan,
    pub subtotal: Money,
    pub discount: Money,
    pub services: Money,
    pub tax: Money,
    pub total: Money,
}

impl Quote {
    pub fn charges(&self) -> Charges {
        Charges {
            subtotal: self.subtotal,
            discount: self.discount,
            services: self.services,
            tax: self.tax,
            overtime: Decimal::ZERO,
            total: self.total,
        }
    }
}

pub fn price(req: &PriceRequest<'_>, policy: &Policy) -> Result<Quote, EngineError> {
    if req.discount_percent < Decimal::ZERO || req.discount_percent > HUNDRED {
        return Err(EngineError::validation("discount percent must be between 0 and 100"));
    }

    let hours = req.slot.duration_hours();
    let plan = effective_plan(req.plan, hours, req.rates, policy);

    let mut subtotal = match plan {
        RatePlan::Hourly => {
            let rate = req
                .rates
                .hourly
                .ok_or_else(|| EngineError::validation("hourly rate is required for the hourly plan"))?;
            hours.checked_mul(rate).ok_or_else(out_of_range)?
        }
        RatePlan::Daily => req
            .rates
            .daily
            .ok_or_else(|| EngineError::validation("daily rate is required for the daily plan"))?,
        RatePlan::Package => {
            let entitlement = req
                .entitlement
                .ok_or_else(|| EngineError::validation("package plan requires an entitlement"))?;
            ensure_usable(entitlement, req.slot)?;
            policy.package_visit_price
        }
    };

    // The floor applies to priced plans only; package visits are metered by the ledger.
    if plan != RatePlan::Package
        && let Some(floor) = req.rates.minimum_charge
        && subtotal < floor {
            subtotal = floor;
        }

    let subtotal = subtotal.round_dp(2);
    let discount = percent_of(req.discount_percent, subtotal)?.round_dp(2);
    let services = req
        .services
        .iter()
        .try_fold(Decimal::ZERO, |acc, line| line.amount().and_then(|a| acc.checked_add(a)))
        .ok_or_else(out_of_range)?
        .round_dp(2);
    let taxable = (subtotal - discount).checked_add(services).ok_or_else(out_of_range)?;
    let tax = percent_of(policy.tax_percent, taxable)?.round_dp(2);
    let total = taxable.checked_add(tax).ok_or_else(out_of_range)?;

    Ok(Quote {
        rate_plan: plan,
        subtotal,
        discount,
        services,
        tax,
        total,
    })
}

/// Hourly requests long enough and cheaper as a day are priced daily.
fn effective_plan(requested: RatePlan, hours: Decimal, rates: &RateCard, policy: &Policy) -> RatePlan {
    if requested != RatePlan::Hourly {
        return requested;
    }
    let (Some(threshold), Some(daily), Some(hourly)) =
        (policy.auto_daily_threshold_hours, rates.daily, rates.hourly)
    else {
        return requested;
    };
    // An hourly cost too large to represent is never the cheaper option.
    if hours >= threshold && hours.checked_mul(hourly).is_none_or(|cost| daily < cost) {
        RatePlan::Daily
    } else {
        requested
    }
}

/// Package visits need an active allowance that covers the date and has units left.
pub(crate) fn ensure_usable(entitlement: &Entitlement, slot: &TimeSlot) -> Result<(), EngineError> {
    if entitlement.status != EntitlementStatus::Active {
        return Err(EngineError::EntitlementInactive {
            id: entitlement.id,
            status: entitlement.status,
        });
    }
    if !entitlement.covers_date(slot.date) {
        return Err(EngineError::validation(format!(
            "entitlement {} is not valid on {}",
            entitlement.id, slot.date
        )));
    }
    if !entitlement.is_unlimited() && entitlement.remaining == 0 {
        return Err(EngineError::EntitlementExhausted(entitlement.id));
    }
    Ok(())
}

/// `hours × hourly rate × multiplier`, zero without an hourly rate.
pub fn overtime_charge(hours: Decimal, hourly_rate: Option<Money>, multiplier: Decimal) -> Result<Money, EngineError> {
    match hourly_rate {
        Some(rate) if hours > Decimal::ZERO => hours
            .checked_mul(rate)
            .and_then(|v| v.checked_mul(multiplier))
            .map(|v| v.round_dp(2))
            .ok_or_else(out_of_range),
        _ => Ok(Decimal::ZERO),
    }
}

/// Charges with overtime folded into the total.
pub fn with_overtime(charges: &Charges, overtime: Money) -> Result<Charges, EngineError> {
    let total = (charges.subtotal - charges.discount)
        .checked_add(charges.services)
        .and_then(|v| v.checked_add(charges.tax))
        .and_then(|v| v.checked_add(overtime))
        .ok_or_else(out_of_range)?;
    Ok(Charges {
        overtime,
        total,
        ..charges.clone()
    })
}
