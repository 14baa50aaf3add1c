use serde::{Deserialize, Serialize};

use crate::limits::MAX_RENTAL_DAYS;
use crate::model::{Location, Vehicle, Window};
use crate::money::Money;
use crate::validation::ValidationError;

/// Derived, never edited by hand. `deposit` is informational and excluded from `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub days: i64,
    pub rate_per_day: Money,
    pub subtotal: Money,
    pub delivery_fee: Money,
    pub total: Money,
    pub deposit: Money,
}

/// Billable days of a normalized window, checked against the vehicle's minimum stay.
/// Short rentals are rejected, never rounded up.
pub fn rental_days(window: &Window, vehicle: &Vehicle) -> Result<i64, ValidationError> {
    let days = window.days();
    if days > MAX_RENTAL_DAYS {
        return Err(ValidationError::RentalTooLong {
            days,
            max: MAX_RENTAL_DAYS,
        });
    }
    if days < i64::from(vehicle.min_rental_days.max(1)) {
        return Err(ValidationError::BelowMinimumStay {
            days,
            minimum: vehicle.min_rental_days,
        });
    }
    Ok(days)
}

/// Pickup fee, plus the drop-off fee when the car is returned somewhere else.
pub fn delivery_fee(pickup: &Location, dropoff: &Location) -> Result<Money, ValidationError> {
    if pickup.id == dropoff.id {
        return Ok(pickup.delivery_fee);
    }
    pickup
        .delivery_fee
        .checked_add(dropoff.delivery_fee)
        .ok_or(ValidationError::AmountTooLarge("delivery_fee"))
}

pub fn price(
    window: &Window,
    vehicle: &Vehicle,
    delivery_fee: Money,
) -> Result<PriceBreakdown, ValidationError> {
    if delivery_fee.is_negative() {
        return Err(ValidationError::NegativeAmount("delivery_fee"));
    }
    let days = rental_days(window, vehicle)?;
    let subtotal = vehicle
        .rate_per_day
        .checked_mul(days)
        .ok_or(ValidationError::AmountTooLarge("subtotal"))?;
    let total = subtotal
        .checked_add(delivery_fee)
        .ok_or(ValidationError::AmountTooLarge("total"))?;
    Ok(PriceBreakdown {
        days,
        rate_per_day: vehicle.rate_per_day,
        subtotal,
        delivery_fee,
        total,
        deposit: vehicle.deposit,
    })
}
