use std::fmt;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::{Location, Ms, RenterContact, Vehicle};
use crate::money::Money;

/// Local, recoverable input errors. Never require a round-trip to detect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Zero-length or inverted window (`start >= end`).
    EmptyWindow { start: NaiveDate, end: NaiveDate },
    TimestampOutOfRange(Ms),
    RentalTooLong { days: i64, max: i64 },
    BelowMinimumStay { days: i64, minimum: u32 },
    MissingPhone,
    InvalidPhone(String),
    Underage { age: u32 },
    InvalidAge(u32),
    NegativeAmount(&'static str),
    AmountTooLarge(&'static str),
    InvalidMinimumStay,
    NameTooLong,
    UnknownLocation(Ulid),
    TermsNotAccepted,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyWindow { start, end } => {
                write!(f, "return date {end} must be after pickup date {start}")
            }
            ValidationError::TimestampOutOfRange(ms) => write!(f, "timestamp out of range: {ms}"),
            ValidationError::RentalTooLong { days, max } => {
                write!(f, "rental of {days} days exceeds the maximum of {max}")
            }
            ValidationError::BelowMinimumStay { days, minimum } => {
                write!(f, "rental of {days} days is below the vehicle minimum of {minimum}")
            }
            ValidationError::MissingPhone => write!(f, "phone number is required"),
            ValidationError::InvalidPhone(p) => write!(f, "invalid phone number: {p}"),
            ValidationError::Underage { age } => {
                write!(f, "renter must be at least {MIN_RENTER_AGE} (got {age})")
            }
            ValidationError::InvalidAge(age) => write!(f, "invalid age: {age}"),
            ValidationError::NegativeAmount(field) => write!(f, "{field} must not be negative"),
            ValidationError::AmountTooLarge(field) => {
                write!(f, "{field} exceeds the maximum of {}", Money::from_minor(MAX_AMOUNT_MINOR))
            }
            ValidationError::InvalidMinimumStay => write!(f, "minimum rental days must be at least 1"),
            ValidationError::NameTooLong => write!(f, "name too long"),
            ValidationError::UnknownLocation(id) => write!(f, "unknown location: {id}"),
            ValidationError::TermsNotAccepted => write!(f, "terms must be accepted before submitting"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Accepts an optional leading `+` followed by digits, spaces, dashes, dots and parentheses,
/// with 7..=15 digits in total.
pub fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    let phone = phone.trim();
    if phone.is_empty() {
        return Err(ValidationError::MissingPhone);
    }
    if phone.len() > MAX_PHONE_LEN {
        return Err(ValidationError::InvalidPhone(phone.to_string()));
    }
    let body = phone.strip_prefix('+').unwrap_or(phone);
    let mut digits = 0usize;
    for c in body.chars() {
        match c {
            '0'..='9' => digits += 1,
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return Err(ValidationError::InvalidPhone(phone.to_string())),
        }
    }
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits) {
        return Err(ValidationError::InvalidPhone(phone.to_string()));
    }
    Ok(())
}

pub fn validate_age(age: u32) -> Result<(), ValidationError> {
    if age < MIN_RENTER_AGE {
        return Err(ValidationError::Underage { age });
    }
    if age > MAX_RENTER_AGE {
        return Err(ValidationError::InvalidAge(age));
    }
    Ok(())
}

pub fn validate_contact(contact: &RenterContact) -> Result<(), ValidationError> {
    validate_phone(&contact.phone)?;
    validate_age(contact.age)
}

pub fn validate_amount(field: &'static str, amount: Money) -> Result<(), ValidationError> {
    if amount.is_negative() {
        return Err(ValidationError::NegativeAmount(field));
    }
    if amount.minor() > MAX_AMOUNT_MINOR {
        return Err(ValidationError::AmountTooLarge(field));
    }
    Ok(())
}

pub fn validate_vehicle(vehicle: &Vehicle) -> Result<(), ValidationError> {
    validate_amount("rate_per_day", vehicle.rate_per_day)?;
    validate_amount("deposit", vehicle.deposit)?;
    if vehicle.min_rental_days == 0 {
        return Err(ValidationError::InvalidMinimumStay);
    }
    if vehicle.name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(ValidationError::NameTooLong);
    }
    Ok(())
}

pub fn validate_location(location: &Location) -> Result<(), ValidationError> {
    validate_amount("delivery_fee", location.delivery_fee)?;
    if location.name.len() > MAX_NAME_LEN {
        return Err(ValidationError::NameTooLong);
    }
    Ok(())
}
