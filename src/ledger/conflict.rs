use chrono::{DateTime, Utc};

use crate::limits::*;
use crate::model::*;

use super::LedgerError;

/// Normalize and validate a requested window. `start >= end` is `InvalidWindow`.
pub(crate) fn validate_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Span, LedgerError> {
    let span = Span::from_window(start, end).ok_or(LedgerError::InvalidWindow { start, end })?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(LedgerError::LimitExceeded("timestamp out of range"));
    }
    Ok(span)
}

/// Like `validate_window`, plus the per-reservation duration cap.
pub(crate) fn validate_reservation_window(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Span, LedgerError> {
    let span = validate_window(start, end)?;
    if span.duration_ms() > MAX_RESERVATION_MS {
        return Err(LedgerError::LimitExceeded("reservation too long"));
    }
    Ok(span)
}

pub(crate) fn validate_attrs(attrs: &ReservationAttrs) -> Result<(), LedgerError> {
    if let Some(plate) = &attrs.plate_number
        && plate.len() > MAX_PLATE_LEN
    {
        return Err(LedgerError::LimitExceeded("plate number too long"));
    }
    Ok(())
}

/// Half-open overlap test against the spot's active reservations.
/// Caller must hold the spot's lock for the answer to stay true.
pub(crate) fn check_no_conflict(ss: &SpotState, span: &Span) -> Result<(), LedgerError> {
    match ss.overlapping(span).next() {
        Some(slot) => Err(LedgerError::Conflict(slot.reservation_id)),
        None => Ok(()),
    }
}
