use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::model::ReservationId;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid window: start {start} is not before end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// Carries the id of the active reservation that was overlapped.
    #[error("conflict with reservation: {0}")]
    Conflict(ReservationId),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("reservation {0} may only be cancelled by its owner or an administrator")]
    Forbidden(ReservationId),

    #[error("reservation {0} is already inactive")]
    AlreadyInactive(ReservationId),

    #[error("zone {0} still has active reservations")]
    ZoneInUse(Ulid),

    #[error("spot {0} still has active reservations")]
    SpotInUse(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    Wal(String),
}

impl LedgerError {
    pub fn zone_not_found(id: Ulid) -> Self {
        Self::NotFound { entity: "zone", id: id.to_string() }
    }

    pub fn spot_not_found(id: Ulid) -> Self {
        Self::NotFound { entity: "spot", id: id.to_string() }
    }

    pub fn reservation_not_found(id: impl ToString) -> Self {
        Self::NotFound { entity: "reservation", id: id.to_string() }
    }

    /// Recoverable signals a caller can act on without treating them as failures.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AlreadyInactive(_) | Self::Conflict(_))
    }
}
