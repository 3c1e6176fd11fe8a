use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds; every conflict check works in this unit.
pub type Ms = i64;

pub type ZoneId = Ulid;
pub type SpotId = Ulid;
pub type ReservationId = Ulid;
pub type PrincipalId = Ulid;

/// Normalize an instant to the millisecond precision the ledger stores.
pub fn normalize(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(3)
}

pub fn to_ms(t: DateTime<Utc>) -> Ms {
    t.timestamp_millis()
}

/// Inverse of `to_ms`. Out-of-range input (never produced by a validated span) maps to the epoch.
pub fn instant(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Canonical plate form: ASCII letters and digits only, upper-cased.
/// `" 34 abc-123"` and `"34ABC123"` are the same plate.
pub fn normalize_plate(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span from two instants; `None` unless `start < end` after normalization.
    pub fn from_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        let (s, e) = (to_ms(normalize(start)), to_ms(normalize(end)));
        (s < e).then(|| Self::new(s, e))
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub district: Option<String>,
    /// Declared number of spots; informational, not enforced.
    pub capacity: u32,
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneMeta {
    pub name: String,
    pub district: Option<String>,
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    pub id: SpotId,
    pub zone_id: ZoneId,
    /// Sequential number within the zone, never reused.
    pub label: u32,
    pub accessible: bool,
    pub location: Option<GeoPoint>,
    pub landmark_hint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpotMeta {
    pub accessible: bool,
    pub location: Option<GeoPoint>,
    pub landmark_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReleaseReason {
    Cancelled,
    Expired,
    NoShow,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::Cancelled => "cancelled",
            ReleaseReason::Expired => "expired",
            ReleaseReason::NoShow => "no_show",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub reason: ReleaseReason,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationAttrs {
    pub plate_number: Option<String>,
}

impl ReservationAttrs {
    pub fn plate(plate: impl Into<String>) -> Self {
        Self {
            plate_number: Some(plate.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub principal: PrincipalId,
    pub spot_id: SpotId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub active: bool,
    pub plate_number: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Correlation token of the external payment that produced this reservation.
    pub payment_token: Option<String>,
    /// First observed arrival at the spot. Absent means a potential no-show.
    pub arrived_at: Option<DateTime<Utc>>,
    pub reminded: bool,
    pub released: Option<Release>,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span::new(to_ms(self.start), to_ms(self.end))
    }
}

/// Who is asking for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub principal: PrincipalId,
    pub admin: bool,
}

impl Requester {
    pub fn user(principal: PrincipalId) -> Self {
        Self { principal, admin: false }
    }

    pub fn admin(principal: PrincipalId) -> Self {
        Self { principal, admin: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupKey {
    Id(ReservationId),
    Token(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckoutState {
    Pending,
    Confirmed(ReservationId),
    /// The slot was claimed before payment confirmed; the payment must be refunded.
    Rejected { conflicting: ReservationId },
}

/// Pending half of a deferred (pay-first) reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkout {
    pub token: String,
    pub spot_id: SpotId,
    pub principal: PrincipalId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attrs: ReservationAttrs,
    /// Quoted price in minor currency units.
    pub amount_minor: u64,
    pub opened_at: DateTime<Utc>,
    pub state: CheckoutState,
}

/// Index entry for one active reservation on a spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub reservation_id: ReservationId,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct SpotState {
    pub spot: Spot,
    /// Set on reserve, cleared on release once no active reservation remains.
    pub occupied: bool,
    /// Active reservations only, sorted by `span.start`.
    pub slots: Vec<Slot>,
    /// Set when the spot is deleted; writers that raced the delete must back off.
    pub retired: bool,
}

impl SpotState {
    pub fn new(spot: Spot) -> Self {
        Self {
            spot,
            occupied: false,
            slots: Vec::new(),
            retired: false,
        }
    }

    /// Insert a slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, reservation_id: ReservationId) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.reservation_id == reservation_id)?;
        Some(self.slots.remove(pos))
    }

    /// Return only slots whose span overlaps the query window.
    /// Uses binary search to skip slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    pub fn has_active(&self) -> bool {
        !self.slots.is_empty()
    }
}

/// WAL record format. Flat, one variant per ledger transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ZoneCreated {
        zone: Zone,
        /// Highest spot label ever issued in the zone.
        label_watermark: u32,
    },
    ZoneDeleted {
        id: ZoneId,
    },
    SpotCreated {
        spot: Spot,
    },
    SpotDeleted {
        id: SpotId,
        zone_id: ZoneId,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ArrivalRecorded {
        id: ReservationId,
        spot_id: SpotId,
        at: DateTime<Utc>,
    },
    ReminderSent {
        id: ReservationId,
        spot_id: SpotId,
    },
    ReservationReleased {
        id: ReservationId,
        spot_id: SpotId,
        reason: ReleaseReason,
        at: DateTime<Utc>,
    },
    SpotReleased {
        spot_id: SpotId,
    },
    CheckoutOpened {
        checkout: Checkout,
    },
    CheckoutResolved {
        token: String,
        state: CheckoutState,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneOccupancy {
    pub zone_id: ZoneId,
    pub spots: usize,
    pub occupied: usize,
    pub available: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dashboard {
    pub zones: usize,
    pub spots: usize,
    pub occupied: usize,
    pub available: usize,
    pub starting_today: usize,
}
