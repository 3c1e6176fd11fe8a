mod availability;
mod compact;
mod conflict;
mod error;
mod queries;
mod registry;
mod reservations;

pub use availability::{merge_overlapping, subtract_intervals};
pub use error::LedgerError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

use crate::config::Tariff;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSpotState = Arc<RwLock<SpotState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Records committed together under one fsync.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task owning the WAL. Appends that queue up while a flush is in
/// progress are written together and share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                WalCommand::Append { events, response } => {
                    let mut batch = vec![(events, response)];
                    loop {
                        match rx.try_recv() {
                            Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                            Ok(other) => {
                                next = Some(other);
                                break;
                            }
                            Err(_) => break,
                        }
                    }
                    commit_batch(&mut wal, batch);
                }
                WalCommand::Compact { events, response } => {
                    let result = Wal::write_compact_file(wal.path(), &events)
                        .and_then(|()| wal.swap_compact_file());
                    let _ = response.send(result);
                }
                WalCommand::AppendsSinceCompact { response } => {
                    let _ = response.send(wal.appends_since_compact());
                }
            }
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    // One write for the whole group; a failure leaves none of it on disk.
    let result = wal.append_batch(batch.iter().flat_map(|(events, _)| events));
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

pub(super) struct ZoneState {
    pub zone: Zone,
    pub label_watermark: u32,
    pub spots: Vec<SpotId>,
}

/// The reservation ledger: source of truth for zones, spots, reservations and
/// pending checkouts.
///
/// Each spot's active reservations live behind their own `RwLock`; the
/// conflict check and insert for a spot run under its write lock, so
/// contention is per spot and never global.
pub struct Ledger {
    pub(super) zones: DashMap<ZoneId, ZoneState>,
    pub(super) spots: DashMap<SpotId, SharedSpotState>,
    pub(super) reservations: DashMap<ReservationId, Reservation>,
    /// Payment correlation token → reservation created from it.
    pub(super) tokens: DashMap<String, ReservationId>,
    pub(super) checkouts: DashMap<String, Checkout>,
    /// Serializes structural registry changes (label allocation, deletes).
    pub(super) registry_lock: Mutex<()>,
    /// Held across a checkout's WAL append and map update.
    pub(super) checkout_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) tariff: Tariff,
    pub notify: Arc<NotifyHub>,
}

/// Apply a spot-scoped event (caller holds the spot's write lock).
pub(super) fn apply_to_spot(
    ss: &mut SpotState,
    event: &Event,
    reservations: &DashMap<ReservationId, Reservation>,
    tokens: &DashMap<String, ReservationId>,
) {
    match event {
        Event::ReservationCreated { reservation } => {
            if let Some(token) = &reservation.payment_token {
                tokens.insert(token.clone(), reservation.id);
            }
            if reservation.active {
                ss.insert_slot(Slot {
                    reservation_id: reservation.id,
                    span: reservation.span(),
                });
                ss.occupied = true;
            }
            reservations.insert(reservation.id, reservation.clone());
        }
        Event::ArrivalRecorded { id, at, .. } => {
            if let Some(mut r) = reservations.get_mut(id)
                && r.arrived_at.is_none()
            {
                r.arrived_at = Some(*at);
            }
        }
        Event::ReminderSent { id, .. } => {
            if let Some(mut r) = reservations.get_mut(id) {
                r.reminded = true;
            }
        }
        Event::ReservationReleased { id, reason, at, .. } => {
            if let Some(mut r) = reservations.get_mut(id) {
                r.active = false;
                r.released = Some(Release { reason: *reason, at: *at });
            }
            ss.remove_slot(*id);
        }
        Event::SpotReleased { .. } => ss.occupied = false,
        Event::ZoneCreated { .. }
        | Event::ZoneDeleted { .. }
        | Event::SpotCreated { .. }
        | Event::SpotDeleted { .. }
        | Event::CheckoutOpened { .. }
        | Event::CheckoutResolved { .. } => {}
    }
}

/// Spot an event is scoped to, for the events `apply_to_spot` handles.
fn event_spot_id(event: &Event) -> Option<SpotId> {
    match event {
        Event::ReservationCreated { reservation } => Some(reservation.spot_id),
        Event::ArrivalRecorded { spot_id, .. }
        | Event::ReminderSent { spot_id, .. }
        | Event::ReservationReleased { spot_id, .. }
        | Event::SpotReleased { spot_id } => Some(*spot_id),
        _ => None,
    }
}

impl Ledger {
    /// Open the ledger, replaying the WAL at `wal_path`. Must run inside a Tokio runtime.
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let ledger = Self {
            zones: DashMap::new(),
            spots: DashMap::new(),
            reservations: DashMap::new(),
            tokens: DashMap::new(),
            checkouts: DashMap::new(),
            registry_lock: Mutex::new(()),
            checkout_lock: Mutex::new(()),
            wal_tx,
            tariff: Tariff::default(),
            notify,
        };

        // Replay into plain values first; nothing else can observe them yet.
        let mut spot_states: HashMap<SpotId, SpotState> = HashMap::new();
        for event in &events {
            match event {
                Event::ZoneCreated { zone, label_watermark } => {
                    ledger.zones.insert(
                        zone.id,
                        ZoneState {
                            zone: zone.clone(),
                            label_watermark: *label_watermark,
                            spots: Vec::new(),
                        },
                    );
                }
                Event::ZoneDeleted { id } => {
                    if let Some((_, zs)) = ledger.zones.remove(id) {
                        for sid in zs.spots {
                            spot_states.remove(&sid);
                        }
                    }
                }
                Event::SpotCreated { spot } => {
                    if let Some(mut zs) = ledger.zones.get_mut(&spot.zone_id) {
                        zs.label_watermark = zs.label_watermark.max(spot.label);
                        zs.spots.push(spot.id);
                        spot_states.insert(spot.id, SpotState::new(spot.clone()));
                    }
                }
                Event::SpotDeleted { id, zone_id } => {
                    if let Some(mut zs) = ledger.zones.get_mut(zone_id) {
                        zs.spots.retain(|s| s != id);
                    }
                    spot_states.remove(id);
                }
                Event::CheckoutOpened { checkout } => {
                    ledger.checkouts.insert(checkout.token.clone(), checkout.clone());
                }
                Event::CheckoutResolved { token, state } => {
                    if let Some(mut c) = ledger.checkouts.get_mut(token) {
                        c.state = state.clone();
                    }
                }
                other => match event_spot_id(other).and_then(|sid| spot_states.get_mut(&sid)) {
                    Some(ss) => apply_to_spot(ss, other, &ledger.reservations, &ledger.tokens),
                    None => {
                        // Spot is gone; keep the audit record anyway.
                        if let Event::ReservationCreated { reservation } = other {
                            if let Some(token) = &reservation.payment_token {
                                ledger.tokens.insert(token.clone(), reservation.id);
                            }
                            ledger.reservations.insert(reservation.id, reservation.clone());
                        }
                    }
                },
            }
        }
        for (id, ss) in spot_states {
            ledger.spots.insert(id, Arc::new(RwLock::new(ss)));
        }

        tracing::info!(
            "ledger opened: {} zones, {} spots, {} reservations replayed from {} events",
            ledger.zones.len(),
            ledger.spots.len(),
            ledger.reservations.len(),
            events.len()
        );
        Ok(ledger)
    }

    /// Replace the tariff used to quote checkouts.
    pub fn with_tariff(mut self, tariff: Tariff) -> Self {
        self.tariff = tariff;
        self
    }

    /// Write an event via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), LedgerError> {
        self.wal_append_all(vec![event.clone()]).await
    }

    /// Write several events as one commit.
    pub(super) async fn wal_append_all(&self, events: Vec<Event>) -> Result<(), LedgerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| LedgerError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Wal(e.to_string()))
    }

    /// WAL-append then apply to the locked spot.
    pub(super) async fn persist_and_apply(
        &self,
        ss: &mut SpotState,
        event: &Event,
    ) -> Result<(), LedgerError> {
        self.wal_append(event).await?;
        apply_to_spot(ss, event, &self.reservations, &self.tokens);
        Ok(())
    }

    pub(super) fn spot_handle(&self, id: &SpotId) -> Result<SharedSpotState, LedgerError> {
        self.spots
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| LedgerError::spot_not_found(*id))
    }

    /// Resolve a reservation to its spot and take that spot's write lock.
    pub(super) async fn lock_reservation_spot(
        &self,
        id: &ReservationId,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<SpotState>, LedgerError> {
        let spot_id = self
            .reservations
            .get(id)
            .map(|r| r.spot_id)
            .ok_or_else(|| LedgerError::reservation_not_found(id))?;
        let handle = self.spot_handle(&spot_id)?;
        Ok(handle.write_owned().await)
    }

    pub fn spot_count(&self) -> usize {
        self.spots.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }
}

pub(crate) fn now() -> chrono::DateTime<chrono::Utc> {
    normalize(chrono::Utc::now())
}
