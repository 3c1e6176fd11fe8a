use chrono::{DateTime, Utc};

use crate::model::*;

use super::{Ledger, LedgerError};

fn newest_first(mut rs: Vec<Reservation>) -> Vec<Reservation> {
    rs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    rs
}

impl Ledger {
    /// Find a reservation by id or by the payment token that created it.
    pub fn lookup(&self, key: &LookupKey) -> Result<Reservation, LedgerError> {
        match key {
            LookupKey::Id(id) => self.snapshot(id),
            LookupKey::Token(token) => self
                .reservation_for_token(token)
                .ok_or_else(|| LedgerError::reservation_not_found(format!("token {token}"))),
        }
    }

    pub fn checkout(&self, token: &str) -> Result<Checkout, LedgerError> {
        self.checkouts
            .get(token)
            .map(|c| c.clone())
            .ok_or_else(|| LedgerError::NotFound {
                entity: "checkout",
                id: token.to_string(),
            })
    }

    /// A principal's reservations, active and past, newest first.
    pub fn reservations_for(&self, principal: PrincipalId) -> Vec<Reservation> {
        newest_first(
            self.reservations
                .iter()
                .filter(|r| r.principal == principal)
                .map(|r| r.clone())
                .collect(),
        )
    }

    pub fn all_reservations(&self) -> Vec<Reservation> {
        newest_first(self.reservations.iter().map(|r| r.clone()).collect())
    }

    pub fn get_zone(&self, id: &ZoneId) -> Option<Zone> {
        self.zones.get(id).map(|zs| zs.zone.clone())
    }

    pub fn list_zones(&self) -> Vec<Zone> {
        let mut zones: Vec<Zone> = self.zones.iter().map(|zs| zs.zone.clone()).collect();
        zones.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        zones
    }

    /// Spots of one zone, or of every zone, ordered by zone then label.
    pub async fn list_spots(&self, zone_id: Option<ZoneId>) -> Result<Vec<Spot>, LedgerError> {
        let ids: Vec<SpotId> = match zone_id {
            Some(zid) => self
                .zones
                .get(&zid)
                .map(|zs| zs.spots.clone())
                .ok_or_else(|| LedgerError::zone_not_found(zid))?,
            None => self.spots.iter().map(|e| *e.key()).collect(),
        };

        let mut spots = Vec::with_capacity(ids.len());
        for id in &ids {
            let Ok(handle) = self.spot_handle(id) else { continue };
            spots.push(handle.read().await.spot.clone());
        }
        spots.sort_by_key(|s| (s.zone_id, s.label));
        Ok(spots)
    }

    pub async fn is_occupied(&self, spot_id: SpotId) -> Result<bool, LedgerError> {
        let handle = self.spot_handle(&spot_id)?;
        let occupied = handle.read().await.occupied;
        Ok(occupied)
    }

    pub async fn dashboard(&self, now: DateTime<Utc>) -> Dashboard {
        let handles: Vec<_> = self.spots.iter().map(|e| e.value().clone()).collect();
        let mut occupied = 0;
        for handle in &handles {
            if handle.read().await.occupied {
                occupied += 1;
            }
        }
        let today = now.date_naive();
        let starting_today = self
            .reservations
            .iter()
            .filter(|r| r.start.date_naive() == today)
            .count();

        Dashboard {
            zones: self.zones.len(),
            spots: handles.len(),
            occupied,
            available: handles.len() - occupied,
            starting_today,
        }
    }

    // ── Sweep candidates ─────────────────────────────────────────
    // Unlocked snapshots. The sweeper re-checks each rule under the spot lock.

    fn active_where(&self, pred: impl Fn(&Reservation) -> bool) -> Vec<ReservationId> {
        let mut hits: Vec<(DateTime<Utc>, ReservationId)> = self
            .reservations
            .iter()
            .filter(|r| r.active && pred(r))
            .map(|r| (r.end, r.id))
            .collect();
        hits.sort();
        hits.into_iter().map(|(_, id)| id).collect()
    }

    pub(crate) fn expired_candidates(&self, now: DateTime<Utc>) -> Vec<ReservationId> {
        self.active_where(|r| r.end <= now)
    }

    /// Started at or before `cutoff` with no arrival recorded.
    pub(crate) fn no_show_candidates(&self, cutoff: DateTime<Utc>) -> Vec<ReservationId> {
        self.active_where(|r| r.start <= cutoff && r.arrived_at.is_none())
    }

    pub(crate) fn reminder_candidates(&self, now: DateTime<Utc>, until: DateTime<Utc>) -> Vec<ReservationId> {
        self.active_where(|r| !r.reminded && now < r.end && r.end <= until)
    }

    /// Spots flagged occupied while holding no active reservation.
    pub(crate) async fn stale_occupied_spots(&self) -> Vec<SpotId> {
        let handles: Vec<_> = self.spots.iter().map(|e| e.value().clone()).collect();
        let mut stale = Vec::new();
        for handle in handles {
            let guard = handle.read().await;
            if guard.occupied && !guard.has_active() {
                stale.push(guard.spot.id);
            }
        }
        stale
    }
}
