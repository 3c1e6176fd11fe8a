use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Ledger, LedgerError, ZoneState};

fn validate_zone_meta(meta: &ZoneMeta) -> Result<(), LedgerError> {
    if meta.name.len() > MAX_NAME_LEN {
        return Err(LedgerError::LimitExceeded("zone name too long"));
    }
    if meta.district.as_ref().is_some_and(|d| d.len() > MAX_NAME_LEN) {
        return Err(LedgerError::LimitExceeded("district name too long"));
    }
    Ok(())
}

impl Ledger {
    pub async fn create_zone(&self, capacity: u32, meta: ZoneMeta) -> Result<Zone, LedgerError> {
        let (zone, _) = self.commit_zone(capacity, meta, 0).await?;
        Ok(zone)
    }

    /// Create a zone and fill it with `capacity` spots labelled `1..=capacity`.
    /// The zone and its spots are committed together or not at all.
    pub async fn seed_zone(&self, capacity: u32, meta: ZoneMeta) -> Result<(Zone, Vec<Spot>), LedgerError> {
        if capacity > MAX_BULK_GENERATE {
            return Err(LedgerError::LimitExceeded("bulk generate batch too large"));
        }
        if capacity as usize > MAX_SPOTS_PER_ZONE {
            return Err(LedgerError::LimitExceeded("too many spots in zone"));
        }
        self.commit_zone(capacity, meta, capacity).await
    }

    /// One WAL write: `ZoneCreated` followed by `spot_count` `SpotCreated` records.
    async fn commit_zone(
        &self,
        capacity: u32,
        meta: ZoneMeta,
        spot_count: u32,
    ) -> Result<(Zone, Vec<Spot>), LedgerError> {
        validate_zone_meta(&meta)?;
        let _registry = self.registry_lock.lock().await;
        if self.zones.len() >= MAX_ZONES {
            return Err(LedgerError::LimitExceeded("too many zones"));
        }

        let zone = Zone {
            id: Ulid::new(),
            name: meta.name,
            district: meta.district,
            capacity,
            location: meta.location,
        };
        let spots: Vec<Spot> = (1..=spot_count)
            .map(|label| Spot {
                id: Ulid::new(),
                zone_id: zone.id,
                label,
                accessible: false,
                location: zone.location,
                landmark_hint: None,
            })
            .collect();

        let mut events = Vec::with_capacity(spots.len() + 1);
        events.push(Event::ZoneCreated {
            zone: zone.clone(),
            label_watermark: 0,
        });
        events.extend(spots.iter().map(|spot| Event::SpotCreated { spot: spot.clone() }));
        self.wal_append_all(events).await?;

        for spot in &spots {
            self.spots.insert(spot.id, Arc::new(RwLock::new(SpotState::new(spot.clone()))));
        }
        self.zones.insert(
            zone.id,
            ZoneState {
                zone: zone.clone(),
                label_watermark: spot_count,
                spots: spots.iter().map(|s| s.id).collect(),
            },
        );
        tracing::info!(
            "zone {} created ({}, capacity {capacity}, {spot_count} spot(s))",
            zone.id,
            zone.name
        );
        Ok((zone, spots))
    }

    pub async fn create_spot(&self, zone_id: ZoneId, meta: SpotMeta) -> Result<Spot, LedgerError> {
        if meta.landmark_hint.as_ref().is_some_and(|h| h.len() > MAX_HINT_LEN) {
            return Err(LedgerError::LimitExceeded("landmark hint too long"));
        }
        let mut spots = self.append_spots(zone_id, vec![meta]).await?;
        spots.pop().ok_or_else(|| LedgerError::zone_not_found(zone_id))
    }

    /// Append `count` spots to the zone, numbered on from the zone's label
    /// high-water mark. Labels of deleted spots are never handed out again.
    /// New spots inherit the zone's location.
    pub async fn bulk_generate_spots(&self, zone_id: ZoneId, count: u32) -> Result<Vec<Spot>, LedgerError> {
        if count > MAX_BULK_GENERATE {
            return Err(LedgerError::LimitExceeded("bulk generate batch too large"));
        }
        let location = self
            .zones
            .get(&zone_id)
            .ok_or_else(|| LedgerError::zone_not_found(zone_id))?
            .zone
            .location;
        let metas = (0..count)
            .map(|_| SpotMeta {
                location,
                ..SpotMeta::default()
            })
            .collect();
        self.append_spots(zone_id, metas).await
    }

    async fn append_spots(&self, zone_id: ZoneId, metas: Vec<SpotMeta>) -> Result<Vec<Spot>, LedgerError> {
        let _registry = self.registry_lock.lock().await;
        let (watermark, existing) = {
            let zs = self
                .zones
                .get(&zone_id)
                .ok_or_else(|| LedgerError::zone_not_found(zone_id))?;
            (zs.label_watermark, zs.spots.len())
        };
        if existing + metas.len() > MAX_SPOTS_PER_ZONE {
            return Err(LedgerError::LimitExceeded("too many spots in zone"));
        }

        let spots: Vec<Spot> = metas
            .into_iter()
            .zip(watermark + 1..)
            .map(|(meta, label)| Spot {
                id: Ulid::new(),
                zone_id,
                label,
                accessible: meta.accessible,
                location: meta.location,
                landmark_hint: meta.landmark_hint,
            })
            .collect();
        if spots.is_empty() {
            return Ok(spots);
        }

        let events = spots.iter().map(|spot| Event::SpotCreated { spot: spot.clone() }).collect();
        self.wal_append_all(events).await?;

        for spot in &spots {
            self.spots.insert(spot.id, Arc::new(RwLock::new(SpotState::new(spot.clone()))));
        }
        if let Some(mut zs) = self.zones.get_mut(&zone_id) {
            zs.label_watermark = watermark + spots.len() as u32;
            zs.spots.extend(spots.iter().map(|s| s.id));
        }
        tracing::info!("{} spot(s) added to zone {zone_id}", spots.len());
        Ok(spots)
    }

    /// Remove a spot with no active reservations. Its past reservations stay on record.
    pub async fn delete_spot(&self, spot_id: SpotId) -> Result<(), LedgerError> {
        let _registry = self.registry_lock.lock().await;
        let handle = self.spot_handle(&spot_id)?;
        let mut guard = handle.write().await;
        if guard.has_active() {
            return Err(LedgerError::SpotInUse(spot_id));
        }
        let zone_id = guard.spot.zone_id;

        self.wal_append(&Event::SpotDeleted { id: spot_id, zone_id }).await?;
        guard.retired = true;
        self.spots.remove(&spot_id);
        if let Some(mut zs) = self.zones.get_mut(&zone_id) {
            zs.spots.retain(|s| *s != spot_id);
        }
        drop(guard);
        self.notify.remove(&spot_id);
        tracing::info!("spot {spot_id} deleted from zone {zone_id}");
        Ok(())
    }

    /// Remove a zone and every spot in it. Refused while any of its spots holds
    /// an active reservation.
    pub async fn delete_zone(&self, zone_id: ZoneId) -> Result<(), LedgerError> {
        let _registry = self.registry_lock.lock().await;
        let spot_ids = self
            .zones
            .get(&zone_id)
            .map(|zs| zs.spots.clone())
            .ok_or_else(|| LedgerError::zone_not_found(zone_id))?;

        // Hold every spot's write lock so no reserve can slip in between check and delete.
        let mut guards = Vec::with_capacity(spot_ids.len());
        let mut sorted = spot_ids.clone();
        sorted.sort();
        for sid in &sorted {
            if let Ok(handle) = self.spot_handle(sid) {
                let guard = handle.write_owned().await;
                if guard.has_active() {
                    return Err(LedgerError::ZoneInUse(zone_id));
                }
                guards.push(guard);
            }
        }

        self.wal_append(&Event::ZoneDeleted { id: zone_id }).await?;
        for guard in guards.iter_mut() {
            guard.retired = true;
        }
        for sid in &spot_ids {
            self.spots.remove(sid);
            self.notify.remove(sid);
        }
        self.zones.remove(&zone_id);
        drop(guards);
        tracing::info!("zone {zone_id} deleted with {} spot(s)", spot_ids.len());
        Ok(())
    }
}
