use tokio::sync::oneshot;

use crate::model::*;

use super::{Ledger, LedgerError, WalCommand};

impl Ledger {
    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Holds the registry lock, the checkout lock and every spot's read lock
    /// until the compacted file is in place, so no committed event can fall
    /// between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), LedgerError> {
        let _registry = self.registry_lock.lock().await;
        let _checkouts = self.checkout_lock.lock().await;

        let mut handles: Vec<(SpotId, _)> = self.spots.iter().map(|e| (*e.key(), e.value().clone())).collect();
        handles.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(handles.len());
        for (_, handle) in &handles {
            guards.push(handle.clone().read_owned().await);
        }

        let mut events = Vec::new();
        for zs in self.zones.iter() {
            events.push(Event::ZoneCreated {
                zone: zs.zone.clone(),
                label_watermark: zs.label_watermark,
            });
        }
        for guard in &guards {
            events.push(Event::SpotCreated {
                spot: guard.spot.clone(),
            });
        }
        // Full records, active and past; records of deleted spots replay as audit entries.
        let mut reservations: Vec<Reservation> = self.reservations.iter().map(|r| r.clone()).collect();
        reservations.sort_by_key(|r| r.id);
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationCreated { reservation }),
        );
        events.extend(self.checkouts.iter().map(|c| Event::CheckoutOpened { checkout: c.clone() }));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| LedgerError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Wal(e.to_string()))?;
        drop(guards);

        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
