use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::*;

const CHANNEL_CAPACITY: usize = 256;

/// Outbound lifecycle notices for the notification service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    Created { reservation: Reservation },
    Confirmed { reservation: Reservation, token: String },
    Released {
        reservation_id: ReservationId,
        spot_id: SpotId,
        principal: PrincipalId,
        reason: ReleaseReason,
    },
    EndingSoon { reservation: Reservation },
}

impl Notice {
    pub fn spot_id(&self) -> SpotId {
        match self {
            Notice::Created { reservation }
            | Notice::Confirmed { reservation, .. }
            | Notice::EndingSoon { reservation } => reservation.spot_id,
            Notice::Released { spot_id, .. } => *spot_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Notice::Created { .. } => "created",
            Notice::Confirmed { .. } => "confirmed",
            Notice::Released { .. } => "released",
            Notice::EndingSoon { .. } => "ending_soon",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Broadcast hub: one firehose for the delivery dispatcher, plus per-spot
/// channels for anyone watching a single spot. Sending never blocks.
pub struct NotifyHub {
    all: broadcast::Sender<Notice>,
    per_spot: DashMap<SpotId, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            per_spot: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notice> {
        self.all.subscribe()
    }

    /// Subscribe to notices for one spot. Creates the channel if needed.
    pub fn subscribe(&self, spot_id: SpotId) -> broadcast::Receiver<Notice> {
        self.per_spot
            .entry(spot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a notice. No-op if nobody is listening.
    pub fn send(&self, notice: Notice) {
        if let Some(sender) = self.per_spot.get(&notice.spot_id()) {
            let _ = sender.send(notice.clone());
        }
        let _ = self.all.send(notice);
    }

    /// Drop a spot's channel (e.g. when the spot is deleted).
    pub fn remove(&self, spot_id: &SpotId) {
        self.per_spot.remove(spot_id);
    }
}
