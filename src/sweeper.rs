use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::SweepPolicy;
use crate::ledger::{Ledger, LedgerError};
use crate::model::*;
use crate::observability::*;

/// Transition counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub no_shows: usize,
    pub reminders: usize,
    pub reconciled: usize,
}

impl SweepReport {
    /// State-changing transitions. Reminders only flag a record, so they count too.
    pub fn transitioned(&self) -> usize {
        self.expired + self.no_shows + self.reminders + self.reconciled
    }

    fn add(&mut self, other: &SweepReport) {
        self.expired += other.expired;
        self.no_shows += other.no_shows;
        self.reminders += other.reminders;
        self.reconciled += other.reconciled;
    }
}

/// Bookkeeping carried from one sweep to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepState {
    pub last_run: Option<DateTime<Utc>>,
    pub runs: u64,
    pub totals: SweepReport,
}

/// Applies the expiration rules to the ledger. Every run recomputes its work
/// from current state, so running twice in a row is harmless.
pub struct Sweeper {
    ledger: Arc<Ledger>,
    policy: SweepPolicy,
    state: SweepState,
}

fn log_skip(rule: &'static str, id: ReservationId, e: &LedgerError) {
    if e.is_recoverable() {
        tracing::debug!("sweep {rule} skip {id}: {e}");
    } else {
        tracing::warn!("sweep {rule} failed on {id}: {e}");
        metrics::counter!(SWEEP_ERRORS_TOTAL, "rule" => rule).increment(1);
    }
}

impl Sweeper {
    pub fn new(ledger: Arc<Ledger>, policy: SweepPolicy, state: SweepState) -> Self {
        Self { ledger, policy, state }
    }

    pub fn state(&self) -> &SweepState {
        &self.state
    }

    pub async fn sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        let now = normalize(now);
        let started = std::time::Instant::now();
        let mut report = SweepReport::default();

        for id in self.ledger.expired_candidates(now) {
            match self
                .ledger
                .release_if(id, ReleaseReason::Expired, now, |r| r.end <= now)
                .await
            {
                Ok(Some(_)) => {
                    info!("reservation {id} expired");
                    report.expired += 1;
                }
                Ok(None) => tracing::debug!("sweep expiry skip {id}: no longer due"),
                Err(e) => log_skip("expiry", id, &e),
            }
        }

        let cutoff = now - self.policy.no_show_grace;
        for id in self.ledger.no_show_candidates(cutoff) {
            let due = |r: &Reservation| r.start <= cutoff && r.arrived_at.is_none();
            match self.ledger.release_if(id, ReleaseReason::NoShow, now, due).await {
                Ok(Some(_)) => {
                    info!("reservation {id} released as no-show");
                    report.no_shows += 1;
                }
                Ok(None) => tracing::debug!("sweep no-show skip {id}: no longer due"),
                Err(e) => log_skip("no_show", id, &e),
            }
        }

        for id in self.ledger.reminder_candidates(now, now + self.policy.reminder_window) {
            match self.ledger.mark_reminded(id).await {
                Ok(Some(_)) => report.reminders += 1,
                Ok(None) => tracing::debug!("sweep reminder skip {id}: already handled"),
                Err(e) => log_skip("reminder", id, &e),
            }
        }

        for spot_id in self.ledger.stale_occupied_spots().await {
            match self.ledger.reconcile_spot(spot_id).await {
                Ok(true) => report.reconciled += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("sweep reconcile failed on spot {spot_id}: {e}");
                    metrics::counter!(SWEEP_ERRORS_TOTAL, "rule" => "reconcile").increment(1);
                }
            }
        }

        metrics::histogram!(SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        for (rule, n) in [
            ("expiry", report.expired),
            ("no_show", report.no_shows),
            ("reminder", report.reminders),
            ("reconcile", report.reconciled),
        ] {
            if n > 0 {
                metrics::counter!(SWEEP_TRANSITIONS_TOTAL, "rule" => rule).increment(n as u64);
            }
        }

        self.state.last_run = Some(now);
        self.state.runs += 1;
        self.state.totals.add(&report);
        if report.transitioned() > 0 {
            info!(
                "sweep #{}: {} expired, {} no-shows, {} reminders, {} reconciled",
                self.state.runs, report.expired, report.no_shows, report.reminders, report.reconciled
            );
        }
        report
    }
}

/// Background task running a sweep every `period`.
pub async fn run_sweeper(mut sweeper: Sweeper, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        sweeper.sweep(Utc::now()).await;
    }
}

/// Background task compacting the WAL once `threshold` appends accumulate.
pub async fn run_compactor(ledger: Arc<Ledger>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = ledger.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = ledger.compact_wal().await {
            tracing::error!("WAL compaction failed after {appends} appends: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyHub;
    use chrono::{TimeDelta, TimeZone};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkledger_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
    }

    async fn ledger_with_spot(name: &str) -> (Arc<Ledger>, SpotId) {
        let ledger = Arc::new(Ledger::open(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap());
        let (_, spots) = ledger
            .seed_zone(1, ZoneMeta {
                name: "Moda".into(),
                ..ZoneMeta::default()
            })
            .await
            .unwrap();
        (ledger, spots[0].id)
    }

    #[tokio::test]
    async fn expired_reservation_released() {
        let (ledger, spot) = ledger_with_spot("expire.wal").await;
        let r = ledger
            .reserve(spot, Ulid::new(), t0(), t0() + TimeDelta::hours(1), ReservationAttrs::default())
            .await
            .unwrap();

        let mut sweeper = Sweeper::new(ledger.clone(), SweepPolicy::default(), SweepState::default());
        let report = sweeper.sweep(t0() + TimeDelta::hours(1)).await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.no_shows, 0);

        let after = ledger.lookup(&LookupKey::Id(r.id)).unwrap();
        assert!(!after.active);
        assert_eq!(after.released.unwrap().reason, ReleaseReason::Expired);
        assert!(!ledger.is_occupied(spot).await.unwrap());
    }

    #[tokio::test]
    async fn no_show_after_grace() {
        let (ledger, spot) = ledger_with_spot("no_show.wal").await;
        let r = ledger
            .reserve(spot, Ulid::new(), t0(), t0() + TimeDelta::hours(3), ReservationAttrs::default())
            .await
            .unwrap();

        let mut sweeper = Sweeper::new(ledger.clone(), SweepPolicy::default(), SweepState::default());
        // Inside the grace period nothing happens.
        assert_eq!(sweeper.sweep(t0() + TimeDelta::minutes(29)).await.transitioned(), 0);

        let report = sweeper.sweep(t0() + TimeDelta::minutes(30)).await;
        assert_eq!(report.no_shows, 1);
        let after = ledger.lookup(&LookupKey::Id(r.id)).unwrap();
        assert_eq!(after.released.unwrap().reason, ReleaseReason::NoShow);
    }

    #[tokio::test]
    async fn arrival_prevents_no_show() {
        let (ledger, spot) = ledger_with_spot("arrived.wal").await;
        ledger
            .reserve(spot, Ulid::new(), t0(), t0() + TimeDelta::hours(3), ReservationAttrs::plate("34ABC123"))
            .await
            .unwrap();
        ledger.record_arrival("34abc123", t0() + TimeDelta::minutes(5)).await.unwrap();

        let mut sweeper = Sweeper::new(ledger.clone(), SweepPolicy::default(), SweepState::default());
        assert_eq!(sweeper.sweep(t0() + TimeDelta::hours(1)).await.transitioned(), 0);
        assert!(ledger.is_occupied(spot).await.unwrap());
    }

    #[tokio::test]
    async fn reminder_sent_once() {
        let (ledger, spot) = ledger_with_spot("reminder.wal").await;
        let mut rx = ledger.notify.subscribe_all();
        let r = ledger
            .reserve(spot, Ulid::new(), t0(), t0() + TimeDelta::hours(1), ReservationAttrs::plate("06XY42"))
            .await
            .unwrap();
        ledger.record_arrival("06XY42", t0()).await.unwrap();
        let _created = rx.recv().await.unwrap();

        let mut sweeper = Sweeper::new(ledger.clone(), SweepPolicy::default(), SweepState::default());
        let report = sweeper.sweep(t0() + TimeDelta::minutes(52)).await;
        assert_eq!(report.reminders, 1);
        assert!(matches!(rx.recv().await.unwrap(), crate::notify::Notice::EndingSoon { reservation } if reservation.id == r.id));

        let again = sweeper.sweep(t0() + TimeDelta::minutes(55)).await;
        assert_eq!(again.reminders, 0);
        assert!(ledger.lookup(&LookupKey::Id(r.id)).unwrap().reminded);
    }

    #[tokio::test]
    async fn sweep_is_idempotent_and_tracks_state() {
        let (ledger, spot) = ledger_with_spot("idempotent.wal").await;
        ledger
            .reserve(spot, Ulid::new(), t0(), t0() + TimeDelta::hours(1), ReservationAttrs::default())
            .await
            .unwrap();

        let injected = SweepState {
            runs: 41,
            ..SweepState::default()
        };
        let mut sweeper = Sweeper::new(ledger.clone(), SweepPolicy::default(), injected);
        let now = t0() + TimeDelta::hours(2);
        let first = sweeper.sweep(now).await;
        let snapshot = ledger.all_reservations();
        let second = sweeper.sweep(now).await;

        assert_eq!(first.transitioned(), 1);
        assert_eq!(second, SweepReport::default());
        assert_eq!(ledger.all_reservations(), snapshot);
        assert_eq!(sweeper.state().runs, 43);
        assert_eq!(sweeper.state().last_run, Some(now));
        assert_eq!(sweeper.state().totals.expired, 1);
    }

    #[tokio::test]
    async fn empty_ledger_sweeps_clean() {
        let ledger = Arc::new(Ledger::open(test_wal_path("empty.wal"), Arc::new(NotifyHub::new())).unwrap());
        let mut sweeper = Sweeper::new(ledger, SweepPolicy::default(), SweepState::default());
        assert_eq!(sweeper.sweep(t0()).await, SweepReport::default());
    }
}
