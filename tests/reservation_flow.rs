use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use tokio_test::assert_ok;
use ulid::Ulid;

use parkledger::config::{LedgerConfig, SweepPolicy};
use parkledger::gateway::{
    GatewayError, NotificationSink, PaymentConfirmation, PaymentGateway, Settlement, run_dispatcher, settle_payment,
};
use parkledger::ledger::{Ledger, LedgerError};
use parkledger::model::*;
use parkledger::notify::{Notice, NotifyHub};
use parkledger::sweeper::{SweepReport, SweepState, Sweeper};

// ── Test infrastructure ──────────────────────────────────────

fn data_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("parkledger_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 15, 8, 0, 0).unwrap()
}

#[derive(Default)]
struct Gateway {
    refunds: Mutex<Vec<String>>,
}

#[async_trait]
impl PaymentGateway for Gateway {
    async fn refund(&self, token: &str, _reason: &str) -> Result<(), GatewayError> {
        self.refunds.lock().unwrap().push(token.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct Inbox {
    notices: Mutex<Vec<Notice>>,
}

#[async_trait]
impl NotificationSink for Inbox {
    fn name(&self) -> &str {
        "inbox"
    }

    async fn deliver(&self, notice: &Notice) -> Result<(), GatewayError> {
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

// ── Flows ────────────────────────────────────────────────────

#[tokio::test]
async fn pay_first_day_in_the_life() {
    let config = LedgerConfig {
        data_dir: data_dir(),
        ..LedgerConfig::default()
    };
    let hub = Arc::new(NotifyHub::new());
    let inbox = Arc::new(Inbox::default());
    let sinks: Vec<Arc<dyn NotificationSink>> = vec![inbox.clone()];
    let dispatcher = tokio::spawn(run_dispatcher(hub.subscribe_all(), sinks));

    let ledger = Arc::new(Ledger::open(config.wal_path(), hub.clone()).unwrap().with_tariff(config.tariff.clone()));
    let (zone, spots) = ledger
        .seed_zone(2, ZoneMeta {
            name: "Bağdat Avenue".into(),
            district: Some("Kadıköy".into()),
            location: None,
        })
        .await
        .unwrap();

    let driver = Ulid::new();
    let start = morning() + TimeDelta::hours(1);
    let end = start + TimeDelta::hours(2);
    let free = ledger.find_available_in_zone(zone.id, start, end).await.unwrap();
    assert_eq!(free.len(), 2);

    // Open a checkout, then the gateway reports the payment twice.
    let checkout = ledger
        .open_checkout(free[0].id, driver, start, end, ReservationAttrs::plate("34PRK01"))
        .await
        .unwrap();
    let gateway = Gateway::default();
    let confirmation = PaymentConfirmation {
        token: checkout.token.clone(),
        spot_id: checkout.spot_id,
        principal: driver,
        start,
        end,
        attrs: checkout.attrs.clone(),
    };
    let Settlement::Reserved(reservation) = settle_payment(&ledger, &gateway, confirmation.clone()).await.unwrap() else {
        panic!("expected a reservation");
    };
    assert_eq!(settle_payment(&ledger, &gateway, confirmation).await.unwrap(), Settlement::Reserved(reservation.clone()));
    assert!(gateway.refunds.lock().unwrap().is_empty());

    // A rival payment for an overlapping window on the same spot is refunded.
    let rival = PaymentConfirmation {
        token: "cs_rival".into(),
        spot_id: spots[0].id,
        principal: Ulid::new(),
        start: start + TimeDelta::minutes(30),
        end: end + TimeDelta::minutes(30),
        attrs: ReservationAttrs::default(),
    };
    assert_eq!(free[0].id, spots[0].id);
    assert!(matches!(
        settle_payment(&ledger, &gateway, rival).await.unwrap(),
        Settlement::Refunded { conflicting } if conflicting == reservation.id
    ));
    assert_eq!(*gateway.refunds.lock().unwrap(), vec!["cs_rival".to_string()]);

    // Driver shows up, the reminder goes out, then the reservation runs out.
    ledger.record_arrival("34prk01", start + TimeDelta::minutes(7)).await.unwrap();
    let mut sweeper = Sweeper::new(ledger.clone(), SweepPolicy::default(), SweepState::default());
    assert_eq!(sweeper.sweep(start + TimeDelta::minutes(45)).await, SweepReport::default());
    assert_eq!(sweeper.sweep(end - TimeDelta::minutes(5)).await.reminders, 1);
    assert_eq!(sweeper.sweep(end).await.expired, 1);
    assert!(!ledger.is_occupied(reservation.spot_id).await.unwrap());

    drop(sweeper);
    drop(ledger);
    drop(hub);
    dispatcher.await.unwrap();

    let kinds: Vec<&str> = inbox.notices.lock().unwrap().iter().map(|n| n.label()).collect();
    assert_eq!(kinds, vec!["confirmed", "ending_soon", "released"]);
}

#[tokio::test]
async fn state_survives_restart_and_sweep_is_repeatable() {
    let dir = data_dir();
    let wal = dir.join("ledger.wal");
    let driver = Ulid::new();

    let spot_id = {
        let ledger = Ledger::open(wal.clone(), Arc::new(NotifyHub::new())).unwrap();
        let (_, spots) = ledger.seed_zone(1, ZoneMeta::default()).await.unwrap();
        ledger
            .reserve(spots[0].id, driver, morning(), morning() + TimeDelta::hours(4), ReservationAttrs::default())
            .await
            .unwrap();
        spots[0].id
    };

    let ledger = Arc::new(Ledger::open(wal.clone(), Arc::new(NotifyHub::new())).unwrap());
    assert!(matches!(
        ledger
            .reserve(spot_id, Ulid::new(), morning() + TimeDelta::hours(1), morning() + TimeDelta::hours(2), ReservationAttrs::default())
            .await,
        Err(LedgerError::Conflict(_))
    ));

    // Nobody arrived: released as a no-show once the grace period passes.
    let mut sweeper = Sweeper::new(ledger.clone(), SweepPolicy::default(), SweepState::default());
    let now = morning() + TimeDelta::minutes(31);
    assert_eq!(sweeper.sweep(now).await.no_shows, 1);
    assert_eq!(sweeper.sweep(now).await.transitioned(), 0);
    assert_ok!(
        ledger
            .reserve(spot_id, Ulid::new(), morning() + TimeDelta::hours(1), morning() + TimeDelta::hours(2), ReservationAttrs::default())
            .await
    );

    let history = ledger.reservations_for(driver);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].released.map(|r| r.reason), Some(ReleaseReason::NoShow));
}
