use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use ulid::Ulid;

use parkledger::config::SweepPolicy;
use parkledger::ledger::{Ledger, LedgerError};
use parkledger::model::*;
use parkledger::notify::NotifyHub;
use parkledger::sweeper::{SweepState, Sweeper};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
}

fn hour(i: i64) -> DateTime<Utc> {
    base() + TimeDelta::hours(i)
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn open_ledger(name: &str) -> Arc<Ledger> {
    let dir = std::env::temp_dir().join("parkledger_bench");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}_{}.wal", Ulid::new()));
    Arc::new(Ledger::open(path, Arc::new(NotifyHub::new())).unwrap())
}

async fn seed(ledger: &Ledger, spots: u32) -> Vec<Spot> {
    let (_, spots) = ledger
        .seed_zone(spots, ZoneMeta {
            name: "Bench".into(),
            ..ZoneMeta::default()
        })
        .await
        .unwrap();
    spots
}

async fn phase1_sequential() {
    let ledger = open_ledger("sequential");
    let spot = seed(&ledger, 1).await[0].id;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n as i64 {
        let t = Instant::now();
        ledger
            .reserve(spot, Ulid::new(), hour(i), hour(i + 1), ReservationAttrs::default())
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("reserve latency", &mut latencies);
}

async fn phase2_concurrent_spots() {
    let ledger = open_ledger("concurrent");
    let spots = seed(&ledger, 50).await;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();
    for spot in &spots {
        let ledger = ledger.clone();
        let spot = spot.id;
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                ledger
                    .reserve(spot, Ulid::new(), hour(j), hour(j + 1), ReservationAttrs::default())
                    .await
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = spots.len() as i64 * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {} spots x {n_per_task} reservations = {total} total in {:.2}s = {ops:.0} ops/sec",
        spots.len(),
        elapsed.as_secs_f64()
    );
}

async fn phase3_contended_spot() {
    let ledger = open_ledger("contended");
    let spot = seed(&ledger, 1).await[0].id;
    let n_tasks = 64;
    let attempts = 50;

    let won = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let ledger = ledger.clone();
        let won = won.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..attempts {
                match ledger
                    .reserve(spot, Ulid::new(), hour(j), hour(j + 1), ReservationAttrs::default())
                    .await
                {
                    Ok(_) => won.fetch_add(1, Ordering::Relaxed),
                    Err(LedgerError::Conflict(_)) => conflicts.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let won = won.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks racing for {attempts} slots: {won} won, {} conflicts in {:.2}s",
        conflicts.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
    assert_eq!(won, attempts as usize, "every slot must be taken exactly once");
}

async fn phase4_reads_under_load() {
    let ledger = open_ledger("reads");
    let spots = seed(&ledger, 100).await;
    let ids: Vec<SpotId> = spots.iter().map(|s| s.id).collect();

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for (w, spot) in spots.iter().take(10).enumerate() {
        let ledger = ledger.clone();
        let stop = stop.clone();
        let spot = spot.id;
        writers.push(tokio::spawn(async move {
            let mut i = w as i64 * 10_000;
            while !stop.load(Ordering::Relaxed) {
                let _ = ledger
                    .reserve(spot, Ulid::new(), hour(i), hour(i + 1), ReservationAttrs::default())
                    .await;
                i += 1;
            }
        }));
    }

    let mut readers = Vec::new();
    for _ in 0..10 {
        let ledger = ledger.clone();
        let ids = ids.clone();
        readers.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(500);
            for k in 0..500 {
                let t = Instant::now();
                ledger.find_available(&ids, hour(k), hour(k + 2)).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("find_available over 100 spots", &mut all);
}

async fn phase5_sweep() {
    let ledger = open_ledger("sweep");
    let spots = seed(&ledger, 200).await;
    for spot in &spots {
        for j in 0..20 {
            ledger
                .reserve(spot.id, Ulid::new(), hour(j), hour(j + 1), ReservationAttrs::default())
                .await
                .unwrap();
        }
    }

    let mut sweeper = Sweeper::new(ledger.clone(), SweepPolicy::default(), SweepState::default());
    let t = Instant::now();
    let report = sweeper.sweep(hour(10)).await;
    println!(
        "  swept {} reservations ({} expired, {} no-shows) in {:.2}ms",
        ledger.reservation_count(),
        report.expired,
        report.no_shows,
        t.elapsed().as_secs_f64() * 1000.0
    );
}

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");

    runtime.block_on(async {
        println!("=== parkledger stress benchmark ===\n");

        println!("[phase 1] sequential reserve throughput");
        phase1_sequential().await;

        println!("\n[phase 2] concurrent reserves, one task per spot");
        phase2_concurrent_spots().await;

        println!("\n[phase 3] many tasks contending for one spot");
        phase3_contended_spot().await;

        println!("\n[phase 4] availability reads under write load");
        phase4_reads_under_load().await;

        println!("\n[phase 5] sweep over a full ledger");
        phase5_sweep().await;

        println!("\n=== benchmark complete ===");
    });
}
