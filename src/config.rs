use std::path::PathBuf;
use std::time::Duration;

/// Read an env var and parse it, falling back to `default` when unset or malformed.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Rules applied by each expiration sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    /// How long after start a reservation may stay unobserved before it is a no-show.
    pub no_show_grace: chrono::Duration,
    /// Reservations ending within this window get one "ending soon" notice.
    pub reminder_window: chrono::Duration,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            no_show_grace: chrono::Duration::minutes(30),
            reminder_window: chrono::Duration::minutes(10),
        }
    }
}

/// Duration-tiered price list used to quote checkouts. Amounts are minor units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tariff {
    /// `(max_minutes, amount)` ascending by `max_minutes`.
    pub tiers: Vec<(i64, u64)>,
    /// Charged when the duration exceeds every tier.
    pub beyond: u64,
}

impl Default for Tariff {
    fn default() -> Self {
        Self {
            tiers: vec![(60, 25_000), (120, 40_000), (180, 50_000)],
            beyond: 60_000,
        }
    }
}

impl Tariff {
    pub fn quote(&self, duration: chrono::Duration) -> u64 {
        let ms = duration.num_milliseconds();
        let minutes = ms / 60_000 + i64::from(ms % 60_000 != 0);
        self.tiers
            .iter()
            .find(|(max, _)| minutes <= *max)
            .map_or(self.beyond, |(_, amount)| *amount)
    }
}

/// Daemon configuration loaded from environment variables.
///
/// | Env Var                           | Default  |
/// |-----------------------------------|----------|
/// | `PARKLEDGER_DATA_DIR`             | `./data` |
/// | `PARKLEDGER_SWEEP_INTERVAL_SECS`  | `60`     |
/// | `PARKLEDGER_NO_SHOW_GRACE_MINS`   | `30`     |
/// | `PARKLEDGER_REMINDER_WINDOW_MINS` | `10`     |
/// | `PARKLEDGER_COMPACT_THRESHOLD`    | `1000`   |
/// | `PARKLEDGER_METRICS_PORT`         | unset    |
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub data_dir: PathBuf,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub sweep: SweepPolicy,
    pub tariff: Tariff,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            sweep_interval: Duration::from_secs(60),
            compact_threshold: 1000,
            metrics_port: None,
            sweep: SweepPolicy::default(),
            tariff: Tariff::default(),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let data_dir = std::env::var("PARKLEDGER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let sweep_interval_secs: u64 = env_or("PARKLEDGER_SWEEP_INTERVAL_SECS", 60).max(1);
        let grace_mins: i64 = env_or("PARKLEDGER_NO_SHOW_GRACE_MINS", 30).max(0);
        let reminder_mins: i64 = env_or("PARKLEDGER_REMINDER_WINDOW_MINS", 10).max(0);

        Self {
            data_dir,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            compact_threshold: env_or("PARKLEDGER_COMPACT_THRESHOLD", defaults.compact_threshold),
            metrics_port: std::env::var("PARKLEDGER_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            sweep: SweepPolicy {
                no_show_grace: chrono::Duration::minutes(grace_mins),
                reminder_window: chrono::Duration::minutes(reminder_mins),
            },
            tariff: defaults.tariff,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }
}
