//! Typed environment-variable configuration, following this codebase's
//! `Config::from_env()` convention.

#[derive(Debug, Clone)]
pub struct Config {
    // --- WAL / event stream paths & rotation ---
    pub wal_dir: String,
    pub events_dir: String,
    pub max_segment_size_bytes: u64,

    // --- locking / fencing TTLs (seconds) ---
    pub wal_writer_lock_ttl_secs: u64,
    pub billing_lock_ttl_secs: u64,

    // --- marketplace ---
    pub lot_size: u64,
    pub fee_rate_bps: u64, // basis points, e.g. 30 = 0.30%
    pub min_order_lots: u64,
    pub max_orders_per_hour: u32,
    pub rate_limit_window_ms: i64,
    pub relist_cooldown_ms: i64,

    // --- credit notes ---
    pub credit_note_daily_cap_micro: u64,

    // --- idempotency cache ---
    pub idempotency_cache_capacity: usize,

    // --- shared store ---
    pub redis_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wal_dir: "./wal".to_string(),
            events_dir: "./events".to_string(),
            max_segment_size_bytes: 64 * 1024 * 1024,
            wal_writer_lock_ttl_secs: 30,
            billing_lock_ttl_secs: 30,
            lot_size: 100,
            fee_rate_bps: 30,
            min_order_lots: 1,
            max_orders_per_hour: 60,
            rate_limit_window_ms: 60 * 60 * 1000,
            relist_cooldown_ms: 30 * 1000,
            credit_note_daily_cap_micro: 500 * crate::money::MICROS_PER_USD,
            idempotency_cache_capacity: 10_000,
            redis_url: "redis://127.0.0.1/".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            wal_dir: env_or("WAL_DIR", default.wal_dir),
            events_dir: env_or("EVENTS_DIR", default.events_dir),
            max_segment_size_bytes: env_parsed("MAX_SEGMENT_SIZE_BYTES", default.max_segment_size_bytes),
            wal_writer_lock_ttl_secs: env_parsed(
                "WAL_WRITER_LOCK_TTL_SECS",
                default.wal_writer_lock_ttl_secs,
            ),
            billing_lock_ttl_secs: env_parsed("BILLING_LOCK_TTL_SECS", default.billing_lock_ttl_secs),
            lot_size: env_parsed("LOT_SIZE", default.lot_size),
            fee_rate_bps: env_parsed("FEE_RATE_BPS", default.fee_rate_bps),
            min_order_lots: env_parsed("MIN_ORDER_LOTS", default.min_order_lots),
            max_orders_per_hour: env_parsed("MAX_ORDERS_PER_HOUR", default.max_orders_per_hour),
            rate_limit_window_ms: env_parsed("RATE_LIMIT_WINDOW_MS", default.rate_limit_window_ms),
            relist_cooldown_ms: env_parsed("RELIST_COOLDOWN_MS", default.relist_cooldown_ms),
            credit_note_daily_cap_micro: env_parsed(
                "CREDIT_NOTE_DAILY_CAP_MICRO",
                default.credit_note_daily_cap_micro,
            ),
            idempotency_cache_capacity: env_parsed(
                "IDEMPOTENCY_CACHE_CAPACITY",
                default.idempotency_cache_capacity,
            ),
            redis_url: env_or("REDIS_URL", default.redis_url),
        }
    }

    /// `fee_micro = floor(total_micro * fee_rate_bps / 10_000)`.
    pub fn fee_for(&self, total_micro: u64) -> u64 {
        ((total_micro as u128) * (self.fee_rate_bps as u128) / 10_000u128) as u64
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_floors_down() {
        let cfg = Config {
            fee_rate_bps: 30,
            ..Config::default()
        };
        // 30 bps of 333 micro-USD = 0.999 -> floors to 0.
        assert_eq!(cfg.fee_for(333), 0);
        // 30 bps of 1_000_000 = 3000 exactly.
        assert_eq!(cfg.fee_for(1_000_000), 3_000);
    }
}
