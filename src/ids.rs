//! Time-ordered identifiers and the process-wide WAL sequence counter.
//!
//! `new_entry_id` produces a 26-character Crockford-base32 ULID-class id:
//! a 48-bit millisecond timestamp followed by 80 bits of randomness. It
//! is time-ordered but NOT strictly monotonic across processes —
//! replay ordering must use `wal_sequence`, never this id.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::RngCore;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

pub fn new_entry_id(now_ms: i64) -> String {
    let ts = (now_ms.max(0) as u64) & 0xFFFF_FFFF_FFFF; // 48 bits
    let mut rand_bytes = [0u8; 10]; // 80 bits
    rand::thread_rng().fill_bytes(&mut rand_bytes);
    encode_ulid(ts, &rand_bytes)
}

fn encode_ulid(ts_ms: u64, rand_bytes: &[u8; 10]) -> String {
    // 128 bits total: 48-bit timestamp + 80-bit randomness, encoded as
    // 26 base32 characters (5 bits each = 130 bits, top 2 bits of the
    // first character are always zero).
    let mut bits: u128 = (ts_ms as u128) << 80;
    let mut rand_val: u128 = 0;
    for b in rand_bytes {
        rand_val = (rand_val << 8) | (*b as u128);
    }
    bits |= rand_val;

    let mut out = [0u8; 26];
    for i in 0..26 {
        let shift = 125 - i * 5;
        let idx = ((bits >> shift) & 0x1F) as usize;
        out[i] = CROCKFORD[idx];
    }
    String::from_utf8(out.to_vec()).expect("crockford alphabet is ascii")
}

/// The process-wide monotonic WAL sequence counter. Recovered on
/// startup from the maximum sequence seen across all segments, then
/// advanced under atomic increments. A `reset` exists for tests only.
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    pub fn starting_after(max_seen: u64) -> Self {
        Self {
            next: AtomicU64::new(max_seen + 1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn reset_for_test(&self, value: u64) {
        self.next.store(value, Ordering::SeqCst);
    }
}
