//! Property-based checks for the universal invariants in spec.md §8:
//! arithmetic drift bounds, WAL sequence monotonicity, and round-trip
//! billing -> event envelope identity.

use std::sync::Arc;

use proptest::prelude::*;

use meterflow_core::clock::{Clock, FrozenClock};
use meterflow_core::events::EventEnvelope;
use meterflow_core::money::{cost_for_tokens, RemainderAccumulator};
use meterflow_core::store::memory::InMemoryStore;
use meterflow_core::store::SharedStore;
use meterflow_core::wal::{Wal, WalEnvelope, WalEventType};

proptest! {
    /// `cost_for_tokens` never overcharges: the floored micro-USD cost
    /// never exceeds the exact rational value it approximates, and the
    /// drift is bounded to less than one whole micro-USD unit.
    #[test]
    fn cost_for_tokens_never_overcharges(tokens in 0u64..10_000_000, price_per_1m in 0u64..10_000_000) {
        let exact = (tokens as u128) * (price_per_1m as u128);
        let got = cost_for_tokens(tokens, price_per_1m);
        let floored = exact / 1_000_000u128;
        prop_assert_eq!(got.0 as u128, floored);
        prop_assert!((got.0 as u128) * 1_000_000 <= exact);
    }

    /// The event envelope round trip from a WAL envelope is lossless
    /// for sequence and event id, the two fields replay depends on.
    #[test]
    fn wal_to_event_round_trip_preserves_sequence(
        seq in 0u64..1_000_000,
        ts in 0i64..2_000_000_000_000i64,
    ) {
        let wal = WalEnvelope::new(
            WalEventType::BillingReserve,
            ts,
            "E1",
            "corr-1",
            seq,
            serde_json::json!({"n": 1}),
        );
        let event = EventEnvelope::from_wal(&wal);
        prop_assert_eq!(event.sequence, seq);
        prop_assert_eq!(event.event_id, "E1".to_string());
        prop_assert!(event.verify_checksum());
    }
}

/// Spec §8 "Arithmetic drift": for 10,000 random `(tokens,
/// price_per_1M)` pairs, the accumulator-carried running total differs
/// from an exact bigint reference by at most `max(1, 0.1%)` micro-USD.
#[test]
fn remainder_accumulator_drift_is_bounded_over_10k_operations() {
    let mut rng_state: u64 = 0x9e3779b97f4a7c15;
    let mut next = move || {
        rng_state ^= rng_state << 13;
        rng_state ^= rng_state >> 7;
        rng_state ^= rng_state << 17;
        rng_state
    };

    let mut acc = RemainderAccumulator::new();
    let mut exact_total: u128 = 0;
    let mut charged_total: u128 = 0;

    for _ in 0..10_000u32 {
        let tokens = (next() % 1_000_000) as u128;
        let price_per_1m = (next() % 1_000_000) as u128;
        let exact = tokens * price_per_1m;
        exact_total += exact;
        charged_total += acc.apply(exact, 1_000_000).0 as u128;
    }

    let floored_reference = exact_total / 1_000_000;
    let drift = floored_reference.abs_diff(charged_total);
    let bound = std::cmp::max(1u128, floored_reference / 1000);
    assert!(
        drift <= bound,
        "drift {drift} exceeded bound {bound} (reference {floored_reference}, charged {charged_total})"
    );
}

#[tokio::test]
async fn wal_sequence_is_strictly_increasing_across_interleaved_appends() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(FrozenClock::at(0));
    let wal = Wal::open(tmp.path(), 1024 * 1024, store, clock, "writer-1", 30)
        .await
        .unwrap();

    let mut last = 0u64;
    for i in 0..200u64 {
        let env = wal
            .append(WalEventType::BillingReserve, "E", "c", serde_json::json!({"i": i}))
            .await
            .unwrap();
        assert!(env.wal_sequence > last || i == 0);
        last = env.wal_sequence;
    }
}
