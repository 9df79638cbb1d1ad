//! The event envelope appended to a stream segment. Unlike the WAL,
//! sequence numbers here are per-stream, not global.

use serde::{Deserialize, Serialize};

use crate::segment::SegmentRecord;
use crate::wal::{WalEnvelope, SCHEMA_VERSION};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub stream: String,
    pub event_type: String,
    pub timestamp: i64,
    pub correlation_id: String,
    pub sequence: u64,
    pub checksum: u32,
    pub schema_version: u32,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(
        stream: impl Into<String>,
        event_type: impl Into<String>,
        timestamp: i64,
        correlation_id: impl Into<String>,
        sequence: u64,
        event_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let checksum = crc32fast::hash(payload.to_string().as_bytes());
        Self {
            event_id: event_id.into(),
            stream: stream.into(),
            event_type: event_type.into(),
            timestamp,
            correlation_id: correlation_id.into(),
            sequence,
            checksum,
            schema_version: SCHEMA_VERSION,
            payload,
        }
    }

    /// Lossless mapping from a billing WAL envelope onto the `billing`
    /// stream: `event_id = billing_entry_id`, `sequence = wal_sequence`.
    pub fn from_wal(envelope: &WalEnvelope) -> Self {
        Self::new(
            "billing",
            envelope.event_type.as_str(),
            envelope.timestamp,
            envelope.correlation_id.clone(),
            envelope.wal_sequence,
            envelope.billing_entry_id.clone(),
            envelope.payload.clone(),
        )
    }
}

impl SegmentRecord for EventEnvelope {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn verify_checksum(&self) -> bool {
        crc32fast::hash(self.payload.to_string().as_bytes()) == self.checksum
    }

    fn compaction_key(&self) -> String {
        self.event_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::WalEventType;
    use serde_json::json;

    #[test]
    fn from_wal_preserves_sequence_and_event_id() {
        let wal = WalEnvelope::new(
            WalEventType::BillingCommit,
            1000,
            "E1",
            "corr-1",
            42,
            json!({"actual_cost": "500"}),
        );
        let event = EventEnvelope::from_wal(&wal);
        assert_eq!(event.sequence, 42);
        assert_eq!(event.event_id, "E1");
        assert_eq!(event.stream, "billing");
        assert!(event.verify_checksum());
    }
}
