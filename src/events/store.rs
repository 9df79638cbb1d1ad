//! Partitioned append-only fact stream: independent monotonic sequence
//! per registered stream, `events-<stream>-<segment_id>.jsonl` naming.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::ids::{new_entry_id, SequenceCounter};
use crate::logging::{self, log_event_emit_failed, Domain, Level};
use crate::segment::SegmentManager;

use super::envelope::EventEnvelope;

/// Streams the store will accept appends for. A stream name outside
/// this set (or that fails the `^[a-z][a-z0-9_]*$` shape) is rejected
/// with `UnknownStream`.
pub const REGISTERED_STREAMS: &[&str] = &[
    "billing",
    "credit",
    "reconciliation",
    "personality",
    "routing_quality",
];

fn is_valid_stream_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

struct StreamHandle {
    segments: SegmentManager<EventEnvelope>,
    sequence: SequenceCounter,
}

pub struct EventStore {
    dir: PathBuf,
    max_segment_size: u64,
    streams: Mutex<HashMap<String, StreamHandle>>,
    closed: AtomicBool,
}

impl EventStore {
    pub fn open(dir: impl AsRef<Path>, max_segment_size: u64) -> CoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_segment_size,
            streams: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn require_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CoreError::WriterClosed)
        } else {
            Ok(())
        }
    }

    fn open_stream(&self, stream: &str) -> CoreResult<()> {
        let mut streams = self.streams.lock().unwrap();
        if streams.contains_key(stream) {
            return Ok(());
        }
        let prefix = format!("events-{stream}");
        let segments = SegmentManager::open(&self.dir, &prefix, self.max_segment_size)?;
        let max_seq = segments.max_sequence()?;
        streams.insert(
            stream.to_string(),
            StreamHandle {
                segments,
                sequence: SequenceCounter::starting_after(max_seq),
            },
        );
        Ok(())
    }

    fn require_registered(stream: &str) -> CoreResult<()> {
        if REGISTERED_STREAMS.contains(&stream) && is_valid_stream_name(stream) {
            Ok(())
        } else {
            Err(CoreError::UnknownStream(stream.to_string()))
        }
    }

    pub fn append(
        &self,
        stream: &str,
        event_type: &str,
        payload: serde_json::Value,
        correlation_id: &str,
    ) -> CoreResult<EventEnvelope> {
        self.require_open()?;
        Self::require_registered(stream)?;
        self.open_stream(stream)?;
        let streams = self.streams.lock().unwrap();
        let handle = streams.get(stream).expect("just opened");
        let seq = handle.sequence.next();
        let event_id = new_entry_id(logging::ts_epoch_ms() as i64);
        let envelope = EventEnvelope::new(
            stream,
            event_type,
            logging::ts_epoch_ms() as i64,
            correlation_id,
            seq,
            event_id,
            payload,
        );
        let line = serde_json::to_string(&envelope)?;
        handle.segments.append_line(&line)?;
        Ok(envelope)
    }

    /// Emits a billing WAL envelope onto the `billing` stream without
    /// reassigning a sequence. Failures are warned and dropped: the
    /// caller's WAL append already durably recorded the transition.
    pub fn emit_billing_mirror(&self, envelope: &EventEnvelope) {
        if self.closed.load(Ordering::SeqCst) {
            log_event_emit_failed("billing", "writer closed");
            return;
        }
        if let Err(e) = self.open_stream("billing") {
            log_event_emit_failed("billing", &e.to_string());
            return;
        }
        let streams = self.streams.lock().unwrap();
        let handle = match streams.get("billing") {
            Some(h) => h,
            None => return,
        };
        let line = match serde_json::to_string(envelope) {
            Ok(l) => l,
            Err(e) => {
                log_event_emit_failed("billing", &e.to_string());
                return;
            }
        };
        if let Err(e) = handle.segments.append_line(&line) {
            log_event_emit_failed("billing", &e.to_string());
        }
    }

    pub fn replay(&self, stream: &str, from_sequence: u64) -> CoreResult<Vec<EventEnvelope>> {
        self.require_open()?;
        Self::require_registered(stream)?;
        self.open_stream(stream)?;
        let streams = self.streams.lock().unwrap();
        let handle = streams.get(stream).expect("just opened");
        handle.segments.entries_since(from_sequence)
    }

    pub fn latest_sequence(&self, stream: &str) -> CoreResult<u64> {
        Self::require_registered(stream)?;
        self.open_stream(stream)?;
        let streams = self.streams.lock().unwrap();
        let handle = streams.get(stream).expect("just opened");
        Ok(handle.sequence.peek())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        logging::log(Level::Info, Domain::EventStream, "close", logging::obj(&[]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_assigns_independent_sequence_per_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let store = EventStore::open(tmp.path(), 1024 * 1024).unwrap();
        store
            .append("billing", "billing_reserve", json!({"a": 1}), "c1")
            .unwrap();
        let credit_event = store
            .append("credit", "credit_reserve", json!({"a": 1}), "c1")
            .unwrap();
        assert_eq!(credit_event.sequence, 1);
    }

    #[test]
    fn unregistered_stream_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = EventStore::open(tmp.path(), 1024 * 1024).unwrap();
        let result = store.append("not_a_stream", "x", json!({}), "c1");
        assert!(matches!(result, Err(CoreError::UnknownStream(_))));
    }

    #[test]
    fn append_after_close_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = EventStore::open(tmp.path(), 1024 * 1024).unwrap();
        store.close();
        let result = store.append("billing", "billing_reserve", json!({}), "c1");
        assert!(matches!(result, Err(CoreError::WriterClosed)));
    }

    #[test]
    fn replay_on_one_stream_never_surfaces_another() {
        let tmp = tempfile::tempdir().unwrap();
        let store = EventStore::open(tmp.path(), 1024 * 1024).unwrap();
        store
            .append("billing", "billing_reserve", json!({"a": 1}), "c1")
            .unwrap();
        store
            .append("credit", "credit_reserve", json!({"a": 1}), "c1")
            .unwrap();
        let billing_events = store.replay("billing", 0).unwrap();
        assert_eq!(billing_events.len(), 1);
        assert_eq!(billing_events[0].stream, "billing");
    }
}
