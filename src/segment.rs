//! Shared append-only JSONL segment storage, used by both the WAL
//! (`wal::segment`) and the event stream (`events::store`) — the
//! design specifies that the two mirror each other's rotation and
//! compaction rules, so the mechanics live here once.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CoreResult;
use crate::ids::new_entry_id;
use crate::logging::{self, log_wal_corruption, Domain, Level};

/// Anything storable in a segment must expose the sequence it was
/// assigned and be able to verify its own checksum on read-back.
pub trait SegmentRecord: Serialize + DeserializeOwned + Clone {
    fn sequence(&self) -> u64;
    fn verify_checksum(&self) -> bool;
    /// Stable key used for compaction ("keep only the latest entry per key").
    fn compaction_key(&self) -> String;
}

pub struct SegmentManager<E: SegmentRecord> {
    dir: PathBuf,
    file_prefix: String,
    max_segment_size: u64,
    state: Mutex<SegmentState>,
    _marker: std::marker::PhantomData<E>,
}

struct SegmentState {
    active_segment_id: String,
    active_file: File,
    active_size: u64,
    prunable: HashSet<String>,
}

impl<E: SegmentRecord> SegmentManager<E> {
    pub fn open(dir: impl AsRef<Path>, file_prefix: &str, max_segment_size: u64) -> CoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let existing = Self::list_segment_ids(&dir, file_prefix)?;
        let active_segment_id = existing.last().cloned().unwrap_or_else(|| new_entry_id(0));
        let path = Self::segment_path(&dir, file_prefix, &active_segment_id);
        let active_file = OpenOptions::new().create(true).append(true).open(&path)?;
        let active_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            dir,
            file_prefix: file_prefix.to_string(),
            max_segment_size,
            state: Mutex::new(SegmentState {
                active_segment_id,
                active_file,
                active_size,
                prunable: HashSet::new(),
            }),
            _marker: std::marker::PhantomData,
        })
    }

    fn segment_path(dir: &Path, prefix: &str, segment_id: &str) -> PathBuf {
        dir.join(format!("{prefix}-{segment_id}.jsonl"))
    }

    fn list_segment_ids(dir: &Path, prefix: &str) -> CoreResult<Vec<String>> {
        let mut ids = Vec::new();
        if !dir.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name
                .strip_prefix(prefix)
                .and_then(|r| r.strip_prefix('-'))
                .and_then(|r| r.strip_suffix(".jsonl"))
            {
                ids.push(rest.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn active_segment_id(&self) -> String {
        self.state.lock().unwrap().active_segment_id.clone()
    }

    pub fn segment_count(&self) -> usize {
        Self::list_segment_ids(&self.dir, &self.file_prefix)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Appends one already-serialized JSON line, rotating first if the
    /// active segment has grown past `max_segment_size`.
    pub fn append_line(&self, line: &str) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.active_size >= self.max_segment_size {
            self.rotate_locked(&mut state)?;
        }
        state.active_file.write_all(line.as_bytes())?;
        state.active_file.write_all(b"\n")?;
        state.active_file.flush()?;
        state.active_size += line.len() as u64 + 1;
        Ok(())
    }

    fn rotate_locked(&self, state: &mut SegmentState) -> CoreResult<()> {
        let new_id = new_entry_id(logging::ts_epoch_ms() as i64);
        let path = Self::segment_path(&self.dir, &self.file_prefix, &new_id);
        let new_file = OpenOptions::new().create(true).append(true).open(&path)?;
        state.active_segment_id = new_id;
        state.active_file = new_file;
        state.active_size = 0;
        Ok(())
    }

    pub fn rotate(&self) -> CoreResult<String> {
        let mut state = self.state.lock().unwrap();
        self.rotate_locked(&mut state)?;
        Ok(state.active_segment_id.clone())
    }

    /// Replays every segment in lexicographic order, invoking `visit`
    /// for each record whose checksum verifies and whose sequence is
    /// strictly greater than `from_sequence`. Corrupt lines are skipped
    /// with a warning; an incomplete final line (a torn write) is
    /// skipped silently.
    pub fn replay(&self, from_sequence: u64, mut visit: impl FnMut(E)) -> CoreResult<()> {
        let ids = Self::list_segment_ids(&self.dir, &self.file_prefix)?;
        for id in ids {
            let path = Self::segment_path(&self.dir, &self.file_prefix, &id);
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(_) => continue,
            };
            let reader = BufReader::new(file);
            let mut lines: Vec<String> = Vec::new();
            for line in reader.lines() {
                match line {
                    Ok(l) => lines.push(l),
                    Err(_) => break,
                }
            }
            let last_idx = lines.len().saturating_sub(1);
            for (idx, line) in lines.iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<E>(line) {
                    Ok(record) => {
                        if !record.verify_checksum() {
                            log_wal_corruption(&id, "crc_mismatch");
                            continue;
                        }
                        if record.sequence() > from_sequence {
                            visit(record);
                        }
                    }
                    Err(_) => {
                        // A torn write can only be the last line; anywhere
                        // else a parse failure is real corruption.
                        if idx == last_idx {
                            logging::log(
                                Level::Debug,
                                Domain::Wal,
                                "torn_write_skipped",
                                logging::obj(&[("segment", logging::v_str(&id))]),
                            );
                        } else {
                            log_wal_corruption(&id, "parse_failure");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn entries_since(&self, from_sequence: u64) -> CoreResult<Vec<E>> {
        let mut out = Vec::new();
        self.replay(from_sequence, |e| out.push(e))?;
        Ok(out)
    }

    /// The maximum sequence number observed across all segments, or 0
    /// if the log is empty. Used to recover the process-wide sequence
    /// counter on startup.
    pub fn max_sequence(&self) -> CoreResult<u64> {
        let mut max_seq = 0u64;
        self.replay(0, |e| max_seq = max_seq.max(e.sequence()))?;
        Ok(max_seq)
    }

    pub fn mark_prunable(&self, segment_ids: &[String]) {
        let mut state = self.state.lock().unwrap();
        for id in segment_ids {
            if *id != state.active_segment_id {
                state.prunable.insert(id.clone());
            }
        }
    }

    /// Deletes segments that are both marked prunable and not active.
    /// Returns the number of segments removed.
    pub fn prune(&self) -> CoreResult<usize> {
        let mut state = self.state.lock().unwrap();
        let mut removed = 0;
        let prunable: Vec<String> = state.prunable.iter().cloned().collect();
        for id in prunable {
            if id == state.active_segment_id {
                continue;
            }
            let path = Self::segment_path(&self.dir, &self.file_prefix, &id);
            if fs::remove_file(&path).is_ok() {
                state.prunable.remove(&id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Rewrites every closed segment to keep only the latest record per
    /// `compaction_key`, writing the result to a fresh segment and then
    /// removing the old ones. The active segment is never touched.
    ///
    /// The compacted output is written under the *earliest* closed
    /// segment's id, not a freshly-minted one: segment ids are
    /// ULID-class and therefore time-ordered, so a newly-minted id
    /// would sort lexicographically *after* the active segment (which
    /// was necessarily opened later) and `replay()` would then yield
    /// the compacted (stale, low-sequence) records after the active
    /// segment's (current, high-sequence) ones — breaking both WAL
    /// monotonicity and last-write-wins reconstruction. Reusing the
    /// earliest closed id keeps the compacted segment sorted ahead of
    /// every segment it didn't touch.
    pub fn compact(&self) -> CoreResult<()> {
        let active_id = self.active_segment_id();
        let closed_ids: Vec<String> = Self::list_segment_ids(&self.dir, &self.file_prefix)?
            .into_iter()
            .filter(|id| *id != active_id)
            .collect();
        if closed_ids.is_empty() {
            return Ok(());
        }

        let mut latest_by_key: std::collections::HashMap<String, E> = std::collections::HashMap::new();
        for id in &closed_ids {
            let path = Self::segment_path(&self.dir, &self.file_prefix, id);
            let file = File::open(&path)?;
            for line in BufReader::new(file).lines().map_while(Result::ok) {
                if let Ok(record) = serde_json::from_str::<E>(&line) {
                    if record.verify_checksum() {
                        latest_by_key.insert(record.compaction_key(), record);
                    }
                }
            }
        }

        let mut ordered: Vec<E> = latest_by_key.into_values().collect();
        ordered.sort_by_key(|r| r.sequence());

        // `closed_ids` came from `list_segment_ids`, which sorts
        // lexicographically, so the first entry is the earliest.
        let compacted_id = closed_ids.first().cloned().expect("checked non-empty above");
        let compacted_path = Self::segment_path(&self.dir, &self.file_prefix, &compacted_id);
        let mut compacted_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&compacted_path)?;
        for record in &ordered {
            let line = serde_json::to_string(record)?;
            compacted_file.write_all(line.as_bytes())?;
            compacted_file.write_all(b"\n")?;
        }
        compacted_file.flush()?;

        for id in &closed_ids {
            if *id == compacted_id {
                continue;
            }
            let path = Self::segment_path(&self.dir, &self.file_prefix, id);
            let _ = fs::remove_file(path);
        }
        Ok(())
    }
}
