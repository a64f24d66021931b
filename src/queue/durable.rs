use super::batch::Batch;
use super::segment::{self, RecordLocation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const ACK_CURSOR_FILE: &str = "ack.cursor";
const ACK_CURSOR_TMP: &str = "ack.cursor.tmp";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize batch {sequence}: {source}")]
    Serialize {
        sequence: u64,
        #[source]
        source: serde_json::Error,
    },

    /// The batch encodes larger than a record may be. Nothing was written
    /// and the queue stays usable.
    #[error("batch {sequence} encodes to {len} bytes, over the record limit")]
    RecordTooLarge { sequence: u64, len: usize },

    #[error("failed to encode ack cursor: {0}")]
    Cursor(#[source] serde_json::Error),

    #[error("batch sequence {sequence} is behind next expected sequence {next}")]
    SequenceRegression { sequence: u64, next: u64 },

    #[error("queue lock poisoned")]
    Poisoned,

    #[error("queue task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> QueueError {
    let path = path.to_path_buf();
    move |source| QueueError::Io { path, source }
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Persisted acknowledgment state.
///
/// Every sequence at or below `low_watermark` is acknowledged, plus the
/// sequences in `acked` that were acknowledged out of order.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct AckCursor {
    low_watermark: u64,
    #[serde(default)]
    acked: BTreeSet<u64>,
}

impl AckCursor {
    fn contains(&self, sequence: u64) -> bool {
        sequence <= self.low_watermark || self.acked.contains(&sequence)
    }

    /// Raises the watermark to just below the oldest live batch.
    fn compact(&mut self, oldest_live: Option<u64>, next_sequence: u64) {
        let floor = match oldest_live {
            Some(sequence) => sequence.saturating_sub(1),
            None => next_sequence.saturating_sub(1),
        };
        self.low_watermark = self.low_watermark.max(floor);
        let low = self.low_watermark;
        self.acked.retain(|&s| s > low);
    }
}

#[derive(Debug)]
struct SegmentMeta {
    path: PathBuf,
    /// Records not yet acknowledged
    live: usize,
    bytes: u64,
}

#[derive(Debug)]
struct ActiveSegment {
    id: u64,
    path: PathBuf,
    file: File,
    bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    segment: u64,
    location: RecordLocation,
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub in_flight: usize,
    pub segments: usize,
    pub disk_bytes: u64,
    pub corrupted_records: u64,
    pub expired_batches: u64,
    pub expired_samples: u64,
    pub next_sequence: u64,
}

impl QueueStats {
    /// Batches persisted but not yet acknowledged
    pub fn depth(&self) -> usize {
        self.ready + self.in_flight
    }
}

/// Segment-file backed FIFO of sealed batches for a single shard.
///
/// All methods do blocking file I/O. Async callers go through
/// [`ShardQueue`](super::shard::ShardQueue).
#[derive(Debug)]
pub struct DurableQueue {
    dir: PathBuf,
    segment_max_bytes: u64,
    max_record_len: usize,
    segments: BTreeMap<u64, SegmentMeta>,
    active: Option<ActiveSegment>,
    ready: BTreeMap<u64, Entry>,
    in_flight: BTreeMap<u64, Entry>,
    cursor: AckCursor,
    next_sequence: u64,
    corrupted_records: u64,
    expired_batches: u64,
    expired_samples: u64,
}

impl DurableQueue {
    /// Opens (or creates) the queue in `dir` and recovers persisted state.
    ///
    /// Unacknowledged batches come back in sequence order ahead of anything
    /// enqueued later. Writes always go to a fresh segment after recovery.
    pub fn open(dir: impl Into<PathBuf>, segment_max_bytes: u64) -> Result<Self, QueueError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let tmp = dir.join(ACK_CURSOR_TMP);
        if tmp.exists() {
            fs::remove_file(&tmp).map_err(io_err(&tmp))?;
        }

        let cursor = load_cursor(&dir)?;
        let next_sequence = cursor.low_watermark + 1;
        let mut queue = Self {
            dir,
            segment_max_bytes: segment_max_bytes.max(1),
            max_record_len: segment::MAX_RECORD_LEN,
            segments: BTreeMap::new(),
            active: None,
            ready: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            cursor,
            next_sequence,
            corrupted_records: 0,
            expired_batches: 0,
            expired_samples: 0,
        };

        let mut removed_any = false;
        let mut torn_tails = 0usize;
        let ids = list_segments(&queue.dir)?;
        let last = ids.last().copied();
        for id in ids {
            let path = queue.dir.join(segment::segment_file_name(id));
            let scan = segment::scan_segment(&path).map_err(io_err(&path))?;
            queue.corrupted_records += scan.corrupted;

            let mut bytes = scan.file_len;
            if scan.torn_tail && Some(id) == last {
                // Only the newest segment can hold an interrupted write
                torn_tails += 1;
                warn!(
                    path = %path.display(),
                    valid_len = scan.valid_len,
                    file_len = scan.file_len,
                    "Truncating torn tail of segment"
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(io_err(&path))?;
                file.set_len(scan.valid_len).map_err(io_err(&path))?;
                file.sync_all().map_err(io_err(&path))?;
                bytes = scan.valid_len;
            } else if scan.torn_tail {
                warn!(
                    path = %path.display(),
                    valid_len = scan.valid_len,
                    file_len = scan.file_len,
                    "Sealed segment ends in damaged bytes, leaving them in place"
                );
            }

            let mut live = 0;
            for location in scan.records {
                let sequence = location.sequence;
                queue.next_sequence = queue.next_sequence.max(sequence + 1);
                if queue.cursor.contains(sequence) || queue.ready.contains_key(&sequence) {
                    continue;
                }
                queue.ready.insert(
                    sequence,
                    Entry {
                        segment: id,
                        location,
                    },
                );
                live += 1;
            }

            if live == 0 {
                fs::remove_file(&path).map_err(io_err(&path))?;
                removed_any = true;
            } else {
                queue.segments.insert(
                    id,
                    SegmentMeta {
                        path,
                        live,
                        bytes,
                    },
                );
            }
        }
        if removed_any {
            sync_dir(&queue.dir).map_err(io_err(&queue.dir))?;
        }

        let oldest = queue.oldest_live();
        queue.cursor.compact(oldest, queue.next_sequence);

        info!(
            dir = %queue.dir.display(),
            pending = queue.ready.len(),
            segments = queue.segments.len(),
            corrupted = queue.corrupted_records,
            torn_tails,
            next_sequence = queue.next_sequence,
            "Opened durable queue"
        );

        Ok(queue)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sequence number the next enqueued batch must carry (or exceed).
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn depth(&self) -> usize {
        self.ready.len() + self.in_flight.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            ready: self.ready.len(),
            in_flight: self.in_flight.len(),
            segments: self.segments.len(),
            disk_bytes: self.segments.values().map(|s| s.bytes).sum(),
            corrupted_records: self.corrupted_records,
            expired_batches: self.expired_batches,
            expired_samples: self.expired_samples,
            next_sequence: self.next_sequence,
        }
    }

    /// Appends a batch and syncs it to disk before returning.
    pub fn enqueue(&mut self, batch: &Batch) -> Result<(), QueueError> {
        if batch.sequence < self.next_sequence {
            return Err(QueueError::SequenceRegression {
                sequence: batch.sequence,
                next: self.next_sequence,
            });
        }

        let payload = serde_json::to_vec(batch).map_err(|source| QueueError::Serialize {
            sequence: batch.sequence,
            source,
        })?;
        if payload.len() > self.max_record_len {
            return Err(QueueError::RecordTooLarge {
                sequence: batch.sequence,
                len: payload.len(),
            });
        }
        let record = segment::encode_record(batch.sequence, &payload).map_err(|_| {
            QueueError::RecordTooLarge {
                sequence: batch.sequence,
                len: payload.len(),
            }
        })?;
        let record_len = record.len() as u64;

        let mut active = match self.active.take() {
            Some(active)
                if active.bytes == 0
                    || active.bytes + record_len <= self.segment_max_bytes =>
            {
                active
            }
            previous => {
                if let Some(previous) = previous {
                    self.retire_if_drained(previous.id)?;
                }
                self.create_segment(batch.sequence)?
            }
        };

        let offset = active.bytes;
        if let Err(source) = active
            .file
            .write_all(&record)
            .and_then(|()| active.file.sync_data())
        {
            // The handle is dropped here; the next enqueue starts a new segment
            return Err(QueueError::Io {
                path: active.path,
                source,
            });
        }
        active.bytes += record_len;

        if let Some(meta) = self.segments.get_mut(&active.id) {
            meta.live += 1;
            meta.bytes = active.bytes;
        }
        self.ready.insert(
            batch.sequence,
            Entry {
                segment: active.id,
                location: RecordLocation {
                    sequence: batch.sequence,
                    offset,
                    len: record_len,
                },
            },
        );
        self.next_sequence = batch.sequence + 1;
        self.active = Some(active);

        debug!(
            dir = %self.dir.display(),
            sequence = batch.sequence,
            samples = batch.len(),
            "Persisted batch"
        );
        Ok(())
    }

    /// Takes the oldest batch that is neither acknowledged nor in flight.
    ///
    /// Samples older than `min_timestamp_ms` are stripped. A batch left empty
    /// by that, or whose record no longer reads back intact, is acknowledged
    /// and skipped.
    pub fn dequeue(&mut self, min_timestamp_ms: i64) -> Result<Option<Batch>, QueueError> {
        while let Some((sequence, entry)) = self.ready.pop_first() {
            let path = self.segment_path(entry.segment);

            let payload = match segment::read_record(&path, &entry.location) {
                Ok(Ok(payload)) => payload,
                Ok(Err(e)) => {
                    warn!(path = %path.display(), sequence, error = %e, "Skipping corrupted record");
                    self.corrupted_records += 1;
                    self.settle(sequence, entry)?;
                    continue;
                }
                Err(source) => {
                    self.ready.insert(sequence, entry);
                    return Err(QueueError::Io { path, source });
                }
            };

            let mut batch: Batch = match serde_json::from_slice(&payload) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(path = %path.display(), sequence, error = %e, "Skipping undecodable record");
                    self.corrupted_records += 1;
                    self.settle(sequence, entry)?;
                    continue;
                }
            };

            let expired = batch.retain_fresh(min_timestamp_ms);
            self.expired_samples += expired as u64;
            if batch.is_empty() {
                debug!(sequence, expired, "Discarding fully expired batch");
                self.expired_batches += 1;
                self.settle(sequence, entry)?;
                continue;
            }

            self.in_flight.insert(sequence, entry);
            return Ok(Some(batch));
        }

        Ok(None)
    }

    /// Permanently removes a batch. Returns false if it was already
    /// acknowledged or never persisted.
    pub fn ack(&mut self, sequence: u64) -> Result<bool, QueueError> {
        if self.cursor.contains(sequence) {
            return Ok(false);
        }

        let entry = match self.in_flight.remove(&sequence) {
            Some(entry) => Some(entry),
            None => self.ready.remove(&sequence),
        };
        match entry {
            Some(entry) => {
                self.settle(sequence, entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns an in-flight batch to the ready set without removing it.
    pub fn release(&mut self, sequence: u64) -> bool {
        match self.in_flight.remove(&sequence) {
            Some(entry) => {
                self.ready.insert(sequence, entry);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_max_record_len(&mut self, max_record_len: usize) {
        self.max_record_len = max_record_len;
    }

    fn oldest_live(&self) -> Option<u64> {
        let ready = self.ready.keys().next().copied();
        let in_flight = self.in_flight.keys().next().copied();
        match (ready, in_flight) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn segment_path(&self, id: u64) -> PathBuf {
        match self.segments.get(&id) {
            Some(meta) => meta.path.clone(),
            None => self.dir.join(segment::segment_file_name(id)),
        }
    }

    /// Records the acknowledgment durably, then drops the segment reference.
    fn settle(&mut self, sequence: u64, entry: Entry) -> Result<(), QueueError> {
        self.cursor.acked.insert(sequence);
        let oldest = self.oldest_live();
        self.cursor.compact(oldest, self.next_sequence);
        self.persist_cursor()?;

        if let Some(meta) = self.segments.get_mut(&entry.segment) {
            meta.live = meta.live.saturating_sub(1);
        }
        self.retire_if_drained(entry.segment)
    }

    /// Deletes a segment once it is no longer written to and holds no live
    /// records.
    fn retire_if_drained(&mut self, id: u64) -> Result<(), QueueError> {
        let is_active = self.active.as_ref().map(|a| a.id) == Some(id);
        let drained = self.segments.get(&id).map(|m| m.live == 0).unwrap_or(false);
        if is_active || !drained {
            return Ok(());
        }

        if let Some(meta) = self.segments.remove(&id) {
            match fs::remove_file(&meta.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&meta.path)(e)),
            }
            sync_dir(&self.dir).map_err(io_err(&self.dir))?;
            debug!(path = %meta.path.display(), "Deleted acknowledged segment");
        }
        Ok(())
    }

    fn create_segment(&mut self, first_sequence: u64) -> Result<ActiveSegment, QueueError> {
        let path = self.dir.join(segment::segment_file_name(first_sequence));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        let bytes = file.metadata().map_err(io_err(&path))?.len();
        sync_dir(&self.dir).map_err(io_err(&self.dir))?;

        self.segments.insert(
            first_sequence,
            SegmentMeta {
                path: path.clone(),
                live: 0,
                bytes,
            },
        );
        debug!(path = %path.display(), "Opened new segment");

        Ok(ActiveSegment {
            id: first_sequence,
            path,
            file,
            bytes,
        })
    }

    fn persist_cursor(&self) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(&self.cursor).map_err(QueueError::Cursor)?;
        let tmp = self.dir.join(ACK_CURSOR_TMP);
        let target = self.dir.join(ACK_CURSOR_FILE);

        let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(&bytes).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
        fs::rename(&tmp, &target).map_err(io_err(&target))?;
        sync_dir(&self.dir).map_err(io_err(&self.dir))
    }
}

fn load_cursor(dir: &Path) -> Result<AckCursor, QueueError> {
    let path = dir.join(ACK_CURSOR_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(AckCursor::default()),
        Err(e) => return Err(io_err(&path)(e)),
    };

    match serde_json::from_slice(&bytes) {
        Ok(cursor) => Ok(cursor),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Ack cursor unreadable, replaying every persisted batch"
            );
            Ok(AckCursor::default())
        }
    }
}

fn list_segments(dir: &Path) -> Result<Vec<u64>, QueueError> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        if let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(segment::parse_segment_file_name)
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
