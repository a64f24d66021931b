//! On-disk record format for shard segments.
//!
//! A segment is an append-only file of records:
//!
//! ```text
//! len: u32 LE | checksum: u32 LE | sequence: u64 LE | payload (len bytes)
//! ```
//!
//! `checksum` is the first four bytes of SHA-256 over the sequence bytes
//! followed by the payload. Segment files are named after the sequence of
//! their first record so that lexical order equals sequence order.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

pub const RECORD_HEADER_LEN: usize = 16;

/// Upper bound on a single record payload. Anything larger is treated as a
/// damaged length field.
pub const MAX_RECORD_LEN: usize = 256 * 1024 * 1024;

pub const SEGMENT_EXTENSION: &str = "seg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record truncated")]
    Truncated,

    #[error("record length {0} exceeds limit")]
    TooLarge(usize),

    #[error("checksum mismatch (expected {expected:08x}, got {actual:08x})")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

pub fn checksum(sequence: u64, payload: &[u8]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(payload);
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Frames a payload as a record.
///
/// Payloads over MAX_RECORD_LEN are refused, since recovery would read them
/// back as a damaged length field.
pub fn encode_record(sequence: u64, payload: &[u8]) -> Result<Vec<u8>, RecordError> {
    let len = match u32::try_from(payload.len()) {
        Ok(len) if payload.len() <= MAX_RECORD_LEN => len,
        _ => return Err(RecordError::TooLarge(payload.len())),
    };
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&checksum(sequence, payload).to_le_bytes());
    buf.extend_from_slice(&sequence.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Payload length declared by a header, validated against MAX_RECORD_LEN.
fn declared_len(buf: &[u8]) -> Result<usize, RecordError> {
    if buf.len() < RECORD_HEADER_LEN {
        return Err(RecordError::Truncated);
    }
    let len = read_u32(buf, 0) as usize;
    if len > MAX_RECORD_LEN {
        return Err(RecordError::TooLarge(len));
    }
    Ok(len)
}

/// Decodes the record at the start of `buf`.
///
/// Returns the sequence, the payload, and the total encoded length.
pub fn decode_record(buf: &[u8]) -> Result<(u64, &[u8], usize), RecordError> {
    let len = declared_len(buf)?;
    let total = RECORD_HEADER_LEN + len;
    if buf.len() < total {
        return Err(RecordError::Truncated);
    }

    let expected = read_u32(buf, 4);
    let sequence = read_u64(buf, 8);
    let payload = &buf[RECORD_HEADER_LEN..total];
    let actual = checksum(sequence, payload);
    if expected != actual {
        return Err(RecordError::ChecksumMismatch { expected, actual });
    }

    Ok((sequence, payload, total))
}

/// Location of one intact record inside a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub sequence: u64,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Default)]
pub struct SegmentScan {
    pub records: Vec<RecordLocation>,
    /// Damaged regions skipped between intact records
    pub corrupted: u64,
    /// Byte offset just past the last intact record
    pub valid_len: u64,
    /// Size of the file as read
    pub file_len: u64,
    /// Nothing intact follows `valid_len`, but bytes remain
    pub torn_tail: bool,
}

/// First offset at or after `from` where an intact record starts.
fn resync(data: &[u8], from: usize) -> Option<usize> {
    (from..data.len()).find(|&at| decode_record(&data[at..]).is_ok())
}

/// Reads a whole segment and indexes its intact records.
///
/// An unreadable record is skipped by searching forward byte by byte for the
/// next intact one, so a damaged length field costs only the damaged region.
/// When nothing intact follows, the remainder is reported as a torn tail;
/// a partial final record with no damage before it is not counted as
/// corruption.
pub fn scan_segment(path: &Path) -> io::Result<SegmentScan> {
    let data = std::fs::read(path)?;
    let mut scan = SegmentScan {
        file_len: data.len() as u64,
        ..SegmentScan::default()
    };
    let mut offset = 0usize;

    while offset < data.len() {
        let error = match decode_record(&data[offset..]) {
            Ok((sequence, _, total)) => {
                scan.records.push(RecordLocation {
                    sequence,
                    offset: offset as u64,
                    len: total as u64,
                });
                offset += total;
                scan.valid_len = offset as u64;
                continue;
            }
            Err(e) => e,
        };

        match resync(&data, offset + 1) {
            Some(next) => {
                scan.corrupted += 1;
                offset = next;
            }
            None => {
                if error != RecordError::Truncated {
                    scan.corrupted += 1;
                }
                scan.torn_tail = true;
                break;
            }
        }
    }

    Ok(scan)
}

/// Re-reads one record by location.
///
/// The outer error is I/O; the inner one means the bytes on disk no longer
/// form a valid record.
pub fn read_record(
    path: &Path,
    location: &RecordLocation,
) -> io::Result<Result<Vec<u8>, RecordError>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(location.offset))?;

    let mut buf = vec![0u8; location.len as usize];
    if let Err(e) = file.read_exact(&mut buf) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(Err(RecordError::Truncated));
        }
        return Err(e);
    }

    Ok(decode_record(&buf).and_then(|(sequence, payload, _)| {
        if sequence == location.sequence {
            Ok(payload.to_vec())
        } else {
            Err(RecordError::ChecksumMismatch {
                expected: location.sequence as u32,
                actual: sequence as u32,
            })
        }
    }))
}

pub fn segment_file_name(first_sequence: u64) -> String {
    format!("{:020}.{}", first_sequence, SEGMENT_EXTENSION)
}

pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}
