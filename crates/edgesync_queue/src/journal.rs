//! Journal record framing and replay.
//!
//! Frame layout:
//!
//! | Field | Size |
//! |---|---|
//! | magic `EQJ1` | 4 |
//! | payload length (LE) | 4 |
//! | CBOR payload | n |
//! | CRC32 of magic, length and payload (LE) | 4 |

use crate::backend::StorageBackend;
use crate::error::{QueueError, QueueResult, StorageResult};
use crate::queue::QueuedOperation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Magic bytes opening every journal frame.
pub(crate) const JOURNAL_MAGIC: [u8; 4] = *b"EQJ1";

const HEADER_LEN: usize = 8;
const TRAILER_LEN: usize = 4;

/// One journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum JournalEntry {
    /// A new row.
    Enqueued(QueuedOperation),
    /// Rows acknowledged by the cloud.
    Completed { ids: Vec<u64> },
    /// Rows whose push attempt failed.
    Failed {
        ids: Vec<u64>,
        reason: String,
        at: DateTime<Utc>,
    },
    /// Counters carried across a compaction.
    Checkpoint { next_id: u64, completed: u64 },
}

impl JournalEntry {
    /// Encodes the entry into a complete frame.
    pub(crate) fn encode_frame(&self) -> QueueResult<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::into_writer(self, &mut payload).map_err(|e| QueueError::Encode(e.to_string()))?;

        let len = u32::try_from(payload.len())
            .map_err(|_| QueueError::Encode(format!("record too large: {} bytes", payload.len())))?;

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
        frame.extend_from_slice(&JOURNAL_MAGIC);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = compute_crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }
}

/// Result of scanning a journal.
#[derive(Debug, Default)]
pub(crate) struct Replay {
    /// Entries in write order.
    pub entries: Vec<JournalEntry>,
    /// Offset just past the last valid frame.
    pub valid_len: u64,
    /// Why scanning stopped early, if it did.
    pub damage: Option<String>,
}

/// Reads every intact frame from the start of the backend.
///
/// Scanning stops at the first frame that is truncated, fails its checksum or
/// does not decode; everything after that point is considered a torn write.
pub(crate) fn replay(backend: &dyn StorageBackend) -> StorageResult<Replay> {
    let size = backend.size()?;
    let bytes = backend.read_at(0, size as usize)?;
    let mut replay = Replay::default();
    let mut offset = 0usize;

    while offset < bytes.len() {
        match decode_frame(&bytes[offset..]) {
            Ok((entry, consumed)) => {
                replay.entries.push(entry);
                offset += consumed;
                replay.valid_len = offset as u64;
            }
            Err(reason) => {
                replay.damage = Some(format!("{reason} at offset {offset}"));
                break;
            }
        }
    }

    Ok(replay)
}

fn decode_frame(bytes: &[u8]) -> Result<(JournalEntry, usize), String> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return Err("truncated header".into());
    }
    if bytes[0..4] != JOURNAL_MAGIC {
        return Err("bad magic".into());
    }

    let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let payload_end = HEADER_LEN + len;
    let frame_end = payload_end + TRAILER_LEN;
    if bytes.len() < frame_end {
        return Err("truncated payload".into());
    }

    let stored = u32::from_le_bytes([
        bytes[payload_end],
        bytes[payload_end + 1],
        bytes[payload_end + 2],
        bytes[payload_end + 3],
    ]);
    let computed = compute_crc32(&bytes[..payload_end]);
    if stored != computed {
        return Err(format!(
            "checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"
        ));
    }

    let entry: JournalEntry = ciborium::from_reader(&bytes[HEADER_LEN..payload_end])
        .map_err(|e| format!("undecodable record: {e}"))?;
    Ok((entry, frame_end))
}

/// Computes CRC32 (IEEE polynomial).
pub(crate) fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ TABLE[index];
    }
    !crc
}
