//! Log records and their on-disk framing.
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────────────────┐
//! │ len (u32 LE) │ crc (u32 LE) │ CBOR payload (len)     │
//! └──────────────┴──────────────┴────────────────────────┘
//! ```
//!
//! The CRC covers the payload only. A frame that is short or fails its
//! CRC marks the end of the valid log.

use crate::error::{StorageError, StorageResult};
use crate::revision::{DocumentId, Revision, RevisionId, SequenceNumber};
use serde::{Deserialize, Serialize};

/// Size of the frame header.
pub(crate) const FRAME_HEADER_SIZE: usize = 8;

/// Largest payload accepted when reading a frame.
const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// One mutation of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum LogRecord {
    /// A revision became current.
    Commit {
        sequence: SequenceNumber,
        revision: Revision,
        history: Vec<RevisionId>,
    },
    /// A document was purged.
    Purge {
        sequence: SequenceNumber,
        doc_id: DocumentId,
    },
    /// A raw record was written or removed.
    Raw {
        key: String,
        value: Option<Vec<u8>>,
    },
}

impl LogRecord {
    /// Encodes the record as a framed byte sequence.
    pub(crate) fn encode(&self) -> StorageResult<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::ser::into_writer(self, &mut payload)
            .map_err(|e| StorageError::Encoding(e.to_string()))?;

        let len = u32::try_from(payload.len())
            .map_err(|_| StorageError::Encoding("record too large".into()))?;
        let crc = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

/// Result of reading one frame.
#[derive(Debug)]
pub(crate) enum Frame {
    /// A complete record and the total bytes it occupied.
    Record(LogRecord, usize),
    /// The remaining bytes do not hold a complete, valid frame.
    Torn,
    /// No bytes remain.
    End,
}

/// Reads the frame at the start of `data`.
pub(crate) fn read_frame(data: &[u8]) -> StorageResult<Frame> {
    if data.is_empty() {
        return Ok(Frame::End);
    }
    if data.len() < FRAME_HEADER_SIZE {
        return Ok(Frame::Torn);
    }

    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let crc = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if len > MAX_PAYLOAD || data.len() < FRAME_HEADER_SIZE + len {
        return Ok(Frame::Torn);
    }

    let payload = &data[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len];
    if crc32fast::hash(payload) != crc {
        return Ok(Frame::Torn);
    }

    // A payload that passes its CRC but does not decode is not a torn
    // write.
    let record: LogRecord = ciborium::de::from_reader(payload)
        .map_err(|e| StorageError::Corrupted(format!("undecodable record: {e}")))?;
    Ok(Frame::Record(record, FRAME_HEADER_SIZE + len))
}
