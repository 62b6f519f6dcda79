//! Journal record types and framing.

use crate::error::{CoreError, CoreResult};
use crate::journal::{CRC_SIZE, HEADER_SIZE};
use farmsync_protocol::{SequenceId, ServerId, Task};
use serde::{Deserialize, Serialize};

/// Magic bytes identifying a journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"FSJR";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// Type of journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalRecordType {
    /// Task queued for a target.
    Enqueue = 1,
    /// Task held for review.
    Hold = 2,
    /// Held task approved into the delivery queue.
    Release = 3,
    /// Task acknowledged by the target.
    Delivered = 4,
    /// Entry removed without delivery.
    Discard = 5,
    /// Task merged into an earlier entry.
    Merged = 6,
    /// Every entry of a target abandoned.
    PurgeTarget = 7,
    /// Sequence ids handed out up to a bound.
    Reserve = 8,
}

impl JournalRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Enqueue),
            2 => Some(Self::Hold),
            3 => Some(Self::Release),
            4 => Some(Self::Delivered),
            5 => Some(Self::Discard),
            6 => Some(Self::Merged),
            7 => Some(Self::PurgeTarget),
            8 => Some(Self::Reserve),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One queue mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// A task was appended to a target's delivery queue.
    Enqueue {
        /// Target server.
        target: ServerId,
        /// The task.
        task: Task,
    },
    /// A task was placed in a target's review queue.
    Hold {
        /// Target server.
        target: ServerId,
        /// The task.
        task: Task,
    },
    /// A held task moved to the delivery queue.
    Release {
        /// Target server.
        target: ServerId,
        /// Released task.
        sequence_id: SequenceId,
    },
    /// The target acknowledged a task.
    Delivered {
        /// Target server.
        target: ServerId,
        /// Delivered task.
        sequence_id: SequenceId,
    },
    /// An entry was superseded or rejected.
    Discard {
        /// Target server.
        target: ServerId,
        /// Removed task.
        sequence_id: SequenceId,
    },
    /// A task was folded into an earlier pending entry.
    Merged {
        /// Target server.
        target: ServerId,
        /// Sequence id of the folded task.
        absorbed: SequenceId,
        /// The earlier entry after merging.
        task: Task,
    },
    /// All entries of a target were abandoned by an administrator.
    PurgeTarget {
        /// Target server.
        target: ServerId,
    },
    /// Sequence ids up to `up_to` may have been handed out.
    Reserve {
        /// Highest reserved id.
        up_to: SequenceId,
    },
}

impl JournalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> JournalRecordType {
        match self {
            Self::Enqueue { .. } => JournalRecordType::Enqueue,
            Self::Hold { .. } => JournalRecordType::Hold,
            Self::Release { .. } => JournalRecordType::Release,
            Self::Delivered { .. } => JournalRecordType::Delivered,
            Self::Discard { .. } => JournalRecordType::Discard,
            Self::Merged { .. } => JournalRecordType::Merged,
            Self::PurgeTarget { .. } => JournalRecordType::PurgeTarget,
            Self::Reserve { .. } => JournalRecordType::Reserve,
        }
    }

    /// Returns the target the record is about, if any.
    #[must_use]
    pub fn target(&self) -> Option<&ServerId> {
        match self {
            Self::Enqueue { target, .. }
            | Self::Hold { target, .. }
            | Self::Release { target, .. }
            | Self::Delivered { target, .. }
            | Self::Discard { target, .. }
            | Self::Merged { target, .. }
            | Self::PurgeTarget { target } => Some(target),
            Self::Reserve { .. } => None,
        }
    }

    /// Returns true for records that only retire earlier records.
    #[must_use]
    pub fn is_retirement(&self) -> bool {
        matches!(
            self,
            Self::Delivered { .. } | Self::Discard { .. } | Self::Merged { .. } | Self::PurgeTarget { .. }
        )
    }

    /// Serializes the record payload (without envelope).
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::invalid_operation(format!("journal encode: {e}")))?;
        Ok(buf)
    }

    /// Deserializes a payload and checks it matches `record_type`.
    pub fn decode_payload(record_type: JournalRecordType, payload: &[u8]) -> CoreResult<Self> {
        let record: Self = ciborium::from_reader(payload)
            .map_err(|e| CoreError::journal_corruption(format!("undecodable payload: {e}")))?;
        if record.record_type() != record_type {
            return Err(CoreError::journal_corruption(format!(
                "header says {record_type:?} but payload is {:?}",
                record.record_type()
            )));
        }
        Ok(record)
    }

    /// Encodes the full framed record.
    pub fn encode_frame(&self) -> CoreResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("journal record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&JOURNAL_MAGIC);
        data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        data.push(self.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);

        // CRC32 over everything before it
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

/// Computes CRC32 checksum for data (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
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
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
