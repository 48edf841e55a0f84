//! Binary codec for eventcask segment files.
//!
//! This module handles serialization and deserialization of the segment file
//! header and footer, transaction frames, and individual event records. It is
//! pure data transformation -- no file I/O, no async, no index management.
//!
//! On-disk layout (all integers little-endian):
//!
//! ```text
//! file:        [version:u8=2][flags:u32] (transaction)* [footer:u32=magic]
//! transaction: [length:u32][version:u8=2][event_count:u16] (event)* [crc32:u32]
//! event:       [length:u32][record bytes]
//! ```
//!
//! The transaction `length` counts everything after the length field itself,
//! checksum included. The CRC32 covers `[version ..= last event byte]`, so a
//! torn tail write is detectable: either the frame is shorter than `length`
//! promises (incomplete) or the checksum fails (corrupt).

use bytes::Bytes;

use crate::error::Error;
use crate::types::{Event, MAX_TRANSACTION_SIZE};

/// Current segment file format version.
pub const FILE_VERSION: u8 = 2;

/// Current transaction frame format version.
pub const TRANSACTION_VERSION: u8 = 2;

/// Size of the segment file header: version byte + flags word.
pub const FILE_HEADER_SIZE: usize = 1 + 4;

/// Size of the segment file footer.
pub const FILE_FOOTER_SIZE: usize = 4;

/// Magic word closing a sealed segment file.
pub const FILE_FOOTER_MAGIC: u32 = 0x4B53_4345; // "ECSK"

/// Size of a transaction frame header: length + version + event count.
pub const TX_HEADER_SIZE: usize = 4 + 1 + 2;

/// Size of the transaction checksum field.
pub const TX_CHECKSUM_SIZE: usize = 4;

/// Result of attempting to decode a value from a byte buffer.
///
/// Distinguishes between a successfully decoded value and a buffer that does
/// not contain enough bytes to form a complete frame. The distinction drives
/// crash recovery: a truncated trailing frame is expected after an unclean
/// shutdown, whereas a checksum mismatch followed by further valid data
/// indicates corruption.
#[derive(Debug)]
pub enum DecodeOutcome<T> {
    /// A full value was successfully decoded from the buffer.
    Complete {
        /// The decoded value.
        value: T,
        /// Total number of bytes consumed from the buffer.
        consumed: usize,
    },
    /// The buffer does not contain enough bytes to form a complete frame.
    Incomplete,
}

/// Header of a transaction frame, decoded without touching the events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHeader {
    /// Byte count of everything after the length field (checksum included).
    pub length: u32,
    /// Transaction format version.
    pub version: u8,
    /// Number of event records in the frame.
    pub event_count: u16,
}

impl TransactionHeader {
    /// Total frame size including the length field itself.
    pub fn frame_size(&self) -> usize {
        4 + self.length as usize
    }
}

/// Encode the segment file header.
pub fn encode_file_header(flags: u32) -> [u8; FILE_HEADER_SIZE] {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    buf[0] = FILE_VERSION;
    buf[1..5].copy_from_slice(&flags.to_le_bytes());
    buf
}

/// Decode and validate the segment file header, returning `(version, flags)`.
///
/// # Errors
///
/// Returns [`Error::DataFileRead`] if the buffer is too short or the version
/// is unsupported. The caller supplies the segment id for error reporting.
pub fn decode_file_header(segment: u64, buf: &[u8]) -> Result<(u8, u32), Error> {
    if buf.len() < FILE_HEADER_SIZE {
        return Err(Error::data_file(segment, "file too short for header"));
    }
    let version = buf[0];
    if version != FILE_VERSION {
        return Err(Error::data_file(
            segment,
            format!("unsupported segment file version: {version}"),
        ));
    }
    let flags = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    Ok((version, flags))
}

/// Encode an [`Event`] as a length-prefixed record.
pub fn encode_event(event: &Event) -> Vec<u8> {
    let id = event.aggregate_identifier.as_bytes();
    let kind = event.aggregate_type.as_bytes();
    let payload_type = event.payload_type.as_bytes();
    let payload_revision = event.payload_revision.as_bytes();

    let body_len = 2 + id.len()
        + 2 + kind.len()
        + 8 // aggregate_sequence_number
        + 8 // timestamp
        + 2 + payload_type.len()
        + 2 + payload_revision.len()
        + 4 + event.payload.len()
        + 4 + event.meta_data.len()
        + 1; // flags

    let mut buf = Vec::with_capacity(4 + body_len);
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    buf.extend_from_slice(&(id.len() as u16).to_le_bytes());
    buf.extend_from_slice(id);
    buf.extend_from_slice(&(kind.len() as u16).to_le_bytes());
    buf.extend_from_slice(kind);
    buf.extend_from_slice(&event.aggregate_sequence_number.to_le_bytes());
    buf.extend_from_slice(&event.timestamp.to_le_bytes());
    buf.extend_from_slice(&(payload_type.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload_type);
    buf.extend_from_slice(&(payload_revision.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload_revision);
    buf.extend_from_slice(&(event.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&event.payload);
    buf.extend_from_slice(&(event.meta_data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&event.meta_data);
    buf.push(event.snapshot as u8);
    buf
}

/// Decode a single event record from the start of a byte buffer.
///
/// # Errors
///
/// Returns [`Error::DataFileRead`] if a field is malformed (invalid UTF-8 or
/// an inner length running past the record).
pub fn decode_event(segment: u64, buf: &[u8]) -> Result<DecodeOutcome<Event>, Error> {
    if buf.len() < 4 {
        return Ok(DecodeOutcome::Incomplete);
    }
    let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total = 4 + body_len;
    if buf.len() < total {
        return Ok(DecodeOutcome::Incomplete);
    }

    let body = &buf[4..total];
    let mut cursor = 0usize;

    // Read `n` bytes from `body` at `cursor`, or fail with a record-bounds error.
    macro_rules! read_bytes {
        ($n:expr) => {{
            let n = $n;
            if cursor + n > body.len() {
                return Err(Error::data_file(segment, "unexpected end of event record"));
            }
            let start = cursor;
            cursor += n;
            &body[start..cursor]
        }};
    }
    macro_rules! read_u16_len {
        () => {{
            let raw = read_bytes!(2);
            u16::from_le_bytes([raw[0], raw[1]]) as usize
        }};
    }
    macro_rules! read_u32_len {
        () => {{
            let raw = read_bytes!(4);
            u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
        }};
    }
    macro_rules! read_string {
        ($len:expr) => {{
            let raw = read_bytes!($len);
            std::str::from_utf8(raw)
                .map_err(|e| Error::data_file(segment, format!("invalid UTF-8 in event: {e}")))?
                .to_string()
        }};
    }

    let id_len = read_u16_len!();
    let aggregate_identifier = read_string!(id_len);
    let kind_len = read_u16_len!();
    let aggregate_type = read_string!(kind_len);

    let seq_raw = read_bytes!(8);
    let aggregate_sequence_number =
        u64::from_le_bytes(seq_raw.try_into().expect("8 bytes for u64"));
    let ts_raw = read_bytes!(8);
    let timestamp = i64::from_le_bytes(ts_raw.try_into().expect("8 bytes for i64"));

    let payload_type_len = read_u16_len!();
    let payload_type = read_string!(payload_type_len);
    let payload_revision_len = read_u16_len!();
    let payload_revision = read_string!(payload_revision_len);

    let payload_len = read_u32_len!();
    let payload = Bytes::copy_from_slice(read_bytes!(payload_len));
    let meta_len = read_u32_len!();
    let meta_data = Bytes::copy_from_slice(read_bytes!(meta_len));

    let flags = read_bytes!(1)[0];

    Ok(DecodeOutcome::Complete {
        value: Event {
            aggregate_identifier,
            aggregate_type,
            aggregate_sequence_number,
            timestamp,
            payload_type,
            payload_revision,
            payload,
            meta_data,
            snapshot: flags & 1 != 0,
        },
        consumed: total,
    })
}

/// Encode a batch of events as one transaction frame.
///
/// Returns the complete frame and the offset of every event record relative
/// to the frame start. The offsets become index positions once the caller
/// adds the frame's position within the segment file.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if the batch is empty, exceeds `u16`
/// events, or the encoded frame exceeds [`MAX_TRANSACTION_SIZE`].
pub fn encode_transaction(events: &[Event]) -> Result<(Vec<u8>, Vec<u32>), Error> {
    if events.is_empty() {
        return Err(Error::InvalidArgument(
            "transaction must contain at least one event".to_string(),
        ));
    }
    if events.len() > u16::MAX as usize {
        return Err(Error::InvalidArgument(format!(
            "transaction contains {} events, limit is {}",
            events.len(),
            u16::MAX
        )));
    }

    let mut buf = Vec::new();
    buf.extend_from_slice(&[0u8; 4]); // length placeholder
    buf.push(TRANSACTION_VERSION);
    buf.extend_from_slice(&(events.len() as u16).to_le_bytes());

    let mut positions = Vec::with_capacity(events.len());
    for event in events {
        positions.push(buf.len() as u32);
        buf.extend_from_slice(&encode_event(event));
    }

    // CRC32 over [version ..= last event byte].
    let crc = crc32fast::hash(&buf[4..]);
    buf.extend_from_slice(&crc.to_le_bytes());

    if buf.len() > MAX_TRANSACTION_SIZE {
        return Err(Error::InvalidArgument(format!(
            "transaction of {} bytes exceeds the {} byte limit",
            buf.len(),
            MAX_TRANSACTION_SIZE
        )));
    }

    let length = (buf.len() - 4) as u32;
    buf[0..4].copy_from_slice(&length.to_le_bytes());
    Ok((buf, positions))
}

/// Decode a transaction frame header from the start of a byte buffer.
///
/// A zero length field means the buffer points at the zeroed tail of a
/// pre-allocated segment: there is no further transaction, reported as
/// `Incomplete`.
///
/// # Errors
///
/// Returns [`Error::DataFileRead`] if the version byte is unsupported.
pub fn decode_transaction_header(
    segment: u64,
    buf: &[u8],
) -> Result<DecodeOutcome<TransactionHeader>, Error> {
    if buf.len() < TX_HEADER_SIZE {
        return Ok(DecodeOutcome::Incomplete);
    }
    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if length == 0 {
        return Ok(DecodeOutcome::Incomplete);
    }
    let version = buf[4];
    if version != TRANSACTION_VERSION {
        return Err(Error::data_file(
            segment,
            format!("unsupported transaction version: {version}"),
        ));
    }
    let event_count = u16::from_le_bytes([buf[5], buf[6]]);
    Ok(DecodeOutcome::Complete {
        value: TransactionHeader {
            length,
            version,
            event_count,
        },
        consumed: TX_HEADER_SIZE,
    })
}

/// Decode a full transaction frame, returning the events and their offsets
/// relative to the frame start.
///
/// When `verify_crc` is set, the stored checksum is recomputed over
/// `[version ..= last event byte]` and a mismatch is an error. Recovery and
/// validation always verify; steady-state iteration may skip the check.
///
/// # Errors
///
/// Returns [`Error::DataFileRead`] on checksum mismatch, malformed event
/// records, or an event count that does not fill the frame.
pub fn decode_transaction(
    segment: u64,
    buf: &[u8],
    verify_crc: bool,
) -> Result<DecodeOutcome<(TransactionHeader, Vec<(u32, Event)>)>, Error> {
    let header = match decode_transaction_header(segment, buf)? {
        DecodeOutcome::Complete { value, .. } => value,
        DecodeOutcome::Incomplete => return Ok(DecodeOutcome::Incomplete),
    };
    let frame_size = header.frame_size();
    if buf.len() < frame_size {
        return Ok(DecodeOutcome::Incomplete);
    }

    let crc_offset = frame_size - TX_CHECKSUM_SIZE;
    if verify_crc {
        let stored = u32::from_le_bytes([
            buf[crc_offset],
            buf[crc_offset + 1],
            buf[crc_offset + 2],
            buf[crc_offset + 3],
        ]);
        let computed = crc32fast::hash(&buf[4..crc_offset]);
        if stored != computed {
            return Err(Error::data_file(
                segment,
                format!("transaction CRC mismatch: stored {stored:#010X}, computed {computed:#010X}"),
            ));
        }
    }

    let mut events = Vec::with_capacity(header.event_count as usize);
    let mut offset = TX_HEADER_SIZE;
    for _ in 0..header.event_count {
        match decode_event(segment, &buf[offset..crc_offset])? {
            DecodeOutcome::Complete { value, consumed } => {
                events.push((offset as u32, value));
                offset += consumed;
            }
            DecodeOutcome::Incomplete => {
                return Err(Error::data_file(
                    segment,
                    "transaction event count runs past the frame",
                ));
            }
        }
    }

    Ok(DecodeOutcome::Complete {
        value: (header, events),
        consumed: frame_size,
    })
}
