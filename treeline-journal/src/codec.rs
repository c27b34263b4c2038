//! The on-disk entry frame codec.
//!
//! Each journal entry is stored as a single frame:
//!
//! ```text
//! | len: u32 | crc: u32 | term: u64 | index: u64 | payload bytes |
//! ```
//!
//! `len` counts everything after the crc field. The CRC covers the same region, so a frame
//! whose length field was itself corrupted fails the CRC as well. All integers are
//! little-endian.
//!
//! Decoding distinguishes a frame that is merely cut short (`Truncated`, expected at the tail
//! of the active segment after a crash; recovery stops there and drops the tail) from one that
//! is damaged (`CrcMismatch`/`Malformed`, meaning the journal is corrupt and the replica must
//! not continue).

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use treeline_raft::raft::Entry;
use treeline_raft::{AppData, LogId};

/// Frame header length: len + crc fields.
pub const FRAME_PREFIX_LEN: usize = 4 + 4;
/// Fixed frame body length before the payload: term + index.
pub const FRAME_FIXED_BODY_LEN: usize = 8 + 8;

/// An error arising from encoding or decoding a journal frame.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ends before the frame does.
    ///
    /// This is the distinguishable "torn write" condition: at the tail of the newest segment
    /// it is recovered by dropping the partial frame, anywhere else it is corruption.
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    /// The frame's checksum does not match its content.
    #[error("crc mismatch in frame at index {index}: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { index: u64, stored: u32, computed: u32 },
    /// The frame's structure or payload could not be interpreted.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// An I/O error from the underlying medium.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Append the frame for `entry` to `buf`.
pub fn encode_entry<D: AppData>(entry: &Entry<D>, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    let payload = serde_json::to_vec(&entry.payload).map_err(|err| CodecError::Malformed(err.to_string()))?;

    let mut body = Vec::with_capacity(FRAME_FIXED_BODY_LEN + payload.len());
    body.write_u64::<LittleEndian>(entry.log_id.term)?;
    body.write_u64::<LittleEndian>(entry.log_id.index)?;
    body.extend_from_slice(&payload);

    let crc = crc32fast::hash(&body);
    buf.write_u32::<LittleEndian>(body.len() as u32)?;
    buf.write_u32::<LittleEndian>(crc)?;
    buf.extend_from_slice(&body);
    Ok(())
}

/// Decode one frame from the front of `buf`, returning the entry and the number of bytes
/// consumed.
pub fn decode_entry<D: AppData>(buf: &[u8]) -> Result<(Entry<D>, usize), CodecError> {
    if buf.len() < FRAME_PREFIX_LEN {
        return Err(CodecError::Truncated {
            need: FRAME_PREFIX_LEN,
            have: buf.len(),
        });
    }
    let mut cursor = Cursor::new(buf);
    let body_len = cursor.read_u32::<LittleEndian>()? as usize;
    let stored_crc = cursor.read_u32::<LittleEndian>()?;

    if body_len < FRAME_FIXED_BODY_LEN {
        return Err(CodecError::Malformed(format!("frame body too small: {} bytes", body_len)));
    }
    let total = FRAME_PREFIX_LEN + body_len;
    if buf.len() < total {
        return Err(CodecError::Truncated {
            need: total,
            have: buf.len(),
        });
    }

    let body = &buf[FRAME_PREFIX_LEN..total];
    let mut body_cursor = Cursor::new(body);
    let term = body_cursor.read_u64::<LittleEndian>()?;
    let index = body_cursor.read_u64::<LittleEndian>()?;

    let computed = crc32fast::hash(body);
    if computed != stored_crc {
        return Err(CodecError::CrcMismatch {
            index,
            stored: stored_crc,
            computed,
        });
    }

    let payload = serde_json::from_slice(&body[FRAME_FIXED_BODY_LEN..]).map_err(|err| CodecError::Malformed(err.to_string()))?;
    Ok((
        Entry {
            log_id: LogId::new(term, index),
            payload,
        },
        total,
    ))
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use treeline_raft::raft::{EntryNormal, EntryPayload};
    use treeline_raft::AppData;

    use super::*;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct TestData {
        data: Vec<u8>,
    }
    impl AppData for TestData {}

    fn entry(term: u64, index: u64, data: &[u8]) -> Entry<TestData> {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Normal(EntryNormal {
                data: TestData { data: data.to_vec() },
            }),
        }
    }

    #[test]
    fn frame_roundtrip() {
        let original = entry(3, 42, b"payload bytes");
        let mut buf = Vec::new();
        encode_entry(&original, &mut buf).unwrap();

        let (decoded, used) = decode_entry::<TestData>(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, original);
    }

    #[test]
    fn consecutive_frames_decode_in_order() {
        let mut buf = Vec::new();
        encode_entry(&entry(1, 1, b"a"), &mut buf).unwrap();
        encode_entry(&entry(1, 2, b"bb"), &mut buf).unwrap();

        let (first, used) = decode_entry::<TestData>(&buf).unwrap();
        assert_eq!(first.log_id, LogId::new(1, 1));
        let (second, _) = decode_entry::<TestData>(&buf[used..]).unwrap();
        assert_eq!(second.log_id, LogId::new(1, 2));
    }

    #[test]
    fn truncated_buffer_is_distinguishable() {
        let mut buf = Vec::new();
        encode_entry(&entry(1, 7, b"some payload"), &mut buf).unwrap();

        // Cut anywhere short of a full frame: always reported as Truncated, never corrupt.
        for cut in [1, FRAME_PREFIX_LEN, buf.len() - 1] {
            let err = decode_entry::<TestData>(&buf[..cut]).unwrap_err();
            assert!(matches!(err, CodecError::Truncated { .. }), "cut at {}: {:?}", cut, err);
        }
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let mut buf = Vec::new();
        encode_entry(&entry(1, 7, b"some payload"), &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let err = decode_entry::<TestData>(&buf).unwrap_err();
        assert!(matches!(err, CodecError::CrcMismatch { index: 7, .. }), "{:?}", err);
    }
}
