//! Frame codec for the database files.
//!
//! Every WAL entry and segment section is one frame:
//!
//! ```text
//! [version: 1 byte][length: 4 bytes LE][JSON payload: N bytes][crc32: 4 bytes LE]
//! ```
//!
//! Files start with a 5-byte header: the magic `CVST` and the codec version.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

const CODEC_VERSION: u8 = 1;

/// Largest payload accepted when decoding (64 MiB).
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Magic bytes at the start of every database file.
pub const MAGIC: [u8; 4] = *b"CVST";

/// Size of the file header in bytes.
pub const HEADER_LEN: u64 = 5;

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Encodes one value as a checksummed frame.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let payload =
        serde_json::to_vec(value).map_err(|e| invalid(format!("frame serialization failed: {e}")))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| invalid(format!("frame of {} bytes is too large", payload.len())))?;

    let mut frame = Vec::with_capacity(payload.len() + 9);
    frame.push(CODEC_VERSION);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(frame)
}

/// Decodes one frame, verifying its version and checksum.
///
/// A frame cut short by the end of input yields `UnexpectedEof`, which
/// readers treat as a torn tail rather than corruption.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported frame version {} (expected {CODEC_VERSION})",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(invalid(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = checksum(&payload);
    if stored != computed {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x}"
        )));
    }

    serde_json::from_slice(&payload).map_err(|e| invalid(format!("frame deserialization failed: {e}")))
}

/// Writes the file header.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])
}

/// Reads and validates the file header, returning its codec version.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(invalid(format!("not a convostore file (magic {magic:?})")));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    Ok(version[0])
}
