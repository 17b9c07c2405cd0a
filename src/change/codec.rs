//! Binary framing of changes.
//!
//! Bodies are CBOR. A body longer than [`COMPRESSION_THRESHOLD`] bytes is
//! compressed with LZ4 (size-prepended block format) and tagged with
//! [`COMPRESSED_DATA_TYPE`]; shorter bodies are stored raw with an empty tag.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::change::model::{Change, ChangeNoSnapshot, StoreChange};
use crate::error::{EngineError, Result};

pub const COMPRESSED_DATA_TYPE: &str = "1/s";
pub const COMPRESSION_THRESHOLD: usize = 64;
pub const MAX_CHANGE_SIZE: usize = 10 * 1024 * 1024;

/// LZ4 never expands more than this ratio; a larger claimed size means the
/// input is not a real compressed block.
const MAX_LZ4_RATIO: usize = 255;
const POOL_LIMIT: usize = 32;

static BUFFER_POOL: Mutex<Vec<Vec<u8>>> = parking_lot::const_mutex(Vec::new());

fn take_buffer() -> Vec<u8> {
    BUFFER_POOL.lock().pop().unwrap_or_else(|| Vec::with_capacity(256))
}

fn return_buffer(mut buf: Vec<u8>) {
    buf.clear();
    let mut pool = BUFFER_POOL.lock();
    if pool.len() < POOL_LIMIT && buf.capacity() <= 64 * 1024 {
        pool.push(buf);
    }
}

/// Encoded body plus its `dataType` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framed {
    pub data: Vec<u8>,
    pub data_type: String,
}

pub fn marshal_change(change: &Change) -> Result<Framed> {
    marshal(change)
}

pub fn marshal_store_change(change: &StoreChange) -> Result<Framed> {
    marshal(change)
}

/// Encodes any serializable value with the change framing rules.
pub fn marshal<T: Serialize>(value: &T) -> Result<Framed> {
    let mut buf = take_buffer();
    let encoded = ciborium::ser::into_writer(value, &mut buf)
        .map_err(EngineError::from)
        .and_then(|_| frame(&buf));
    return_buffer(buf);
    encoded
}

fn frame(raw: &[u8]) -> Result<Framed> {
    if raw.len() > MAX_CHANGE_SIZE {
        return Err(EngineError::BigChangeSize {
            size: raw.len(),
            limit: MAX_CHANGE_SIZE,
        });
    }
    if raw.len() > COMPRESSION_THRESHOLD {
        Ok(Framed {
            data: lz4_flex::compress_prepend_size(raw),
            data_type: COMPRESSED_DATA_TYPE.to_string(),
        })
    } else {
        Ok(Framed {
            data: raw.to_vec(),
            data_type: String::new(),
        })
    }
}

pub fn unmarshal_change(data: &[u8], data_type: &str) -> Result<Change> {
    unmarshal(data, data_type)
}

pub fn unmarshal_change_no_snapshot(data: &[u8], data_type: &str) -> Result<Change> {
    unmarshal::<ChangeNoSnapshot>(data, data_type).map(Change::from)
}

pub fn unmarshal_store_change(data: &[u8], data_type: &str) -> Result<StoreChange> {
    unmarshal(data, data_type)
}

/// Compressed-tagged bodies that fail to decompress or decode are retried as
/// raw CBOR; legacy writers tagged some raw bodies as compressed. When both
/// attempts fail the decompression-path error is returned.
pub fn unmarshal<T: DeserializeOwned>(data: &[u8], data_type: &str) -> Result<T> {
    if data_type != COMPRESSED_DATA_TYPE {
        return decode_exact(data);
    }
    let compressed_err = match decompress(data).and_then(|raw| decode_exact::<T>(&raw)) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };
    decode_exact(data).map_err(|_| compressed_err)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let header: [u8; 4] = data
        .get(..4)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| EngineError::Codec("compressed body shorter than its size header".into()))?;
    let claimed = u32::from_le_bytes(header) as usize;
    let ceiling = (data.len() - 4).saturating_mul(MAX_LZ4_RATIO).saturating_add(16);
    if claimed > MAX_CHANGE_SIZE || claimed > ceiling {
        return Err(EngineError::Codec(format!("implausible decompressed size {claimed}")));
    }
    Ok(lz4_flex::decompress_size_prepended(data)?)
}

fn decode_exact<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut reader = bytes;
    let value: T = ciborium::de::from_reader(&mut reader)?;
    if !reader.is_empty() {
        return Err(EngineError::Codec(format!("{} trailing bytes after change body", reader.len())));
    }
    Ok(value)
}

/// Decodes the first change of a walk with its snapshot and every later one
/// without, so long histories do not keep old snapshots alive.
#[derive(Debug, Default)]
pub struct SnapshotSkippingDecoder {
    first_done: bool,
}

impl SnapshotSkippingDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, data: &[u8], data_type: &str) -> Result<Change> {
        if self.first_done {
            return unmarshal_change_no_snapshot(data, data_type);
        }
        self.first_done = true;
        unmarshal_change(data, data_type)
    }
}
