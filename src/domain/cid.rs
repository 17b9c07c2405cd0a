//! Minimal content-identifier codec: base32 multibase, varints, multihash header.

use sha2::{Digest, Sha256};

pub const CODEC_DAG_PB: u64 = 0x70;
pub const CODEC_DAG_CBOR: u64 = 0x71;
pub const HASH_SHA2_256: u64 = 0x12;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidInfo {
    pub version: u64,
    pub codec: u64,
    pub hash_code: u64,
}

impl CidInfo {
    pub fn is_file(&self) -> bool {
        self.codec == CODEC_DAG_PB && self.hash_code == HASH_SHA2_256
    }

    pub fn is_tree_root(&self) -> bool {
        self.codec == CODEC_DAG_CBOR
    }
}

/// Decodes a v0 (`Qm…`) or base32 v1 (`b…`) id. Returns `None` for anything else.
pub fn decode(id: &str) -> Option<CidInfo> {
    if id.len() == 46 && id.starts_with("Qm") {
        return Some(CidInfo {
            version: 0,
            codec: CODEC_DAG_PB,
            hash_code: HASH_SHA2_256,
        });
    }
    let body = id.strip_prefix('b')?;
    let bytes = base32_decode(body)?;

    let mut pos = 0;
    let version = read_varint(&bytes, &mut pos)?;
    if version != 1 {
        return None;
    }
    let codec = read_varint(&bytes, &mut pos)?;
    let hash_code = read_varint(&bytes, &mut pos)?;
    let digest_len = read_varint(&bytes, &mut pos)? as usize;
    if bytes.len() - pos != digest_len {
        return None;
    }
    Some(CidInfo {
        version,
        codec,
        hash_code,
    })
}

/// Builds a base32 v1 id of `data` hashed with sha2-256.
pub fn encode_v1(codec: u64, data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut bytes = Vec::with_capacity(digest.len() + 4);
    write_varint(&mut bytes, 1);
    write_varint(&mut bytes, codec);
    write_varint(&mut bytes, HASH_SHA2_256);
    write_varint(&mut bytes, digest.len() as u64);
    bytes.extend_from_slice(&digest);
    format!("b{}", base32_encode(&bytes))
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 8 / 5 + 1);
    let mut acc = 0u32;
    let mut bits = 0;
    for byte in data {
        acc = (acc << 8) | u32::from(*byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((acc >> bits) & 31) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((acc << (5 - bits)) & 31) as usize] as char);
    }
    out
}

fn base32_decode(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut acc = 0u32;
    let mut bits = 0;
    for ch in text.bytes() {
        let v = BASE32_ALPHABET.iter().position(|c| *c == ch)? as u32;
        acc = (acc << 5) | v;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((acc >> bits) & 0xff) as u8);
        }
    }
    Some(out)
}
