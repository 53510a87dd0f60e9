//! Byte-level primitives: hex, little-endian integers, varint, minimal
//! script numbers, push-data prefixes, and the two hash functions used
//! throughout the engine.
//!
//! Values are little-endian on the wire; txids and hash160s are
//! displayed big-endian (reversed from wire order), matching BCH
//! convention.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub type Bytes32 = [u8; 32];
pub type Bytes20 = [u8; 20];
pub type Pub33 = [u8; 33];

/// Decode a hex string into bytes, rejecting odd length or non-hex
/// characters with a [`Error::Validation`].
pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| Error::validation(format!("invalid hex: {e}")))
}

/// Decode a hex string into a fixed-size array.
pub fn from_hex_fixed<const N: usize>(s: &str) -> Result<[u8; N]> {
    let bytes = from_hex(s)?;
    if bytes.len() != N {
        return Err(Error::validation(format!(
            "expected {N} bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Reverse byte order — used for converting between wire txid order and
/// display (big-endian) txid order.
pub fn reversed(bytes: &[u8]) -> Vec<u8> {
    let mut v = bytes.to_vec();
    v.reverse();
    v
}

pub fn double_sha256(data: &[u8]) -> Bytes32 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

pub fn sha256(data: &[u8]) -> Bytes32 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// `HASH160(x) = RIPEMD160(SHA256(x))`.
pub fn hash160(data: &[u8]) -> Bytes20 {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

/// Concatenate any number of byte slices into one buffer.
pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for p in parts {
        out.extend_from_slice(p);
    }
    out
}

/// Encode `n` as a BIP-style varint.
pub fn write_varint(n: u64) -> Vec<u8> {
    if n < 0xfd {
        vec![n as u8]
    } else if n <= 0xffff {
        let mut v = vec![0xfd];
        v.extend_from_slice(&(n as u16).to_le_bytes());
        v
    } else if n <= 0xffff_ffff {
        let mut v = vec![0xfe];
        v.extend_from_slice(&(n as u32).to_le_bytes());
        v
    } else {
        let mut v = vec![0xff];
        v.extend_from_slice(&n.to_le_bytes());
        v
    }
}

/// Read a varint from the front of `data`, returning the value and the
/// number of bytes consumed.
pub fn read_varint(data: &[u8]) -> Result<(u64, usize)> {
    let first = *data
        .first()
        .ok_or_else(|| Error::validation("varint: empty input"))?;
    match first {
        0..=0xfc => Ok((first as u64, 1)),
        0xfd => {
            let bytes = data
                .get(1..3)
                .ok_or_else(|| Error::validation("varint: truncated u16"))?;
            Ok((u16::from_le_bytes(bytes.try_into().unwrap()) as u64, 3))
        }
        0xfe => {
            let bytes = data
                .get(1..5)
                .ok_or_else(|| Error::validation("varint: truncated u32"))?;
            Ok((u32::from_le_bytes(bytes.try_into().unwrap()) as u64, 5))
        }
        0xff => {
            let bytes = data
                .get(1..9)
                .ok_or_else(|| Error::validation("varint: truncated u64"))?;
            Ok((u64::from_le_bytes(bytes.try_into().unwrap()), 9))
        }
    }
}

/// Minimal signed script-number encoding: the shortest little-endian
/// two's-complement representation with a sign bit in the high bit of
/// the last byte, an extra zero byte appended when the magnitude's
/// top bit would otherwise be mistaken for the sign.
pub fn minimal_script_number(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let neg = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out.last().map(|b| b & 0x80 != 0).unwrap_or(false) {
        out.push(if neg { 0x80 } else { 0x00 });
    } else if neg {
        let last = out.last_mut().unwrap();
        *last |= 0x80;
    }
    out
}

/// Decode a minimal script number back to a signed integer.
pub fn decode_script_number(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        return Err(Error::validation("script number too long"));
    }
    let mut result: i64 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        result |= (b as i64) << (8 * i);
    }
    let last = bytes[bytes.len() - 1];
    if last & 0x80 != 0 {
        result &= !(0x80i64 << (8 * (bytes.len() - 1)));
        result = -result;
    }
    Ok(result)
}

/// Emit the smallest push-data opcode prefix for a payload of length `n`.
pub fn push_data_prefix(n: usize) -> Vec<u8> {
    if n < 0x4c {
        vec![n as u8]
    } else if n <= 0xff {
        vec![0x4c, n as u8]
    } else if n <= 0xffff {
        let mut v = vec![0x4d];
        v.extend_from_slice(&(n as u16).to_le_bytes());
        v
    } else {
        let mut v = vec![0x4e];
        v.extend_from_slice(&(n as u32).to_le_bytes());
        v
    }
}

/// Push `data` onto a script buffer with a minimal push-data prefix.
pub fn push_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = push_data_prefix(data.len());
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let bytes = from_hex("deadbeef").unwrap();
        assert_eq!(to_hex(&bytes), "deadbeef");
    }

    #[test]
    fn hex_rejects_odd_length() {
        assert!(from_hex("abc").is_err());
    }

    #[test]
    fn varint_small() {
        assert_eq!(write_varint(0), vec![0x00]);
        assert_eq!(write_varint(252), vec![0xfc]);
        let (v, len) = read_varint(&[0xfc]).unwrap();
        assert_eq!((v, len), (252, 1));
    }

    #[test]
    fn varint_roundtrip_all_widths() {
        for n in [0u64, 252, 253, 0xffff, 0x1_0000, u64::MAX] {
            let enc = write_varint(n);
            let (v, len) = read_varint(&enc).unwrap();
            assert_eq!(v, n);
            assert_eq!(len, enc.len());
        }
    }

    #[test]
    fn minimal_script_number_zero_is_empty() {
        assert_eq!(minimal_script_number(0), Vec::<u8>::new());
    }

    #[test]
    fn minimal_script_number_roundtrip() {
        for n in [-1i64, 1, 127, 128, -128, 255, 256, -256, 1_000_000, -1_000_000] {
            let enc = minimal_script_number(n);
            assert_eq!(decode_script_number(&enc).unwrap(), n);
        }
    }

    #[test]
    fn push_data_prefix_thresholds() {
        assert_eq!(push_data_prefix(10), vec![10]);
        assert_eq!(push_data_prefix(0x4c)[0], 0x4c);
        assert_eq!(push_data_prefix(0x100)[0], 0x4d);
        assert_eq!(push_data_prefix(0x1_0000)[0], 0x4e);
    }

    #[test]
    fn hash160_known_vector() {
        // HASH160 of the empty string.
        let h = hash160(b"");
        assert_eq!(
            to_hex(&h),
            "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb"
        );
    }
}
