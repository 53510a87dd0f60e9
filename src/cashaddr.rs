//! CashAddr address encoding and the paycode envelope.
//!
//! CashAddr uses its own base32 alphabet and BCH-specific checksum
//! polynomial — unrelated to BIP173 bech32 despite the visual
//! resemblance. Paycode is a base58check payload carrying the wallet's
//! scan public key.

use crate::config::Network;
use crate::error::{Error, Result};
use crate::primitives::{Bytes20, Pub33};

const CHARSET: &[u8] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// CashAddr hash type: P2PKH (version bit pattern 0) or P2SH (1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    P2pkh,
    P2sh,
}

fn polymod(values: &[u8]) -> u64 {
    let mut c: u64 = 1;
    for &d in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x07ff_ffff_ff) << 5) ^ (d as u64);
        if c0 & 0x01 != 0 {
            c ^= 0x98_f2bc_8e61;
        }
        if c0 & 0x02 != 0 {
            c ^= 0x79_b76d_99e2;
        }
        if c0 & 0x04 != 0 {
            c ^= 0xf3_3e5f_b3c4;
        }
        if c0 & 0x08 != 0 {
            c ^= 0xae_2eab_e2a8;
        }
        if c0 & 0x10 != 0 {
            c ^= 0x1e_4f43_e470;
        }
    }
    c ^ 1
}

fn prefix_expand(prefix: &str) -> Vec<u8> {
    let mut v: Vec<u8> = prefix.bytes().map(|b| b & 0x1f).collect();
    v.push(0);
    v
}

fn convert_bits(data: &[u8], from_bits: u32, to_bits: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let maxv = (1u32 << to_bits) - 1;
    let mut out = Vec::new();
    for &value in data {
        if (value as u32) >> from_bits != 0 {
            return None;
        }
        acc = (acc << from_bits) | value as u32;
        bits += from_bits;
        while bits >= to_bits {
            bits -= to_bits;
            out.push(((acc >> bits) & maxv) as u8);
        }
    }
    if pad {
        if bits > 0 {
            out.push(((acc << (to_bits - bits)) & maxv) as u8);
        }
    } else if bits >= from_bits || (acc << (to_bits - bits)) & maxv != 0 {
        return None;
    }
    Some(out)
}

/// Encode a 20-byte hash into a CashAddr string for `network`.
pub fn encode(network: Network, addr_type: AddressType, hash: &Bytes20) -> String {
    let prefix = network.cashaddr_prefix();
    let version_byte: u8 = match addr_type {
        AddressType::P2pkh => 0x00,
        AddressType::P2sh => 0x08,
    };
    let payload = crate::primitives::concat(&[&[version_byte], hash]);
    let payload5 = convert_bits(&payload, 8, 5, true).expect("8->5 bit conversion cannot fail");

    let mut checksum_input = prefix_expand(prefix);
    checksum_input.extend_from_slice(&payload5);
    checksum_input.extend_from_slice(&[0u8; 8]);
    let checksum = polymod(&checksum_input);

    let mut checksum5 = Vec::with_capacity(8);
    for i in 0..8 {
        checksum5.push(((checksum >> (5 * (7 - i))) & 0x1f) as u8);
    }

    let body: String = payload5
        .iter()
        .chain(checksum5.iter())
        .map(|&b| CHARSET[b as usize] as char)
        .collect();

    format!("{prefix}:{body}")
}

/// Decode a CashAddr string, validating the checksum and returning the
/// address type and raw 20-byte hash. Accepts addresses with or without
/// an explicit `prefix:` component, in which case the caller's expected
/// network prefix is assumed.
pub fn decode(network: Network, input: &str) -> Result<(AddressType, Bytes20)> {
    let (prefix, body) = match input.split_once(':') {
        Some((p, b)) => (p.to_string(), b),
        None => (network.cashaddr_prefix().to_string(), input),
    };

    if body.is_empty() {
        return Err(Error::validation("cashaddr: empty body"));
    }

    let lower = body.to_lowercase();
    if lower != body && body.to_uppercase() != body {
        return Err(Error::validation("cashaddr: mixed case"));
    }
    let body = lower;

    let mut values = Vec::with_capacity(body.len());
    for c in body.chars() {
        let idx = CHARSET
            .iter()
            .position(|&x| x as char == c)
            .ok_or_else(|| Error::validation(format!("cashaddr: invalid character '{c}'")))?;
        values.push(idx as u8);
    }

    let mut checksum_input = prefix_expand(&prefix);
    checksum_input.extend_from_slice(&values);
    if polymod(&checksum_input) != 0 {
        return Err(Error::validation("cashaddr: checksum mismatch"));
    }

    let payload5 = &values[..values.len() - 8];
    let payload =
        convert_bits(payload5, 5, 8, false).ok_or_else(|| Error::validation("cashaddr: bad padding"))?;

    if payload.is_empty() {
        return Err(Error::validation("cashaddr: empty payload"));
    }
    let version_byte = payload[0];
    let hash = &payload[1..];
    if hash.len() != 20 {
        return Err(Error::validation("cashaddr: only 20-byte hashes supported"));
    }

    let addr_type = match version_byte & 0x78 {
        0x00 => AddressType::P2pkh,
        0x08 => AddressType::P2sh,
        _ => return Err(Error::validation("cashaddr: unsupported address type")),
    };

    if network.cashaddr_prefix() != prefix {
        return Err(Error::validation(format!(
            "cashaddr: network mismatch, expected prefix '{}', got '{prefix}'",
            network.cashaddr_prefix()
        )));
    }

    let mut out = [0u8; 20];
    out.copy_from_slice(hash);
    Ok((addr_type, out))
}

const PAYCODE_VERSION: u8 = 0x47;

const PAYCODE_PAYLOAD_LEN: usize = 80;

/// Encode a scan public key into a `"PM" || base58check(...)` paycode.
/// The inner payload is `0x01 0x00 || scanPub33 || chainCode32 || pad`,
/// padded to 80 bytes; a bare scan-pub paycode carries an all-zero
/// chain code.
pub fn encode_paycode(scan_pub: &Pub33) -> String {
    let mut payload = vec![0x01u8, 0x00];
    payload.extend_from_slice(scan_pub);
    payload.extend_from_slice(&[0u8; 32]);
    payload.resize(PAYCODE_PAYLOAD_LEN, 0);

    let mut versioned = vec![PAYCODE_VERSION];
    versioned.extend_from_slice(&payload);
    format!("PM{}", bs58::encode(checked(&versioned)).into_string())
}

fn checked(payload: &[u8]) -> Vec<u8> {
    let checksum = crate::primitives::double_sha256(payload);
    let mut out = payload.to_vec();
    out.extend_from_slice(&checksum[0..4]);
    out
}

/// Decode a paycode string, returning the embedded scan public key.
/// Rejects any payload whose point is not on-curve, or whose version
/// byte does not match.
pub fn decode_paycode(input: &str) -> Result<Pub33> {
    let body = input
        .strip_prefix("PM")
        .ok_or_else(|| Error::validation("paycode: missing 'PM' prefix"))?;

    let decoded = bs58::decode(body)
        .into_vec()
        .map_err(|e| Error::validation(format!("paycode: invalid base58: {e}")))?;

    if decoded.len() < 4 {
        return Err(Error::validation("paycode: too short"));
    }
    let (payload, checksum) = decoded.split_at(decoded.len() - 4);
    let expected = crate::primitives::double_sha256(payload);
    if checksum != &expected[0..4] {
        return Err(Error::validation("paycode: checksum mismatch"));
    }

    if payload.is_empty() || payload[0] != PAYCODE_VERSION {
        return Err(Error::validation("paycode: unexpected version byte"));
    }
    let body = &payload[1..];
    if body.len() < 2 + 33 {
        return Err(Error::validation("paycode: truncated payload"));
    }
    if body[0] != 0x01 || body[1] != 0x00 {
        return Err(Error::validation("paycode: unexpected flags"));
    }

    let mut scan_pub = [0u8; 33];
    scan_pub.copy_from_slice(&body[2..35]);

    if !crate::curve::is_valid_pubkey(&scan_pub) {
        return Err(Error::validation("paycode: embedded point is not on-curve"));
    }

    Ok(scan_pub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cashaddr_roundtrip_p2pkh() {
        let hash = [0x11u8; 20];
        let addr = encode(Network::Mainnet, AddressType::P2pkh, &hash);
        assert!(addr.starts_with("bitcoincash:"));
        let (t, decoded) = decode(Network::Mainnet, &addr).unwrap();
        assert_eq!(t, AddressType::P2pkh);
        assert_eq!(decoded, hash);
    }

    #[test]
    fn cashaddr_roundtrip_p2sh() {
        let hash = [0x22u8; 20];
        let addr = encode(Network::Testnet, AddressType::P2sh, &hash);
        let (t, decoded) = decode(Network::Testnet, &addr).unwrap();
        assert_eq!(t, AddressType::P2sh);
        assert_eq!(decoded, hash);
    }

    #[test]
    fn cashaddr_rejects_invalid_prefix() {
        let err = decode(Network::Mainnet, "bchtest:qpzrytypo00000000000000000000000000000000");
        assert!(err.is_err());
    }

    #[test]
    fn cashaddr_rejects_bad_checksum() {
        let hash = [0x33u8; 20];
        let mut addr = encode(Network::Mainnet, AddressType::P2pkh, &hash);
        let last = addr.pop().unwrap();
        let replacement = if last == 'q' { 'p' } else { 'q' };
        addr.push(replacement);
        assert!(decode(Network::Mainnet, &addr).is_err());
    }

    #[test]
    fn paycode_roundtrip() {
        let priv32 = {
            let mut p = [0u8; 32];
            p[31] = 7;
            p
        };
        let scan_pub = crate::curve::get_public_key(&priv32).unwrap();
        let paycode = encode_paycode(&scan_pub);
        assert!(paycode.starts_with("PM"));
        let decoded = decode_paycode(&paycode).unwrap();
        assert_eq!(decoded, scan_pub);
    }

    #[test]
    fn paycode_rejects_missing_prefix() {
        assert!(decode_paycode("not-a-paycode").is_err());
    }
}
