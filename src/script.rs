//! Locking scripts and the CashTokens prefix.

use crate::error::{Error, Result};
use crate::primitives::{push_bytes, write_varint, Bytes20, Bytes32};

/// `P2PKH(h160) = 76 a9 14 <h160> 88 ac`.
pub fn p2pkh_script(hash160: &Bytes20) -> Vec<u8> {
    let mut out = vec![0x76, 0xa9, 0x14];
    out.extend_from_slice(hash160);
    out.extend_from_slice(&[0x88, 0xac]);
    out
}

/// `P2SH(h20) = a9 14 <h20> 87`.
pub fn p2sh_script(hash20: &Bytes20) -> Vec<u8> {
    let mut out = vec![0xa9, 0x14];
    out.extend_from_slice(hash20);
    out.push(0x87);
    out
}

const P2PKH_START: [u8; 3] = [0x76, 0xa9, 0x14];
const P2SH_START: [u8; 2] = [0xa9, 0x14];

/// NFT capability carried by a token, per CashTokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NftCapability {
    None,
    Mutable,
    Minting,
}

impl NftCapability {
    fn code(self) -> u8 {
        match self {
            NftCapability::None => 0,
            NftCapability::Mutable => 1,
            NftCapability::Minting => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(NftCapability::None),
            1 => Ok(NftCapability::Mutable),
            2 => Ok(NftCapability::Minting),
            other => Err(Error::validation(format!("invalid NFT capability code {other}"))),
        }
    }
}

/// A parsed CashTokens prefix: `0xef || category32 || bitfield ||
/// [commitmentLen commitment] || [amountVarInt]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPrefix {
    pub category: Bytes32,
    pub capability: NftCapability,
    pub commitment: Option<Vec<u8>>,
    pub amount: Option<u64>,
}

impl TokenPrefix {
    fn has_nft(&self) -> bool {
        self.commitment.is_some() || self.capability != NftCapability::None
    }

    fn validate(&self) -> Result<()> {
        if self.commitment.is_none() && self.amount.is_none() {
            return Err(Error::validation("token prefix: neither NFT nor amount present"));
        }
        if let Some(commitment) = &self.commitment {
            if commitment.is_empty() || commitment.len() > 40 {
                return Err(Error::validation("token prefix: commitment length must be in [1,40]"));
            }
        }
        if let Some(amount) = self.amount {
            if amount == 0 || amount > (1u64 << 63) - 1 {
                return Err(Error::validation("token prefix: amount out of range"));
            }
        }
        if self.capability != NftCapability::None && self.commitment.is_none() && !self.has_nft() {
            return Err(Error::validation("token prefix: capability set without NFT"));
        }
        Ok(())
    }

    /// Whether this token carries an NFT at all (commitment or a
    /// non-default capability).
    pub fn carries_nft(&self) -> bool {
        self.commitment.is_some() || self.capability != NftCapability::None
    }
}

/// Serialize a [`TokenPrefix`] to its on-wire bytes.
pub fn encode_token_prefix(token: &TokenPrefix) -> Result<Vec<u8>> {
    token.validate()?;

    let has_commitment = token.commitment.is_some();
    let has_nft = token.carries_nft();
    let has_amount = token.amount.is_some();

    if has_commitment && !has_nft {
        return Err(Error::validation("token prefix: commitment requires NFT"));
    }

    let mut bitfield = token.capability.code();
    if has_amount {
        bitfield |= 0x10;
    }
    if has_nft {
        bitfield |= 0x20;
    }
    if has_commitment {
        bitfield |= 0x40;
    }

    let mut out = vec![0xefu8];
    out.extend_from_slice(&token.category);
    out.push(bitfield);
    if let Some(commitment) = &token.commitment {
        out.push(commitment.len() as u8);
        out.extend_from_slice(commitment);
    }
    if let Some(amount) = token.amount {
        out.extend_from_slice(&write_varint(amount));
    }
    Ok(out)
}

/// Parse a [`TokenPrefix`] from the front of `data`, returning the
/// value and the number of bytes consumed.
pub fn decode_token_prefix(data: &[u8]) -> Result<(TokenPrefix, usize)> {
    if data.first() != Some(&0xef) {
        return Err(Error::validation("token prefix: missing 0xef marker"));
    }
    if data.len() < 1 + 32 + 1 {
        return Err(Error::validation("token prefix: truncated"));
    }

    let mut category = [0u8; 32];
    category.copy_from_slice(&data[1..33]);
    let bitfield = data[33];

    let has_amount = bitfield & 0x10 != 0;
    let has_nft = bitfield & 0x20 != 0;
    let has_commitment = bitfield & 0x40 != 0;
    let capability = NftCapability::from_code(bitfield & 0x0f)?;

    if !has_nft && capability != NftCapability::None {
        return Err(Error::validation("token prefix: capability set without NFT bit"));
    }
    if has_commitment && !has_nft {
        return Err(Error::validation("token prefix: commitment bit set without NFT bit"));
    }

    let mut pos = 34;
    let commitment = if has_commitment {
        let len = *data
            .get(pos)
            .ok_or_else(|| Error::validation("token prefix: truncated commitment length"))? as usize;
        if len == 0 || len > 40 {
            return Err(Error::validation("token prefix: commitment length out of range"));
        }
        pos += 1;
        let bytes = data
            .get(pos..pos + len)
            .ok_or_else(|| Error::validation("token prefix: truncated commitment"))?
            .to_vec();
        pos += len;
        Some(bytes)
    } else {
        None
    };

    let amount = if has_amount {
        let (value, len) = crate::primitives::read_varint(&data[pos..])?;
        pos += len;
        Some(value)
    } else {
        None
    };

    if !has_nft && commitment.is_none() && amount.is_none() {
        return Err(Error::validation("token prefix: neither NFT nor amount present"));
    }

    Ok((
        TokenPrefix {
            category,
            capability,
            commitment,
            amount,
        },
        pos,
    ))
}

/// Prepend an encoded token prefix to a locking script.
pub fn add_token_to_script(token: &TokenPrefix, locking: &[u8]) -> Result<Vec<u8>> {
    let mut out = encode_token_prefix(token)?;
    out.extend_from_slice(locking);
    Ok(out)
}

/// Split a raw `scriptPubKey` into its optional CashTokens prefix and
/// the underlying locking script, by scanning forward from position 1
/// for the first P2PKH or P2SH start pattern. If neither is found (or
/// the input does not start with `0xef`), the whole input is returned
/// as the locking script with no prefix.
pub fn split_token_prefix(raw_spk: &[u8]) -> (Option<Vec<u8>>, Vec<u8>) {
    if raw_spk.first() != Some(&0xef) {
        return (None, raw_spk.to_vec());
    }
    for i in 1..raw_spk.len() {
        let rest = &raw_spk[i..];
        if rest.starts_with(&P2PKH_START) || rest.starts_with(&P2SH_START) {
            return (Some(raw_spk[..i].to_vec()), rest.to_vec());
        }
    }
    (None, raw_spk.to_vec())
}

/// Wrap a raw value in a minimal direct-push script fragment.
pub fn push(data: &[u8]) -> Vec<u8> {
    push_bytes(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2pkh_script_shape() {
        let h = [0x11u8; 20];
        let s = p2pkh_script(&h);
        assert_eq!(s[0], 0x76);
        assert_eq!(s[1], 0xa9);
        assert_eq!(s[2], 0x14);
        assert_eq!(&s[3..23], &h);
        assert_eq!(&s[23..], &[0x88, 0xac]);
    }

    #[test]
    fn p2sh_script_shape() {
        let h = [0x22u8; 20];
        let s = p2sh_script(&h);
        assert_eq!(s[0], 0xa9);
        assert_eq!(s[1], 0x14);
        assert_eq!(&s[2..22], &h);
        assert_eq!(s[22], 0x87);
    }

    #[test]
    fn token_prefix_roundtrip_nft_and_amount() {
        let token = TokenPrefix {
            category: [0x42; 32],
            capability: NftCapability::Mutable,
            commitment: Some(vec![0xaa; 8]),
            amount: Some(1234),
        };
        let encoded = encode_token_prefix(&token).unwrap();
        let (decoded, len) = decode_token_prefix(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        assert_eq!(decoded, token);
    }

    #[test]
    fn token_prefix_roundtrip_amount_only() {
        let token = TokenPrefix {
            category: [0x09; 32],
            capability: NftCapability::None,
            commitment: None,
            amount: Some(99),
        };
        let encoded = encode_token_prefix(&token).unwrap();
        let (decoded, _) = decode_token_prefix(&encoded).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn token_prefix_rejects_neither_nft_nor_amount() {
        let token = TokenPrefix {
            category: [0; 32],
            capability: NftCapability::None,
            commitment: None,
            amount: None,
        };
        assert!(encode_token_prefix(&token).is_err());
    }

    #[test]
    fn token_prefix_rejects_oversized_commitment() {
        let token = TokenPrefix {
            category: [0; 32],
            capability: NftCapability::Mutable,
            commitment: Some(vec![0; 41]),
            amount: None,
        };
        assert!(encode_token_prefix(&token).is_err());
    }

    #[test]
    fn split_and_add_token_roundtrip() {
        let token = TokenPrefix {
            category: [0x05; 32],
            capability: NftCapability::Minting,
            commitment: Some(vec![1, 2, 3]),
            amount: None,
        };
        let locking = p2pkh_script(&[0x77; 20]);
        let full = add_token_to_script(&token, &locking).unwrap();

        let (prefix_bytes, locking_out) = split_token_prefix(&full);
        assert_eq!(locking_out, locking);
        let (decoded, _) = decode_token_prefix(&prefix_bytes.unwrap()).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn split_token_prefix_no_prefix_passthrough() {
        let locking = p2pkh_script(&[0x01; 20]);
        let (prefix, out) = split_token_prefix(&locking);
        assert!(prefix.is_none());
        assert_eq!(out, locking);
    }
}
