//! Raw transaction structure, consensus serialization, and sighash
//! preimage construction.
//!
//! BCH uses no segwit: the wire format is the pre-segwit Bitcoin
//! layout, and the sighash algorithm is the BIP143-shaped "replay
//! protected" preimage introduced with `SIGHASH_FORKID`, extended here
//! to cover the CashTokens prevout prefix when present.

use crate::curve;
use crate::error::{Error, Result};
use crate::primitives::{double_sha256, read_varint, write_varint, Bytes32};

/// `SIGHASH_ALL | SIGHASH_FORKID`, the default sighash type.
pub const SIGHASH_ALL_FORKID: u32 = 0x41;

/// An outpoint, stored in display (big-endian) txid order; wire order
/// is the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutPoint {
    pub txid_be: Bytes32,
    pub vout: u32,
}

impl OutPoint {
    fn write_wire(&self, out: &mut Vec<u8>) {
        let mut wire = self.txid_be;
        wire.reverse();
        out.extend_from_slice(&wire);
        out.extend_from_slice(&self.vout.to_le_bytes());
    }
}

#[derive(Debug, Clone)]
pub struct TxInput {
    pub outpoint: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone)]
pub struct TxOutput {
    pub value_sats: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.value_sats.to_le_bytes());
        out.extend_from_slice(&write_varint(self.script_pubkey.len() as u64));
        out.extend_from_slice(&self.script_pubkey);
    }
}

/// A raw BCH transaction.
#[derive(Debug, Clone)]
pub struct RawTx {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
}

impl RawTx {
    /// `version(u32le) || varint(nInputs) || inputs || varint(nOutputs)
    /// || outputs || locktime(u32le)`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());

        out.extend_from_slice(&write_varint(self.inputs.len() as u64));
        for input in &self.inputs {
            input.outpoint.write_wire(&mut out);
            out.extend_from_slice(&write_varint(input.script_sig.len() as u64));
            out.extend_from_slice(&input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }

        out.extend_from_slice(&write_varint(self.outputs.len() as u64));
        for output in &self.outputs {
            output.write(&mut out);
        }

        out.extend_from_slice(&self.locktime.to_le_bytes());
        out
    }

    /// Parse a raw transaction from consensus-serialized bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let version = read_u32(data, &mut pos)?;

        let (n_in, len) = read_varint(&data[pos..])?;
        pos += len;
        let mut inputs = Vec::with_capacity(n_in as usize);
        for _ in 0..n_in {
            let mut txid_wire = [0u8; 32];
            let slice = data
                .get(pos..pos + 32)
                .ok_or_else(|| Error::validation("tx: truncated input txid"))?;
            txid_wire.copy_from_slice(slice);
            pos += 32;
            let mut txid_be = txid_wire;
            txid_be.reverse();
            let vout = read_u32(data, &mut pos)?;

            let (script_len, len) = read_varint(&data[pos..])?;
            pos += len;
            let script_sig = data
                .get(pos..pos + script_len as usize)
                .ok_or_else(|| Error::validation("tx: truncated scriptSig"))?
                .to_vec();
            pos += script_len as usize;

            let sequence = read_u32(data, &mut pos)?;
            inputs.push(TxInput {
                outpoint: OutPoint { txid_be, vout },
                script_sig,
                sequence,
            });
        }

        let (n_out, len) = read_varint(&data[pos..])?;
        pos += len;
        let mut outputs = Vec::with_capacity(n_out as usize);
        for _ in 0..n_out {
            let value_bytes = data
                .get(pos..pos + 8)
                .ok_or_else(|| Error::validation("tx: truncated output value"))?;
            let value_sats = u64::from_le_bytes(value_bytes.try_into().unwrap());
            pos += 8;

            let (spk_len, len) = read_varint(&data[pos..])?;
            pos += len;
            let script_pubkey = data
                .get(pos..pos + spk_len as usize)
                .ok_or_else(|| Error::validation("tx: truncated scriptPubKey"))?
                .to_vec();
            pos += spk_len as usize;

            outputs.push(TxOutput {
                value_sats,
                script_pubkey,
            });
        }

        let locktime = read_u32(data, &mut pos)?;

        Ok(RawTx {
            version,
            inputs,
            outputs,
            locktime,
        })
    }

    /// Double-SHA256 of the serialized transaction, in display
    /// (big-endian) order.
    pub fn txid(&self) -> Bytes32 {
        let mut id = double_sha256(&self.serialize());
        id.reverse();
        id
    }
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
    let slice = data
        .get(*pos..*pos + 4)
        .ok_or_else(|| Error::validation("tx: truncated u32 field"))?;
    *pos += 4;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

/// Per-prevout context the preimage needs for the input being signed:
/// its value, and its raw scriptPubKey (to detect a CashTokens prefix).
#[derive(Debug, Clone)]
pub struct PrevoutInfo {
    pub value_sats: u64,
    pub script_pubkey: Vec<u8>,
}

/// Build the BIP143-shaped, CashTokens-aware sighash preimage for
/// input `input_index` of `tx`.
///
/// `script_code` is the subscript actually covered by the signature
/// (the P2PKH script, the redeem script, or the covenant script,
/// depending on the input's authorizer variant).
pub fn build_preimage(
    tx: &RawTx,
    input_index: usize,
    prevout: &PrevoutInfo,
    script_code: &[u8],
    sighash_type: u32,
) -> Result<Vec<u8>> {
    let input = tx
        .inputs
        .get(input_index)
        .ok_or_else(|| Error::internal("preimage: input index out of range"))?;

    let mut prevouts_buf = Vec::new();
    for inp in &tx.inputs {
        inp.outpoint.write_wire(&mut prevouts_buf);
    }
    let hash_prevouts = double_sha256(&prevouts_buf);

    let mut sequence_buf = Vec::new();
    for inp in &tx.inputs {
        sequence_buf.extend_from_slice(&inp.sequence.to_le_bytes());
    }
    let hash_sequence = double_sha256(&sequence_buf);

    let mut outputs_buf = Vec::new();
    for out in &tx.outputs {
        out.write(&mut outputs_buf);
    }
    let hash_outputs = double_sha256(&outputs_buf);

    let mut preimage = Vec::new();
    preimage.extend_from_slice(&tx.version.to_le_bytes());
    preimage.extend_from_slice(&hash_prevouts);
    preimage.extend_from_slice(&hash_sequence);

    input.outpoint.write_wire(&mut preimage);

    let (token_prefix, _) = crate::script::split_token_prefix(&prevout.script_pubkey);
    if let Some(prefix) = token_prefix {
        preimage.extend_from_slice(&prefix);
    }

    preimage.extend_from_slice(&write_varint(script_code.len() as u64));
    preimage.extend_from_slice(script_code);
    preimage.extend_from_slice(&prevout.value_sats.to_le_bytes());
    preimage.extend_from_slice(&input.sequence.to_le_bytes());

    preimage.extend_from_slice(&hash_outputs);
    preimage.extend_from_slice(&tx.locktime.to_le_bytes());
    preimage.extend_from_slice(&sighash_type.to_le_bytes());

    Ok(preimage)
}

/// `sighash = double_sha256(preimage)`, the value actually signed.
pub fn compute_sighash(
    tx: &RawTx,
    input_index: usize,
    prevout: &PrevoutInfo,
    script_code: &[u8],
    sighash_type: u32,
) -> Result<Bytes32> {
    let preimage = build_preimage(tx, input_index, prevout, script_code, sighash_type)?;
    Ok(double_sha256(&preimage))
}

/// Input-authorization variants. `signature_of` is left abstract here:
/// callers supply the already-Schnorr-signed 65-byte value (`sig64 ||
/// sighashType`).
pub fn p2pkh_unlock(sig65: &[u8; 65], pub33: &[u8; 33]) -> Vec<u8> {
    let mut out = crate::script::push(sig65);
    out.extend_from_slice(&crate::script::push(pub33));
    out
}

pub fn p2sh_unlock(sig65: &[u8; 65], pub33: &[u8; 33], redeem_script: &[u8]) -> Vec<u8> {
    let mut out = crate::script::push(sig65);
    out.extend_from_slice(&crate::script::push(pub33));
    out.extend_from_slice(&crate::script::push(redeem_script));
    out
}

/// Legacy covenant spend: `<amountCommitment> <pub33> <sig65>
/// <redeemScript>`. Kept for the legacy signer path; not used by the
/// live hash-fold v1.1 covenant.
pub fn covenant_legacy_unlock(
    amount_commitment: &[u8],
    pub33: &[u8; 33],
    sig65: &[u8; 65],
    redeem_script: &[u8],
) -> Vec<u8> {
    let mut out = crate::script::push(amount_commitment);
    out.extend_from_slice(&crate::script::push(pub33));
    out.extend_from_slice(&crate::script::push(sig65));
    out.extend_from_slice(&crate::script::push(redeem_script));
    out
}

/// hash-fold v1.1 "bare" covenant spend: exactly two 32-byte direct
/// pushes, no signature and no redeem-script push. The covenant input
/// is unsigned.
pub fn hashfold_v1_1_unlock(note_hash: &Bytes32, proof_blob: &Bytes32) -> Vec<u8> {
    let mut out = Vec::with_capacity(66);
    out.push(0x20);
    out.extend_from_slice(note_hash);
    out.push(0x20);
    out.extend_from_slice(proof_blob);
    out
}

/// Parse a builder-emitted hash-fold v1.1 scriptSig back into its two
/// pushes, asserting push-count and push-length. Used by the builder's
/// debug-mode self-check.
pub fn parse_hashfold_v1_1_unlock(script_sig: &[u8]) -> Result<(Bytes32, Bytes32)> {
    if script_sig.len() != 66 || script_sig[0] != 0x20 || script_sig[33] != 0x20 {
        return Err(Error::internal(
            "hash-fold v1.1 unlock: expected exactly two 32-byte direct pushes",
        ));
    }
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a.copy_from_slice(&script_sig[1..33]);
    b.copy_from_slice(&script_sig[34..66]);
    Ok((a, b))
}

/// Sign a P2PKH input and return its `sig64 || sighashType` fragment.
pub fn schnorr_sign_sighash(priv32: &Bytes32, sighash: &Bytes32, sighash_type: u32) -> Result<[u8; 65]> {
    let sig64 = curve::bch_schnorr_sign(priv32, sighash)?;
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&sig64);
    out[64] = sighash_type as u8;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::p2pkh_script;

    fn sample_tx() -> RawTx {
        RawTx {
            version: 2,
            inputs: vec![TxInput {
                outpoint: OutPoint {
                    txid_be: [0x01; 32],
                    vout: 0,
                },
                script_sig: Vec::new(),
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                value_sats: 1000,
                script_pubkey: p2pkh_script(&[0x02; 20]),
            }],
            locktime: 0,
        }
    }

    #[test]
    fn tx_serialize_deserialize_roundtrip() {
        let tx = sample_tx();
        let bytes = tx.serialize();
        let parsed = RawTx::deserialize(&bytes).unwrap();
        assert_eq!(parsed.version, tx.version);
        assert_eq!(parsed.locktime, tx.locktime);
        assert_eq!(parsed.inputs.len(), 1);
        assert_eq!(parsed.outputs[0].value_sats, 1000);
        assert_eq!(parsed.inputs[0].outpoint.txid_be, [0x01; 32]);
    }

    #[test]
    fn txid_is_double_sha256_reversed() {
        let tx = sample_tx();
        let bytes = tx.serialize();
        let mut expected = double_sha256(&bytes);
        expected.reverse();
        assert_eq!(tx.txid(), expected);
    }

    #[test]
    fn preimage_includes_token_prefix_when_prevout_is_tokenized() {
        let tx = sample_tx();
        let token = crate::script::TokenPrefix {
            category: [0x07; 32],
            capability: crate::script::NftCapability::Mutable,
            commitment: Some(vec![0xaa; 4]),
            amount: None,
        };
        let locking = p2pkh_script(&[0x09; 20]);
        let tokenized_spk = crate::script::add_token_to_script(&token, &locking).unwrap();

        let prevout = PrevoutInfo {
            value_sats: 5000,
            script_pubkey: tokenized_spk.clone(),
        };
        let preimage = build_preimage(&tx, 0, &prevout, &locking, SIGHASH_ALL_FORKID).unwrap();

        let (prefix, _) = crate::script::split_token_prefix(&tokenized_spk);
        let prefix = prefix.unwrap();
        // The preimage must contain the prevout's token prefix bytes
        // immediately after the outpoint (32 + 4 bytes in) and before
        // the scriptCode length varint.
        let needle_pos = preimage
            .windows(prefix.len())
            .position(|w| w == prefix.as_slice());
        assert!(needle_pos.is_some());
    }

    #[test]
    fn hashfold_v1_1_unlock_roundtrip() {
        let note_hash = [0x11; 32];
        let proof_blob = [0x22; 32];
        let script_sig = hashfold_v1_1_unlock(&note_hash, &proof_blob);
        let (a, b) = parse_hashfold_v1_1_unlock(&script_sig).unwrap();
        assert_eq!(a, note_hash);
        assert_eq!(b, proof_blob);
    }

    #[test]
    fn sign_and_verify_p2pkh_sighash() {
        let priv32 = {
            let mut p = [0u8; 32];
            p[31] = 9;
            p
        };
        let pub33 = curve::get_public_key(&priv32).unwrap();
        let tx = sample_tx();
        let h160 = crate::primitives::hash160(&pub33);
        let script_code = p2pkh_script(&h160);
        let prevout = PrevoutInfo {
            value_sats: 10_000,
            script_pubkey: script_code.clone(),
        };

        let sighash = compute_sighash(&tx, 0, &prevout, &script_code, SIGHASH_ALL_FORKID).unwrap();
        let sig65 = schnorr_sign_sighash(&priv32, &sighash, SIGHASH_ALL_FORKID).unwrap();
        assert!(curve::bch_schnorr_verify(&sig65, &sighash, &pub33));

        let unlock = p2pkh_unlock(&sig65, &pub33);
        assert!(unlock.len() > 65 + 33);
    }
}
