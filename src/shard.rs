//! Shard state machine: category derivation, the pool hash-fold
//! commitment evolution rule, and the `init` / `import` / `withdraw`
//! transaction builders that drive a covenant-locked state cell.
//!
//! The covenant's opcode-level logic is out of scope for this crate
//! (spec §1); what lives here is the deterministic set of bytes the
//! builder must emit and consume to stay in lockstep with it — the
//! `computeFold` reducer, the two-push unlocking blob, and the
//! funding/fee-change policy around each transition.

use crate::error::{Error, Result};
use crate::primitives::{concat, double_sha256, push_bytes, sha256, Bytes20, Bytes32, Pub33};
use crate::script::{add_token_to_script, p2pkh_script, p2sh_script, NftCapability, TokenPrefix};
use crate::txbuilder::{
    build_preimage, compute_sighash, hashfold_v1_1_unlock, p2pkh_unlock, parse_hashfold_v1_1_unlock,
    schnorr_sign_sighash, OutPoint, PrevoutInfo, RawTx, SIGHASH_ALL_FORKID, TxInput, TxOutput,
};

/// Hash-fold covenant ABI version this builder speaks. The legacy
/// signed variant (`signCovenantInput`) is not emitted on this path;
/// see [`crate::txbuilder::covenant_legacy_unlock`] for the shape a
/// future covenant revision that reintroduces a signature would use.
pub const HASHFOLD_VERSION_1_1: u8 = 0x01;

/// Import's note marker byte, mirroring withdraw's `0x02` (spec §4.6).
/// Not itself spec'd for import; chosen to keep the same
/// `SHA256(noteHash || marker)` shape withdraw uses for `proofBlob`.
const IMPORT_PROOF_MARKER: u8 = 0x01;
const WITHDRAW_PROOF_MARKER: u8 = 0x02;

const IMPORT_CAP_BYTE: u8 = 0x01;
const WITHDRAW_CAP_BYTE: u8 = 0x02;

/// A constant safety margin added on top of the caller-supplied fee
/// floor for `initShards` (spec §4.6: "Fee: caller-supplied floor, plus
/// safety margin").
pub const FEE_SAFETY_MARGIN_SATS: u64 = 200;

/// How the 32-byte category value is derived from the funding
/// transaction's txid, see the module doc on [`derive_category32`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CategoryMode {
    #[serde(rename = "null")]
    Null,
    #[serde(rename = "reverse")]
    Reverse,
    #[serde(rename = "raw")]
    Raw,
}

impl CategoryMode {
    /// The three modes in the fixed fallback order the import
    /// orchestrator retries across (spec §4.10).
    pub const FALLBACK_ORDER: [CategoryMode; 3] =
        [CategoryMode::Null, CategoryMode::Reverse, CategoryMode::Raw];

    /// Tag byte folded into `computeFold`'s digest. `Null` and `Raw`
    /// share a tag (and, per [`derive_category32`], share their output
    /// bytes too) so that the import retry loop's `(dedup)` step (spec
    /// §4.10) can recognize them as the same candidate without a
    /// broadcast round-trip.
    fn tag_byte(self) -> u8 {
        match self {
            CategoryMode::Null | CategoryMode::Raw => 0x00,
            CategoryMode::Reverse => 0x01,
        }
    }
}

/// `deriveCategory32FromFundingTxidHex`: a deterministic reshaping of
/// the funding transaction's txid bytes (spec §4.6). The spec leaves
/// the exact byte-order convention as a covenant-library contract and
/// flags the ambiguity explicitly (§4.10, §9 "categoryMode fallback");
/// we resolve it as two candidate orderings (display order, and
/// wire/reversed order) plus a `Raw` mode that intentionally coincides
/// with `Null` — see [`CategoryMode::tag_byte`].
pub fn derive_category32(funding_txid_be: &Bytes32, mode: CategoryMode) -> Bytes32 {
    match mode {
        CategoryMode::Null | CategoryMode::Raw => *funding_txid_be,
        CategoryMode::Reverse => {
            let mut reversed = *funding_txid_be;
            reversed.reverse();
            reversed
        }
    }
}

/// `HASH160(ownerBasePub)`.
pub fn pool_id(owner_base_pub: &Pub33) -> Bytes20 {
    crate::primitives::hash160(owner_base_pub)
}

/// The deterministic reducer the covenant's hash-fold rule stands in
/// for at the core layer: `stateOut = computeFold(version, stateIn,
/// category, noteHash, limbs, categoryMode, capByte)`. This is
/// explicitly a placeholder (spec §1 Non-goals): the core computes and
/// carries consistent bytes, it does not prove anything about them.
pub fn compute_fold(
    version: u8,
    state_in: &Bytes32,
    category: &Bytes32,
    note_hash: &Bytes32,
    limbs: &[Bytes32],
    category_mode: CategoryMode,
    cap_byte: u8,
) -> Bytes32 {
    let mut buf = Vec::with_capacity(2 + 32 * (3 + limbs.len()));
    buf.push(version);
    buf.extend_from_slice(state_in);
    buf.extend_from_slice(category);
    buf.extend_from_slice(note_hash);
    for limb in limbs {
        buf.extend_from_slice(limb);
    }
    buf.push(category_mode.tag_byte());
    buf.push(cap_byte);
    double_sha256(&buf)
}

/// Genesis commitment for shard `index` of `shard_count`:
/// `HASH256(poolId || category || i(u16be) || shardCount(u16be))`.
pub fn genesis_commitment(pool_id: &Bytes20, category: &Bytes32, index: u16, shard_count: u16) -> Bytes32 {
    let buf = concat(&[
        pool_id.as_slice(),
        category.as_slice(),
        &index.to_be_bytes(),
        &shard_count.to_be_bytes(),
    ]);
    double_sha256(&buf)
}

/// A deterministic stand-in for the covenant's actual redeem script.
/// The covenant bytecode itself is supplied by the covenant library at
/// integration time (spec §1 Non-goals); what this engine needs is
/// *some* pool-specific script whose hash anchors the P2SH address, so
/// every shard of a given pool locks to the same redeem script and
/// different pools never collide.
pub fn derive_redeem_script(pool_id: &Bytes20, category: &Bytes32) -> Vec<u8> {
    let mut script = push_bytes(pool_id);
    script.extend_from_slice(&push_bytes(category));
    script.push(0x75); // OP_DROP
    script.push(0x75); // OP_DROP
    script.push(0x51); // OP_1
    script
}

/// A UTXO usable as a funding or fee input: a plain P2PKH prevout.
#[derive(Debug, Clone)]
pub struct FundingUtxo {
    pub txid_be: Bytes32,
    pub vout: u32,
    pub value_sats: u64,
    pub owner_pub: Pub33,
}

impl FundingUtxo {
    fn script_pubkey(&self) -> Vec<u8> {
        p2pkh_script(&crate::primitives::hash160(&self.owner_pub))
    }
}

/// A shard's current on-chain prevout: the token-wrapped covenant
/// output being spent.
#[derive(Debug, Clone)]
pub struct ShardPrevout {
    pub txid_be: Bytes32,
    pub vout: u32,
    pub value_sats: u64,
    pub commitment: Bytes32,
}

/// Dust threshold for an output carrying `script_len` bytes of
/// scriptPubKey: three times the relay cost of spending it, following
/// the common `(len + 148) * 3` wallet heuristic (the extra 148 bytes
/// approximate a compact P2PKH-style spend of the output).
pub fn dust_threshold(script_len: usize) -> u64 {
    (script_len as u64 + 148) * 3
}

fn shard_script_pubkey(redeem_script: &[u8], category: &Bytes32, commitment: &Bytes32) -> Result<Vec<u8>> {
    let token = TokenPrefix {
        category: *category,
        capability: NftCapability::Mutable,
        commitment: Some(commitment.to_vec()),
        amount: None,
    };
    let redeem_hash = crate::primitives::hash160(redeem_script);
    add_token_to_script(&token, &p2sh_script(&redeem_hash))
}

/// Parameters for [`init_shards`].
pub struct InitShardsParams {
    pub owner_base_priv: Bytes32,
    pub owner_base_pub: Pub33,
    pub funding: FundingUtxo,
    pub shard_count: u16,
    pub shard_value_sats: u64,
    pub fee_floor_sats: u64,
    pub category_mode: CategoryMode,
}

/// Result of [`init_shards`]: the signed transaction plus everything
/// the caller needs to seed `PoolState`.
pub struct InitShardsResult {
    pub tx: RawTx,
    pub pool_id: Bytes20,
    pub category: Bytes32,
    pub redeem_script: Vec<u8>,
    pub shard_commitments: Vec<Bytes32>,
}

/// Build and sign the genesis transaction: `shardCount` covenant
/// outputs, each carrying a `mutable` NFT whose commitment commits to
/// the pool id, category, and shard index, followed by a change output
/// back to the owner's base P2PKH.
pub fn init_shards(params: &InitShardsParams) -> Result<InitShardsResult> {
    if !(2..1u32 << 16).contains(&(params.shard_count as u32)) {
        return Err(Error::validation("shard_count must be in [2, 65536)"));
    }

    let pool_id = pool_id(&params.owner_base_pub);
    let category = derive_category32(&params.funding.txid_be, params.category_mode);
    let redeem_script = derive_redeem_script(&pool_id, &category);

    let mut outputs = Vec::with_capacity(params.shard_count as usize + 1);
    let mut shard_commitments = Vec::with_capacity(params.shard_count as usize);
    for i in 0..params.shard_count {
        let commitment = genesis_commitment(&pool_id, &category, i, params.shard_count);
        shard_commitments.push(commitment);
        outputs.push(TxOutput {
            value_sats: params.shard_value_sats,
            script_pubkey: shard_script_pubkey(&redeem_script, &category, &commitment)?,
        });
    }

    let total_shard_value = params.shard_value_sats * params.shard_count as u64;
    let fee = params.fee_floor_sats + FEE_SAFETY_MARGIN_SATS;
    let spent = total_shard_value
        .checked_add(fee)
        .ok_or_else(|| Error::internal("init_shards: value overflow"))?;
    let change_value = params
        .funding
        .value_sats
        .checked_sub(spent)
        .ok_or_else(|| Error::policy("init_shards: funding UTXO does not cover shards + fee"))?;

    let owner_hash160 = crate::primitives::hash160(&params.owner_base_pub);
    let change_script = p2pkh_script(&owner_hash160);
    if change_value >= dust_threshold(change_script.len()) {
        outputs.push(TxOutput {
            value_sats: change_value,
            script_pubkey: change_script,
        });
    }
    // Below dust: change is dropped and its value absorbed into the fee.

    let mut tx = RawTx {
        version: 2,
        inputs: vec![TxInput {
            outpoint: OutPoint {
                txid_be: params.funding.txid_be,
                vout: params.funding.vout,
            },
            script_sig: Vec::new(),
            sequence: 0xffff_ffff,
        }],
        outputs,
        locktime: 0,
    };

    let script_code = p2pkh_script(&owner_hash160);
    let prevout = PrevoutInfo {
        value_sats: params.funding.value_sats,
        script_pubkey: params.funding.script_pubkey(),
    };
    let sighash = compute_sighash(&tx, 0, &prevout, &script_code, SIGHASH_ALL_FORKID)?;
    let sig65 = schnorr_sign_sighash(&params.owner_base_priv, &sighash, SIGHASH_ALL_FORKID)?;
    tx.inputs[0].script_sig = p2pkh_unlock(&sig65, &params.owner_base_pub);

    Ok(InitShardsResult {
        tx,
        pool_id,
        category,
        redeem_script,
        shard_commitments,
    })
}

/// `shardIndex = noteHash[0] mod shardCount` where `noteHash =
/// SHA256(txid_bytes || vout(u32le))`. This is the shard *selection*
/// hash; distinct from the fold's `noteHash` argument, which is a
/// double-SHA256 of the same inputs (see [`import_note_hash`]).
pub fn select_shard_index(deposit_txid_be: &Bytes32, deposit_vout: u32, shard_count: u16) -> Result<u16> {
    if shard_count == 0 {
        return Err(Error::internal("select_shard_index: shard_count is zero"));
    }
    let buf = concat(&[deposit_txid_be.as_slice(), &deposit_vout.to_le_bytes()]);
    let h = sha256(&buf);
    Ok((h[0] as u16) % shard_count)
}

/// The fold's `noteHash` argument for an import: `HASH256(depositTxidBE
/// || depositVout(u32le))` (spec §8 scenario 3).
pub fn import_note_hash(deposit_txid_be: &Bytes32, deposit_vout: u32) -> Bytes32 {
    let buf = concat(&[deposit_txid_be.as_slice(), &deposit_vout.to_le_bytes()]);
    double_sha256(&buf)
}

/// Parameters for [`import_deposit_to_shard`].
pub struct ImportDepositParams {
    pub shard: ShardPrevout,
    pub deposit: FundingUtxo,
    pub deposit_priv: Bytes32,
    pub witness: Option<FundingUtxo>,
    pub fee_sats: u64,
    pub category: Bytes32,
    pub category_mode: CategoryMode,
    pub redeem_script: Vec<u8>,
    pub debug_assert_unlock: bool,
}

/// Fold a deposit into a shard. Input[0] is the shard (unsigned, per
/// the hash-fold v1.1 ABI); input[1] is the deposit P2PKH, signed by
/// the receiver's one-time priv; an optional input[2] is a witness
/// prevout. Output[0] is the shard continuation with the updated
/// commitment and combined value minus fee.
pub fn import_deposit_to_shard(params: &ImportDepositParams) -> Result<(RawTx, Bytes32)> {
    let new_value = params
        .shard
        .value_sats
        .checked_add(params.deposit.value_sats)
        .and_then(|v| v.checked_sub(params.fee_sats))
        .ok_or_else(|| Error::policy("import: shard + deposit value does not cover fee"))?;

    let token_script = shard_script_pubkey(&params.redeem_script, &params.category, &params.shard.commitment)?;
    let dust = dust_threshold(token_script.len());
    if new_value < dust {
        return Err(Error::policy("import: resulting shard value below dust threshold"));
    }

    let note_hash = import_note_hash(&params.deposit.txid_be, params.deposit.vout);
    let proof_blob = sha256(&concat(&[&note_hash, &[IMPORT_PROOF_MARKER]]));
    let state_out = compute_fold(
        HASHFOLD_VERSION_1_1,
        &params.shard.commitment,
        &params.category,
        &note_hash,
        &[],
        params.category_mode,
        IMPORT_CAP_BYTE,
    );

    let new_token_script = shard_script_pubkey(&params.redeem_script, &params.category, &state_out)?;

    let mut inputs = vec![
        TxInput {
            outpoint: OutPoint {
                txid_be: params.shard.txid_be,
                vout: params.shard.vout,
            },
            script_sig: hashfold_v1_1_unlock(&note_hash, &proof_blob),
            sequence: 0xffff_ffff,
        },
        TxInput {
            outpoint: OutPoint {
                txid_be: params.deposit.txid_be,
                vout: params.deposit.vout,
            },
            script_sig: Vec::new(),
            sequence: 0xffff_ffff,
        },
    ];

    if let Some(witness) = &params.witness {
        inputs.push(TxInput {
            outpoint: OutPoint {
                txid_be: witness.txid_be,
                vout: witness.vout,
            },
            script_sig: Vec::new(),
            sequence: 0xffff_ffff,
        });
    }

    let mut tx = RawTx {
        version: 2,
        inputs,
        outputs: vec![TxOutput {
            value_sats: new_value,
            script_pubkey: new_token_script,
        }],
        locktime: 0,
    };

    let deposit_hash160 = crate::primitives::hash160(&params.deposit.owner_pub);
    let deposit_script_code = p2pkh_script(&deposit_hash160);
    let deposit_prevout = PrevoutInfo {
        value_sats: params.deposit.value_sats,
        script_pubkey: params.deposit.script_pubkey(),
    };
    let sighash = compute_sighash(&tx, 1, &deposit_prevout, &deposit_script_code, SIGHASH_ALL_FORKID)?;
    let sig65 = schnorr_sign_sighash(&params.deposit_priv, &sighash, SIGHASH_ALL_FORKID)?;
    tx.inputs[1].script_sig = p2pkh_unlock(&sig65, &params.deposit.owner_pub);

    if params.debug_assert_unlock {
        let (a, b) = parse_hashfold_v1_1_unlock(&tx.inputs[0].script_sig)?;
        debug_assert_eq!(a, note_hash);
        debug_assert_eq!(b, proof_blob);
    }

    Ok((tx, state_out))
}

/// `noteHash = SHA256(stateIn || receiverHash160 || SHA256(amount_low32_u32le))`.
pub fn withdraw_note_hash(state_in: &Bytes32, receiver_hash160: &Bytes20, amount_sats: u64) -> Bytes32 {
    let amount_low32 = (amount_sats as u32).to_le_bytes();
    let amount_digest = sha256(&amount_low32);
    sha256(&concat(&[state_in, receiver_hash160.as_slice(), &amount_digest]))
}

/// `proofBlob = SHA256(noteHash || 0x02)`.
pub fn withdraw_proof_blob(note_hash: &Bytes32) -> Bytes32 {
    sha256(&concat(&[note_hash, &[WITHDRAW_PROOF_MARKER]]))
}

/// Parameters for [`withdraw_from_shard`].
pub struct WithdrawParams {
    pub shard: ShardPrevout,
    pub fee_prevout: FundingUtxo,
    pub fee_priv: Bytes32,
    pub receiver_hash160: Bytes20,
    pub amount_sats: u64,
    pub fee_sats: u64,
    pub change_hash160: Bytes20,
    pub category: Bytes32,
    pub category_mode: CategoryMode,
    pub redeem_script: Vec<u8>,
    pub debug_assert_unlock: bool,
}

/// Withdraw `amount_sats` from a shard to `receiver_hash160`. Outputs,
/// in order: shard continuation, payment P2PKH, fee-change P2PKH.
/// `state_in` must come from the on-chain shard prevout's token
/// commitment, never from the store (spec §4.6: "this eliminates state
/// file drift").
pub fn withdraw_from_shard(params: &WithdrawParams, state_in: &Bytes32) -> Result<(RawTx, Bytes32)> {
    let remainder = params
        .shard
        .value_sats
        .checked_sub(params.amount_sats)
        .ok_or_else(|| Error::policy("withdraw: amount exceeds shard value"))?;

    let token_script = shard_script_pubkey(&params.redeem_script, &params.category, &params.shard.commitment)?;
    let shard_dust = dust_threshold(token_script.len());
    if remainder == 0 {
        return Err(Error::policy(
            "close-if-dust shard policy is recognized but not supported pending covenant support",
        ));
    }
    if remainder < shard_dust {
        return Err(Error::policy("withdraw: shard remainder below shard-dust threshold"));
    }

    let note_hash = withdraw_note_hash(state_in, &params.receiver_hash160, params.amount_sats);
    let proof_blob = withdraw_proof_blob(&note_hash);
    let state_out = compute_fold(
        HASHFOLD_VERSION_1_1,
        state_in,
        &params.category,
        &note_hash,
        &[],
        params.category_mode,
        WITHDRAW_CAP_BYTE,
    );
    let new_token_script = shard_script_pubkey(&params.redeem_script, &params.category, &state_out)?;

    let payment_script = p2pkh_script(&params.receiver_hash160);
    let fee_change_value = params
        .fee_prevout
        .value_sats
        .checked_sub(params.fee_sats)
        .ok_or_else(|| Error::policy("withdraw: fee prevout does not cover fee"))?;
    let fee_change_script = p2pkh_script(&params.change_hash160);

    let mut outputs = vec![
        TxOutput {
            value_sats: remainder,
            script_pubkey: new_token_script,
        },
        TxOutput {
            value_sats: params.amount_sats,
            script_pubkey: payment_script,
        },
    ];
    if fee_change_value >= dust_threshold(fee_change_script.len()) {
        outputs.push(TxOutput {
            value_sats: fee_change_value,
            script_pubkey: fee_change_script,
        });
    }

    let mut tx = RawTx {
        version: 2,
        inputs: vec![
            TxInput {
                outpoint: OutPoint {
                    txid_be: params.shard.txid_be,
                    vout: params.shard.vout,
                },
                script_sig: hashfold_v1_1_unlock(&note_hash, &proof_blob),
                sequence: 0xffff_ffff,
            },
            TxInput {
                outpoint: OutPoint {
                    txid_be: params.fee_prevout.txid_be,
                    vout: params.fee_prevout.vout,
                },
                script_sig: Vec::new(),
                sequence: 0xffff_ffff,
            },
        ],
        outputs,
        locktime: 0,
    };

    let fee_hash160 = crate::primitives::hash160(&params.fee_prevout.owner_pub);
    let fee_script_code = p2pkh_script(&fee_hash160);
    let fee_prevout_info = PrevoutInfo {
        value_sats: params.fee_prevout.value_sats,
        script_pubkey: params.fee_prevout.script_pubkey(),
    };
    let sighash = compute_sighash(&tx, 1, &fee_prevout_info, &fee_script_code, SIGHASH_ALL_FORKID)?;
    let sig65 = schnorr_sign_sighash(&params.fee_priv, &sighash, SIGHASH_ALL_FORKID)?;
    tx.inputs[1].script_sig = p2pkh_unlock(&sig65, &params.fee_prevout.owner_pub);

    if params.debug_assert_unlock {
        let (a, b) = parse_hashfold_v1_1_unlock(&tx.inputs[0].script_sig)?;
        debug_assert_eq!(a, note_hash);
        debug_assert_eq!(b, proof_blob);
    }

    Ok((tx, state_out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priv_from_u64(n: u64) -> Bytes32 {
        let mut out = [0u8; 32];
        out[24..32].copy_from_slice(&n.to_be_bytes());
        out
    }

    #[test]
    fn category_null_and_raw_coincide() {
        let txid = [0x42u8; 32];
        assert_eq!(
            derive_category32(&txid, CategoryMode::Null),
            derive_category32(&txid, CategoryMode::Raw)
        );
        assert_ne!(
            derive_category32(&txid, CategoryMode::Null),
            derive_category32(&txid, CategoryMode::Reverse)
        );
    }

    #[test]
    fn genesis_commitments_differ_by_index() {
        let pool_id = [0x01u8; 20];
        let category = [0x02u8; 32];
        let c0 = genesis_commitment(&pool_id, &category, 0, 4);
        let c1 = genesis_commitment(&pool_id, &category, 1, 4);
        assert_ne!(c0, c1);
    }

    #[test]
    fn init_shards_two_shards_layout() {
        let owner_priv = priv_from_u64(777);
        let owner_pub = crate::curve::get_public_key(&owner_priv).unwrap();
        let funding = FundingUtxo {
            txid_be: [0x55u8; 32],
            vout: 0,
            value_sats: 10_000,
            owner_pub,
        };

        let result = init_shards(&InitShardsParams {
            owner_base_priv: owner_priv,
            owner_base_pub: owner_pub,
            funding,
            shard_count: 2,
            shard_value_sats: 2_000,
            fee_floor_sats: 1_800,
            category_mode: CategoryMode::Null,
        })
        .unwrap();

        assert_eq!(result.tx.outputs.len(), 3);
        assert_eq!(result.tx.outputs[0].value_sats, 2_000);
        assert_eq!(result.tx.outputs[1].value_sats, 2_000);
        assert_eq!(result.shard_commitments.len(), 2);
    }

    #[test]
    fn select_shard_index_within_bounds() {
        let txid = [0x09u8; 32];
        for shard_count in [2u16, 5, 64] {
            let idx = select_shard_index(&txid, 3, shard_count).unwrap();
            assert!(idx < shard_count);
        }
    }

    #[test]
    fn import_deposit_changes_commitment() {
        let redeem_script = derive_redeem_script(&[0x01; 20], &[0x02; 32]);
        let deposit_priv = priv_from_u64(42);
        let deposit_pub = crate::curve::get_public_key(&deposit_priv).unwrap();

        let shard = ShardPrevout {
            txid_be: [0x10u8; 32],
            vout: 0,
            value_sats: 2_000,
            commitment: [0x20u8; 32],
        };
        let deposit = FundingUtxo {
            txid_be: [0x30u8; 32],
            vout: 1,
            value_sats: 5_000,
            owner_pub: deposit_pub,
        };

        let (tx, state_out) = import_deposit_to_shard(&ImportDepositParams {
            shard,
            deposit,
            deposit_priv,
            witness: None,
            fee_sats: 500,
            category: [0x02; 32],
            category_mode: CategoryMode::Null,
            redeem_script,
            debug_assert_unlock: true,
        })
        .unwrap();

        assert_eq!(tx.outputs[0].value_sats, 2_000 + 5_000 - 500);
        assert_ne!(state_out, [0x20u8; 32]);
    }

    #[test]
    fn withdraw_rejects_close_if_dust() {
        let redeem_script = derive_redeem_script(&[0x01; 20], &[0x02; 32]);
        let fee_priv = priv_from_u64(99);
        let fee_pub = crate::curve::get_public_key(&fee_priv).unwrap();

        let shard = ShardPrevout {
            txid_be: [0x11u8; 32],
            vout: 0,
            value_sats: 1_000,
            commitment: [0x22u8; 32],
        };
        let fee_prevout = FundingUtxo {
            txid_be: [0x33u8; 32],
            vout: 0,
            value_sats: 2_000,
            owner_pub: fee_pub,
        };

        let result = withdraw_from_shard(
            &WithdrawParams {
                shard,
                fee_prevout,
                fee_priv,
                receiver_hash160: [0x44; 20],
                amount_sats: 1_000,
                fee_sats: 300,
                change_hash160: [0x55; 20],
                category: [0x02; 32],
                category_mode: CategoryMode::Null,
                redeem_script,
                debug_assert_unlock: true,
            },
            &[0x22u8; 32],
        );
        assert!(matches!(result, Err(Error::PolicyViolation(_))));
    }

    #[test]
    fn withdraw_accepts_remainder_at_dust_boundary() {
        let redeem_script = derive_redeem_script(&[0x01; 20], &[0x02; 32]);
        let fee_priv = priv_from_u64(5);
        let fee_pub = crate::curve::get_public_key(&fee_priv).unwrap();

        let token_script =
            shard_script_pubkey(&redeem_script, &[0x02; 32], &[0x22u8; 32]).unwrap();
        let dust = dust_threshold(token_script.len());

        let shard = ShardPrevout {
            txid_be: [0x11u8; 32],
            vout: 0,
            value_sats: 1_000 + dust,
            commitment: [0x22u8; 32],
        };
        let fee_prevout = FundingUtxo {
            txid_be: [0x33u8; 32],
            vout: 0,
            value_sats: 2_000,
            owner_pub: fee_pub,
        };

        let (tx, _) = withdraw_from_shard(
            &WithdrawParams {
                shard,
                fee_prevout,
                fee_priv,
                receiver_hash160: [0x44; 20],
                amount_sats: 1_000,
                fee_sats: 300,
                change_hash160: [0x55; 20],
                category: [0x02; 32],
                category_mode: CategoryMode::Null,
                redeem_script,
                debug_assert_unlock: true,
            },
            &[0x22u8; 32],
        )
        .unwrap();
        assert_eq!(tx.outputs[0].value_sats, dust);
    }
}
