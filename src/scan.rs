//! Scan engine: recovers stealth UTXOs by enumerating candidate
//! derivation indices against every plausible sender/outpoint pair
//! visible in chain history.
//!
//! Stateless across runs; the caller supplies the wallet's keys and an
//! index-space bound, and the oracle for history/mempool/tx lookups.

use std::collections::HashSet;

use crate::curve;
use crate::error::{Error, Result};
use crate::oracle::{decode_tolerant_tx_response, ChainOracle};
use crate::primitives::{hash160, to_hex, Bytes20, Bytes32, Pub33};
use crate::rpa::{self, RpaContext};
use crate::script::{p2pkh_script, split_token_prefix};
use crate::txbuilder::RawTx;

const PROGRESS_TICK_EVERY: u64 = 25;

/// A recovered stealth UTXO, ready to be upserted into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanMatch {
    pub txid_be: Bytes32,
    pub vout: u32,
    pub value_sats: u64,
    pub hash160: Bytes20,
    pub rpa_context: RpaContext,
}

/// Keys and bounds the scanner needs.
pub struct ScanParams {
    pub scan_priv: Bytes32,
    pub spend_priv: Bytes32,
    pub scan_pub: Pub33,
    pub start_height: u32,
    pub end_height_exclusive: u32,
    pub max_role_index: u32,
    /// Previously-seen indices to try first, per record (spec §4.9:
    /// "optionally take hints... first").
    pub index_hints: Vec<u32>,
    pub stop_on_first_match: bool,
    pub include_mempool: bool,
}

fn candidate_indices(hints: &[u32], max_role_index: u32) -> Vec<u32> {
    let mut seen = HashSet::new();
    let mut order = Vec::with_capacity(hints.len() + max_role_index as usize + 1);
    for &h in hints {
        if h <= max_role_index && seen.insert(h) {
            order.push(h);
        }
    }
    for i in 0..=max_role_index {
        if seen.insert(i) {
            order.push(i);
        }
    }
    order
}

/// First-input sender pubkey extraction is a convention, not a
/// protocol guarantee (spec §4.9: "conventionally, the sender's
/// pubkey is the first input's signer"). A P2PKH scriptSig is `<sig>
/// <pub33>`; we take the last push as the candidate sender pubkey.
fn extract_sender_pubkey(tx: &RawTx) -> Option<Pub33> {
    let script_sig = &tx.inputs.first()?.script_sig;
    if script_sig.len() < 33 {
        return None;
    }
    let tail = &script_sig[script_sig.len() - 33..];
    tail.try_into().ok()
}

fn outpoint_source(tx: &RawTx) -> Option<(String, u32)> {
    let input = tx.inputs.first()?;
    Some((to_hex(&input.outpoint.txid_be), input.outpoint.vout))
}

/// Try to match a single transaction's P2PKH outputs against the
/// wallet's scan key, searching the index space for every output.
pub fn match_transaction(tx: &RawTx, params: &ScanParams) -> Result<Vec<ScanMatch>> {
    let mut matches = Vec::new();

    let sender_pub = match extract_sender_pubkey(tx) {
        Some(p) if curve::is_valid_pubkey(&p) => p,
        _ => return Ok(matches),
    };
    let (prevout_txid_hex, prevout_n) = match outpoint_source(tx) {
        Some(v) => v,
        None => return Ok(matches),
    };

    let indices = candidate_indices(&params.index_hints, params.max_role_index);

    for (vout, output) in tx.outputs.iter().enumerate() {
        let (_, locking) = split_token_prefix(&output.script_pubkey);
        let expected_hash160 = match p2pkh_hash160(&locking) {
            Some(h) => h,
            None => continue,
        };

        for &index in &indices {
            let one_time_priv = match rpa::derive_receiver_one_time_priv(
                &params.scan_priv,
                &params.spend_priv,
                &sender_pub,
                &prevout_txid_hex,
                prevout_n,
                index,
            ) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let one_time_pub = curve::get_public_key(&one_time_priv)?;
            let derived_hash160 = hash160(&one_time_pub);

            if derived_hash160 == expected_hash160 {
                matches.push(ScanMatch {
                    txid_be: tx.txid(),
                    vout: vout as u32,
                    value_sats: output.value_sats,
                    hash160: derived_hash160,
                    rpa_context: RpaContext {
                        sender_pub33: to_hex(&sender_pub),
                        prevout_txid_hex: prevout_txid_hex.clone(),
                        prevout_n,
                        index,
                    },
                });
                if params.stop_on_first_match {
                    return Ok(matches);
                }
                break;
            }
        }
    }

    Ok(matches)
}

fn p2pkh_hash160(locking: &[u8]) -> Option<Bytes20> {
    if locking.len() != 25 || &locking[0..3] != [0x76, 0xa9, 0x14] {
        return None;
    }
    let mut h = [0u8; 20];
    h.copy_from_slice(&locking[3..23]);
    if p2pkh_script(&h) == locking {
        Some(h)
    } else {
        None
    }
}

/// Run a full scan across `[start_height, end_height_exclusive)` plus
/// the mempool, emitting progress every [`PROGRESS_TICK_EVERY`] txids
/// and deduping matches by `(txid, vout)` before returning.
pub async fn run_scan(oracle: &dyn ChainOracle, params: &ScanParams) -> Result<Vec<ScanMatch>> {
    let prefix = rpa::prefix16(&params.scan_pub);
    let prefix_hex = to_hex(&prefix);

    let mut txids: Vec<Bytes32> = oracle
        .rpa_get_history(&prefix_hex, params.start_height, params.end_height_exclusive)
        .await
        .map_err(|e| crate::oracle::chain_error("blockchain.rpa.get_history", e))?;

    if params.include_mempool {
        let mempool = oracle
            .rpa_get_mempool(&prefix_hex)
            .await
            .map_err(|e| crate::oracle::chain_error("blockchain.rpa.get_mempool", e))?;
        txids.extend(mempool);
    }

    let mut seen_txids = HashSet::new();
    txids.retain(|t| seen_txids.insert(*t));

    let mut all_matches = Vec::new();
    let mut seen_outpoints = HashSet::new();
    let tip = oracle
        .get_tip()
        .await
        .map_err(|e| crate::oracle::chain_error("blockchain.headers.get_tip", e))?;

    for (scanned, txid_be) in txids.iter().enumerate() {
        let scanned = scanned as u64 + 1;
        if scanned % PROGRESS_TICK_EVERY == 0 {
            crate::logging::log_scan_progress(scanned, all_matches.len() as u64, tip.height);
        }

        let raw = oracle
            .get_transaction(txid_be)
            .await
            .map_err(|e| crate::oracle::chain_error("blockchain.transaction.get", e))?;
        let tx = match RawTx::deserialize(&raw) {
            Ok(tx) => tx,
            Err(_) => continue,
        };

        let tx_params = ScanParams {
            scan_priv: params.scan_priv,
            spend_priv: params.spend_priv,
            scan_pub: params.scan_pub,
            start_height: params.start_height,
            end_height_exclusive: params.end_height_exclusive,
            max_role_index: params.max_role_index,
            index_hints: params.index_hints.clone(),
            stop_on_first_match: txids.len() == 1 && params.stop_on_first_match,
            include_mempool: params.include_mempool,
        };

        for m in match_transaction(&tx, &tx_params)? {
            if seen_outpoints.insert((m.txid_be, m.vout)) {
                all_matches.push(m);
            }
        }
    }

    crate::logging::log_scan_progress(txids.len() as u64, all_matches.len() as u64, tip.height);
    Ok(all_matches)
}

/// Decode a raw-tx value through the oracle's tolerant decoder and
/// parse it. Convenience used by callers that already hold a
/// `serde_json::Value` (e.g. a verbose RPC response) rather than raw
/// bytes.
pub fn parse_tolerant_tx(value: &serde_json::Value) -> Result<RawTx> {
    let bytes =
        decode_tolerant_tx_response(value).map_err(|e| crate::oracle::chain_error("blockchain.transaction.get", e))?;
    RawTx::deserialize(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MockChainOracle;
    use crate::script::p2pkh_script;
    use crate::txbuilder::{OutPoint, TxInput, TxOutput};

    fn priv_from_u64(n: u64) -> Bytes32 {
        let mut out = [0u8; 32];
        out[24..32].copy_from_slice(&n.to_be_bytes());
        out
    }

    fn build_scan_params(scan_priv: Bytes32, spend_priv: Bytes32, scan_pub: Pub33) -> ScanParams {
        ScanParams {
            scan_priv,
            spend_priv,
            scan_pub,
            start_height: 0,
            end_height_exclusive: 100,
            max_role_index: 64,
            index_hints: Vec::new(),
            stop_on_first_match: false,
            include_mempool: false,
        }
    }

    #[test]
    fn match_transaction_finds_stealth_output() {
        let sender_priv = priv_from_u64(77);
        let scan_priv = priv_from_u64(88);
        let sender_pub = curve::get_public_key(&sender_priv).unwrap();
        let scan_pub = curve::get_public_key(&scan_priv).unwrap();
        let spend_priv = rpa::derive_spend_priv(&scan_priv, &scan_pub).unwrap();
        let spend_pub = curve::get_public_key(&spend_priv).unwrap();

        let prevout_txid_hex = "11".repeat(32);
        let prevout_n = 0u32;
        let index = 3u32;

        let child_pub =
            rpa::derive_sender_one_time_pub(&sender_priv, &scan_pub, &spend_pub, &prevout_txid_hex, prevout_n, index)
                .unwrap();
        let child_hash160 = hash160(&child_pub);

        let prevout_txid_be = crate::primitives::from_hex_fixed::<32>(&prevout_txid_hex).unwrap();

        let sig_stub = [0x30u8; 10];
        let mut script_sig = crate::script::push(&sig_stub);
        script_sig.extend_from_slice(&crate::script::push(&sender_pub));

        let tx = RawTx {
            version: 2,
            inputs: vec![TxInput {
                outpoint: OutPoint {
                    txid_be: prevout_txid_be,
                    vout: prevout_n,
                },
                script_sig,
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                value_sats: 4_200,
                script_pubkey: p2pkh_script(&child_hash160),
            }],
            locktime: 0,
        };

        let params = build_scan_params(scan_priv, spend_priv, scan_pub);
        let matches = match_transaction(&tx, &params).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].hash160, child_hash160);
        assert_eq!(matches[0].rpa_context.index, index);
    }

    #[tokio::test]
    async fn run_scan_against_mock_oracle() {
        let sender_priv = priv_from_u64(1);
        let scan_priv = priv_from_u64(2);
        let sender_pub = curve::get_public_key(&sender_priv).unwrap();
        let scan_pub = curve::get_public_key(&scan_priv).unwrap();
        let spend_priv = rpa::derive_spend_priv(&scan_priv, &scan_pub).unwrap();
        let spend_pub = curve::get_public_key(&spend_priv).unwrap();

        let prevout_txid_hex = "22".repeat(32);
        let index = 1u32;
        let child_pub =
            rpa::derive_sender_one_time_pub(&sender_priv, &scan_pub, &spend_pub, &prevout_txid_hex, 0, index)
                .unwrap();
        let child_hash160 = hash160(&child_pub);

        let mut script_sig = crate::script::push(&[0x30u8; 8]);
        script_sig.extend_from_slice(&crate::script::push(&sender_pub));

        let tx = RawTx {
            version: 2,
            inputs: vec![TxInput {
                outpoint: OutPoint {
                    txid_be: crate::primitives::from_hex_fixed::<32>(&prevout_txid_hex).unwrap(),
                    vout: 0,
                },
                script_sig,
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                value_sats: 1_500,
                script_pubkey: p2pkh_script(&child_hash160),
            }],
            locktime: 0,
        };

        let oracle = MockChainOracle::new();
        oracle.set_tip_height(500);
        oracle.insert_transaction(&tx);
        let txid = tx.txid();
        oracle.set_rpa_history(&to_hex(&rpa::prefix16(&scan_pub)), vec![txid]);

        let params = build_scan_params(scan_priv, spend_priv, scan_pub);
        let matches = run_scan(&oracle, &params).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].txid_be, txid);
        assert_eq!(matches[0].value_sats, 1_500);
    }
}
