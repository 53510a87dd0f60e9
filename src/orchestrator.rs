//! High-level operations: `init` / `send` / `deposit` / `import` /
//! `withdraw` / `scan`, composing the funding selector, RPA derivation,
//! shard engine, store, and chain oracle into the caller-facing API
//! (spec §4.10).
//!
//! Each operation runs to completion without interleaving; the only
//! suspension points are calls through [`ChainOracle`] (spec §5).
//! Broadcast always precedes the state write, never the reverse.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::{sleep, Duration};

use crate::cashaddr::{self, AddressType};
use crate::config::Config;
use crate::curve;
use crate::error::{Error, Result};
use crate::funding::{self, BaseUtxoCandidate, FundingRequest, StealthKeys, StealthUtxoCandidate};
use crate::oracle::{self, ChainOracle};
use crate::primitives::{from_hex_fixed, hash160, to_hex, Bytes20, Bytes32};
use crate::rpa::{self, RpaContext};
use crate::scan::{self, ScanMatch, ScanParams};
use crate::script::p2pkh_script;
use crate::shard::{self, CategoryMode, FundingUtxo, ShardPrevout};
use crate::store::{DepositKind, DepositRecord, OpPointer, PoolState, ShardPointer, StealthUtxoRecord, StoreIo, WalletStore, WithdrawalRecord};
use crate::txbuilder::{RawTx, TxInput, TxOutput};
use crate::wallet::WalletKeyMaterial;

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// `(size_bytes) * sats_per_byte`, rounded up, using the same
/// per-input/per-output weight the dust heuristic uses elsewhere in
/// this crate ([`crate::shard::dust_threshold`]).
fn estimate_fee_sats(fee_rate_sats_per_byte: f64, n_inputs: usize, n_outputs: usize) -> u64 {
    let size = 10 + n_inputs * 148 + n_outputs * 34;
    (size as f64 * fee_rate_sats_per_byte).ceil().max(1.0) as u64
}

async fn fee_rate(oracle: &dyn ChainOracle) -> Result<f64> {
    oracle
        .estimate_fee()
        .await
        .map_err(|e| oracle::chain_error("blockchain.estimatefee", e))
}

/// Either half of a resolved send/withdraw destination.
enum Destination {
    Stealth(crate::primitives::Pub33),
    Transparent(Bytes20),
}

fn resolve_destination(network: crate::config::Network, dest: &str) -> Result<Destination> {
    if dest.starts_with("PM") {
        Ok(Destination::Stealth(cashaddr::decode_paycode(dest)?))
    } else {
        let (addr_type, hash) = cashaddr::decode(network, dest)?;
        if addr_type != AddressType::P2pkh {
            return Err(Error::validation("destination must be a P2PKH cashaddr or a paycode"));
        }
        Ok(Destination::Transparent(hash))
    }
}

async fn fetch_base_candidates(oracle: &dyn ChainOracle, base_pub: &crate::primitives::Pub33) -> Result<Vec<BaseUtxoCandidate>> {
    let script = p2pkh_script(&hash160(base_pub));
    let scripthash = oracle::script_hash_hex(&script);
    let tip = oracle.get_tip().await.map_err(|e| oracle::chain_error("blockchain.headers.get_tip", e))?;
    let entries = oracle
        .list_unspent(&scripthash)
        .await
        .map_err(|e| oracle::chain_error("blockchain.scripthash.listunspent", e))?;

    Ok(entries
        .into_iter()
        .map(|u| BaseUtxoCandidate {
            txid_be: u.txid_be,
            vout: u.vout,
            value_sats: u.value_sats,
            confirmations: if u.height <= 0 { 0 } else { tip.height.saturating_sub(u.height as u32) + 1 },
            // Base-address UTXOs are assumed non-tokenized; a base
            // wallet is never the intended holder of a CashToken.
            is_token: false,
            is_p2pkh: true,
            exists_onchain: true,
            owner_pub: *base_pub,
        })
        .collect())
}

async fn fetch_stealth_candidates(
    oracle: &dyn ChainOracle,
    state: &PoolState,
    owner: &str,
) -> Result<Vec<StealthUtxoCandidate>> {
    let tip = oracle.get_tip().await.map_err(|e| oracle::chain_error("blockchain.headers.get_tip", e))?;
    let mut out = Vec::new();
    for record in &state.stealth_utxos {
        if record.owner != owner || record.spent == Some(true) {
            continue;
        }
        let txid_be: Bytes32 = match from_hex_fixed(&record.txid) {
            Ok(t) => t,
            Err(_) => continue,
        };
        let stored_hash160: Bytes20 = match from_hex_fixed(&record.hash160_hex) {
            Ok(h) => h,
            Err(_) => continue,
        };
        let script = p2pkh_script(&stored_hash160);
        let scripthash = oracle::script_hash_hex(&script);
        let entries = oracle
            .list_unspent(&scripthash)
            .await
            .map_err(|e| oracle::chain_error("blockchain.scripthash.listunspent", e))?;
        let found = entries.iter().find(|u| u.txid_be == txid_be && u.vout == record.vout);

        out.push(StealthUtxoCandidate {
            txid_be,
            vout: record.vout,
            value_sats: record.value_sats,
            confirmations: found.map(|u| if u.height <= 0 { 0 } else { tip.height.saturating_sub(u.height as u32) + 1 }).unwrap_or(0),
            is_token: false,
            exists_onchain: found.is_some(),
            spent: record.spent == Some(true),
            stored_hash160,
            rpa_context: record.rpa_context.clone(),
        });
    }
    Ok(out)
}

/// A selected funding input, resolved to a concrete private key and
/// carrying enough information to mark its source spent afterward.
struct ResolvedFunding {
    sel: funding::SelectedFunding,
}

async fn select_funding(
    oracle: &dyn ChainOracle,
    wallet: &WalletKeyMaterial,
    state: &PoolState,
    config: &Config,
    min_sats: u64,
    require_vout0: bool,
) -> Result<ResolvedFunding> {
    let base_candidates = fetch_base_candidates(oracle, &wallet.base_pub).await?;
    let stealth_candidates = fetch_stealth_candidates(oracle, state, &wallet.paycode).await?;

    let req = FundingRequest {
        min_sats,
        min_confirmations: 0,
        include_unconfirmed: true,
        require_vout0,
        allow_tokens: false,
        preference: FundingRequest::from_preference(config.funding_prefer),
    };

    let sel = funding::select(
        &base_candidates,
        &stealth_candidates,
        &req,
        &wallet.base_priv,
        &StealthKeys {
            scan_priv: wallet.scan_priv,
            spend_priv: wallet.spend_priv,
        },
    )?;
    Ok(ResolvedFunding { sel })
}

/// Build and sign a single-input P2PKH-authorized transaction with up
/// to two outputs (payment, optional change), given an already
/// selected funding input.
fn build_p2pkh_tx(
    funding: &funding::SelectedFunding,
    payment_script: Vec<u8>,
    payment_value: u64,
    change: Option<(Vec<u8>, u64)>,
) -> Result<RawTx> {
    let mut outputs = vec![TxOutput {
        value_sats: payment_value,
        script_pubkey: payment_script,
    }];
    if let Some((script, value)) = change {
        outputs.push(TxOutput { value_sats: value, script_pubkey: script });
    }

    let mut tx = RawTx {
        version: 2,
        inputs: vec![TxInput {
            outpoint: crate::txbuilder::OutPoint { txid_be: funding.txid_be, vout: funding.vout },
            script_sig: Vec::new(),
            sequence: 0xffff_ffff,
        }],
        outputs,
        locktime: 0,
    };

    let hash160 = hash160(&funding.owner_pub);
    let script_code = p2pkh_script(&hash160);
    let prevout = crate::txbuilder::PrevoutInfo {
        value_sats: funding.value_sats,
        script_pubkey: script_code.clone(),
    };
    let sighash = crate::txbuilder::compute_sighash(&tx, 0, &prevout, &script_code, crate::txbuilder::SIGHASH_ALL_FORKID)?;
    let sig65 = crate::txbuilder::schnorr_sign_sighash(&funding.owner_priv, &sighash, crate::txbuilder::SIGHASH_ALL_FORKID)?;
    tx.inputs[0].script_sig = crate::txbuilder::p2pkh_unlock(&sig65, &funding.owner_pub);
    Ok(tx)
}

/// Options accepted by [`PoolOrchestrator::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub dry_run: bool,
    pub grind_max: Option<u32>,
}

/// What [`PoolOrchestrator::send`] (and, transitively, `deposit`)
/// produced.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub txid_be: Bytes32,
    pub payment_vout: u32,
    pub payment_hash160: Bytes20,
    pub change: Option<(u32, u64, Bytes20)>,
    pub broadcast: bool,
}

/// Change-output policy for [`PoolOrchestrator::deposit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMode {
    Auto,
    Transparent,
    Stealth,
}

/// Options accepted by [`PoolOrchestrator::deposit`].
#[derive(Debug, Clone)]
pub struct DepositOptions {
    pub deposit_kind: DepositKind,
    pub change_mode: ChangeMode,
}

impl Default for DepositOptions {
    fn default() -> Self {
        Self {
            deposit_kind: DepositKind::Rpa,
            change_mode: ChangeMode::Auto,
        }
    }
}

/// Result of [`PoolOrchestrator::init_pool`].
pub struct InitResult {
    pub txid_be: Bytes32,
}

/// Result of [`PoolOrchestrator::import`].
pub struct ImportResult {
    pub txid_be: Bytes32,
    pub shard_index: u16,
    pub new_commitment: Bytes32,
    pub category_mode_used: CategoryMode,
}

/// Result of [`PoolOrchestrator::withdraw`].
pub struct WithdrawResult {
    pub txid_be: Bytes32,
    pub shard_index: u16,
    pub new_commitment: Bytes32,
    pub shard_remainder_sats: u64,
}

/// Owns one wallet's key material, its persisted state, and a handle
/// to the chain, and exposes the caller-facing operations of spec
/// §4.10. A thin composition layer: all of the actual cryptography and
/// transition rules live in [`crate::rpa`], [`crate::shard`], and
/// [`crate::funding`].
pub struct PoolOrchestrator<IO: StoreIo> {
    pub config: Config,
    pub wallet: WalletKeyMaterial,
    pub oracle: std::sync::Arc<dyn ChainOracle>,
    pub store: WalletStore<IO>,
}

impl<IO: StoreIo> PoolOrchestrator<IO> {
    pub fn new(config: Config, wallet: WalletKeyMaterial, oracle: std::sync::Arc<dyn ChainOracle>, store: WalletStore<IO>) -> Self {
        Self { config, wallet, oracle, store }
    }

    fn category_mode(&self) -> CategoryMode {
        self.config.category_mode_override.unwrap_or_else(crate::store::default_category_mode)
    }

    fn self_change_rpa_context(&self, funding_owner_pub: &crate::primitives::Pub33, funding_outpoint: (Bytes32, u32)) -> RpaContext {
        RpaContext {
            sender_pub33: to_hex(funding_owner_pub),
            prevout_txid_hex: to_hex(&funding_outpoint.0),
            prevout_n: funding_outpoint.1,
            index: 0,
        }
    }

    /// `initShards`: fund `shard_count` covenant outputs from a
    /// `vout=0` base UTXO, plus change. Seeds the pool state.
    pub async fn init_pool(&mut self, shard_count: u16, shard_value_sats: u64, fee_floor_sats: u64) -> Result<InitResult> {
        let total = shard_value_sats
            .checked_mul(shard_count as u64)
            .ok_or_else(|| Error::internal("init_pool: value overflow"))?
            + fee_floor_sats
            + shard::FEE_SAFETY_MARGIN_SATS;

        let base_candidates = fetch_base_candidates(&*self.oracle, &self.wallet.base_pub).await?;
        let req = FundingRequest {
            min_sats: total,
            min_confirmations: 0,
            include_unconfirmed: true,
            require_vout0: true,
            allow_tokens: false,
            preference: [crate::funding::FundingKind::Base, crate::funding::FundingKind::Stealth],
        };
        let selected = funding::select(
            &base_candidates,
            &[],
            &req,
            &self.wallet.base_priv,
            &StealthKeys { scan_priv: self.wallet.scan_priv, spend_priv: self.wallet.spend_priv },
        )?;

        let category_mode = self.category_mode();
        let result = shard::init_shards(&shard::InitShardsParams {
            owner_base_priv: self.wallet.base_priv,
            owner_base_pub: self.wallet.base_pub,
            funding: FundingUtxo {
                txid_be: selected.txid_be,
                vout: selected.vout,
                value_sats: selected.value_sats,
                owner_pub: self.wallet.base_pub,
            },
            shard_count,
            shard_value_sats,
            fee_floor_sats,
            category_mode,
        })?;

        let raw = result.tx.serialize();
        let txid = self
            .oracle
            .broadcast(&raw)
            .await
            .map_err(|e| Error::Broadcast(e.to_string()))?;

        let mut state = PoolState::new(
            &result.pool_id,
            "1",
            shard_count,
            self.config.network.as_str(),
            &result.category,
            &result.redeem_script,
        );
        for (i, commitment) in result.shard_commitments.iter().enumerate() {
            state.upsert_shard(ShardPointer {
                index: i as u16,
                txid: to_hex(&txid),
                vout: i as u32,
                value_sats: shard_value_sats,
                commitment_hex: to_hex(commitment),
            });
        }
        self.store.load_or_init(self.config.network.as_str(), state)?;
        self.store.save(now())?;

        Ok(InitResult { txid_be: txid })
    }

    /// `send(dest, sats)`: fund from base or stealth UTXOs, pay `dest`
    /// (a paycode or a cashaddr), keep any change as a fresh stealth
    /// UTXO of our own.
    pub async fn send(&mut self, dest: &str, amount_sats: u64, opts: &SendOptions) -> Result<SendResult> {
        let destination = resolve_destination(self.config.network, dest)?;
        let rate = fee_rate(&*self.oracle).await?;
        let estimated_fee = estimate_fee_sats(rate, 1, 2);

        let resolved = select_funding(&*self.oracle, &self.wallet, self.store.state(), &self.config, amount_sats + estimated_fee, false).await?;
        let sel = &resolved.sel;

        let mut payment_receive_record: Option<(Bytes20, RpaContext)> = None;
        let payment_hash160 = match &destination {
            Destination::Stealth(receiver_scan_pub) => {
                let receiver_spend_pub = rpa::derive_spend_pub(receiver_scan_pub)?;
                let grind_max = opts.grind_max.unwrap_or(rpa::DEFAULT_GRIND_MAX);
                let expected_prefix = rpa::prefix16(receiver_scan_pub);
                let grind = rpa::grind_for_prefix(
                    &sel.owner_priv,
                    receiver_scan_pub,
                    &receiver_spend_pub,
                    &to_hex(&sel.txid_be),
                    sel.vout,
                    &expected_prefix,
                    grind_max,
                )?;
                if *receiver_scan_pub == self.wallet.scan_pub {
                    payment_receive_record = Some((
                        grind.child_hash160,
                        RpaContext {
                            sender_pub33: to_hex(&sel.owner_pub),
                            prevout_txid_hex: to_hex(&sel.txid_be),
                            prevout_n: sel.vout,
                            index: grind.index,
                        },
                    ));
                }
                grind.child_hash160
            }
            Destination::Transparent(hash) => *hash,
        };

        let change_one_time_pub = rpa::derive_sender_one_time_pub(
            &sel.owner_priv,
            &self.wallet.scan_pub,
            &self.wallet.spend_pub,
            &to_hex(&sel.txid_be),
            sel.vout,
            0,
        )?;
        let change_hash160 = hash160(&change_one_time_pub);

        let change_value = sel.value_sats.checked_sub(amount_sats).and_then(|v| v.checked_sub(estimated_fee));

        let change_script = p2pkh_script(&change_hash160);
        let change_out = match change_value {
            Some(v) if v >= shard::dust_threshold(change_script.len()) => Some((change_script.clone(), v)),
            _ => None,
        };
        if change_value.is_none() {
            return Err(Error::policy("send: funding UTXO does not cover amount + fee"));
        }

        let tx = build_p2pkh_tx(sel, p2pkh_script(&payment_hash160), amount_sats, change_out.clone())?;
        let txid = tx.txid();

        if !opts.dry_run {
            self.oracle
                .broadcast(&tx.serialize())
                .await
                .map_err(|e| Error::Broadcast(e.to_string()))?;
        }

        if let Some((hash160_val, rpa_context)) = payment_receive_record {
            self.store.state_mut().upsert_stealth_utxo(StealthUtxoRecord {
                owner: self.wallet.paycode.clone(),
                purpose: "receive".to_string(),
                txid: to_hex(&txid),
                vout: 0,
                value_sats: amount_sats,
                hash160_hex: to_hex(&hash160_val),
                rpa_context,
                spent: None,
                spent_by_txid: None,
                spent_at: None,
            });
        }
        if let Some((_, value)) = &change_out {
            self.store.state_mut().upsert_stealth_utxo(StealthUtxoRecord {
                owner: self.wallet.paycode.clone(),
                purpose: "send_change".to_string(),
                txid: to_hex(&txid),
                vout: 1,
                value_sats: *value,
                hash160_hex: to_hex(&change_hash160),
                rpa_context: self.self_change_rpa_context(&sel.owner_pub, (sel.txid_be, sel.vout)),
                spent: None,
                spent_by_txid: None,
                spent_at: None,
            });
        }
        if sel.kind == crate::funding::FundingKind::Stealth {
            self.store.state_mut().mark_stealth_spent(&to_hex(&sel.txid_be), sel.vout, &to_hex(&txid), now());
        }
        self.store.save(now())?;

        Ok(SendResult {
            txid_be: txid,
            payment_vout: 0,
            payment_hash160,
            change: change_out.map(|(_, v)| (1, v, change_hash160)),
            broadcast: !opts.dry_run,
        })
    }

    /// Self-send in structure: records a [`DepositRecord`] alongside
    /// the stealth-UTXO bookkeeping `send` already performs, so the
    /// deposit can later be picked up by `import`.
    pub async fn deposit(&mut self, amount_sats: u64, opts: &DepositOptions) -> Result<SendResult> {
        if opts.deposit_kind == DepositKind::BaseP2pkh && !self.config.allow_base_import {
            return Err(Error::policy(
                "deposit: depositMode=base requires BCH_STEALTH_ALLOW_BASE_IMPORT=1",
            ));
        }

        let rate = fee_rate(&*self.oracle).await?;
        let estimated_fee = estimate_fee_sats(rate, 1, 2);
        let resolved = select_funding(&*self.oracle, &self.wallet, self.store.state(), &self.config, amount_sats + estimated_fee, false).await?;
        let sel = &resolved.sel;

        let (receiver_hash160, rpa_context) = match opts.deposit_kind {
            DepositKind::Rpa => {
                let child_pub = rpa::derive_sender_one_time_pub(
                    &sel.owner_priv,
                    &self.wallet.scan_pub,
                    &self.wallet.spend_pub,
                    &to_hex(&sel.txid_be),
                    sel.vout,
                    0,
                )?;
                (hash160(&child_pub), Some(self.self_change_rpa_context(&sel.owner_pub, (sel.txid_be, sel.vout))))
            }
            DepositKind::BaseP2pkh => (self.wallet.base_hash160(), None),
        };

        let use_stealth_change = match opts.change_mode {
            ChangeMode::Stealth => true,
            ChangeMode::Transparent => false,
            ChangeMode::Auto => opts.deposit_kind == DepositKind::Rpa,
        };

        let change_value = sel
            .value_sats
            .checked_sub(amount_sats)
            .and_then(|v| v.checked_sub(estimated_fee))
            .ok_or_else(|| Error::policy("deposit: funding UTXO does not cover amount + fee"))?;

        let (change_hash160, change_rpa_context) = if use_stealth_change {
            let child_pub = rpa::derive_sender_one_time_pub(
                &sel.owner_priv,
                &self.wallet.scan_pub,
                &self.wallet.spend_pub,
                &to_hex(&sel.txid_be),
                sel.vout,
                1,
            )?;
            (
                hash160(&child_pub),
                Some(RpaContext {
                    sender_pub33: to_hex(&sel.owner_pub),
                    prevout_txid_hex: to_hex(&sel.txid_be),
                    prevout_n: sel.vout,
                    index: 1,
                }),
            )
        } else {
            (self.wallet.base_hash160(), None)
        };

        let change_script = p2pkh_script(&change_hash160);
        let change_out = if change_value >= shard::dust_threshold(change_script.len()) {
            Some((change_script, change_value))
        } else {
            None
        };

        let tx = build_p2pkh_tx(sel, p2pkh_script(&receiver_hash160), amount_sats, change_out.clone())?;
        let txid = tx.txid();

        self.oracle
            .broadcast(&tx.serialize())
            .await
            .map_err(|e| Error::Broadcast(e.to_string()))?;

        if let Some(ctx) = &rpa_context {
            self.store.state_mut().upsert_stealth_utxo(StealthUtxoRecord {
                owner: self.wallet.paycode.clone(),
                purpose: "receive".to_string(),
                txid: to_hex(&txid),
                vout: 0,
                value_sats: amount_sats,
                hash160_hex: to_hex(&receiver_hash160),
                rpa_context: ctx.clone(),
                spent: None,
                spent_by_txid: None,
                spent_at: None,
            });
        }
        if let (Some((_, value)), Some(ctx)) = (&change_out, &change_rpa_context) {
            self.store.state_mut().upsert_stealth_utxo(StealthUtxoRecord {
                owner: self.wallet.paycode.clone(),
                purpose: "deposit_change".to_string(),
                txid: to_hex(&txid),
                vout: 1,
                value_sats: *value,
                hash160_hex: to_hex(&change_hash160),
                rpa_context: ctx.clone(),
                spent: None,
                spent_by_txid: None,
                spent_at: None,
            });
        }
        if sel.kind == crate::funding::FundingKind::Stealth {
            self.store.state_mut().mark_stealth_spent(&to_hex(&sel.txid_be), sel.vout, &to_hex(&txid), now());
        }

        self.store.state_mut().upsert_deposit(DepositRecord {
            txid: to_hex(&txid),
            vout: 0,
            value_sats: amount_sats,
            receiver_hash160_hex: to_hex(&receiver_hash160),
            created_at: now(),
            rpa_context,
            deposit_kind: opts.deposit_kind,
            import_txid: None,
            imported_into_shard: None,
        });
        self.store.state_mut().last_deposit = Some(OpPointer { txid: to_hex(&txid), vout: 0 });
        self.store.save(now())?;

        Ok(SendResult {
            txid_be: txid,
            payment_vout: 0,
            payment_hash160: receiver_hash160,
            change: change_out.map(|(_, v)| (1, v, change_hash160)),
            broadcast: true,
        })
    }

    fn pick_unimported_deposit(&self, deposit_txid: Option<Bytes32>) -> Result<DepositRecord> {
        let deposits = &self.store.state().deposits;
        let record = match deposit_txid {
            Some(txid) => deposits.iter().find(|d| d.txid == to_hex(&txid) && d.is_unimported()),
            None => deposits.iter().filter(|d| d.is_unimported()).max_by_key(|d| d.created_at),
        };
        record.cloned().ok_or_else(|| Error::policy("import: no matching unimported deposit"))
    }

    async fn deposit_owner_priv(&self, deposit: &DepositRecord) -> Result<(Bytes32, crate::primitives::Pub33)> {
        match deposit.deposit_kind {
            DepositKind::BaseP2pkh => Ok((self.wallet.base_priv, self.wallet.base_pub)),
            DepositKind::Rpa => {
                let ctx = deposit
                    .rpa_context
                    .as_ref()
                    .ok_or_else(|| Error::policy("import: rpa deposit missing rpaContext"))?;
                let sender_pub: crate::primitives::Pub33 = from_hex_fixed(&ctx.sender_pub33)?;
                let priv_key = rpa::derive_receiver_one_time_priv(
                    &self.wallet.scan_priv,
                    &self.wallet.spend_priv,
                    &sender_pub,
                    &ctx.prevout_txid_hex,
                    ctx.prevout_n,
                    ctx.index,
                )?;
                let pub_key = curve::get_public_key(&priv_key)?;
                Ok((priv_key, pub_key))
            }
        }
    }

    /// Wait (up to 12 polls, 750ms apart) for `(txid, vout)` to appear
    /// in the scripthash's unspent set, per spec §4.10.
    async fn wait_for_unspent(&self, txid_be: Bytes32, vout: u32, hash160: &Bytes20) -> Result<()> {
        let scripthash = oracle::script_hash_hex(&p2pkh_script(hash160));
        for attempt in 0..12 {
            let entries = self
                .oracle
                .list_unspent(&scripthash)
                .await
                .map_err(|e| oracle::chain_error("blockchain.scripthash.listunspent", e))?;
            if entries.iter().any(|u| u.txid_be == txid_be && u.vout == vout) {
                return Ok(());
            }
            if attempt < 11 {
                sleep(Duration::from_millis(750)).await;
            }
        }
        Err(Error::chain(
            "blockchain.scripthash.listunspent",
            "deposit outpoint never became visible as unspent",
        ))
    }

    /// `importDepositToShard`, with the category-mode fallback retry
    /// loop (spec §4.10/§9): `null`, then `reverse`, then `raw`
    /// (deduped against `null`'s identical tag byte), retrying only on
    /// [`Error::is_broadcast_retryable`] failures.
    pub async fn import(&mut self, deposit_txid: Option<Bytes32>, shard_index: Option<u16>) -> Result<ImportResult> {
        let deposit = self.pick_unimported_deposit(deposit_txid)?;
        if deposit.deposit_kind == DepositKind::BaseP2pkh && !self.config.allow_base_import {
            return Err(Error::policy(
                "import: base-address deposits require BCH_STEALTH_ALLOW_BASE_IMPORT=1",
            ));
        }

        let deposit_txid_be: Bytes32 = from_hex_fixed(&deposit.txid)?;
        let receiver_hash160: Bytes20 = from_hex_fixed(&deposit.receiver_hash160_hex)?;
        self.wait_for_unspent(deposit_txid_be, deposit.vout, &receiver_hash160).await?;

        let shard_count = self.store.state().shard_count;
        let index = match shard_index {
            Some(i) => i,
            None => shard::select_shard_index(&deposit_txid_be, deposit.vout, shard_count)?,
        };
        let pointer = self
            .store
            .state()
            .shard(index)
            .cloned()
            .ok_or_else(|| Error::validation(format!("import: no shard at index {index}")))?;

        let shard_prevout = ShardPrevout {
            txid_be: from_hex_fixed(&pointer.txid)?,
            vout: pointer.vout,
            value_sats: pointer.value_sats,
            commitment: from_hex_fixed(&pointer.commitment_hex)?,
        };

        let (deposit_priv, deposit_pub) = self.deposit_owner_priv(&deposit).await?;
        let category: Bytes32 = from_hex_fixed(&self.store.state().category_hex)?;
        let redeem_script: Vec<u8> = crate::primitives::from_hex(&self.store.state().redeem_script_hex)?;

        let rate = fee_rate(&*self.oracle).await?;
        let fee_sats = estimate_fee_sats(rate, 2, 1);

        let candidate_modes: Vec<CategoryMode> = match self.config.category_mode_override {
            Some(m) => vec![m],
            None => {
                let mut modes = Vec::new();
                let mut tried_null_tag = false;
                for m in CategoryMode::FALLBACK_ORDER {
                    if matches!(m, CategoryMode::Raw) && tried_null_tag {
                        continue; // tag byte identical to Null's, already attempted
                    }
                    if matches!(m, CategoryMode::Null) {
                        tried_null_tag = true;
                    }
                    modes.push(m);
                }
                modes
            }
        };

        let mut last_err: Option<Error> = None;
        for (attempt_idx, mode) in candidate_modes.iter().enumerate() {
            let params = shard::ImportDepositParams {
                shard: shard_prevout.clone(),
                deposit: FundingUtxo {
                    txid_be: deposit_txid_be,
                    vout: deposit.vout,
                    value_sats: deposit.value_sats,
                    owner_pub: deposit_pub,
                },
                deposit_priv,
                witness: None,
                fee_sats,
                category,
                category_mode: *mode,
                redeem_script: redeem_script.clone(),
                debug_assert_unlock: self.config.debug,
            };

            let (tx, state_out) = match shard::import_deposit_to_shard(&params) {
                Ok(v) => v,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let txid = tx.txid();

            match self.oracle.broadcast(&tx.serialize()).await {
                Ok(_) => {
                    if attempt_idx > 0 {
                        crate::logging::log_category_mode_fallback(&format!("{mode:?}"), true);
                    }
                    self.store.state_mut().upsert_shard(ShardPointer {
                        index,
                        txid: to_hex(&txid),
                        vout: 0,
                        value_sats: tx.outputs[0].value_sats,
                        commitment_hex: to_hex(&state_out),
                    });
                    let mut updated = deposit.clone();
                    updated.import_txid = Some(to_hex(&txid));
                    updated.imported_into_shard = Some(index);
                    self.store.state_mut().upsert_deposit(updated);
                    self.store.state_mut().last_import = Some(OpPointer { txid: to_hex(&txid), vout: 0 });
                    self.store.save(now())?;

                    return Ok(ImportResult {
                        txid_be: txid,
                        shard_index: index,
                        new_commitment: state_out,
                        category_mode_used: *mode,
                    });
                }
                Err(e) => {
                    let err = Error::Broadcast(e.to_string());
                    if err.is_broadcast_retryable() {
                        crate::logging::log_category_mode_fallback(&format!("{mode:?}"), false);
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::internal("import: no category-mode candidate attempted")))
    }

    /// Parse the on-chain shard prevout's CashTokens commitment straight
    /// off its funding transaction (spec §4.6: "must be read from the
    /// on-chain shard prevout's token commitment, not from the store").
    async fn fetch_onchain_shard_prevout(&self, pointer: &ShardPointer) -> Result<(ShardPrevout, Bytes32)> {
        let txid_be: Bytes32 = from_hex_fixed(&pointer.txid)?;
        let raw = self
            .oracle
            .get_transaction(&txid_be)
            .await
            .map_err(|e| oracle::chain_error("blockchain.transaction.get", e))?;
        let tx = RawTx::deserialize(&raw)?;
        let output = tx
            .outputs
            .get(pointer.vout as usize)
            .ok_or_else(|| Error::chain("blockchain.transaction.get", "shard vout out of range"))?;
        let (prefix, _) = crate::script::split_token_prefix(&output.script_pubkey);
        let prefix = prefix.ok_or_else(|| Error::policy("withdraw: shard prevout carries no token prefix"))?;
        let (token, _) = crate::script::decode_token_prefix(&prefix)?;
        let commitment = token
            .commitment
            .ok_or_else(|| Error::policy("withdraw: shard prevout token carries no commitment"))?;
        if commitment.len() != 32 {
            return Err(Error::policy("withdraw: shard commitment is not 32 bytes"));
        }
        let mut state_in = [0u8; 32];
        state_in.copy_from_slice(&commitment);

        if self.config.debug {
            let stored: Bytes32 = from_hex_fixed(&pointer.commitment_hex).unwrap_or([0u8; 32]);
            if stored != state_in {
                tracing::warn!(
                    shard_index = pointer.index,
                    stored = %pointer.commitment_hex,
                    onchain = %to_hex(&state_in),
                    "shard commitment in store disagrees with chain"
                );
            }
        }

        Ok((
            ShardPrevout {
                txid_be,
                vout: pointer.vout,
                value_sats: output.value_sats,
                commitment: state_in,
            },
            state_in,
        ))
    }

    /// `withdrawFromShard`: pay `amount_sats` from shard `shard_index`
    /// to `dest`, funding the fee from base/stealth UTXOs.
    pub async fn withdraw(&mut self, dest: &str, shard_index: u16, amount_sats: u64, fee_sats: u64) -> Result<WithdrawResult> {
        let destination = resolve_destination(self.config.network, dest)?;
        let pointer = self
            .store
            .state()
            .shard(shard_index)
            .cloned()
            .ok_or_else(|| Error::validation(format!("withdraw: no shard at index {shard_index}")))?;
        let (shard_prevout, state_in) = self.fetch_onchain_shard_prevout(&pointer).await?;

        let resolved = select_funding(&*self.oracle, &self.wallet, self.store.state(), &self.config, fee_sats, false).await?;
        let fee_sel = &resolved.sel;

        let receiver_hash160 = match &destination {
            Destination::Stealth(receiver_scan_pub) => {
                let receiver_spend_pub = rpa::derive_spend_pub(receiver_scan_pub)?;
                let grind = rpa::grind_for_prefix(
                    &fee_sel.owner_priv,
                    receiver_scan_pub,
                    &receiver_spend_pub,
                    &to_hex(&fee_sel.txid_be),
                    fee_sel.vout,
                    &rpa::prefix16(receiver_scan_pub),
                    rpa::DEFAULT_GRIND_MAX,
                )?;
                grind.child_hash160
            }
            Destination::Transparent(hash) => *hash,
        };

        let category: Bytes32 = from_hex_fixed(&self.store.state().category_hex)?;
        let redeem_script: Vec<u8> = crate::primitives::from_hex(&self.store.state().redeem_script_hex)?;

        let (tx, state_out) = shard::withdraw_from_shard(
            &shard::WithdrawParams {
                shard: shard_prevout,
                fee_prevout: FundingUtxo {
                    txid_be: fee_sel.txid_be,
                    vout: fee_sel.vout,
                    value_sats: fee_sel.value_sats,
                    owner_pub: fee_sel.owner_pub,
                },
                fee_priv: fee_sel.owner_priv,
                receiver_hash160,
                amount_sats,
                fee_sats,
                change_hash160: self.wallet.base_hash160(),
                category,
                category_mode: self.category_mode(),
                redeem_script,
                debug_assert_unlock: self.config.debug,
            },
            &state_in,
        )?;

        let txid = tx.txid();
        self.oracle
            .broadcast(&tx.serialize())
            .await
            .map_err(|e| Error::Broadcast(e.to_string()))?;

        self.store.state_mut().upsert_shard(ShardPointer {
            index: shard_index,
            txid: to_hex(&txid),
            vout: 0,
            value_sats: tx.outputs[0].value_sats,
            commitment_hex: to_hex(&state_out),
        });
        self.store.state_mut().withdrawals.push(WithdrawalRecord {
            shard_index,
            txid: to_hex(&txid),
            amount_sats,
            receiver_hash160_hex: to_hex(&receiver_hash160),
            created_at: now(),
        });
        if fee_sel.kind == crate::funding::FundingKind::Stealth {
            self.store
                .state_mut()
                .mark_stealth_spent(&to_hex(&fee_sel.txid_be), fee_sel.vout, &to_hex(&txid), now());
        }
        self.store.state_mut().last_withdraw = Some(OpPointer { txid: to_hex(&txid), vout: 0 });
        self.store.save(now())?;

        Ok(WithdrawResult {
            txid_be: txid,
            shard_index,
            new_commitment: state_out,
            shard_remainder_sats: tx.outputs[0].value_sats,
        })
    }

    /// Runs [`crate::scan::run_scan`] and merges every match into the
    /// store as a `receive` stealth UTXO (spec §4.9, scenario 5).
    pub async fn scan(&mut self, start_height: u32, end_height_exclusive: u32, include_mempool: bool) -> Result<Vec<ScanMatch>> {
        let hints: Vec<u32> = self
            .store
            .state()
            .stealth_utxos
            .iter()
            .filter(|r| r.owner == self.wallet.paycode)
            .map(|r| r.rpa_context.index)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let params = ScanParams {
            scan_priv: self.wallet.scan_priv,
            spend_priv: self.wallet.spend_priv,
            scan_pub: self.wallet.scan_pub,
            start_height,
            end_height_exclusive,
            max_role_index: self.config.max_role_index,
            index_hints: hints,
            stop_on_first_match: false,
            include_mempool,
        };

        let matches = scan::run_scan(&*self.oracle, &params).await?;
        for m in &matches {
            self.store.state_mut().upsert_stealth_utxo(StealthUtxoRecord {
                owner: self.wallet.paycode.clone(),
                purpose: "receive".to_string(),
                txid: to_hex(&m.txid_be),
                vout: m.vout,
                value_sats: m.value_sats,
                hash160_hex: to_hex(&m.hash160),
                rpa_context: m.rpa_context.clone(),
                spent: None,
                spent_by_txid: None,
                spent_at: None,
            });
        }
        if !matches.is_empty() {
            self.store.save(now())?;
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FundingPreference, Network};
    use crate::oracle::MockChainOracle;
    use crate::store::FileStoreIo;
    use std::cell::RefCell;

    struct MemIo {
        bytes: RefCell<Option<Vec<u8>>>,
    }
    impl MemIo {
        fn empty() -> Self {
            Self { bytes: RefCell::new(None) }
        }
    }
    impl StoreIo for MemIo {
        fn load(&self) -> std::io::Result<Option<Vec<u8>>> {
            Ok(self.bytes.borrow().clone())
        }
        fn save(&self, bytes: &[u8]) -> std::io::Result<()> {
            *self.bytes.borrow_mut() = Some(bytes.to_vec());
            Ok(())
        }
    }

    fn priv_from_u64(n: u64) -> Bytes32 {
        let mut out = [0u8; 32];
        out[24..32].copy_from_slice(&n.to_be_bytes());
        out
    }

    fn test_config() -> Config {
        Config {
            network: Network::Regtest,
            allow_base_import: true,
            category_mode_override: Some(CategoryMode::Null),
            funding_prefer: FundingPreference::BaseFirst,
            max_role_index: 64,
            debug: true,
        }
    }

    fn fund_base(oracle: &MockChainOracle, wallet: &WalletKeyMaterial, value_sats: u64) -> Bytes32 {
        let script = p2pkh_script(&wallet.base_hash160());
        let scripthash = oracle::script_hash_hex(&script);
        let txid = [0x77u8; 32];
        oracle.set_unspent(
            &scripthash,
            vec![crate::oracle::UnspentEntry {
                txid_be: txid,
                vout: 0,
                value_sats,
                height: 100,
            }],
        );
        let tx = RawTx {
            version: 2,
            inputs: vec![],
            outputs: vec![TxOutput { value_sats, script_pubkey: script }],
            locktime: 0,
        };
        oracle.insert_transaction(&tx);
        txid
    }

    #[tokio::test]
    async fn send_to_self_paycode_creates_receive_and_change() {
        let wallet = WalletKeyMaterial::new(priv_from_u64(1), priv_from_u64(2), 0).unwrap();
        let oracle = std::sync::Arc::new(MockChainOracle::new());
        oracle.set_tip_height(100);
        fund_base(&oracle, &wallet, 10_000);

        let mut store = WalletStore::new(MemIo::empty(), wallet.paycode.clone());
        store
            .load_or_init(
                "regtest",
                PoolState::new(&[0u8; 20], "1", 2, "regtest", &[0u8; 32], &[0x51]),
            )
            .unwrap();

        let mut orch = PoolOrchestrator::new(test_config(), wallet.clone(), oracle.clone(), store);
        let result = orch
            .send(&wallet.paycode, 3_000, &SendOptions { dry_run: false, grind_max: None })
            .await
            .unwrap();

        assert!(result.broadcast);
        assert!(result.change.is_some());
        assert_eq!(orch.store.state().stealth_utxos.len(), 2);

        let receive = orch
            .store
            .state()
            .stealth_utxos
            .iter()
            .find(|u| u.purpose == "receive")
            .expect("payment output recorded as a receive stealth UTXO");
        assert_eq!(receive.vout, 0);
        assert_eq!(receive.value_sats, 3_000);
        assert_eq!(receive.hash160_hex, to_hex(&result.payment_hash160));

        let change = orch
            .store
            .state()
            .stealth_utxos
            .iter()
            .find(|u| u.purpose == "send_change")
            .expect("change output recorded as a stealth UTXO");
        assert_eq!(change.vout, 1);
    }

    #[tokio::test]
    async fn init_pool_seeds_two_shards() {
        let wallet = WalletKeyMaterial::new(priv_from_u64(10), priv_from_u64(20), 0).unwrap();
        let oracle = std::sync::Arc::new(MockChainOracle::new());
        oracle.set_tip_height(50);
        fund_base(&oracle, &wallet, 10_000);

        let store = WalletStore::new(MemIo::empty(), wallet.paycode.clone());
        let mut orch = PoolOrchestrator::new(test_config(), wallet, oracle, store);
        orch.init_pool(2, 2_000, 1_800).await.unwrap();

        assert_eq!(orch.store.state().shard_count, 2);
        assert_eq!(orch.store.state().shards.len(), 2);
    }

    #[tokio::test]
    async fn deposit_then_import_then_withdraw_round_trip() {
        let wallet = WalletKeyMaterial::new(priv_from_u64(100), priv_from_u64(200), 0).unwrap();
        let oracle = std::sync::Arc::new(MockChainOracle::new());
        oracle.set_tip_height(10);
        fund_base(&oracle, &wallet, 20_000);

        let store = WalletStore::new(MemIo::empty(), wallet.paycode.clone());
        let mut orch = PoolOrchestrator::new(test_config(), wallet.clone(), oracle.clone(), store);
        orch.init_pool(2, 2_000, 1_800).await.unwrap();

        // Fund again for the deposit's own input.
        fund_base(&oracle, &wallet, 9_000);
        let deposit_result = orch
            .deposit(5_000, &DepositOptions::default())
            .await
            .unwrap();
        assert!(deposit_result.broadcast);
        assert_eq!(orch.store.state().deposits.len(), 1);

        let import_result = orch.import(None, Some(0)).await.unwrap();
        assert_eq!(import_result.shard_index, 0);
        assert!(orch.store.state().deposits[0].import_txid.is_some());

        fund_base(&oracle, &wallet, 5_000);
        let recv_priv = priv_from_u64(999);
        let recv_pub = curve::get_public_key(&recv_priv).unwrap();
        let recv_hash160 = hash160(&recv_pub);
        let recv_addr = cashaddr::encode(Network::Regtest, AddressType::P2pkh, &recv_hash160);

        let withdraw_result = orch.withdraw(&recv_addr, 0, 1_000, 600).await.unwrap();
        assert_eq!(withdraw_result.shard_index, 0);
        assert_eq!(orch.store.state().withdrawals.len(), 1);
    }
}
