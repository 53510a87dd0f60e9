//! Wallet-state store: the canonical JSON envelope recording deposits,
//! stealth UTXOs, shard pointers, and withdrawals for one pool.
//!
//! Persistence is split from the data model by the [`StoreIo`] trait
//! (spec §1 names "on-disk atomic-write plumbing" as an external
//! collaborator); [`FileStoreIo`] is the one reference implementation
//! this crate ships.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::{to_hex, Bytes20, Bytes32};
use crate::rpa::RpaContext;
use crate::shard::CategoryMode;

/// Errors from the store layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store write refused: owner tag mismatch (envelope={envelope}, caller={caller})")]
    OwnerMismatch { envelope: String, caller: String },

    #[error("store envelope is malformed: {0}")]
    Malformed(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Which derivation path produced a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositKind {
    Rpa,
    BaseP2pkh,
}

/// A discovered or self-created stealth UTXO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StealthUtxoRecord {
    pub owner: String,
    pub purpose: String,
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
    pub hash160_hex: String,
    pub rpa_context: RpaContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spent_by_txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spent_at: Option<u64>,
}

impl StealthUtxoRecord {
    fn key(&self) -> (String, u32) {
        (self.txid.clone(), self.vout)
    }
}

/// A deposit awaiting import, or already imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRecord {
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
    pub receiver_hash160_hex: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpa_context: Option<RpaContext>,
    pub deposit_kind: DepositKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_into_shard: Option<u16>,
}

impl DepositRecord {
    fn key(&self) -> (String, u32) {
        (self.txid.clone(), self.vout)
    }

    pub fn is_unimported(&self) -> bool {
        self.import_txid.is_none()
    }
}

/// One shard's current on-chain position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardPointer {
    pub index: u16,
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
    pub commitment_hex: String,
}

/// A completed withdrawal, kept for history/audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRecord {
    pub shard_index: u16,
    pub txid: String,
    pub amount_sats: u64,
    pub receiver_hash160_hex: String,
    pub created_at: u64,
}

/// A single `(txid, vout)` pointer, used for `lastDeposit`/`lastImport`/
/// `lastWithdraw` bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpPointer {
    pub txid: String,
    pub vout: u32,
}

/// Restore hints carried in the envelope, including the owner tag used
/// for the cross-profile safety check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_tag: Option<String>,
}

/// The full state of one pool, plus its satellite record arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolState {
    pub pool_id_hex: String,
    pub pool_version: String,
    pub shard_count: u16,
    pub network: String,
    pub category_hex: String,
    pub redeem_script_hex: String,
    pub shards: Vec<ShardPointer>,

    #[serde(default)]
    pub stealth_utxos: Vec<StealthUtxoRecord>,
    #[serde(default)]
    pub deposits: Vec<DepositRecord>,
    #[serde(default)]
    pub withdrawals: Vec<WithdrawalRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deposit: Option<OpPointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_import: Option<OpPointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_withdraw: Option<OpPointer>,

    #[serde(default)]
    pub restore_hints: RestoreHints,
}

impl PoolState {
    pub fn new(
        pool_id: &Bytes20,
        pool_version: impl Into<String>,
        shard_count: u16,
        network: &str,
        category: &Bytes32,
        redeem_script: &[u8],
    ) -> Self {
        Self {
            pool_id_hex: to_hex(pool_id),
            pool_version: pool_version.into(),
            shard_count,
            network: network.to_string(),
            category_hex: to_hex(category),
            redeem_script_hex: to_hex(redeem_script),
            shards: Vec::new(),
            stealth_utxos: Vec::new(),
            deposits: Vec::new(),
            withdrawals: Vec::new(),
            last_deposit: None,
            last_import: None,
            last_withdraw: None,
            restore_hints: RestoreHints::default(),
        }
    }

    /// Insert or replace the stealth-UTXO record with the same
    /// `(txid, vout)` key.
    pub fn upsert_stealth_utxo(&mut self, record: StealthUtxoRecord) {
        let key = record.key();
        if let Some(existing) = self.stealth_utxos.iter_mut().find(|r| r.key() == key) {
            *existing = record;
        } else {
            self.stealth_utxos.push(record);
        }
    }

    /// Insert or replace the deposit record with the same
    /// `(txid, vout)` key.
    pub fn upsert_deposit(&mut self, record: DepositRecord) {
        let key = record.key();
        if let Some(existing) = self.deposits.iter_mut().find(|r| r.key() == key) {
            *existing = record;
        } else {
            self.deposits.push(record);
        }
    }

    /// Insert or replace the shard pointer with the same `index`.
    pub fn upsert_shard(&mut self, pointer: ShardPointer) {
        if let Some(existing) = self.shards.iter_mut().find(|s| s.index == pointer.index) {
            *existing = pointer;
        } else {
            self.shards.push(pointer);
        }
    }

    /// No-op if the record is absent, per spec §4.7.
    pub fn mark_stealth_spent(&mut self, txid: &str, vout: u32, spending_txid: &str, spent_at: u64) {
        if let Some(record) = self.stealth_utxos.iter_mut().find(|r| r.txid == txid && r.vout == vout) {
            record.spent = Some(true);
            record.spent_by_txid = Some(spending_txid.to_string());
            record.spent_at = Some(spent_at);
        }
    }

    pub fn shard(&self, index: u16) -> Option<&ShardPointer> {
        self.shards.iter().find(|s| s.index == index)
    }

    /// Merge legacy top-level/nested arrays into the canonical arrays,
    /// first-seen wins (spec §4.7, §6). Call this once after
    /// deserializing an envelope that may carry legacy shapes.
    fn merge_legacy(&mut self, legacy_stealth_utxos: Vec<Vec<StealthUtxoRecord>>) {
        let mut seen: HashMap<(String, u32), ()> = self.stealth_utxos.iter().map(|r| (r.key(), ())).collect();
        for batch in legacy_stealth_utxos {
            for record in batch {
                let key = record.key();
                if seen.insert(key, ()).is_none() {
                    self.stealth_utxos.push(record);
                }
            }
        }
    }
}

/// Top-level persisted data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreData {
    pub pool: PoolWrapper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolWrapper {
    pub state: PoolState,
}

/// The on-disk envelope: `{ schemaVersion, network, data: { pool: {
/// state: PoolState } }, updatedAt, createdAt }`, plus whatever legacy
/// top-level fields an older writer may have left behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEnvelope {
    pub schema_version: u32,
    pub network: String,
    pub data: StoreData,
    pub updated_at: u64,
    pub created_at: u64,

    /// Legacy top-level `stealthUtxos`, read and merged on load,
    /// removed on save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stealth_utxos: Option<Vec<StealthUtxoRecord>>,
}

pub const SCHEMA_VERSION: u32 = 1;

/// Persistence boundary: load the envelope bytes (if any exist yet)
/// and save new ones. [`FileStoreIo`] is the one reference
/// implementation; callers needing locking or fsync guarantees supply
/// their own.
pub trait StoreIo {
    fn load(&self) -> std::io::Result<Option<Vec<u8>>>;
    fn save(&self, bytes: &[u8]) -> std::io::Result<()>;
}

/// Write-to-temp-file-then-rename, the closest to atomic the standard
/// library offers on POSIX.
pub struct FileStoreIo {
    path: std::path::PathBuf,
}

impl FileStoreIo {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StoreIo for FileStoreIo {
    fn load(&self) -> std::io::Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, bytes: &[u8]) -> std::io::Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, &self.path)
    }
}

/// The wallet-state store: owns one envelope, backed by a [`StoreIo`].
pub struct WalletStore<IO: StoreIo> {
    io: IO,
    owner_tag: String,
    envelope: Option<StoreEnvelope>,
}

impl<IO: StoreIo> WalletStore<IO> {
    pub fn new(io: IO, owner_tag: impl Into<String>) -> Self {
        Self {
            io,
            owner_tag: owner_tag.into(),
            envelope: None,
        }
    }

    /// Load the envelope from disk, merging any legacy fields. If no
    /// file exists yet, seeds an empty envelope around `initial_state`.
    pub fn load_or_init(&mut self, network: &str, initial_state: PoolState) -> crate::error::Result<()> {
        match self.io.load()? {
            Some(bytes) => {
                let mut envelope: StoreEnvelope = serde_json::from_slice(&bytes)?;
                let legacy = envelope.stealth_utxos.take().map(|v| vec![v]).unwrap_or_default();
                envelope.data.pool.state.merge_legacy(legacy);
                self.check_owner(&envelope)?;
                self.envelope = Some(envelope);
            }
            None => {
                self.envelope = Some(StoreEnvelope {
                    schema_version: SCHEMA_VERSION,
                    network: network.to_string(),
                    data: StoreData {
                        pool: PoolWrapper { state: initial_state },
                    },
                    updated_at: 0,
                    created_at: 0,
                    stealth_utxos: None,
                });
            }
        }
        Ok(())
    }

    fn check_owner(&self, envelope: &StoreEnvelope) -> StoreResult<()> {
        if let Some(envelope_tag) = &envelope.data.pool.state.restore_hints.owner_tag {
            if envelope_tag != &self.owner_tag {
                return Err(StoreError::OwnerMismatch {
                    envelope: envelope_tag.clone(),
                    caller: self.owner_tag.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn state(&self) -> &PoolState {
        &self.envelope.as_ref().expect("load_or_init called before state()").data.pool.state
    }

    pub fn state_mut(&mut self) -> &mut PoolState {
        &mut self
            .envelope
            .as_mut()
            .expect("load_or_init called before state_mut()")
            .data
            .pool
            .state
    }

    /// Serialize and persist the envelope, refusing (without writing)
    /// if the owner tag disagrees (spec §4.7: "any write operation
    /// fails with a refuse-to-write error").
    pub fn save(&mut self, now: u64) -> crate::error::Result<()> {
        let envelope = self
            .envelope
            .as_mut()
            .expect("load_or_init called before save()");
        if envelope.data.pool.state.restore_hints.owner_tag.is_none() {
            envelope.data.pool.state.restore_hints.owner_tag = Some(self.owner_tag.clone());
        }
        self.check_owner(envelope)?;

        if envelope.created_at == 0 {
            envelope.created_at = now;
        }
        envelope.updated_at = now;
        envelope.stealth_utxos = None;

        let bytes = serde_json::to_vec_pretty(envelope)?;
        self.io.save(&bytes)?;
        Ok(())
    }
}

/// Pick the category-mode default recorded in an existing envelope's
/// stored category, or fall back to the fixed fallback-order default
/// (`Null`) for a brand-new pool. Exposed for orchestrators composing
/// the category-mode retry loop (spec §4.10).
pub fn default_category_mode() -> CategoryMode {
    CategoryMode::FALLBACK_ORDER[0]
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn sample_state() -> PoolState {
        PoolState::new(&[0x01; 20], "1", 2, "regtest", &[0x02; 32], &[0x51])
    }

    fn sample_rpa_context() -> RpaContext {
        RpaContext {
            sender_pub33: "ab".repeat(33),
            prevout_txid_hex: "cd".repeat(32),
            prevout_n: 0,
            index: 0,
        }
    }

    #[test]
    fn upsert_stealth_utxo_is_idempotent() {
        let mut state = sample_state();
        let record = StealthUtxoRecord {
            owner: "w1".into(),
            purpose: "receive".into(),
            txid: "11".repeat(32),
            vout: 0,
            value_sats: 1000,
            hash160_hex: "22".repeat(20),
            rpa_context: sample_rpa_context(),
            spent: None,
            spent_by_txid: None,
            spent_at: None,
        };
        state.upsert_stealth_utxo(record.clone());
        state.upsert_stealth_utxo(record);
        assert_eq!(state.stealth_utxos.len(), 1);
    }

    #[test]
    fn mark_stealth_spent_is_noop_when_absent() {
        let mut state = sample_state();
        state.mark_stealth_spent("nope", 0, "spendtx", 1234);
        assert!(state.stealth_utxos.is_empty());
    }

    #[test]
    fn mark_stealth_spent_updates_existing_record() {
        let mut state = sample_state();
        let record = StealthUtxoRecord {
            owner: "w1".into(),
            purpose: "receive".into(),
            txid: "33".repeat(32),
            vout: 1,
            value_sats: 500,
            hash160_hex: "44".repeat(20),
            rpa_context: sample_rpa_context(),
            spent: None,
            spent_by_txid: None,
            spent_at: None,
        };
        state.upsert_stealth_utxo(record);
        state.mark_stealth_spent(&"33".repeat(32), 1, "spendtx", 999);
        let updated = state.stealth_utxos.first().unwrap();
        assert_eq!(updated.spent, Some(true));
        assert_eq!(updated.spent_by_txid.as_deref(), Some("spendtx"));
    }

    #[test]
    fn load_or_init_seeds_empty_store() {
        let io = MemIo::empty();
        let mut store = WalletStore::new(io, "owner-1");
        store.load_or_init("regtest", sample_state()).unwrap();
        assert_eq!(store.state().shard_count, 2);
    }

    #[test]
    fn save_then_reload_roundtrips() {
        let io = MemIo::empty();
        let mut store = WalletStore::new(io, "owner-1");
        store.load_or_init("regtest", sample_state()).unwrap();
        store.state_mut().upsert_shard(ShardPointer {
            index: 0,
            txid: "55".repeat(32),
            vout: 0,
            value_sats: 2000,
            commitment_hex: "66".repeat(32),
        });
        store.save(1_700_000_000).unwrap();

        let bytes = store.io.load().unwrap().unwrap();
        let reloaded: StoreEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reloaded.data.pool.state.shards.len(), 1);
        assert_eq!(reloaded.data.pool.state.restore_hints.owner_tag.as_deref(), Some("owner-1"));
    }

    #[test]
    fn save_refuses_on_owner_mismatch() {
        let io = MemIo::empty();
        let mut state = sample_state();
        state.restore_hints.owner_tag = Some("other-owner".into());
        let mut store = WalletStore::new(io, "owner-1");
        store.load_or_init("regtest", state).unwrap();
        let err = store.save(1).unwrap_err();
        assert!(matches!(err, crate::error::Error::Storage(StoreError::OwnerMismatch { .. })));
    }

    #[test]
    fn legacy_top_level_stealth_utxos_merge_first_seen_wins() {
        let io = MemIo::empty();
        let legacy_record = StealthUtxoRecord {
            owner: "w1".into(),
            purpose: "receive".into(),
            txid: "77".repeat(32),
            vout: 0,
            value_sats: 111,
            hash160_hex: "88".repeat(20),
            rpa_context: sample_rpa_context(),
            spent: None,
            spent_by_txid: None,
            spent_at: None,
        };
        let envelope = StoreEnvelope {
            schema_version: SCHEMA_VERSION,
            network: "regtest".into(),
            data: StoreData {
                pool: PoolWrapper { state: sample_state() },
            },
            updated_at: 0,
            created_at: 0,
            stealth_utxos: Some(vec![legacy_record.clone()]),
        };
        io.save(&serde_json::to_vec(&envelope).unwrap()).unwrap();

        let mut store = WalletStore::new(io, "owner-1");
        store.load_or_init("regtest", sample_state()).unwrap();
        assert_eq!(store.state().stealth_utxos.len(), 1);
        assert_eq!(store.state().stealth_utxos[0].txid, legacy_record.txid);
    }
}
