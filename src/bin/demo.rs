//! bch-stealth-pool demo
//!
//! Demonstrates one full pool lifecycle — init, deposit, import,
//! withdraw, scan — against an in-memory [`MockChainOracle`] rather
//! than a live Electrum server, so the demo runs without any network
//! access.
//!
//! Run modes:
//!   cargo run --bin poolctl-demo           - Run the lifecycle demo

use std::sync::Arc;

use bch_stealth_pool::config::Config;
use bch_stealth_pool::oracle::{script_hash_hex, MockChainOracle, UnspentEntry};
use bch_stealth_pool::orchestrator::{DepositOptions, PoolOrchestrator, SendOptions};
use bch_stealth_pool::script::p2pkh_script;
use bch_stealth_pool::store::{StoreIo, WalletStore};
use bch_stealth_pool::txbuilder::{RawTx, TxOutput};
use bch_stealth_pool::wallet::WalletKeyMaterial;

/// In-memory [`StoreIo`] so the demo leaves nothing on disk.
struct MemIo {
    bytes: std::cell::RefCell<Option<Vec<u8>>>,
}

impl MemIo {
    fn empty() -> Self {
        Self { bytes: std::cell::RefCell::new(None) }
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

fn priv_from_u64(n: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..32].copy_from_slice(&n.to_be_bytes());
    out
}

/// Seed the mock oracle with one confirmed base UTXO, as if the wallet
/// had externally received a coinbase/faucet payment.
fn fund_base(oracle: &MockChainOracle, wallet: &WalletKeyMaterial, value_sats: u64, txid_tag: u8) -> [u8; 32] {
    let script = p2pkh_script(&wallet.base_hash160());
    let scripthash = script_hash_hex(&script);
    let txid = [txid_tag; 32];
    oracle.set_unspent(
        &scripthash,
        vec![UnspentEntry { txid_be: txid, vout: 0, value_sats, height: 100 }],
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

#[tokio::main]
async fn main() {
    let config = Config::for_tests();
    config.print_summary();

    let wallet = WalletKeyMaterial::new(priv_from_u64(1001), priv_from_u64(2002), 0)
        .expect("wallet key derivation");
    println!("\nwallet paycode: {}", wallet.paycode);

    let oracle = Arc::new(MockChainOracle::new());
    oracle.set_tip_height(100);
    fund_base(&oracle, &wallet, 50_000, 0xa0);

    let store = WalletStore::new(MemIo::empty(), wallet.paycode.clone());
    let mut orch = PoolOrchestrator::new(config, wallet.clone(), oracle.clone(), store);

    println!("\n=== init_pool: seeding 2 shards of 2,000 sats each ===");
    let init = orch.init_pool(2, 2_000, 1_800).await.expect("init_pool");
    println!("pool tx: {}", hex::encode(init.txid_be));
    println!("shards seeded: {}", orch.store.state().shards.len());

    fund_base(&oracle, &wallet, 9_000, 0xa1);
    println!("\n=== deposit: 5,000 sats into the pool via a stealth receive address ===");
    let deposit = orch
        .deposit(5_000, &DepositOptions::default())
        .await
        .expect("deposit");
    println!("deposit tx: {}", hex::encode(deposit.txid_be));

    println!("\n=== import: folding the deposit into shard 0 ===");
    let import = orch.import(None, Some(0)).await.expect("import");
    println!("import tx: {}", hex::encode(import.txid_be));
    println!("new shard commitment: {}", hex::encode(import.new_commitment));
    println!("category mode used: {:?}", import.category_mode_used);

    fund_base(&oracle, &wallet, 5_000, 0xa2);
    println!("\n=== withdraw: 1,000 sats from shard 0 back to our own paycode ===");
    let withdraw = orch
        .withdraw(&wallet.paycode, 0, 1_000, 600)
        .await
        .expect("withdraw");
    println!("withdraw tx: {}", hex::encode(withdraw.txid_be));
    println!("shard remainder: {} sats", withdraw.shard_remainder_sats);

    println!("\n=== send: 500 sats to our own paycode (exercises stealth grinding) ===");
    fund_base(&oracle, &wallet, 5_000, 0xa3);
    let send = orch
        .send(&wallet.paycode, 500, &SendOptions { dry_run: false, grind_max: None })
        .await
        .expect("send");
    println!("send tx: {}", hex::encode(send.txid_be));
    println!("change: {:?}", send.change);

    println!("\n=== scan: rediscovering our own stealth receives from height 0 ===");
    let matches = orch.scan(0, 101, true).await.expect("scan");
    println!("matches found: {}", matches.len());

    println!("\n=== demo complete ===");
}
