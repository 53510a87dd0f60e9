//! BCH stealth-pool wallet and covenant engine.
//!
//! Combines Reusable Payment Address (RPA) stealth addressing with a
//! hash-fold covenant ("the pool") that shards funds across a fixed
//! number of CashTokens-tagged on-chain UTXOs. A wallet deposits into
//! the pool via an RPA one-time address, imports that deposit into a
//! shard (folding it into the shard's hash-chain commitment), and later
//! withdraws from a shard to any BCH or stealth destination.
//!
//! ## Module map
//!
//! - [`primitives`] — hex, varints, push-data, hash160/sha256.
//! - [`curve`] — secp256k1 arithmetic and BCH Schnorr signing.
//! - [`cashaddr`] — CashAddr and paycode encoding.
//! - [`rpa`] — stealth address derivation and destination grinding.
//! - [`script`] — P2PKH/P2SH scripts and the CashTokens prefix codec.
//! - [`txbuilder`] — raw transaction (de)serialization and sighash.
//! - [`shard`] — the hash-fold covenant state machine.
//! - [`funding`] — UTXO candidate selection and rejection reporting.
//! - [`scan`] — RPA history scanning against a [`oracle::ChainOracle`].
//! - [`oracle`] — the chain-data abstraction plus Electrum and mock
//!   implementations.
//! - [`store`] — the on-disk wallet state envelope.
//! - [`wallet`] — wallet key material.
//! - [`config`] — environment-driven runtime configuration.
//! - [`error`] — the crate-wide error taxonomy.
//! - [`logging`] — structured logging helpers.
//! - [`orchestrator`] — the send/deposit/import/withdraw/scan workflows
//!   that tie every other module together.

pub mod cashaddr;
pub mod config;
pub mod curve;
pub mod error;
pub mod funding;
pub mod logging;
pub mod oracle;
pub mod orchestrator;
pub mod primitives;
pub mod rpa;
pub mod scan;
pub mod script;
pub mod shard;
pub mod store;
pub mod txbuilder;
pub mod wallet;

pub use config::{Config, FundingPreference, Network};
pub use error::{Error, Result};
pub use oracle::{ChainOracle, ElectrumOracle, MockChainOracle};
pub use orchestrator::{
    ChangeMode, DepositOptions, ImportResult, InitResult, PoolOrchestrator, SendOptions,
    SendResult, WithdrawResult,
};
pub use shard::CategoryMode;
pub use store::{DepositKind, FileStoreIo, StoreIo, WalletStore};
pub use wallet::WalletKeyMaterial;
