//! Chain oracle trait.
//!
//! Implementations:
//! - `ElectrumOracle` — production transport over `electrum-client`.
//! - `MockChainOracle` — in-memory double for tests.

use async_trait::async_trait;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::primitives::{from_hex, to_hex, Bytes32};

/// Oracle-layer errors, wrapped into [`Error::Chain`] at the call site.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response shape from {rpc}: {detail}")]
    UnexpectedShape { rpc: &'static str, detail: String },

    #[error("server error: {0}")]
    Server(String),
}

pub type OracleResult<T> = std::result::Result<T, OracleError>;

/// A single history entry: `(txid, height)`. `height <= 0` means
/// unconfirmed/mempool, matching the Electrum protocol convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub txid_be: Bytes32,
    pub height: i32,
}

/// An unspent output as reported by `blockchain.scripthash.listunspent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentEntry {
    pub txid_be: Bytes32,
    pub vout: u32,
    pub value_sats: u64,
    pub height: i32,
}

/// The tip height/header hash pair returned by subscribe/get_tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub height: u32,
}

/// All chain interactions the engine needs, abstracted away from any
/// particular transport (spec §6). Every method is independently
/// cancellable by the caller — this trait carries no internal retry or
/// timeout logic; callers wrap calls in `tokio::time::timeout` using
/// the deadlines spec.md §5 documents (30s default, 90s history, 180s
/// pool init).
#[async_trait]
pub trait ChainOracle: Send + Sync {
    /// `blockchain.headers.subscribe` / `blockchain.headers.get_tip`.
    async fn get_tip(&self) -> OracleResult<ChainTip>;

    /// `blockchain.scripthash.get_history`.
    async fn get_history(&self, scripthash_hex: &str) -> OracleResult<Vec<HistoryEntry>>;

    /// `blockchain.scripthash.listunspent`.
    async fn list_unspent(&self, scripthash_hex: &str) -> OracleResult<Vec<UnspentEntry>>;

    /// `blockchain.transaction.get(txid, verbose?)`, tolerant of the
    /// several response shapes the protocol allows; returns raw tx
    /// bytes.
    async fn get_transaction(&self, txid_be: &Bytes32) -> OracleResult<Vec<u8>>;

    /// `blockchain.transaction.broadcast`.
    async fn broadcast(&self, raw_tx: &[u8]) -> OracleResult<Bytes32>;

    /// `blockchain.rpa.get_history(prefixHex, startHeight, endHeightExclusive)`.
    /// A BCH-specific RPA index extension with no first-class
    /// `electrum-client` support.
    async fn rpa_get_history(
        &self,
        prefix_hex: &str,
        start_height: u32,
        end_height_exclusive: u32,
    ) -> OracleResult<Vec<Bytes32>>;

    /// `blockchain.rpa.get_mempool(prefixHex)`.
    async fn rpa_get_mempool(&self, prefix_hex: &str) -> OracleResult<Vec<Bytes32>>;

    /// `blockchain.estimatefee`, sats/byte.
    async fn estimate_fee(&self) -> OracleResult<f64>;
}

/// Decode a raw-tx response that may arrive as a hex string, raw
/// bytes, a verbose object carrying a `hex` field, or a wrapper keyed
/// by one of `hex|raw|result|data|tx|transaction` (spec §6, §9 "the
/// tolerant response decoders... become a single front-door
/// function"). Returns the decoded bytes or a typed error.
pub fn decode_tolerant_tx_response(value: &serde_json::Value) -> OracleResult<Vec<u8>> {
    fn from_str_field(s: &str) -> OracleResult<Vec<u8>> {
        from_hex(s).map_err(|e| OracleError::UnexpectedShape {
            rpc: "blockchain.transaction.get",
            detail: format!("invalid hex: {e}"),
        })
    }

    match value {
        serde_json::Value::String(s) => from_str_field(s),
        serde_json::Value::Array(bytes) => {
            let mut out = Vec::with_capacity(bytes.len());
            for b in bytes {
                let n = b.as_u64().ok_or_else(|| OracleError::UnexpectedShape {
                    rpc: "blockchain.transaction.get",
                    detail: "array element is not a byte".to_string(),
                })?;
                out.push(n as u8);
            }
            Ok(out)
        }
        serde_json::Value::Object(obj) => {
            if let Some(err) = obj.get("error") {
                let message = err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown server error");
                return Err(OracleError::Server(message.to_string()));
            }
            for key in ["hex", "raw", "result", "data", "tx", "transaction"] {
                if let Some(inner) = obj.get(key) {
                    return decode_tolerant_tx_response(inner);
                }
            }
            Err(OracleError::UnexpectedShape {
                rpc: "blockchain.transaction.get",
                detail: "object has none of hex|raw|result|data|tx|transaction".to_string(),
            })
        }
        other => Err(OracleError::UnexpectedShape {
            rpc: "blockchain.transaction.get",
            detail: format!("unsupported JSON shape: {other}"),
        }),
    }
}

/// Lift an [`OracleError`] into the crate-root [`Error`], tagging it
/// with the RPC method name that produced it.
pub fn chain_error(rpc: &'static str, err: OracleError) -> Error {
    Error::chain(rpc, err.to_string())
}

/// Electrum-protocol scripthash: `reverse(SHA256(scriptPubKey))`, hex
/// encoded. Used to key every `blockchain.scripthash.*` call the
/// funding selector and orchestrators make.
pub fn script_hash_hex(script_pubkey: &[u8]) -> String {
    let hash = crate::primitives::sha256(script_pubkey);
    to_hex(&crate::primitives::reversed(&hash))
}

/// Production transport over `electrum-client`, talking to an Electrum
/// or Fulcrum server. The RPA extension methods have no first-class
/// client support, so they go out through the client's raw JSON-RPC
/// call escape hatch.
pub struct ElectrumOracle {
    client: electrum_client::Client,
}

impl ElectrumOracle {
    pub fn connect(url: &str) -> Result<Self> {
        let client = electrum_client::Client::new(url)
            .map_err(|e| chain_error("connect", OracleError::Transport(e.to_string())))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChainOracle for ElectrumOracle {
    async fn get_tip(&self) -> OracleResult<ChainTip> {
        let header = self
            .client
            .block_headers_subscribe()
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        Ok(ChainTip {
            height: header.height as u32,
        })
    }

    async fn get_history(&self, scripthash_hex: &str) -> OracleResult<Vec<HistoryEntry>> {
        let params = vec![serde_json::Value::String(scripthash_hex.to_string())];
        let response: serde_json::Value = self
            .client
            .raw_call("blockchain.scripthash.get_history", params)
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        parse_history_array(&response, "blockchain.scripthash.get_history")
    }

    async fn list_unspent(&self, scripthash_hex: &str) -> OracleResult<Vec<UnspentEntry>> {
        let params = vec![serde_json::Value::String(scripthash_hex.to_string())];
        let response: serde_json::Value = self
            .client
            .raw_call("blockchain.scripthash.listunspent", params)
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        parse_unspent_array(&response, "blockchain.scripthash.listunspent")
    }

    async fn get_transaction(&self, txid_be: &Bytes32) -> OracleResult<Vec<u8>> {
        let mut wire = *txid_be;
        wire.reverse();
        let txid = electrum_client::bitcoin::Txid::from_slice(&wire)
            .map_err(|e| OracleError::UnexpectedShape {
                rpc: "blockchain.transaction.get",
                detail: e.to_string(),
            })?;
        let raw = self
            .client
            .transaction_get_raw(&txid)
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        Ok(raw)
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> OracleResult<Bytes32> {
        let txid = self
            .client
            .transaction_broadcast_raw(raw_tx)
            .map_err(|e| OracleError::Server(e.to_string()))?;
        let mut txid_be: Bytes32 = *txid.as_ref();
        txid_be.reverse();
        Ok(txid_be)
    }

    async fn rpa_get_history(
        &self,
        prefix_hex: &str,
        start_height: u32,
        end_height_exclusive: u32,
    ) -> OracleResult<Vec<Bytes32>> {
        let params = vec![
            serde_json::Value::String(prefix_hex.to_string()),
            serde_json::Value::from(start_height),
            serde_json::Value::from(end_height_exclusive),
        ];
        let response: serde_json::Value = self
            .client
            .raw_call("blockchain.rpa.get_history", params)
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        parse_txid_array(&response, "blockchain.rpa.get_history")
    }

    async fn rpa_get_mempool(&self, prefix_hex: &str) -> OracleResult<Vec<Bytes32>> {
        let params = vec![serde_json::Value::String(prefix_hex.to_string())];
        let response: serde_json::Value = self
            .client
            .raw_call("blockchain.rpa.get_mempool", params)
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        parse_txid_array(&response, "blockchain.rpa.get_mempool")
    }

    async fn estimate_fee(&self) -> OracleResult<f64> {
        self.client
            .estimate_fee(6)
            .map_err(|e| OracleError::Transport(e.to_string()))
    }
}

fn parse_txid_array(value: &serde_json::Value, rpc: &'static str) -> OracleResult<Vec<Bytes32>> {
    let arr = value.as_array().ok_or_else(|| OracleError::UnexpectedShape {
        rpc,
        detail: "expected a JSON array of txids".to_string(),
    })?;
    arr.iter()
        .map(|v| {
            let s = v.as_str().ok_or_else(|| OracleError::UnexpectedShape {
                rpc,
                detail: "array element is not a string".to_string(),
            })?;
            from_hex(s)
                .ok()
                .and_then(|b| <[u8; 32]>::try_from(b).ok())
                .ok_or_else(|| OracleError::UnexpectedShape {
                    rpc,
                    detail: format!("invalid txid hex: {s}"),
                })
        })
        .collect()
}

fn txid_field(obj: &serde_json::Map<String, serde_json::Value>, rpc: &'static str) -> OracleResult<Bytes32> {
    let s = obj
        .get("tx_hash")
        .and_then(|v| v.as_str())
        .ok_or_else(|| OracleError::UnexpectedShape {
            rpc,
            detail: "entry missing string field tx_hash".to_string(),
        })?;
    from_hex(s)
        .ok()
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
        .ok_or_else(|| OracleError::UnexpectedShape {
            rpc,
            detail: format!("invalid tx_hash hex: {s}"),
        })
}

fn height_field(obj: &serde_json::Map<String, serde_json::Value>, rpc: &'static str) -> OracleResult<i32> {
    obj.get("height")
        .and_then(|v| v.as_i64())
        .map(|h| h as i32)
        .ok_or_else(|| OracleError::UnexpectedShape {
            rpc,
            detail: "entry missing integer field height".to_string(),
        })
}

fn parse_history_array(value: &serde_json::Value, rpc: &'static str) -> OracleResult<Vec<HistoryEntry>> {
    let arr = value.as_array().ok_or_else(|| OracleError::UnexpectedShape {
        rpc,
        detail: "expected a JSON array of history entries".to_string(),
    })?;
    arr.iter()
        .map(|v| {
            let obj = v.as_object().ok_or_else(|| OracleError::UnexpectedShape {
                rpc,
                detail: "history entry is not an object".to_string(),
            })?;
            Ok(HistoryEntry {
                txid_be: txid_field(obj, rpc)?,
                height: height_field(obj, rpc)?,
            })
        })
        .collect()
}

fn parse_unspent_array(value: &serde_json::Value, rpc: &'static str) -> OracleResult<Vec<UnspentEntry>> {
    let arr = value.as_array().ok_or_else(|| OracleError::UnexpectedShape {
        rpc,
        detail: "expected a JSON array of unspent entries".to_string(),
    })?;
    arr.iter()
        .map(|v| {
            let obj = v.as_object().ok_or_else(|| OracleError::UnexpectedShape {
                rpc,
                detail: "unspent entry is not an object".to_string(),
            })?;
            let vout = obj
                .get("tx_pos")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| OracleError::UnexpectedShape {
                    rpc,
                    detail: "entry missing integer field tx_pos".to_string(),
                })? as u32;
            let value_sats = obj
                .get("value")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| OracleError::UnexpectedShape {
                    rpc,
                    detail: "entry missing integer field value".to_string(),
                })?;
            Ok(UnspentEntry {
                txid_be: txid_field(obj, rpc)?,
                vout,
                value_sats,
                height: height_field(obj, rpc)?,
            })
        })
        .collect()
}

/// In-memory double for tests. Transactions, unspent sets, and history
/// are all populated directly by the test harness; `broadcast` appends
/// the transaction to an in-memory ledger so subsequent `get_transaction`
/// calls on the same oracle resolve.
pub struct MockChainOracle {
    inner: std::sync::Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    tip_height: u32,
    transactions: std::collections::HashMap<Bytes32, Vec<u8>>,
    history: std::collections::HashMap<String, Vec<HistoryEntry>>,
    unspent: std::collections::HashMap<String, Vec<UnspentEntry>>,
    rpa_history: std::collections::HashMap<String, Vec<Bytes32>>,
    rpa_mempool: std::collections::HashMap<String, Vec<Bytes32>>,
    broadcasts: Vec<Bytes32>,
    fee_sats_per_byte: f64,
}

impl MockChainOracle {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(MockState {
                fee_sats_per_byte: 1.0,
                ..Default::default()
            }),
        }
    }

    pub fn set_tip_height(&self, height: u32) {
        self.inner.lock().unwrap().tip_height = height;
    }

    pub fn insert_transaction(&self, tx: &crate::txbuilder::RawTx) {
        let txid = tx.txid();
        self.inner.lock().unwrap().transactions.insert(txid, tx.serialize());
    }

    pub fn set_unspent(&self, scripthash_hex: &str, entries: Vec<UnspentEntry>) {
        self.inner.lock().unwrap().unspent.insert(scripthash_hex.to_string(), entries);
    }

    pub fn set_history(&self, scripthash_hex: &str, entries: Vec<HistoryEntry>) {
        self.inner.lock().unwrap().history.insert(scripthash_hex.to_string(), entries);
    }

    pub fn set_rpa_history(&self, prefix_hex: &str, txids: Vec<Bytes32>) {
        self.inner.lock().unwrap().rpa_history.insert(prefix_hex.to_string(), txids);
    }

    pub fn set_rpa_mempool(&self, prefix_hex: &str, txids: Vec<Bytes32>) {
        self.inner.lock().unwrap().rpa_mempool.insert(prefix_hex.to_string(), txids);
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.inner.lock().unwrap().broadcasts.iter().map(|t| to_hex(t)).collect()
    }
}

impl Default for MockChainOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainOracle for MockChainOracle {
    async fn get_tip(&self) -> OracleResult<ChainTip> {
        Ok(ChainTip {
            height: self.inner.lock().unwrap().tip_height,
        })
    }

    async fn get_history(&self, scripthash_hex: &str) -> OracleResult<Vec<HistoryEntry>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .history
            .get(scripthash_hex)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_unspent(&self, scripthash_hex: &str) -> OracleResult<Vec<UnspentEntry>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .unspent
            .get(scripthash_hex)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_transaction(&self, txid_be: &Bytes32) -> OracleResult<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .transactions
            .get(txid_be)
            .cloned()
            .ok_or_else(|| OracleError::Server(format!("unknown txid {}", to_hex(txid_be))))
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> OracleResult<Bytes32> {
        let tx = crate::txbuilder::RawTx::deserialize(raw_tx)
            .map_err(|e| OracleError::UnexpectedShape {
                rpc: "blockchain.transaction.broadcast",
                detail: e.to_string(),
            })?;
        let txid = tx.txid();
        let mut state = self.inner.lock().unwrap();
        state.transactions.insert(txid, raw_tx.to_vec());
        state.broadcasts.push(txid);
        Ok(txid)
    }

    async fn rpa_get_history(
        &self,
        prefix_hex: &str,
        _start_height: u32,
        _end_height_exclusive: u32,
    ) -> OracleResult<Vec<Bytes32>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .rpa_history
            .get(prefix_hex)
            .cloned()
            .unwrap_or_default())
    }

    async fn rpa_get_mempool(&self, prefix_hex: &str) -> OracleResult<Vec<Bytes32>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .rpa_mempool
            .get(prefix_hex)
            .cloned()
            .unwrap_or_default())
    }

    async fn estimate_fee(&self) -> OracleResult<f64> {
        Ok(self.inner.lock().unwrap().fee_sats_per_byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_tolerant_accepts_plain_hex_string() {
        let v = serde_json::Value::String("deadbeef".to_string());
        let bytes = decode_tolerant_tx_response(&v).unwrap();
        assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn decode_tolerant_unwraps_verbose_object() {
        let v = serde_json::json!({ "hex": "cafe", "confirmations": 3 });
        let bytes = decode_tolerant_tx_response(&v).unwrap();
        assert_eq!(bytes, vec![0xca, 0xfe]);
    }

    #[test]
    fn decode_tolerant_surfaces_server_error() {
        let v = serde_json::json!({ "error": { "message": "no such transaction" } });
        let err = decode_tolerant_tx_response(&v).unwrap_err();
        assert!(matches!(err, OracleError::Server(_)));
    }

    #[tokio::test]
    async fn mock_oracle_roundtrips_broadcast_and_fetch() {
        let oracle = MockChainOracle::new();
        let tx = crate::txbuilder::RawTx {
            version: 2,
            inputs: vec![],
            outputs: vec![crate::txbuilder::TxOutput {
                value_sats: 1000,
                script_pubkey: crate::script::p2pkh_script(&[0x01; 20]),
            }],
            locktime: 0,
        };
        let raw = tx.serialize();
        let txid = oracle.broadcast(&raw).await.unwrap();
        let fetched = oracle.get_transaction(&txid).await.unwrap();
        assert_eq!(fetched, raw);
        assert_eq!(oracle.broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn mock_oracle_rpa_history_and_mempool() {
        let oracle = MockChainOracle::new();
        oracle.set_rpa_history("ab", vec![[0x01; 32]]);
        oracle.set_rpa_mempool("ab", vec![[0x02; 32]]);
        let hist = oracle.rpa_get_history("ab", 0, 100).await.unwrap();
        let mempool = oracle.rpa_get_mempool("ab").await.unwrap();
        assert_eq!(hist, vec![[0x01; 32]]);
        assert_eq!(mempool, vec![[0x02; 32]]);
    }
}
