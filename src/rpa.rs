//! Reusable Payment Address (RPA) derivation.
//!
//! Binds a one-time output to `(sender key, receiver paycode, spent
//! outpoint, derivation index)`. Sender and receiver independently
//! compute the same shared secret from their respective halves of an
//! ECDH exchange, then use it as the chain code for a BIP32-style
//! non-hardened child derivation rooted at the wallet's spend key.

use num_bigint::BigUint;

use crate::curve;
use crate::error::Result;
use crate::primitives::{sha256, Bytes32, Pub33};

/// `spendPriv = scanPriv + H("bch-stealth:rpa:spend:" || scanPub) mod n`.
/// A hard invariant of this scheme: there is exactly one valid spend key
/// per scan key, since the paycode carries only the scan public key.
pub fn derive_spend_priv(scan_priv: &Bytes32, scan_pub: &Pub33) -> Result<Bytes32> {
    let tweak_input = crate::primitives::concat(&[b"bch-stealth:rpa:spend:", scan_pub.as_slice()]);
    let tweak = sha256(&tweak_input);
    curve::add_scalar_mod_n(scan_priv, &tweak)
}

/// Public-key counterpart of [`derive_spend_priv`]: lets a sender
/// derive a receiver's `spendPub` from the `scanPub` carried in their
/// paycode, without ever needing `scanPriv`.
pub fn derive_spend_pub(scan_pub: &Pub33) -> Result<Pub33> {
    let tweak_input = crate::primitives::concat(&[b"bch-stealth:rpa:spend:", scan_pub.as_slice()]);
    let tweak = sha256(&tweak_input);
    curve::add_scalar_times_generator(scan_pub, &tweak)
}

fn outpoint_string(prevout_txid_hex: &str, prevout_n: u32) -> String {
    format!("{prevout_txid_hex}{prevout_n}")
}

/// Shared secret from `(priv32, pub33, outpoint)`. Symmetric: the
/// sender computing `(senderPriv, scanPub, outpoint)` and the receiver
/// computing `(scanPriv, senderPub, outpoint)` land on the same value.
pub fn shared_secret(priv32: &Bytes32, pub33: &Pub33, prevout_txid_hex: &str, prevout_n: u32) -> Result<Bytes32> {
    let x = curve::ecdh_product_x(priv32, pub33)?;

    let mut x_bytes_33 = [0u8; 33];
    x_bytes_33[1..].copy_from_slice(&x);
    let a = BigUint::from_bytes_be(&sha256(&x_bytes_33));

    let outpoint = outpoint_string(prevout_txid_hex, prevout_n);
    let b = BigUint::from_bytes_be(&sha256(outpoint.as_bytes()));

    let sum = a + b;
    Ok(sha256(&sum.to_bytes_be()))
}

/// Minimal data required to re-derive a one-time key, stored alongside
/// every discovered stealth UTXO.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RpaContext {
    #[serde(rename = "senderPub33")]
    pub sender_pub33: String,
    #[serde(rename = "prevoutTxidHex")]
    pub prevout_txid_hex: String,
    #[serde(rename = "prevoutN")]
    pub prevout_n: u32,
    pub index: u32,
}

/// Sender side: `childPub = CKDpub(spendPub, sharedSecret(senderPriv,
/// scanPub), index)`.
pub fn derive_sender_one_time_pub(
    sender_priv: &Bytes32,
    scan_pub: &Pub33,
    spend_pub: &Pub33,
    prevout_txid_hex: &str,
    prevout_n: u32,
    index: u32,
) -> Result<Pub33> {
    let secret = shared_secret(sender_priv, scan_pub, prevout_txid_hex, prevout_n)?;
    curve::ckd_pub(spend_pub, &secret, index)
}

/// Receiver side: `oneTimePriv = CKDpriv(spendPriv, sharedSecret(scanPriv,
/// senderPub), index)`.
pub fn derive_receiver_one_time_priv(
    scan_priv: &Bytes32,
    spend_priv: &Bytes32,
    sender_pub: &Pub33,
    prevout_txid_hex: &str,
    prevout_n: u32,
    index: u32,
) -> Result<Bytes32> {
    let secret = shared_secret(scan_priv, sender_pub, prevout_txid_hex, prevout_n)?;
    curve::ckd_priv(spend_priv, &secret, index)
}

/// Per-payment session keys derived from the shared secret and the
/// spent outpoint: an amount-encryption key, a memo key, and a
/// zero-knowledge seed (all currently used only by legacy helpers, per
/// the design notes — not on the hot signing/scan path).
pub struct SessionKeys {
    pub amount_key: [u8; 16],
    pub memo_key: [u8; 16],
    pub zk_seed: Bytes32,
}

pub fn derive_session_keys(shared_secret: &Bytes32, txid_hex: &str, vout: u32) -> SessionKeys {
    let base_input = crate::primitives::concat(&[shared_secret, format!("{txid_hex}:{vout}").as_bytes()]);
    let base = sha256(&base_input);

    let amount_hash = sha256(&crate::primitives::concat(&[&base, b"amount"]));
    let memo_hash = sha256(&crate::primitives::concat(&[&base, b"memo"]));
    let zk_seed = sha256(&crate::primitives::concat(&[&base, b"zk-seed"]));

    let mut amount_key = [0u8; 16];
    amount_key.copy_from_slice(&amount_hash[0..16]);
    let mut memo_key = [0u8; 16];
    memo_key.copy_from_slice(&memo_hash[0..16]);

    SessionKeys {
        amount_key,
        memo_key,
        zk_seed,
    }
}

/// Default per-wallet grind prefix (8-bit).
pub fn prefix8(scan_pub: &Pub33) -> [u8; 1] {
    let input = crate::primitives::concat(&[b"bch-stealth:rpa:grind:", scan_pub.as_slice()]);
    let h = sha256(&input);
    [h[0]]
}

/// 16-bit grind prefix, preferred when the server supports it.
pub fn prefix16(scan_pub: &Pub33) -> [u8; 2] {
    let input = crate::primitives::concat(&[b"bch-stealth:rpa:grind:", scan_pub.as_slice()]);
    let h = sha256(&input);
    [h[0], h[1]]
}

/// Truncate an arbitrary-length prefix to at most 2 bytes, per the
/// server's accepted prefix length (§6: 2-4 hex chars / 1-2 bytes).
pub fn truncate_prefix(prefix: &[u8]) -> Vec<u8> {
    prefix.iter().take(2).copied().collect()
}

/// Default grind bound used by `send` when grinding for a matching
/// child hash160.
pub const DEFAULT_GRIND_MAX: u32 = 256;

/// Result of sender grinding: the chosen index, the derived child
/// pub/hash160, and whether a prefix match was actually found (index 0
/// is always returned as a fallback when no match is found within
/// `grind_max`).
pub struct GrindResult {
    pub index: u32,
    pub child_pub: Pub33,
    pub child_hash160: crate::primitives::Bytes20,
    pub matched: bool,
}

/// Enumerate `index = 0..grind_max`, accepting the first whose
/// `childHash160` starts with `expected_prefix`. Falls back to `index =
/// 0` (always attempted regardless of grinding) if nothing matches.
pub fn grind_for_prefix(
    sender_priv: &Bytes32,
    scan_pub: &Pub33,
    spend_pub: &Pub33,
    prevout_txid_hex: &str,
    prevout_n: u32,
    expected_prefix: &[u8],
    grind_max: u32,
) -> Result<GrindResult> {
    let mut fallback: Option<(Pub33, crate::primitives::Bytes20)> = None;
    for index in 0..grind_max.max(1) {
        let child_pub =
            derive_sender_one_time_pub(sender_priv, scan_pub, spend_pub, prevout_txid_hex, prevout_n, index)?;
        let child_hash160 = crate::primitives::hash160(&child_pub);

        if index == 0 {
            fallback = Some((child_pub, child_hash160));
        }
        if child_hash160.starts_with(expected_prefix) {
            return Ok(GrindResult {
                index,
                child_pub,
                child_hash160,
                matched: true,
            });
        }
    }

    let (child_pub, child_hash160) = fallback.expect("grind_max is always >= 1");
    Ok(GrindResult {
        index: 0,
        child_pub,
        child_hash160,
        matched: false,
    })
}
