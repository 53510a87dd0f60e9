//! Wallet identity: the concrete key material a pool's owner holds,
//! and the paycode envelope derived from it.
//!
//! `spendPriv` is never an independent secret — it is always recomputed
//! from `scanPriv`/`scanPub` (spec §3). [`WalletKeyMaterial::new`] is the
//! only constructor; there is no setter that lets a caller substitute a
//! different spend key.

use crate::cashaddr::encode_paycode;
use crate::curve;
use crate::error::Result;
use crate::primitives::{Bytes32, Pub33};
use crate::rpa::derive_spend_priv;

/// One wallet's full key material: a base (non-stealth) identity plus
/// the scan/spend pair that drives RPA derivation.
#[derive(Clone)]
pub struct WalletKeyMaterial {
    pub base_priv: Bytes32,
    pub base_pub: Pub33,
    pub scan_priv: Bytes32,
    pub scan_pub: Pub33,
    pub spend_priv: Bytes32,
    pub spend_pub: Pub33,
    pub paycode: String,
    pub birthday_height: u32,
}

impl WalletKeyMaterial {
    /// Derive every public field from `base_priv`/`scan_priv`.
    /// `birthday_height` should be the chain tip at wallet creation when
    /// the caller has no earlier value to carry forward.
    pub fn new(base_priv: Bytes32, scan_priv: Bytes32, birthday_height: u32) -> Result<Self> {
        let base_pub = curve::get_public_key(&base_priv)?;
        let scan_pub = curve::get_public_key(&scan_priv)?;
        let spend_priv = derive_spend_priv(&scan_priv, &scan_pub)?;
        let spend_pub = curve::get_public_key(&spend_priv)?;
        let paycode = encode_paycode(&scan_pub);

        Ok(Self {
            base_priv,
            base_pub,
            scan_priv,
            scan_pub,
            spend_priv,
            spend_pub,
            paycode,
            birthday_height,
        })
    }

    /// Re-derive `spendPriv` from `scanPriv`/`scanPub` and compare
    /// against a value loaded from persisted/legacy wallet config. The
    /// hard invariant from spec §3: a stored spend key that disagrees is
    /// never trusted, only the re-derived one is returned. Callers
    /// should log a warning when `stored` is `Some` and disagrees.
    pub fn reconcile_spend_priv(scan_priv: &Bytes32, scan_pub: &Pub33, stored: Option<Bytes32>) -> Result<(Bytes32, bool)> {
        let derived = derive_spend_priv(scan_priv, scan_pub)?;
        let overridden = matches!(stored, Some(s) if s != derived);
        Ok((derived, overridden))
    }

    /// The hash160 of the base public key — the wallet's non-stealth
    /// receive identity, and the input to [`crate::shard::pool_id`].
    pub fn base_hash160(&self) -> crate::primitives::Bytes20 {
        crate::primitives::hash160(&self.base_pub)
    }
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
    fn paycode_roundtrips_to_scan_pub() {
        let wallet = WalletKeyMaterial::new(priv_from_u64(11), priv_from_u64(22), 800_000).unwrap();
        let decoded = crate::cashaddr::decode_paycode(&wallet.paycode).unwrap();
        assert_eq!(decoded, wallet.scan_pub);
    }

    #[test]
    fn spend_priv_is_derived_not_stored() {
        let wallet = WalletKeyMaterial::new(priv_from_u64(1), priv_from_u64(2), 0).unwrap();
        let expected = derive_spend_priv(&wallet.scan_priv, &wallet.scan_pub).unwrap();
        assert_eq!(wallet.spend_priv, expected);
    }

    #[test]
    fn reconcile_overrides_disagreeing_stored_key() {
        let wallet = WalletKeyMaterial::new(priv_from_u64(1), priv_from_u64(2), 0).unwrap();
        let bogus = priv_from_u64(999);
        let (derived, overridden) =
            WalletKeyMaterial::reconcile_spend_priv(&wallet.scan_priv, &wallet.scan_pub, Some(bogus)).unwrap();
        assert_eq!(derived, wallet.spend_priv);
        assert!(overridden);

        let (derived2, overridden2) =
            WalletKeyMaterial::reconcile_spend_priv(&wallet.scan_priv, &wallet.scan_pub, Some(wallet.spend_priv)).unwrap();
        assert_eq!(derived2, wallet.spend_priv);
        assert!(!overridden2);
    }
}
