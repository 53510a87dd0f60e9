//! Funding UTXO selection.
//!
//! Chooses a single input to fund an operation from either the base
//! P2PKH address or the stealth-UTXO set, in a caller-specified
//! preference order, verifying each candidate against the chain before
//! it is eligible. Purpose filtering (spec §4.8: "skips records with
//! purpose disallowed by caller") is expected to happen in the caller
//! before candidates reach this module — this keeps the rejection-code
//! set here limited to the ones actually enumerated in the external
//! contract.

use crate::curve;
use crate::error::{Error, Result};
use crate::primitives::{hash160, Bytes20, Bytes32, Pub33};
use crate::rpa::{derive_receiver_one_time_priv, RpaContext};

/// Rejection reasons, matching the external contract's closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    Spent,
    TokenUtxoExcluded,
    Unconfirmed,
    BelowMinSats,
    PrevoutMismatch,
    DerivationMismatch,
    RequireVout0,
    NonP2pkh,
    MissingRpaContext(&'static str),
}

impl RejectionReason {
    pub fn code(&self) -> String {
        match self {
            RejectionReason::Spent => "spent".to_string(),
            RejectionReason::TokenUtxoExcluded => "token-utxo-excluded".to_string(),
            RejectionReason::Unconfirmed => "unconfirmed".to_string(),
            RejectionReason::BelowMinSats => "below-min-sats".to_string(),
            RejectionReason::PrevoutMismatch => "prevout-mismatch".to_string(),
            RejectionReason::DerivationMismatch => "derivation-mismatch".to_string(),
            RejectionReason::RequireVout0 => "require-vout0".to_string(),
            RejectionReason::NonP2pkh => "non-p2pkh".to_string(),
            RejectionReason::MissingRpaContext(field) => format!("missing-rpaContext.{field}"),
        }
    }
}

/// A rejected candidate, carried in [`Error::InsufficientFunds`].
#[derive(Debug, Clone)]
pub struct RejectedCandidate {
    pub txid_be: Bytes32,
    pub vout: u32,
    pub reason: RejectionReason,
}

/// Which pool of UTXOs a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingKind {
    Base,
    Stealth,
}

/// A base (non-stealth) P2PKH UTXO candidate, already fetched from the
/// chain oracle.
#[derive(Debug, Clone)]
pub struct BaseUtxoCandidate {
    pub txid_be: Bytes32,
    pub vout: u32,
    pub value_sats: u64,
    pub confirmations: u32,
    pub is_token: bool,
    pub is_p2pkh: bool,
    pub exists_onchain: bool,
    pub owner_pub: Pub33,
}

/// A stealth-UTXO candidate sourced from the store, already fetched
/// from the chain oracle for its current on-chain status.
#[derive(Debug, Clone)]
pub struct StealthUtxoCandidate {
    pub txid_be: Bytes32,
    pub vout: u32,
    pub value_sats: u64,
    pub confirmations: u32,
    pub is_token: bool,
    pub exists_onchain: bool,
    pub spent: bool,
    pub stored_hash160: Bytes20,
    pub rpa_context: RpaContext,
}

/// Scan/spend priv pair needed to re-derive a stealth candidate's
/// one-time private key during verification.
pub struct StealthKeys {
    pub scan_priv: Bytes32,
    pub spend_priv: Bytes32,
}

/// Selection parameters.
#[derive(Debug, Clone)]
pub struct FundingRequest {
    pub min_sats: u64,
    pub min_confirmations: u32,
    pub include_unconfirmed: bool,
    pub require_vout0: bool,
    pub allow_tokens: bool,
    pub preference: [FundingKind; 2],
}

impl FundingRequest {
    /// Preference order driven by [`crate::config::FundingPreference`].
    pub fn from_preference(pref: crate::config::FundingPreference) -> [FundingKind; 2] {
        match pref {
            crate::config::FundingPreference::BaseFirst => [FundingKind::Base, FundingKind::Stealth],
            crate::config::FundingPreference::StealthFirst => [FundingKind::Stealth, FundingKind::Base],
        }
    }
}

/// A selected funding input, ready to spend.
pub struct SelectedFunding {
    pub kind: FundingKind,
    pub txid_be: Bytes32,
    pub vout: u32,
    pub value_sats: u64,
    pub owner_priv: Bytes32,
    pub owner_pub: Pub33,
}

fn check_common(
    txid_be: Bytes32,
    vout: u32,
    value_sats: u64,
    confirmations: u32,
    is_token: bool,
    exists_onchain: bool,
    req: &FundingRequest,
) -> std::result::Result<(), RejectedCandidate> {
    let reject = |reason: RejectionReason| RejectedCandidate { txid_be, vout, reason };

    if !exists_onchain {
        return Err(reject(RejectionReason::PrevoutMismatch));
    }
    if is_token && !req.allow_tokens {
        return Err(reject(RejectionReason::TokenUtxoExcluded));
    }
    if confirmations == 0 && !req.include_unconfirmed {
        return Err(reject(RejectionReason::Unconfirmed));
    }
    if value_sats < req.min_sats {
        return Err(reject(RejectionReason::BelowMinSats));
    }
    if confirmations < req.min_confirmations && confirmations > 0 {
        return Err(reject(RejectionReason::Unconfirmed));
    }
    Ok(())
}

fn select_base(
    candidates: &[BaseUtxoCandidate],
    req: &FundingRequest,
    rejected: &mut Vec<RejectedCandidate>,
) -> Option<SelectedFunding> {
    let mut best: Option<&BaseUtxoCandidate> = None;

    for c in candidates {
        let outcome = check_common(
            c.txid_be,
            c.vout,
            c.value_sats,
            c.confirmations,
            c.is_token,
            c.exists_onchain,
            req,
        )
        .and_then(|_| {
            if !c.is_p2pkh {
                Err(RejectedCandidate {
                    txid_be: c.txid_be,
                    vout: c.vout,
                    reason: RejectionReason::NonP2pkh,
                })
            } else if req.require_vout0 && c.vout != 0 {
                Err(RejectedCandidate {
                    txid_be: c.txid_be,
                    vout: c.vout,
                    reason: RejectionReason::RequireVout0,
                })
            } else {
                Ok(())
            }
        });

        match outcome {
            Err(r) => rejected.push(r),
            Ok(()) => {
                if best.map(|b| c.value_sats > b.value_sats).unwrap_or(true) {
                    best = Some(c);
                }
            }
        }
    }

    best.map(|c| SelectedFunding {
        kind: FundingKind::Base,
        txid_be: c.txid_be,
        vout: c.vout,
        value_sats: c.value_sats,
        // The caller substitutes the real base priv; see select().
        owner_priv: [0u8; 32],
        owner_pub: c.owner_pub,
    })
}

fn verify_stealth_candidate(
    candidate: &StealthUtxoCandidate,
    keys: &StealthKeys,
) -> std::result::Result<(Bytes32, Pub33), RejectedCandidate> {
    let reject = |reason: RejectionReason| RejectedCandidate {
        txid_be: candidate.txid_be,
        vout: candidate.vout,
        reason,
    };

    if candidate.rpa_context.sender_pub33.is_empty() {
        return Err(reject(RejectionReason::MissingRpaContext("senderPub33")));
    }
    if candidate.rpa_context.prevout_txid_hex.is_empty() {
        return Err(reject(RejectionReason::MissingRpaContext("prevoutTxidHex")));
    }

    let sender_pub: Pub33 = crate::primitives::from_hex_fixed(&candidate.rpa_context.sender_pub33)
        .map_err(|_| reject(RejectionReason::MissingRpaContext("senderPub33")))?;

    let one_time_priv = derive_receiver_one_time_priv(
        &keys.scan_priv,
        &keys.spend_priv,
        &sender_pub,
        &candidate.rpa_context.prevout_txid_hex,
        candidate.rpa_context.prevout_n,
        candidate.rpa_context.index,
    )
    .map_err(|_| reject(RejectionReason::DerivationMismatch))?;

    let one_time_pub = curve::get_public_key(&one_time_priv).map_err(|_| reject(RejectionReason::DerivationMismatch))?;
    let derived_hash160 = hash160(&one_time_pub);

    if derived_hash160 != candidate.stored_hash160 {
        return Err(reject(RejectionReason::DerivationMismatch));
    }

    Ok((one_time_priv, one_time_pub))
}

fn select_stealth(
    candidates: &[StealthUtxoCandidate],
    req: &FundingRequest,
    keys: &StealthKeys,
    rejected: &mut Vec<RejectedCandidate>,
) -> Option<SelectedFunding> {
    let mut best: Option<(u64, Bytes32, u32, Bytes32, Pub33)> = None;

    for c in candidates {
        if c.spent {
            rejected.push(RejectedCandidate {
                txid_be: c.txid_be,
                vout: c.vout,
                reason: RejectionReason::Spent,
            });
            continue;
        }

        if let Err(r) = check_common(
            c.txid_be,
            c.vout,
            c.value_sats,
            c.confirmations,
            c.is_token,
            c.exists_onchain,
            req,
        ) {
            rejected.push(r);
            continue;
        }

        match verify_stealth_candidate(c, keys) {
            Err(r) => rejected.push(r),
            Ok((priv_key, pub_key)) => {
                if best.map(|(v, ..)| c.value_sats > v).unwrap_or(true) {
                    best = Some((c.value_sats, c.txid_be, c.vout, priv_key, pub_key));
                }
            }
        }
    }

    best.map(|(value_sats, txid_be, vout, owner_priv, owner_pub)| SelectedFunding {
        kind: FundingKind::Stealth,
        txid_be,
        vout,
        value_sats,
        owner_priv,
        owner_pub,
    })
}

/// Run the preference-ordered selection. `base_priv` is substituted
/// into the winning base candidate (base candidates don't carry a
/// private key of their own, unlike stealth candidates which derive
/// theirs during verification).
pub fn select(
    base_candidates: &[BaseUtxoCandidate],
    stealth_candidates: &[StealthUtxoCandidate],
    req: &FundingRequest,
    base_priv: &Bytes32,
    stealth_keys: &StealthKeys,
) -> Result<SelectedFunding> {
    let mut rejected = Vec::new();

    for kind in req.preference {
        let found = match kind {
            FundingKind::Base => select_base(base_candidates, req, &mut rejected).map(|mut sf| {
                sf.owner_priv = *base_priv;
                sf
            }),
            FundingKind::Stealth => select_stealth(stealth_candidates, req, stealth_keys, &mut rejected),
        };
        if let Some(sf) = found {
            return Ok(sf);
        }
    }

    Err(Error::InsufficientFunds { rejected })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priv_from_u64(n: u64) -> Bytes32 {
        let mut out = [0u8; 32];
        out[24..32].copy_from_slice(&n.to_be_bytes());
        out
    }

    fn base_req() -> FundingRequest {
        FundingRequest {
            min_sats: 0,
            min_confirmations: 0,
            include_unconfirmed: true,
            require_vout0: false,
            allow_tokens: false,
            preference: [FundingKind::Base, FundingKind::Stealth],
        }
    }

    #[test]
    fn selects_largest_base_candidate() {
        let owner_priv = priv_from_u64(1);
        let owner_pub = curve::get_public_key(&owner_priv).unwrap();
        let candidates = vec![
            BaseUtxoCandidate {
                txid_be: [0x01; 32],
                vout: 0,
                value_sats: 1_000,
                confirmations: 1,
                is_token: false,
                is_p2pkh: true,
                exists_onchain: true,
                owner_pub,
            },
            BaseUtxoCandidate {
                txid_be: [0x02; 32],
                vout: 0,
                value_sats: 5_000,
                confirmations: 1,
                is_token: false,
                is_p2pkh: true,
                exists_onchain: true,
                owner_pub,
            },
        ];
        let req = base_req();
        let selected = select(
            &candidates,
            &[],
            &req,
            &owner_priv,
            &StealthKeys {
                scan_priv: [0; 32],
                spend_priv: [0; 32],
            },
        )
        .unwrap();
        assert_eq!(selected.txid_be, [0x02; 32]);
        assert_eq!(selected.value_sats, 5_000);
    }

    #[test]
    fn rejects_token_utxo_unless_allowed() {
        let owner_priv = priv_from_u64(1);
        let owner_pub = curve::get_public_key(&owner_priv).unwrap();
        let candidates = vec![BaseUtxoCandidate {
            txid_be: [0x01; 32],
            vout: 0,
            value_sats: 1_000,
            confirmations: 1,
            is_token: true,
            is_p2pkh: true,
            exists_onchain: true,
            owner_pub,
        }];
        let req = base_req();
        let err = select(
            &candidates,
            &[],
            &req,
            &owner_priv,
            &StealthKeys {
                scan_priv: [0; 32],
                spend_priv: [0; 32],
            },
        )
        .unwrap_err();
        match err {
            Error::InsufficientFunds { rejected } => {
                assert_eq!(rejected.len(), 1);
                assert_eq!(rejected[0].reason.code(), "token-utxo-excluded");
            }
            _ => panic!("expected InsufficientFunds"),
        }
    }

    #[test]
    fn require_vout0_gate() {
        let owner_priv = priv_from_u64(1);
        let owner_pub = curve::get_public_key(&owner_priv).unwrap();
        let candidates = vec![BaseUtxoCandidate {
            txid_be: [0x01; 32],
            vout: 1,
            value_sats: 10_000,
            confirmations: 1,
            is_token: false,
            is_p2pkh: true,
            exists_onchain: true,
            owner_pub,
        }];
        let mut req = base_req();
        req.require_vout0 = true;
        let err = select(
            &candidates,
            &[],
            &req,
            &owner_priv,
            &StealthKeys {
                scan_priv: [0; 32],
                spend_priv: [0; 32],
            },
        )
        .unwrap_err();
        match err {
            Error::InsufficientFunds { rejected } => {
                assert_eq!(rejected[0].reason.code(), "require-vout0");
            }
            _ => panic!("expected InsufficientFunds"),
        }
    }

    #[test]
    fn stealth_candidate_verifies_and_selects() {
        let sender_priv = priv_from_u64(11);
        let scan_priv = priv_from_u64(22);
        let sender_pub = curve::get_public_key(&sender_priv).unwrap();
        let scan_pub = curve::get_public_key(&scan_priv).unwrap();
        let spend_priv = crate::rpa::derive_spend_priv(&scan_priv, &scan_pub).unwrap();
        let spend_pub = curve::get_public_key(&spend_priv).unwrap();

        let txid_hex = "ab".repeat(32);
        let vout = 2u32;
        let index = 7u32;

        let child_pub = crate::rpa::derive_sender_one_time_pub(
            &sender_priv,
            &scan_pub,
            &spend_pub,
            &txid_hex,
            vout,
            index,
        )
        .unwrap();
        let child_hash160 = hash160(&child_pub);

        let candidate = StealthUtxoCandidate {
            txid_be: [0x09; 32],
            vout: 0,
            value_sats: 4_200,
            confirmations: 3,
            is_token: false,
            exists_onchain: true,
            spent: false,
            stored_hash160: child_hash160,
            rpa_context: RpaContext {
                sender_pub33: crate::primitives::to_hex(&sender_pub),
                prevout_txid_hex: txid_hex,
                prevout_n: vout,
                index,
            },
        };

        let mut req = base_req();
        req.preference = [FundingKind::Stealth, FundingKind::Base];
        let selected = select(
            &[],
            &[candidate],
            &req,
            &[0; 32],
            &StealthKeys { scan_priv, spend_priv },
        )
        .unwrap();
        assert_eq!(selected.value_sats, 4_200);
        assert_eq!(curve::get_public_key(&selected.owner_priv).unwrap(), child_pub);
    }

    #[test]
    fn spent_stealth_candidate_rejected() {
        let candidate = StealthUtxoCandidate {
            txid_be: [0x01; 32],
            vout: 0,
            value_sats: 1_000,
            confirmations: 1,
            is_token: false,
            exists_onchain: true,
            spent: true,
            stored_hash160: [0; 20],
            rpa_context: RpaContext {
                sender_pub33: "ab".repeat(33),
                prevout_txid_hex: "cd".repeat(32),
                prevout_n: 0,
                index: 0,
            },
        };
        let mut req = base_req();
        req.preference = [FundingKind::Stealth, FundingKind::Base];
        let err = select(
            &[],
            &[candidate],
            &req,
            &[0; 32],
            &StealthKeys {
                scan_priv: [0; 32],
                spend_priv: [0; 32],
            },
        )
        .unwrap_err();
        match err {
            Error::InsufficientFunds { rejected } => {
                assert_eq!(rejected[0].reason.code(), "spent");
            }
            _ => panic!("expected InsufficientFunds"),
        }
    }
}
