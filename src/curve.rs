//! secp256k1 point/scalar arithmetic and BCH Schnorr signing.
//!
//! We work directly against `k256`'s arithmetic types rather than a
//! higher-level signing API: BCH's Schnorr variant selects the nonce by
//! the Jacobi symbol of `R.y`, not BIP340's even-y convention, and the
//! RPA scheme needs raw non-hardened child derivation that no signer
//! crate exposes.

use hmac::{Hmac, Mac};
use k256::elliptic_curve::generic_array::GenericArray;
use k256::elliptic_curve::group::Group;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::elliptic_curve::Field;
use k256::{AffinePoint, EncodedPoint, ProjectivePoint, Scalar};
use num_bigint::BigUint;
use num_traits::One;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::primitives::{sha256, Bytes32, Pub33};

type HmacSha256 = Hmac<Sha256>;

/// The 16-byte RFC6979 additional data BCH Schnorr mixes into the
/// nonce derivation, distinguishing it from plain ECDSA signing with
/// the same key.
const SCHNORR_EXTRA_ENTROPY: &[u8; 16] = b"Schnorr+SHA256  ";

/// secp256k1 field prime `p`, used for the Jacobi-symbol nonce test.
/// This is distinct from the curve order `n` that `k256::Scalar`
/// arithmetic is already reduced modulo.
fn field_prime() -> BigUint {
    BigUint::parse_bytes(
        b"fffffffffffffffffffffffffffffffffffffffffffffffffffffefffffc2f",
        16,
    )
    .unwrap()
}

/// secp256k1 curve order `n`.
fn curve_order() -> BigUint {
    BigUint::parse_bytes(
        b"fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141",
        16,
    )
    .unwrap()
}

/// Reduce an arbitrary 32-byte value mod the curve order, yielding a
/// valid scalar (used to turn a hash output into an addable tweak).
fn scalar_mod_n(bytes32: &Bytes32) -> Scalar {
    let n = curve_order();
    let v = BigUint::from_bytes_be(bytes32) % &n;
    let mut out = [0u8; 32];
    let vb = v.to_bytes_be();
    out[32 - vb.len()..].copy_from_slice(&vb);
    let repr = GenericArray::clone_from_slice(&out);
    let scalar: Option<Scalar> = Scalar::from_repr(repr).into();
    scalar.expect("value reduced mod n is always a valid scalar")
}

/// `(priv32 + tweak32) mod n`, with `tweak32` reduced mod `n` first.
/// Used for the spend-key tweak (`spendPriv = scanPriv + H(...) mod n`).
pub fn add_scalar_mod_n(priv32: &Bytes32, tweak32: &Bytes32) -> Result<Bytes32> {
    let base = scalar_from_priv32(priv32)?;
    let tweak = scalar_mod_n(tweak32);
    let sum = base + tweak;
    if bool::from(sum.is_zero()) {
        return Err(Error::internal("spend key tweak produced a zero scalar"));
    }
    Ok(scalar_to_bytes(&sum))
}

/// `pub33 + tweak32*G`, the public-key counterpart of
/// [`add_scalar_mod_n`]. Lets a sender derive a receiver's `spendPub`
/// from `scanPub` alone, without ever seeing `scanPriv`.
pub fn add_scalar_times_generator(pub33: &Pub33, tweak32: &Bytes32) -> Result<Pub33> {
    let point = affine_from_pub33(pub33)?;
    let tweak = scalar_mod_n(tweak32);
    let sum = ProjectivePoint::from(point) + ProjectivePoint::GENERATOR * tweak;
    let sum_affine = sum.to_affine();
    if bool::from(ProjectivePoint::from(sum_affine).is_identity()) {
        return Err(Error::internal("add_scalar_times_generator: result is identity"));
    }
    Ok(compressed_bytes(&sum_affine))
}

/// ECDH: the affine x-coordinate of `priv32 * pub33`, as used by the
/// RPA shared-secret derivation.
pub fn ecdh_product_x(priv32: &Bytes32, pub33: &Pub33) -> Result<Bytes32> {
    let scalar = scalar_from_priv32(priv32)?;
    let point = affine_from_pub33(pub33)?;
    let product = (ProjectivePoint::from(point) * scalar).to_affine();
    Ok(point_xy(&product).0)
}

fn scalar_from_priv32(priv32: &Bytes32) -> Result<Scalar> {
    let repr = GenericArray::clone_from_slice(priv32);
    let scalar = Scalar::from_repr(repr);
    let scalar: Option<Scalar> = scalar.into();
    let scalar = scalar.ok_or_else(|| Error::validation("private key out of range"))?;
    if bool::from(scalar.is_zero()) {
        return Err(Error::validation("private key is zero"));
    }
    Ok(scalar)
}

fn scalar_to_bytes(s: &Scalar) -> Bytes32 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&s.to_bytes());
    out
}

fn affine_from_pub33(pub33: &Pub33) -> Result<AffinePoint> {
    let encoded = EncodedPoint::from_bytes(pub33)
        .map_err(|_| Error::validation("malformed compressed public key"))?;
    let point = AffinePoint::from_encoded_point(&encoded);
    let point: Option<AffinePoint> = point.into();
    point.ok_or_else(|| Error::validation("public key is not on the curve"))
}

fn compressed_bytes(point: &AffinePoint) -> Pub33 {
    let encoded = point.to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(encoded.as_bytes());
    out
}

/// Whether `pub33` decompresses to a point actually on the curve.
pub fn is_valid_pubkey(pub33: &Pub33) -> bool {
    affine_from_pub33(pub33).is_ok()
}

/// `getPublicKey(priv, compressed=true)`.
pub fn get_public_key(priv32: &Bytes32) -> Result<Pub33> {
    let scalar = scalar_from_priv32(priv32)?;
    let point = (ProjectivePoint::GENERATOR * scalar).to_affine();
    Ok(compressed_bytes(&point))
}

fn y_is_even(point: &AffinePoint) -> bool {
    let encoded = point.to_encoded_point(true);
    encoded.as_bytes()[0] == 0x02
}

/// `ensureEvenYPriv`: negate `priv` mod `n` when its point has odd `y`.
/// Idempotent: applying it twice yields the same result as once.
pub fn ensure_even_y_priv(priv32: &Bytes32) -> Result<Bytes32> {
    let scalar = scalar_from_priv32(priv32)?;
    let point = (ProjectivePoint::GENERATOR * scalar).to_affine();
    if y_is_even(&point) {
        Ok(*priv32)
    } else {
        Ok(scalar_to_bytes(&(-scalar)))
    }
}

/// Jacobi (Legendre, since `p` is prime) symbol test: is `y` a
/// quadratic residue mod the field prime?
fn jacobi_is_one(y: &[u8]) -> bool {
    let p = field_prime();
    let exp = (&p - BigUint::one()) >> 1;
    let y = BigUint::from_bytes_be(y);
    y.modpow(&exp, &p) == BigUint::one()
}

fn point_xy(point: &AffinePoint) -> (Bytes32, Bytes32) {
    let encoded = point.to_encoded_point(false);
    let mut x = [0u8; 32];
    let mut y = [0u8; 32];
    x.copy_from_slice(encoded.x().unwrap());
    y.copy_from_slice(encoded.y().unwrap());
    (x, y)
}

/// RFC6979 deterministic nonce generation with BCH's 16-byte Schnorr
/// additional data mixed into every HMAC update, per the algorithm in
/// RFC 6979 §3.2 specialized to SHA-256 (hash length == order length).
fn rfc6979_nonce(priv32: &Bytes32, sighash: &Bytes32, retry: u32) -> Result<Scalar> {
    let mut v = [0x01u8; 32];
    let mut k = [0x00u8; 32];

    let mut mac = HmacSha256::new_from_slice(&k).unwrap();
    mac.update(&v);
    mac.update(&[0x00]);
    mac.update(priv32);
    mac.update(sighash);
    mac.update(SCHNORR_EXTRA_ENTROPY);
    k.copy_from_slice(&mac.finalize().into_bytes());

    let mut mac = HmacSha256::new_from_slice(&k).unwrap();
    mac.update(&v);
    v.copy_from_slice(&mac.finalize().into_bytes());

    let mut mac = HmacSha256::new_from_slice(&k).unwrap();
    mac.update(&v);
    mac.update(&[0x01]);
    mac.update(priv32);
    mac.update(sighash);
    mac.update(SCHNORR_EXTRA_ENTROPY);
    k.copy_from_slice(&mac.finalize().into_bytes());

    let mut mac = HmacSha256::new_from_slice(&k).unwrap();
    mac.update(&v);
    v.copy_from_slice(&mac.finalize().into_bytes());

    let mut attempts = 0u32;
    loop {
        let mut mac = HmacSha256::new_from_slice(&k).unwrap();
        mac.update(&v);
        v.copy_from_slice(&mac.finalize().into_bytes());

        if attempts >= retry {
            let repr = GenericArray::clone_from_slice(&v);
            let candidate: Option<Scalar> = Scalar::from_repr(repr).into();
            if let Some(scalar) = candidate {
                if !bool::from(scalar.is_zero()) {
                    return Ok(scalar);
                }
            }
        }
        attempts += 1;

        let mut mac = HmacSha256::new_from_slice(&k).unwrap();
        mac.update(&v);
        mac.update(&[0x00]);
        k.copy_from_slice(&mac.finalize().into_bytes());

        let mut mac = HmacSha256::new_from_slice(&k).unwrap();
        mac.update(&v);
        v.copy_from_slice(&mac.finalize().into_bytes());
    }
}

/// BCH deterministic Schnorr signature: `r || s`, 64 bytes.
pub fn bch_schnorr_sign(priv32: &Bytes32, sighash: &Bytes32) -> Result<[u8; 64]> {
    let priv_scalar = scalar_from_priv32(priv32)?;
    let pub33 = get_public_key(priv32)?;

    let mut retry = 0u32;
    loop {
        let mut k = rfc6979_nonce(priv32, sighash, retry)?;
        let (_, ry) = point_xy(&(ProjectivePoint::GENERATOR * k).to_affine());
        if !jacobi_is_one(&ry) {
            k = -k;
        }
        let r_point = (ProjectivePoint::GENERATOR * k).to_affine();
        let (rx, _) = point_xy(&r_point);

        let e_input = crate::primitives::concat(&[&rx, &pub33, sighash]);
        let e_hash = sha256(&e_input);
        let e_repr = GenericArray::clone_from_slice(&e_hash);
        let e_opt: Option<Scalar> = Scalar::from_repr(e_repr).into();
        let e = match e_opt {
            Some(e) => e,
            None => {
                retry += 1;
                continue;
            }
        };

        let s = k + e * priv_scalar;

        let mut sig = [0u8; 64];
        sig[0..32].copy_from_slice(&rx);
        sig[32..64].copy_from_slice(&scalar_to_bytes(&s));
        return Ok(sig);
    }
}

/// BCH Schnorr verification. Accepts 64-byte (`r||s`) or 65-byte
/// (`r||s||sighashtype`, trailing byte stripped) signatures.
pub fn bch_schnorr_verify(sig: &[u8], sighash: &Bytes32, pub33: &Pub33) -> bool {
    let sig = match sig.len() {
        64 => sig,
        65 => &sig[..64],
        _ => return false,
    };

    let p = field_prime();
    let r_int = BigUint::from_bytes_be(&sig[0..32]);
    if r_int >= p {
        return false;
    }

    let s_repr = GenericArray::clone_from_slice(&sig[32..64]);
    let s_opt: Option<Scalar> = Scalar::from_repr(s_repr).into();
    let s = match s_opt {
        Some(s) => s,
        None => return false,
    };

    let point = match affine_from_pub33(pub33) {
        Ok(p) => p,
        Err(_) => return false,
    };

    let e_input = crate::primitives::concat(&[&sig[0..32], pub33, sighash]);
    let e_hash = sha256(&e_input);
    let e_repr = GenericArray::clone_from_slice(&e_hash);
    let e_opt: Option<Scalar> = Scalar::from_repr(e_repr).into();
    let e = match e_opt {
        Some(e) => e,
        None => return false,
    };

    let r_prime = ProjectivePoint::from(point) * (-e) + ProjectivePoint::GENERATOR * s;
    if bool::from(r_prime.is_identity()) {
        return false;
    }
    let r_affine = r_prime.to_affine();

    let (rx, ry) = point_xy(&r_affine);
    if rx != sig[0..32] {
        return false;
    }
    jacobi_is_one(&ry)
}

/// HMAC-SHA512, used by the RPA non-hardened child derivation (BIP32
/// shape, but the "chain code" is an RPA shared secret rather than a
/// master-seed-derived one).
pub fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    use hmac::Hmac as HmacGeneric;
    use sha2::Sha512;
    let mut mac = HmacGeneric::<Sha512>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 64];
    out.copy_from_slice(&result);
    out
}

/// `CKDpub(parentPub33, chainCode32, index32)`.
pub fn ckd_pub(parent_pub: &Pub33, chain_code: &Bytes32, index: u32) -> Result<Pub33> {
    let parent_point = affine_from_pub33(parent_pub)?;
    let data = crate::primitives::concat(&[parent_pub, &index.to_be_bytes()]);
    let i = hmac_sha512(chain_code, &data);

    let il_repr = GenericArray::clone_from_slice(&i[0..32]);
    let il_opt: Option<Scalar> = Scalar::from_repr(il_repr).into();
    let il = il_opt.ok_or_else(|| Error::internal("CKDpub: IL out of range"))?;
    if bool::from(il.is_zero()) {
        return Err(Error::internal("CKDpub: IL is zero"));
    }

    let child = ProjectivePoint::from(parent_point) + ProjectivePoint::GENERATOR * il;
    let child_affine = child.to_affine();
    if bool::from(ProjectivePoint::from(child_affine).is_identity()) {
        return Err(Error::internal("CKDpub: child point is identity"));
    }
    Ok(compressed_bytes(&child_affine))
}

/// `CKDpriv(parentPriv32, chainCode32, index32)`.
pub fn ckd_priv(parent_priv: &Bytes32, chain_code: &Bytes32, index: u32) -> Result<Bytes32> {
    let parent_scalar = scalar_from_priv32(parent_priv)?;
    let parent_pub = get_public_key(parent_priv)?;
    let data = crate::primitives::concat(&[&parent_pub, &index.to_be_bytes()]);
    let i = hmac_sha512(chain_code, &data);

    let il_repr = GenericArray::clone_from_slice(&i[0..32]);
    let il_opt: Option<Scalar> = Scalar::from_repr(il_repr).into();
    let il = il_opt.ok_or_else(|| Error::internal("CKDpriv: IL out of range"))?;
    if bool::from(il.is_zero()) {
        return Err(Error::internal("CKDpriv: IL is zero"));
    }

    let child = il + parent_scalar;
    if bool::from(child.is_zero()) {
        return Err(Error::internal("CKDpriv: child scalar is zero"));
    }
    Ok(scalar_to_bytes(&child))
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
    fn public_key_is_on_curve() {
        let priv32 = priv_from_u64(12345);
        let pub33 = get_public_key(&priv32).unwrap();
        assert!(affine_from_pub33(&pub33).is_ok());
    }

    #[test]
    fn ensure_even_y_is_idempotent() {
        let priv32 = priv_from_u64(98765);
        let once = ensure_even_y_priv(&priv32).unwrap();
        let twice = ensure_even_y_priv(&once).unwrap();
        assert_eq!(once, twice);

        let point = (ProjectivePoint::GENERATOR
            * scalar_from_priv32(&once).unwrap())
        .to_affine();
        assert!(y_is_even(&point));
    }

    #[test]
    fn schnorr_sign_verify_roundtrip() {
        let priv32 = priv_from_u64(424242);
        let pub33 = get_public_key(&priv32).unwrap();
        let msg = sha256(b"shard withdraw test message");

        let sig = bch_schnorr_sign(&priv32, &msg).unwrap();
        assert!(bch_schnorr_verify(&sig, &msg, &pub33));
    }

    #[test]
    fn schnorr_verify_rejects_tampered_message() {
        let priv32 = priv_from_u64(13);
        let pub33 = get_public_key(&priv32).unwrap();
        let msg = sha256(b"original");
        let mut other = sha256(b"original");
        other[0] ^= 0x01;

        let sig = bch_schnorr_sign(&priv32, &msg).unwrap();
        assert!(!bch_schnorr_verify(&sig, &other, &pub33));
    }

    #[test]
    fn schnorr_verify_rejects_tampered_signature() {
        let priv32 = priv_from_u64(77);
        let pub33 = get_public_key(&priv32).unwrap();
        let msg = sha256(b"covenant preimage");

        let mut sig = bch_schnorr_sign(&priv32, &msg).unwrap();
        sig[40] ^= 0x01;
        assert!(!bch_schnorr_verify(&sig, &msg, &pub33));
    }

    #[test]
    fn schnorr_accepts_65_byte_signature_with_sighash_byte() {
        let priv32 = priv_from_u64(55);
        let pub33 = get_public_key(&priv32).unwrap();
        let msg = sha256(b"sighash-suffixed");

        let sig = bch_schnorr_sign(&priv32, &msg).unwrap();
        let mut sig65 = sig.to_vec();
        sig65.push(0x41);
        assert!(bch_schnorr_verify(&sig65, &msg, &pub33));
    }

    #[test]
    fn add_scalar_times_generator_matches_priv_tweak() {
        let base_priv = priv_from_u64(42);
        let base_pub = get_public_key(&base_priv).unwrap();
        let tweak = sha256(b"tweak");

        let tweaked_priv = add_scalar_mod_n(&base_priv, &tweak).unwrap();
        let tweaked_pub_via_priv = get_public_key(&tweaked_priv).unwrap();
        let tweaked_pub_via_point = add_scalar_times_generator(&base_pub, &tweak).unwrap();

        assert_eq!(tweaked_pub_via_priv, tweaked_pub_via_point);
    }

    #[test]
    fn ckd_pub_and_priv_agree() {
        let parent_priv = priv_from_u64(9001);
        let parent_pub = get_public_key(&parent_priv).unwrap();
        let chain_code = sha256(b"shared secret stand-in");

        let child_pub = ckd_pub(&parent_pub, &chain_code, 7).unwrap();
        let child_priv = ckd_priv(&parent_priv, &chain_code, 7).unwrap();
        assert_eq!(get_public_key(&child_priv).unwrap(), child_pub);
    }
}
