use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::errors::ServerError;
use crate::wire::base64_bytes;

pub const SPENT_TOKENS_DB: &str = "tokens.db";

const DLEQ_DOMAIN: &[u8] = b"token-board-dleq-v1";
const SPEND_DOMAIN: &[u8] = b"token-board-spend-v1";

pub const TOKEN_NONCE_BYTES: usize = 16;

/// Samples a uniform scalar from 64 bytes of OS randomness. Panics when
/// secure randomness is unavailable.
pub fn random_scalar() -> Scalar {
    let mut wide = [0u8; 64];
    OsRng.fill_bytes(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Chaum-Pedersen proof that the same scalar links (G, Y) and (P', Q').
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DleqProof {
    #[serde(with = "base64_bytes")]
    pub c: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub s: Vec<u8>,
}

impl DleqProof {
    pub(crate) fn scalars(&self) -> Option<(Scalar, Scalar)> {
        let c: Option<Scalar> =
            Scalar::from_canonical_bytes(self.c.as_slice().try_into().ok()?).into();
        let s: Option<Scalar> =
            Scalar::from_canonical_bytes(self.s.as_slice().try_into().ok()?).into();
        Some((c?, s?))
    }
}

pub(crate) fn dleq_challenge(
    y: &RistrettoPoint,
    blinded: &RistrettoPoint,
    signed: &RistrettoPoint,
    commit_a: &RistrettoPoint,
    commit_b: &RistrettoPoint,
) -> Scalar {
    let mut h = Sha512::new();
    h.update(DLEQ_DOMAIN);
    h.update(curve25519_dalek::constants::RISTRETTO_BASEPOINT_COMPRESSED.as_bytes());
    h.update(y.compress().as_bytes());
    h.update(blinded.compress().as_bytes());
    h.update(signed.compress().as_bytes());
    h.update(commit_a.compress().as_bytes());
    h.update(commit_b.compress().as_bytes());
    Scalar::from_hash(h)
}

pub(crate) fn decompress_point(bytes: &[u8]) -> Result<RistrettoPoint, ServerError> {
    CompressedRistretto::from_slice(bytes)
        .ok()
        .and_then(|c| c.decompress())
        .ok_or(ServerError::TokenInvalid)
}

/// MAC binding a token's unblinded shared point to a one-time nonce. Both
/// ends can derive it: the client from the unblinded issuance, the server by
/// multiplying the presented point with its root scalar.
pub(crate) fn spend_mac(shared: &RistrettoPoint, nonce: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(shared.compress().as_bytes())
        .expect("hmac accepts any key length");
    mac.update(SPEND_DOMAIN);
    mac.update(nonce);
    mac.finalize().into_bytes().to_vec()
}

/// An unblinded token presented for spending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpentToken {
    #[serde(with = "base64_bytes")]
    pub point: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub mac: Vec<u8>,
}

/// Blind-token issuance and spend verification over Ristretto255, with a
/// durable set of spent-token fingerprints.
pub struct TokenServer {
    k: Scalar,
    pub y: RistrettoPoint,
    spent: sled::Db,
}

impl TokenServer {
    /// Opens the spent-token database under the config directory and derives
    /// the public parameter from the persisted root scalar.
    pub fn open(k: Scalar, config_dir: &Path) -> Result<TokenServer, ServerError> {
        let spent = sled::open(config_dir.join(SPENT_TOKENS_DB))
            .map_err(|e| ServerError::Storage(e.to_string()))?;
        Ok(TokenServer {
            k,
            y: RistrettoPoint::mul_base(&k),
            spent,
        })
    }

    /// The public parameter Y = k*G, base64 encoded for key bundles.
    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.y.compress().as_bytes())
    }

    /// Signs a blinded point and proves the signature used the committed
    /// root scalar, so the client can unblind without learning k.
    pub fn issue(&self, blinded: &[u8]) -> Result<(Vec<u8>, DleqProof), ServerError> {
        let p = decompress_point(blinded)?;
        let q = p * self.k;

        let t = random_scalar();
        let commit_a = RistrettoPoint::mul_base(&t);
        let commit_b = p * t;
        let c = dleq_challenge(&self.y, &p, &q, &commit_a, &commit_b);
        let s = t + c * self.k;

        Ok((
            q.compress().as_bytes().to_vec(),
            DleqProof {
                c: c.to_bytes().to_vec(),
                s: s.to_bytes().to_vec(),
            },
        ))
    }

    /// Verifies and burns a token. The spent-set write is flushed before the
    /// call returns so a spend acknowledgement is never emitted for a token
    /// that could be replayed after a crash.
    pub fn spend(&self, token: &SpentToken) -> Result<(), ServerError> {
        if token.nonce.is_empty() {
            return Err(ServerError::TokenInvalid);
        }
        let t = decompress_point(&token.point)?;
        let shared = t * self.k;

        let mut mac = Hmac::<Sha256>::new_from_slice(shared.compress().as_bytes())
            .expect("hmac accepts any key length");
        mac.update(SPEND_DOMAIN);
        mac.update(&token.nonce);
        mac.verify_slice(&token.mac)
            .map_err(|_| ServerError::TokenInvalid)?;

        // the fingerprint is the revealed point: a client re-minting fresh
        // nonces for an already burned token must still be refused
        match self
            .spent
            .compare_and_swap(&token.point, None as Option<&[u8]>, Some(&[][..]))
        {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(ServerError::TokenAlreadySpent),
            Err(e) => return Err(ServerError::Storage(e.to_string())),
        }
        self.spent
            .flush()
            .map_err(|e| ServerError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn close(&self) {
        let _ = self.spent.flush();
    }
}
