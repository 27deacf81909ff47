//! Client half of the blind-token protocol. Lives in the server crate so the
//! round trip is testable in-process and so bundled tooling can exercise a
//! deployment end to end.

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand_core::{OsRng, RngCore};
use sha2::Sha512;

use crate::errors::ServerError;
use crate::tokens::{
    decompress_point, dleq_challenge, random_scalar, spend_mac, DleqProof, SpentToken,
    TOKEN_NONCE_BYTES,
};

/// A token awaiting issuance: the hashed-to-group point and its blind.
pub struct PendingToken {
    r: Scalar,
    t: RistrettoPoint,
}

/// A token the issuer signed and the client unblinded. Spendable exactly
/// once via [`make_spend`].
#[derive(Debug)]
pub struct UnblindedToken {
    t: RistrettoPoint,
    shared: RistrettoPoint,
}

/// Generates a fresh token seed, hashes it to the group and blinds it.
/// Returns the pending state and the blinded point to send to the issuer.
pub fn blind() -> (PendingToken, Vec<u8>) {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let t = RistrettoPoint::hash_from_bytes::<Sha512>(&seed);
    let r = random_scalar();
    let blinded = t * r;
    (
        PendingToken { r, t },
        blinded.compress().as_bytes().to_vec(),
    )
}

/// Checks the issuer's discrete-log-equality proof against its public
/// parameter and unblinds the signed point.
pub fn unblind(
    pending: PendingToken,
    signed: &[u8],
    proof: &DleqProof,
    server_public: &[u8],
) -> Result<UnblindedToken, ServerError> {
    let y = decompress_point(server_public)?;
    let q = decompress_point(signed)?;
    let p = pending.t * pending.r;

    let (c, s) = proof.scalars().ok_or(ServerError::TokenInvalid)?;
    let commit_a = RistrettoPoint::mul_base(&s) - y * c;
    let commit_b = p * s - q * c;
    if dleq_challenge(&y, &p, &q, &commit_a, &commit_b) != c {
        return Err(ServerError::TokenInvalid);
    }

    let shared = q * pending.r.invert();
    Ok(UnblindedToken {
        t: pending.t,
        shared,
    })
}

/// Builds a one-time spend of an unblinded token: the revealed point, a
/// fresh nonce and a MAC over the nonce keyed by the shared point.
pub fn make_spend(token: &UnblindedToken) -> SpentToken {
    let mut nonce = vec![0u8; TOKEN_NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);
    let mac = spend_mac(&token.shared, &nonce);
    SpentToken {
        point: token.t.compress().as_bytes().to_vec(),
        nonce,
        mac,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::TokenServer;

    #[test]
    fn issue_unblind_spend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let server = TokenServer::open(random_scalar(), dir.path()).unwrap();

        let (pending, blinded) = blind();
        let (signed, proof) = server.issue(&blinded).unwrap();
        let token = unblind(
            pending,
            &signed,
            &proof,
            &server.y.compress().as_bytes()[..],
        )
        .unwrap();

        server.spend(&make_spend(&token)).unwrap();
    }

    #[test]
    fn proof_from_wrong_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = TokenServer::open(random_scalar(), dir.path()).unwrap();
        let imposter = RistrettoPoint::mul_base(&random_scalar());

        let (pending, blinded) = blind();
        let (signed, proof) = server.issue(&blinded).unwrap();
        let err = unblind(pending, &signed, &proof, imposter.compress().as_bytes()).unwrap_err();
        assert!(matches!(err, ServerError::TokenInvalid));
    }

    #[test]
    fn tampered_mac_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = TokenServer::open(random_scalar(), dir.path()).unwrap();

        let (pending, blinded) = blind();
        let (signed, proof) = server.issue(&blinded).unwrap();
        let token = unblind(pending, &signed, &proof, &server.y.compress().as_bytes()[..]).unwrap();

        let mut spend = make_spend(&token);
        spend.mac[0] ^= 0xff;
        assert!(matches!(
            server.spend(&spend).unwrap_err(),
            ServerError::TokenInvalid
        ));
    }
}
