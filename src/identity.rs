use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use data_encoding::BASE32_NOPAD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::errors::ServerError;
use crate::wire::base64_bytes;

const ONION_VERSION: u8 = 3;
const ONION_CHECKSUM_TAG: &[u8] = b".onion checksum";

/// An Ed25519 keypair naming one hidden-service endpoint.
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Generates a fresh identity. Panics when secure randomness is
    /// unavailable.
    pub fn generate() -> Identity {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Identity {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Identity {
        Identity {
            signing: SigningKey::from_bytes(seed),
        }
    }

    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The v3 hostname of this identity, without the network suffix.
    pub fn hostname(&self) -> String {
        onion_hostname(&self.public_key())
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing.sign(msg).to_bytes().to_vec()
    }
}

/// Derives the v3 hostname for a service public key: base32 over
/// `pubkey || checksum || version` where the checksum is the first two bytes
/// of SHA3-256(".onion checksum" || pubkey || version).
pub fn onion_hostname(public_key: &[u8; 32]) -> String {
    let mut h = Sha3_256::new();
    h.update(ONION_CHECKSUM_TAG);
    h.update(public_key);
    h.update([ONION_VERSION]);
    let checksum = h.finalize();

    let mut raw = Vec::with_capacity(35);
    raw.extend_from_slice(public_key);
    raw.extend_from_slice(&checksum[..2]);
    raw.push(ONION_VERSION);
    BASE32_NOPAD.encode(&raw).to_ascii_lowercase()
}

/// Whether a string is a well-formed v3 hostname with a valid checksum.
pub fn is_valid_hostname(hostname: &str) -> bool {
    let Ok(raw) = BASE32_NOPAD.decode(hostname.to_ascii_uppercase().as_bytes()) else {
        return false;
    };
    if raw.len() != 35 || raw[34] != ONION_VERSION {
        return false;
    }
    let public_key: [u8; 32] = raw[..32].try_into().expect("32-byte prefix");
    onion_hostname(&public_key) == hostname
}

pub const KEY_TYPE_SERVER_ONION: &str = "server_onion";
pub const KEY_TYPE_TOKEN_ONION: &str = "token_onion";
pub const KEY_TYPE_PRIVACY_PASS: &str = "privacy_pass";

/// A signed advertisement binding the board hostname to its token endpoint
/// and the token service public parameter. Clients verify the bundle before
/// trusting either address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBundle {
    pub keys: BTreeMap<String, String>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl KeyBundle {
    pub fn new_signed(
        identity: &Identity,
        server_onion: &str,
        token_onion: &str,
        privacy_pass: &str,
    ) -> KeyBundle {
        let mut keys = BTreeMap::new();
        keys.insert(KEY_TYPE_SERVER_ONION.to_string(), server_onion.to_string());
        keys.insert(KEY_TYPE_TOKEN_ONION.to_string(), token_onion.to_string());
        keys.insert(KEY_TYPE_PRIVACY_PASS.to_string(), privacy_pass.to_string());

        let mut bundle = KeyBundle {
            keys,
            signature: vec![],
        };
        bundle.signature = identity.sign(&bundle.signing_bytes());
        bundle
    }

    /// Canonical serialization of the bundle, signature included.
    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("key bundle serializable")
    }

    pub fn deserialize(bytes: &[u8]) -> Result<KeyBundle, ServerError> {
        serde_json::from_slice(bytes).map_err(|e| ServerError::Config(e.to_string()))
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let unsigned = KeyBundle {
            keys: self.keys.clone(),
            signature: vec![],
        };
        serde_json::to_vec(&unsigned).expect("key bundle serializable")
    }

    pub fn verify(&self, public_key: &[u8; 32]) -> bool {
        let Ok(vk) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        vk.verify(&self.signing_bytes(), &signature).is_ok()
    }

    pub fn key(&self, key_type: &str) -> Option<&str> {
        self.keys.get(key_type).map(String::as_str)
    }
}

/// An invitation binding a fresh group id and shared key to a server
/// address. Serialized JSON, base64 encoded for embedding in bundles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInvite {
    #[serde(with = "base64_bytes")]
    pub group_id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub group_key: Vec<u8>,
    pub server: String,
}

impl GroupInvite {
    pub fn new(server: &str) -> GroupInvite {
        let mut group_id = vec![0u8; 16];
        OsRng.fill_bytes(&mut group_id);
        let mut group_key = vec![0u8; 32];
        OsRng.fill_bytes(&mut group_key);
        GroupInvite {
            group_id,
            group_key,
            server: server.to_string(),
        }
    }

    pub fn encode(&self) -> String {
        STANDARD.encode(serde_json::to_vec(self).expect("invite serializable"))
    }
}
