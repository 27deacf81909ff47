use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use curve25519_dalek::scalar::Scalar;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::ServerError;
use crate::identity::Identity;
use crate::tokens::random_scalar;
use crate::wire::base64_bytes;

pub const SERVER_CONFIG_FILE: &str = "serverConfig.json";
pub const SALT_FILE: &str = "SALT";

pub const ATTR_DESCRIPTION: &str = "description";
pub const ATTR_AUTOSTART: &str = "autostart";
pub const ATTR_STORAGE_TYPE: &str = "storageType";

pub const STORAGE_TYPE_FILE: &str = "file";

const DEFAULT_MAX_BUFFER_LINES: usize = 100_000;
const SALT_BYTES: usize = 16;
const NONCE_BYTES: usize = 24;

/// Configuration the server needs to report metrics upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reporting {
    #[serde(rename = "logMetricsToFile")]
    pub log_metrics_to_file: bool,
    #[serde(rename = "reportingGroupId")]
    pub reporting_group_id: String,
    #[serde(rename = "reportingServerAddr")]
    pub reporting_server_addr: String,
}

/// The persisted server record: both endpoint identities, the token-service
/// root scalar and operator-facing attributes.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "maxBufferLines")]
    pub max_buffer_lines: usize,

    #[serde(rename = "publicKey", with = "base64_bytes")]
    pub public_key: Vec<u8>,
    #[serde(rename = "privateKey", with = "base64_bytes")]
    pub private_key: Vec<u8>,

    #[serde(rename = "tokenServerPublicKey", with = "base64_bytes")]
    pub token_server_public_key: Vec<u8>,
    #[serde(rename = "tokenServerPrivateKey", with = "base64_bytes")]
    pub token_server_private_key: Vec<u8>,

    #[serde(rename = "tokenServiceK", with = "base64_bytes")]
    pub token_service_k: Vec<u8>,

    #[serde(rename = "serverReporting")]
    pub server_reporting: Reporting,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Config {
    /// A fresh default config: two new identities and a new root scalar.
    pub fn generate() -> Config {
        let identity = Identity::generate();
        let token_identity = Identity::generate();
        Config {
            max_buffer_lines: DEFAULT_MAX_BUFFER_LINES,
            public_key: identity.public_key().to_vec(),
            private_key: identity.seed().to_vec(),
            token_server_public_key: token_identity.public_key().to_vec(),
            token_server_private_key: token_identity.seed().to_vec(),
            token_service_k: random_scalar().to_bytes().to_vec(),
            server_reporting: Reporting {
                log_metrics_to_file: true,
                reporting_group_id: String::new(),
                reporting_server_addr: String::new(),
            },
            attributes: BTreeMap::new(),
        }
    }

    fn identity_from(seed: &[u8]) -> Result<Identity, ServerError> {
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| ServerError::Config("private key must be 32 bytes".to_string()))?;
        Ok(Identity::from_seed(&seed))
    }

    pub fn identity(&self) -> Result<Identity, ServerError> {
        Self::identity_from(&self.private_key)
    }

    pub fn token_identity(&self) -> Result<Identity, ServerError> {
        Self::identity_from(&self.token_server_private_key)
    }

    pub fn token_k(&self) -> Result<Scalar, ServerError> {
        let bytes: [u8; 32] = self
            .token_service_k
            .as_slice()
            .try_into()
            .map_err(|_| ServerError::Config("token root scalar must be 32 bytes".to_string()))?;
        Option::<Scalar>::from(Scalar::from_canonical_bytes(bytes))
            .ok_or_else(|| ServerError::Config("token root scalar is not canonical".to_string()))
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32], ServerError> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| ServerError::Config(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, ServerError> {
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let ct = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| ServerError::Config("config encryption failed".to_string()))?;
    let mut out = nonce.to_vec();
    out.extend_from_slice(&ct);
    Ok(out)
}

fn decrypt(key: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>, ServerError> {
    if blob.len() < NONCE_BYTES {
        return Err(ServerError::Config("config blob truncated".to_string()));
    }
    let (nonce, ct) = blob.split_at(NONCE_BYTES);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ct)
        .map_err(|_| ServerError::Config("could not decrypt config".to_string()))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

struct ConfigInner {
    config: Config,
    dir: PathBuf,
    // present iff the config is encrypted at rest; the password itself is
    // never retained
    key: Option<[u8; 32]>,
}

/// Handle owning the persisted config: a mutex-guarded inner record plus the
/// file writer. Accessors copy values out.
pub struct ConfigStore {
    inner: Mutex<ConfigInner>,
}

impl ConfigStore {
    /// Generates and persists a fresh config in `dir`. With a password the
    /// config is encrypted and a new salt file written alongside it.
    pub fn create(dir: &Path, password: Option<&str>) -> Result<ConfigStore, ServerError> {
        ConfigStore::create_with(dir, Config::generate(), password)
    }

    /// Persists a caller-supplied config, encrypting when given a password.
    pub fn create_with(
        dir: &Path,
        config: Config,
        password: Option<&str>,
    ) -> Result<ConfigStore, ServerError> {
        fs::create_dir_all(dir).map_err(|e| ServerError::Config(e.to_string()))?;

        let key = match password {
            Some(password) => {
                let mut salt = [0u8; SALT_BYTES];
                OsRng.fill_bytes(&mut salt);
                fs::write(dir.join(SALT_FILE), salt)
                    .map_err(|e| ServerError::Config(e.to_string()))?;
                Some(derive_key(password, &salt)?)
            }
            None => None,
        };

        let store = ConfigStore {
            inner: Mutex::new(ConfigInner {
                config,
                dir: dir.to_path_buf(),
                key,
            }),
        };
        store.save()?;
        Ok(store)
    }

    /// Loads an existing config. A password implies an encrypted config and
    /// requires the salt file written at creation.
    pub fn load(dir: &Path, password: Option<&str>) -> Result<ConfigStore, ServerError> {
        let path = dir.join(SERVER_CONFIG_FILE);
        info!("loading config from {}", path.display());
        let raw = fs::read(&path).map_err(|e| ServerError::Config(e.to_string()))?;

        let (plaintext, key) = match password {
            Some(password) => {
                let salt = fs::read(dir.join(SALT_FILE))
                    .map_err(|e| ServerError::Config(format!("missing salt file: {}", e)))?;
                let key = derive_key(password, &salt)?;
                (decrypt(&key, &raw)?, Some(key))
            }
            None => (raw, None),
        };

        let config: Config =
            serde_json::from_slice(&plaintext).map_err(|e| ServerError::Config(e.to_string()))?;
        Ok(ConfigStore {
            inner: Mutex::new(ConfigInner {
                config,
                dir: dir.to_path_buf(),
                key,
            }),
        })
    }

    /// Loads the config in `dir` or generates a new one when none exists.
    pub fn load_or_create(dir: &Path, password: Option<&str>) -> Result<ConfigStore, ServerError> {
        if dir.join(SERVER_CONFIG_FILE).exists() {
            ConfigStore::load(dir, password)
        } else {
            ConfigStore::create(dir, password)
        }
    }

    fn save_locked(inner: &ConfigInner) -> Result<(), ServerError> {
        let path = inner.dir.join(SERVER_CONFIG_FILE);
        let json = serde_json::to_vec_pretty(&inner.config)
            .map_err(|e| ServerError::Config(e.to_string()))?;
        let bytes = match &inner.key {
            Some(key) => encrypt(key, &json)?,
            None => json,
        };
        fs::write(&path, bytes).map_err(|e| ServerError::Config(e.to_string()))?;
        restrict_permissions(&path).map_err(|e| ServerError::Config(e.to_string()))?;
        Ok(())
    }

    /// Rewrites the config file, using only the in-memory key when the
    /// config is encrypted.
    pub fn save(&self) -> Result<(), ServerError> {
        let inner = self.inner.lock().expect("config lock");
        Self::save_locked(&inner)
    }

    /// Re-derives a key from the salt file and compares it with the
    /// in-memory key. An unencrypted config accepts any password.
    pub fn check_password(&self, password: &str) -> bool {
        let inner = self.inner.lock().expect("config lock");
        let Some(key) = inner.key else {
            return true;
        };
        let Ok(salt) = fs::read(inner.dir.join(SALT_FILE)) else {
            return false;
        };
        match derive_key(password, &salt) {
            Ok(candidate) => candidate == key,
            Err(_) => false,
        }
    }

    pub fn encrypted(&self) -> bool {
        self.inner.lock().expect("config lock").key.is_some()
    }

    pub fn config_dir(&self) -> PathBuf {
        self.inner.lock().expect("config lock").dir.clone()
    }

    pub fn identity(&self) -> Result<Identity, ServerError> {
        self.inner.lock().expect("config lock").config.identity()
    }

    pub fn token_identity(&self) -> Result<Identity, ServerError> {
        self.inner
            .lock()
            .expect("config lock")
            .config
            .token_identity()
    }

    pub fn token_k(&self) -> Result<Scalar, ServerError> {
        self.inner.lock().expect("config lock").config.token_k()
    }

    pub fn public_key(&self) -> Result<[u8; 32], ServerError> {
        let inner = self.inner.lock().expect("config lock");
        inner
            .config
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| ServerError::Config("public key must be 32 bytes".to_string()))
    }

    pub fn max_buffer_lines(&self) -> usize {
        self.inner.lock().expect("config lock").config.max_buffer_lines
    }

    pub fn reporting(&self) -> Reporting {
        self.inner
            .lock()
            .expect("config lock")
            .config
            .server_reporting
            .clone()
    }

    pub fn get_attribute(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("config lock")
            .config
            .attributes
            .get(key)
            .cloned()
    }

    pub fn set_attribute(&self, key: &str, value: &str) -> Result<(), ServerError> {
        let mut inner = self.inner.lock().expect("config lock");
        inner
            .config
            .attributes
            .insert(key.to_string(), value.to_string());
        Self::save_locked(&inner)
    }
}
