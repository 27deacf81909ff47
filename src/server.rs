//! The server facade: owns the config, the token service, the metrics pack
//! and both hidden-service listeners, and exposes the operator lifecycle.

use std::fs;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::sync::RwLock;
use tracing::info;

use crate::applications::{ApplicationChain, ProofOfWorkApp, TokenApp, TokenAppMode};
use crate::board::TokenBoardApp;
use crate::config::{ConfigStore, ATTR_AUTOSTART, ATTR_STORAGE_TYPE, STORAGE_TYPE_FILE};
use crate::errors::ServerError;
use crate::identity::{GroupInvite, KeyBundle};
use crate::metrics::Monitors;
use crate::petname;
use crate::service::{Acn, OnionListener};
use crate::storage::{FileMessageStore, MessageStore, SqliteMessageStore};
use crate::tokens::TokenServer;

pub const MESSAGES_FILE: &str = "cwtch.messages";

const ONION_SUFFIX: &str = ".onion";

/// High level information about the server for bundling applications.
#[derive(Debug, Clone, Copy)]
pub struct Statistics {
    pub total_messages: i64,
}

struct ServerInner {
    running: bool,
    board_listener: Option<OnionListener>,
    token_listener: Option<OnionListener>,
    monitors: Option<Monitors>,
    store: Option<Arc<dyn MessageStore>>,
    // held here so shutdown releases the database lock, allowing the
    // directory to be reloaded by a fresh server instance
    tokens: Option<Arc<TokenServer>>,
    // metrics are collected per session; counts already on disk at startup
    // are carried separately
    existing_message_count: i64,
}

/// A complete relay server: board endpoint, token issuance endpoint and the
/// operational state shared between them.
pub struct Server {
    config: Arc<ConfigStore>,
    token_public_b64: String,
    conn_gauge: Arc<AtomicUsize>,
    public_key: [u8; 32],
    hostname: String,
    token_hostname: String,
    inner: RwLock<ServerInner>,
}

impl Server {
    /// Creates a server from its configuration, opening the spent-token
    /// database under the config directory.
    pub fn new(config: ConfigStore) -> Result<Server, ServerError> {
        let identity = config.identity()?;
        let token_identity = config.token_identity()?;
        let tokens = Arc::new(TokenServer::open(config.token_k()?, &config.config_dir())?);
        info!("token service Y: {}", tokens.public_key_b64());

        Ok(Server {
            public_key: identity.public_key(),
            hostname: identity.hostname(),
            token_hostname: token_identity.hostname(),
            token_public_b64: tokens.public_key_b64(),
            config: Arc::new(config),
            conn_gauge: Arc::new(AtomicUsize::new(0)),
            inner: RwLock::new(ServerInner {
                running: false,
                board_listener: None,
                token_listener: None,
                monitors: None,
                store: None,
                tokens: Some(tokens),
                existing_message_count: 0,
            }),
        })
    }

    /// Starts both endpoints. Idempotent: calling run on a running server
    /// returns success without side effects.
    pub async fn run(&self, acn: &dyn Acn) -> Result<(), ServerError> {
        let mut inner = self.inner.write().await;
        if inner.running {
            return Ok(());
        }

        let identity = self.config.identity()?;
        let token_identity = self.config.token_identity()?;
        let dir = self.config.config_dir();
        let reporting = self.config.reporting();

        let monitors = Monitors::start(
            self.conn_gauge.clone(),
            &dir,
            reporting.log_metrics_to_file,
        );

        let store: Result<Arc<dyn MessageStore>, ServerError> =
            match self.config.get_attribute(ATTR_STORAGE_TYPE).as_deref() {
                Some(STORAGE_TYPE_FILE) => FileMessageStore::open(
                    &dir,
                    self.config.max_buffer_lines(),
                    monitors.message_counter.clone(),
                )
                .map(|s| Arc::new(s) as Arc<dyn MessageStore>),
                _ => SqliteMessageStore::open(
                    &dir.join(MESSAGES_FILE),
                    monitors.message_counter.clone(),
                )
                .map(|s| Arc::new(s) as Arc<dyn MessageStore>),
            };
        let store = match store {
            Ok(store) => store,
            Err(e) => {
                monitors.stop();
                return Err(e);
            }
        };
        let existing_message_count = store.count();

        // reopen the spent-token database when restarting after a shutdown
        let tokens = match &inner.tokens {
            Some(tokens) => tokens.clone(),
            None => {
                let k = match self.config.token_k() {
                    Ok(k) => k,
                    Err(e) => {
                        monitors.stop();
                        store.close();
                        return Err(e);
                    }
                };
                match TokenServer::open(k, &dir) {
                    Ok(tokens) => {
                        let tokens = Arc::new(tokens);
                        inner.tokens = Some(tokens.clone());
                        tokens
                    }
                    Err(e) => {
                        monitors.stop();
                        store.close();
                        return Err(e);
                    }
                }
            }
        };

        let board_chain = Arc::new(
            ApplicationChain::new()
                .chain(Arc::new(ProofOfWorkApp::new()))
                .chain(Arc::new(TokenApp::new(TokenAppMode::Spend, tokens.clone())))
                .chain(Arc::new(TokenBoardApp::new(store.clone(), tokens.clone()))),
        );
        let token_chain = Arc::new(
            ApplicationChain::new()
                .chain(Arc::new(ProofOfWorkApp::new()))
                .chain(Arc::new(TokenApp::new(TokenAppMode::Issue, tokens))),
        );

        let board_tcp = match acn.listen(&identity).await {
            Ok(l) => l,
            Err(e) => {
                monitors.stop();
                store.close();
                return Err(e);
            }
        };
        let token_tcp = match acn.listen(&token_identity).await {
            Ok(l) => l,
            Err(e) => {
                monitors.stop();
                store.close();
                return Err(e);
            }
        };
        info!("relay server running on {}", self.onion());

        inner.board_listener = Some(OnionListener::spawn(
            board_tcp,
            board_chain,
            self.conn_gauge.clone(),
        ));
        inner.token_listener = Some(OnionListener::spawn(
            token_tcp,
            token_chain,
            Arc::new(AtomicUsize::new(0)),
        ));
        inner.monitors = Some(monitors);
        inner.store = Some(store);
        inner.existing_message_count = existing_message_count;
        inner.running = true;
        Ok(())
    }

    /// Whether the server is running, plus an error naming any endpoint
    /// whose task has fallen over.
    pub async fn check_status(&self) -> (bool, Option<ServerError>) {
        let inner = self.inner.read().await;
        let board = inner
            .board_listener
            .as_ref()
            .map(OnionListener::stopped)
            .unwrap_or(false);
        let token = inner
            .token_listener
            .as_ref()
            .map(OnionListener::stopped)
            .unwrap_or(false);
        if inner.running && (board || token) {
            return (inner.running, Some(ServerError::ComponentDown { board, token }));
        }
        (inner.running, None)
    }

    /// Tears down, in order: listeners, metrics, token database, message
    /// store.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.write().await;
        if let Some(listener) = inner.board_listener.take() {
            listener.shutdown().await;
        }
        if let Some(listener) = inner.token_listener.take() {
            listener.shutdown().await;
        }
        if let Some(monitors) = inner.monitors.take() {
            monitors.stop();
        }
        if let Some(tokens) = inner.tokens.take() {
            tokens.close();
        }
        if let Some(store) = inner.store.take() {
            store.close();
        }
        inner.running = false;
    }

    /// Removes the server's state from disk. An encrypted server requires
    /// the password its config was created with.
    pub async fn delete(&self, password: &str) -> Result<(), ServerError> {
        if self.config.encrypted() && !self.config.check_password(password) {
            return Err(ServerError::BadPassword);
        }
        self.shutdown().await;
        fs::remove_dir_all(self.config.config_dir())
            .map_err(|e| ServerError::Config(e.to_string()))?;
        Ok(())
    }

    pub async fn get_statistics(&self) -> Statistics {
        let inner = self.inner.read().await;
        let session = inner
            .monitors
            .as_ref()
            .map(|m| m.total_message_counter.count() + m.message_counter.count())
            .unwrap_or(0);
        Statistics {
            total_messages: inner.existing_message_count.max(0) + session as i64,
        }
    }

    pub fn configure_autostart(&self, autostart: bool) -> Result<(), ServerError> {
        self.config
            .set_attribute(ATTR_AUTOSTART, if autostart { "true" } else { "false" })
    }

    pub fn set_attribute(&self, key: &str, value: &str) -> Result<(), ServerError> {
        self.config.set_attribute(key, value)
    }

    pub fn get_attribute(&self, key: &str) -> Option<String> {
        self.config.get_attribute(key)
    }

    /// The signed bundle binding the board address to the token endpoint
    /// and the token service public parameter.
    pub fn key_bundle(&self) -> Result<KeyBundle, ServerError> {
        let identity = self.config.identity()?;
        Ok(KeyBundle::new_signed(
            &identity,
            &self.hostname,
            &self.token_hostname,
            &self.token_public_b64,
        ))
    }

    /// The reachable address of the board endpoint.
    pub fn onion(&self) -> String {
        format!("{}{}", self.hostname, ONION_SUFFIX)
    }

    /// The reachable address of the token issuance endpoint.
    pub fn token_onion(&self) -> String {
        format!("{}{}", self.token_hostname, ONION_SUFFIX)
    }

    /// `server:` + the base64 encoded key bundle; importable by clients.
    pub fn server_bundle(&self) -> Result<String, ServerError> {
        Ok(format!(
            "server:{}",
            STANDARD.encode(self.key_bundle()?.serialize())
        ))
    }

    /// The server bundle plus a fresh group invite bound to this server,
    /// used by clients on first import.
    pub fn tofu_bundle(&self) -> Result<String, ServerError> {
        let invite = GroupInvite::new(&self.onion()).encode();
        Ok(format!("tofubundle:{}||{}", self.server_bundle()?, invite))
    }

    /// Eight-word petname of the board public key.
    pub fn hash_name(&self) -> String {
        petname::hash_name(&self.public_key)
    }
}
