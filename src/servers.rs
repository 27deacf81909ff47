//! Manager for a set of servers rooted under one parent directory, each
//! living in a subdirectory named by its board onion address.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::config::{Config, ConfigStore};
use crate::errors::ServerError;
use crate::identity::is_valid_hostname;
use crate::server::Server;

/// Sentinel password for servers whose operator did not pick one. The
/// config is still encrypted at rest, just with a publicly known secret.
pub const DEFAULT_PASSWORD: &str = "be gay do crime";

pub struct Servers {
    directory: PathBuf,
    servers: Mutex<HashMap<String, Arc<Server>>>,
}

impl Servers {
    pub fn new(directory: PathBuf) -> Servers {
        Servers {
            directory,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a new server under the parent directory. The subdirectory is
    /// named by the new server's onion address and its config is encrypted
    /// with `password`.
    pub fn create_server(&self, password: &str) -> Result<Arc<Server>, ServerError> {
        let config = Config::generate();
        let hostname = config.identity()?.hostname();
        let dir = self.directory.join(&hostname);

        let store = ConfigStore::create_with(&dir, config, Some(password))?;
        let server = Arc::new(Server::new(store)?);
        info!("created server {}", server.onion());

        self.servers
            .lock()
            .expect("servers lock")
            .insert(server.onion(), server.clone());
        Ok(server)
    }

    /// Scans the parent directory for server subdirectories and loads every
    /// config the password opens. Unreadable entries are skipped with a
    /// warning. Returns the onions of the servers loaded.
    pub fn load_servers(&self, password: &str) -> Result<Vec<String>, ServerError> {
        let entries =
            fs::read_dir(&self.directory).map_err(|e| ServerError::Config(e.to_string()))?;

        let mut loaded = vec![];
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_valid_hostname(name) {
                continue;
            }
            let server = ConfigStore::load(&path, Some(password)).and_then(Server::new);
            match server {
                Ok(server) => {
                    let server = Arc::new(server);
                    let onion = server.onion();
                    self.servers
                        .lock()
                        .expect("servers lock")
                        .insert(onion.clone(), server);
                    loaded.push(onion);
                }
                Err(e) => warn!("skipping server directory {}: {}", path.display(), e),
            }
        }
        Ok(loaded)
    }

    pub fn get_server(&self, onion: &str) -> Option<Arc<Server>> {
        self.servers.lock().expect("servers lock").get(onion).cloned()
    }

    pub fn list_servers(&self) -> Vec<String> {
        self.servers.lock().expect("servers lock").keys().cloned().collect()
    }

    /// Shuts down every registered server.
    pub async fn shutdown(&self) {
        let servers: Vec<Arc<Server>> = self
            .servers
            .lock()
            .expect("servers lock")
            .values()
            .cloned()
            .collect();
        for server in servers {
            server.shutdown().await;
        }
    }
}
