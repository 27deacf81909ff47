use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::ServerError;
use crate::metrics::Counter;
use crate::wire::base64_bytes;

const FILE_STORE_PARTITIONS: usize = 10;
const FILE_STORE_FILENAME: &str = "cwtch.messages";
const MESSAGES_DIRECTORY: &str = "messages";

/// An opaque group message. The signature is the canonical identity of the
/// message; the server never interprets the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedGroupMessage {
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// A store of relayed group messages. Implementations serialize concurrent
/// writers; insertion order is the only ordering exposed.
pub trait MessageStore: Send + Sync {
    /// Persists one message. Messages with an empty signature are dropped,
    /// duplicates of an already stored signature are ignored.
    fn add(&self, msg: EncryptedGroupMessage);

    /// Every stored message in insertion order.
    fn fetch_all(&self) -> Vec<EncryptedGroupMessage>;

    /// The suffix of messages starting at `signature` (inclusive). An empty
    /// or unknown signature yields the full history so that clients re-sync
    /// from zero instead of silently losing messages.
    fn fetch_from(&self, signature: &[u8]) -> Vec<EncryptedGroupMessage>;

    /// Total number of stored messages, -1 on error.
    fn count(&self) -> i64;

    /// Releases statements and the underlying handle.
    fn close(&self);
}

/// SQLite-backed message store. This is the production store: a single
/// append-only table keyed by an autoincrement id with a UNIQUE signature
/// column, both payload columns held as base64 text.
pub struct SqliteMessageStore {
    conn: Mutex<Option<Connection>>,
    counter: Arc<Counter>,
}

impl SqliteMessageStore {
    pub fn open(path: &Path, counter: Arc<Counter>) -> Result<SqliteMessageStore, ServerError> {
        let conn = Connection::open(path).map_err(|e| ServerError::Storage(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signature TEXT UNIQUE NOT NULL,
                ciphertext TEXT NOT NULL
            )",
        )
        .map_err(|e| ServerError::Storage(e.to_string()))?;
        Ok(SqliteMessageStore {
            conn: Mutex::new(Some(conn)),
            counter,
        })
    }

    fn collect_rows(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Vec<EncryptedGroupMessage> {
        let mut stmt = match conn.prepare_cached(sql) {
            Ok(s) => s,
            Err(e) => {
                warn!("message store query failed: {}", e);
                return vec![];
            }
        };
        let rows = stmt.query_map(args, |row| {
            let signature: String = row.get(0)?;
            let ciphertext: String = row.get(1)?;
            Ok((signature, ciphertext))
        });
        let mut out = vec![];
        match rows {
            Ok(rows) => {
                for row in rows.flatten() {
                    match (STANDARD.decode(&row.0), STANDARD.decode(&row.1)) {
                        (Ok(signature), Ok(ciphertext)) => out.push(EncryptedGroupMessage {
                            signature,
                            ciphertext,
                        }),
                        _ => warn!("message store row was not valid base64, skipping"),
                    }
                }
            }
            Err(e) => warn!("message store query failed: {}", e),
        }
        out
    }
}

impl MessageStore for SqliteMessageStore {
    fn add(&self, msg: EncryptedGroupMessage) {
        if msg.signature.is_empty() {
            return;
        }
        let guard = self.conn.lock().expect("store lock");
        let Some(conn) = guard.as_ref() else {
            warn!("add on closed message store");
            return;
        };
        let result = conn
            .prepare_cached("INSERT INTO messages (signature, ciphertext) VALUES (?1, ?2)")
            .and_then(|mut stmt| {
                stmt.execute(params![
                    STANDARD.encode(&msg.signature),
                    STANDARD.encode(&msg.ciphertext)
                ])
            });
        match result {
            Ok(_) => self.counter.add(1),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                debug!("dropping message with duplicate signature");
            }
            Err(e) => warn!("could not insert message: {}", e),
        }
    }

    fn fetch_all(&self) -> Vec<EncryptedGroupMessage> {
        let guard = self.conn.lock().expect("store lock");
        let Some(conn) = guard.as_ref() else {
            return vec![];
        };
        Self::collect_rows(
            conn,
            "SELECT signature, ciphertext FROM messages ORDER BY id ASC",
            &[],
        )
    }

    fn fetch_from(&self, signature: &[u8]) -> Vec<EncryptedGroupMessage> {
        if signature.is_empty() {
            return self.fetch_all();
        }
        let suffix = {
            let guard = self.conn.lock().expect("store lock");
            let Some(conn) = guard.as_ref() else {
                return vec![];
            };
            Self::collect_rows(
                conn,
                "SELECT signature, ciphertext FROM messages
                 WHERE id >= (SELECT id FROM messages WHERE signature = ?1)
                 ORDER BY id ASC",
                &[&STANDARD.encode(signature)],
            )
        };
        if suffix.is_empty() {
            // unknown or purged resumption point: fall back to a full sync
            return self.fetch_all();
        }
        suffix
    }

    fn count(&self) -> i64 {
        let guard = self.conn.lock().expect("store lock");
        let Some(conn) = guard.as_ref() else {
            return -1;
        };
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap_or_else(|e| {
                warn!("could not count messages: {}", e);
                -1
            })
    }

    fn close(&self) {
        let mut guard = self.conn.lock().expect("store lock");
        guard.take();
    }
}

struct FileStoreInner {
    directory: PathBuf,
    active: File,
    file_pos: usize,
    max_buffer_lines: usize,
    buffer: Vec<Option<EncryptedGroupMessage>>,
    buffer_pos: usize,
    rotated: bool,
    signatures: HashSet<Vec<u8>>,
}

impl FileStoreInner {
    fn partition_path(&self, i: usize) -> PathBuf {
        self.directory.join(format!("{}.{}", FILE_STORE_FILENAME, i))
    }

    fn update_buffer(&mut self, msg: EncryptedGroupMessage) {
        if let Some(old) = self.buffer[self.buffer_pos].take() {
            self.signatures.remove(&old.signature);
        }
        self.signatures.insert(msg.signature.clone());
        self.buffer[self.buffer_pos] = Some(msg);
        self.buffer_pos += 1;
        if self.buffer_pos == self.max_buffer_lines {
            self.buffer_pos = 0;
            self.rotated = true;
        }
    }

    fn rotate_partitions(&mut self) {
        let _ = fs::remove_file(self.partition_path(FILE_STORE_PARTITIONS - 1));
        for i in (0..FILE_STORE_PARTITIONS - 1).rev() {
            let _ = fs::rename(self.partition_path(i), self.partition_path(i + 1));
        }
        match OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(self.partition_path(0))
        {
            Ok(f) => {
                self.active = f;
                self.file_pos = 0;
            }
            Err(e) => warn!("could not open new message store partition: {}", e),
        }
    }
}

/// Legacy partitioned flat-file store retaining the most recent
/// `max_buffer_lines` messages across ten rotating log partitions.
pub struct FileMessageStore {
    inner: Mutex<Option<FileStoreInner>>,
    counter: Arc<Counter>,
}

impl FileMessageStore {
    pub fn open(
        config_dir: &Path,
        max_buffer_lines: usize,
        counter: Arc<Counter>,
    ) -> Result<FileMessageStore, ServerError> {
        let directory = config_dir.join(MESSAGES_DIRECTORY);
        fs::create_dir_all(&directory).map_err(|e| ServerError::Storage(e.to_string()))?;

        let mut buffer: Vec<Option<EncryptedGroupMessage>> = Vec::with_capacity(max_buffer_lines);
        buffer.resize_with(max_buffer_lines, || None);
        let mut inner = None;
        let mut signatures = HashSet::new();
        let mut buffer_pos = 0;
        let mut rotated = false;
        let mut active: Option<(File, usize)> = None;

        // oldest partition first so the ring ends up in insertion order
        for i in (0..FILE_STORE_PARTITIONS).rev() {
            let path = directory.join(format!("{}.{}", FILE_STORE_FILENAME, i));
            let f = match OpenOptions::new().create(true).append(true).read(true).open(&path) {
                Ok(f) => f,
                Err(e) => {
                    warn!("message store could not open {}: {}", path.display(), e);
                    continue;
                }
            };
            let mut file_pos = 0;
            let read_handle = match f.try_clone() {
                Ok(h) => h,
                Err(e) => {
                    warn!("message store could not reopen {}: {}", path.display(), e);
                    continue;
                }
            };
            for line in BufReader::new(read_handle).lines().map_while(Result::ok) {
                file_pos += 1;
                if let Ok(msg) = serde_json::from_str::<EncryptedGroupMessage>(&line) {
                    if let Some(old) = buffer[buffer_pos].take() {
                        signatures.remove(&old.signature);
                    }
                    signatures.insert(msg.signature.clone());
                    buffer[buffer_pos] = Some(msg);
                    buffer_pos += 1;
                    if buffer_pos == max_buffer_lines {
                        buffer_pos = 0;
                        rotated = true;
                    }
                }
            }
            active = Some((f, file_pos));
        }

        match active {
            Some((f, file_pos)) => {
                inner.replace(FileStoreInner {
                    directory,
                    active: f,
                    file_pos,
                    max_buffer_lines,
                    buffer,
                    buffer_pos,
                    rotated,
                    signatures,
                });
            }
            None => {
                return Err(ServerError::Storage(format!(
                    "could not create a log file to write to in {}",
                    directory.display()
                )))
            }
        }

        Ok(FileMessageStore {
            inner: Mutex::new(inner),
            counter,
        })
    }
}

impl MessageStore for FileMessageStore {
    fn add(&self, msg: EncryptedGroupMessage) {
        if msg.signature.is_empty() {
            return;
        }
        let mut guard = self.inner.lock().expect("store lock");
        let Some(inner) = guard.as_mut() else {
            warn!("add on closed message store");
            return;
        };
        if inner.signatures.contains(&msg.signature) {
            debug!("dropping message with duplicate signature");
            return;
        }
        match serde_json::to_string(&msg) {
            Ok(line) => {
                if let Err(e) = writeln!(inner.active, "{}", line) {
                    warn!("could not append message: {}", e);
                }
                inner.file_pos += 1;
                if inner.file_pos >= inner.max_buffer_lines / FILE_STORE_PARTITIONS {
                    inner.rotate_partitions();
                }
            }
            Err(e) => warn!("could not serialize message: {}", e),
        }
        inner.update_buffer(msg);
        self.counter.add(1);
    }

    fn fetch_all(&self) -> Vec<EncryptedGroupMessage> {
        let guard = self.inner.lock().expect("store lock");
        let Some(inner) = guard.as_ref() else {
            return vec![];
        };
        let ordered: Vec<&Option<EncryptedGroupMessage>> = if inner.rotated {
            inner.buffer[inner.buffer_pos..]
                .iter()
                .chain(inner.buffer[..inner.buffer_pos].iter())
                .collect()
        } else {
            inner.buffer[..inner.buffer_pos].iter().collect()
        };
        ordered.into_iter().filter_map(|m| m.clone()).collect()
    }

    fn fetch_from(&self, signature: &[u8]) -> Vec<EncryptedGroupMessage> {
        let all = self.fetch_all();
        if signature.is_empty() {
            return all;
        }
        match all.iter().position(|m| m.signature == signature) {
            Some(i) => all[i..].to_vec(),
            None => all,
        }
    }

    fn count(&self) -> i64 {
        let guard = self.inner.lock().expect("store lock");
        match guard.as_ref() {
            Some(inner) if inner.rotated => inner.max_buffer_lines as i64,
            Some(inner) => inner.buffer_pos as i64,
            None => -1,
        }
    }

    fn close(&self) {
        let mut guard = self.inner.lock().expect("store lock");
        guard.take();
    }
}
