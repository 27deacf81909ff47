//! Hidden-service listener runtime: the interface to the anonymity network
//! plus the accept loop wiring connections to an application chain.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::applications::{ApplicationChain, ConnectionCtx};
use crate::errors::ServerError;
use crate::identity::Identity;
use crate::wire::{read_frame, write_frame, Frame};

/// The anonymity-network connectivity layer. The production implementation
/// drives the network's control port; that client lives outside this crate.
#[async_trait]
pub trait Acn: Send + Sync {
    /// Publishes a hidden service for `identity` and returns the local
    /// listener backing it.
    async fn listen(&self, identity: &Identity) -> Result<TcpListener, ServerError>;

    /// Opens a connection to a published hostname.
    async fn connect(&self, hostname: &str) -> Result<TcpStream, ServerError>;
}

/// Loopback connectivity mapping hostnames to local ports. Used by tests
/// and local deployments.
pub struct LocalAcn {
    registry: Mutex<HashMap<String, SocketAddr>>,
}

impl LocalAcn {
    pub fn new() -> LocalAcn {
        LocalAcn {
            registry: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LocalAcn {
    fn default() -> Self {
        LocalAcn::new()
    }
}

#[async_trait]
impl Acn for LocalAcn {
    async fn listen(&self, identity: &Identity) -> Result<TcpListener, ServerError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| ServerError::Connection(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Connection(e.to_string()))?;
        self.registry
            .lock()
            .expect("registry lock")
            .insert(identity.hostname(), addr);
        Ok(listener)
    }

    async fn connect(&self, hostname: &str) -> Result<TcpStream, ServerError> {
        let hostname = hostname.trim_end_matches(".onion");
        let addr = {
            let registry = self.registry.lock().expect("registry lock");
            registry.get(hostname).copied()
        };
        let addr = addr
            .ok_or_else(|| ServerError::Connection(format!("unknown hostname {}", hostname)))?;
        TcpStream::connect(addr)
            .await
            .map_err(|e| ServerError::Connection(e.to_string()))
    }
}

/// A running hidden-service endpoint: the accept-loop task plus the flags
/// the facade polls for status.
pub struct OnionListener {
    stopped: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl OnionListener {
    /// Spawns the accept loop. Each accepted connection runs the chain's
    /// frame loop on its own task and is counted in `conn_gauge` while open.
    pub fn spawn(
        listener: TcpListener,
        chain: Arc<ApplicationChain>,
        conn_gauge: Arc<AtomicUsize>,
    ) -> OnionListener {
        let stopped = Arc::new(AtomicBool::new(false));
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task_stopped = stopped.clone();
        let handle = tokio::spawn(async move {
            let mut connections: Vec<JoinHandle<()>> = vec![];
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("accepted connection from {}", peer);
                            let chain = chain.clone();
                            let gauge = conn_gauge.clone();
                            gauge.fetch_add(1, Ordering::Relaxed);
                            connections.retain(|c| !c.is_finished());
                            connections.push(tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, chain).await {
                                    debug!("connection from {} closed: {}", peer, e);
                                }
                                gauge.fetch_sub(1, Ordering::Relaxed);
                            }));
                        }
                        Err(e) => {
                            warn!("listener accept failed: {}", e);
                            break;
                        }
                    }
                }
            }
            // open connections do not outlive the listener
            for connection in connections {
                connection.abort();
                let _ = connection.await;
            }
            task_stopped.store(true, Ordering::Relaxed);
        });

        OnionListener {
            stopped,
            shutdown,
            handle,
        }
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Per-connection frame loop. Token failures are answered in-band; any
/// other error drops the connection.
async fn handle_connection(
    stream: TcpStream,
    chain: Arc<ApplicationChain>,
) -> Result<(), ServerError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut ctx = ConnectionCtx::new();

    for frame in chain.on_connect(&mut ctx).await {
        write_frame(&mut write_half, &frame).await?;
    }

    loop {
        let Some(frame) = read_frame(&mut reader).await? else {
            return Ok(());
        };
        match chain.dispatch(&mut ctx, frame).await {
            Ok(replies) => {
                for frame in replies {
                    write_frame(&mut write_half, &frame).await?;
                }
            }
            Err(e) if e.is_token_failure() => {
                write_frame(&mut write_half, &Frame::error(&e)).await?;
            }
            Err(e) => {
                let _ = write_frame(&mut write_half, &Frame::error(&e)).await;
                return Err(e);
            }
        }
    }
}
