//! TCP server listener
//!
//! Accepts USB/IP connections on the configured port, enforces the client
//! allow-list before any protocol bytes are exchanged, bounds the number
//! of concurrent sessions, and spawns one session task per accepted
//! connection.

use crate::config::ServerConfig;
use crate::network::session::Session;
use crate::usb::adapter::TransferAdapter;
use crate::usb::registry::DeviceRegistry;
use anyhow::{Context as _, Result};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub struct UsbIpServer {
    listener: TcpListener,
    registry: Arc<DeviceRegistry>,
    adapter: TransferAdapter,
    /// Allowed client addresses (empty = allow all)
    allowed_clients: HashSet<IpAddr>,
    session_permits: Arc<Semaphore>,
}

impl UsbIpServer {
    /// Bind the listener described by `config`
    pub async fn bind(
        config: &ServerConfig,
        registry: Arc<DeviceRegistry>,
        adapter: TransferAdapter,
    ) -> Result<Self> {
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;

        let allowed_clients = parse_allowlist(&config.security.allowed_clients);
        if allowed_clients.is_empty() {
            warn!("client allow-list empty - accepting all connections");
        } else {
            info!(
                "client allow-list enabled with {} entries",
                allowed_clients.len()
            );
        }

        Ok(Self {
            listener,
            registry,
            adapter,
            allowed_clients,
            session_permits: Arc::new(Semaphore::new(config.server.max_sessions)),
        })
    }

    /// The address the listener actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails. Each accepted
    /// connection runs as its own task; a failure in one session never
    /// reaches another or the accept loop.
    pub async fn run(self) -> Result<()> {
        info!("server running, waiting for connections...");
        let mut sessions = JoinSet::new();

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };

            // Reap finished session tasks
            while sessions.try_join_next().is_some() {}

            // Allow-list check happens before any protocol bytes
            if !self.allowed_clients.is_empty() && !self.allowed_clients.contains(&peer.ip()) {
                warn!("rejected connection from unauthorized address {}", peer);
                continue;
            }

            let permit = match Arc::clone(&self.session_permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // No queueing beyond the bound; drop and move on
                    warn!("session limit reached, dropping connection from {}", peer);
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay failed for {}: {}", peer, e);
            }

            info!("accepted connection from {}", peer);
            let session = Session::new(
                peer.to_string(),
                Arc::clone(&self.registry),
                self.adapter.clone(),
            );
            sessions.spawn(async move {
                let _permit = permit;
                if let Err(e) = session.run(stream).await {
                    error!("session error for {}: {:#}", peer, e);
                }
                info!("connection closed: {}", peer);
            });
        }
    }
}

/// Parse allow-list entries, skipping malformed ones with a warning
fn parse_allowlist(allowed_clients: &[String]) -> HashSet<IpAddr> {
    let mut allowlist = HashSet::new();

    for client in allowed_clients {
        if client.is_empty() {
            continue;
        }
        match client.parse::<IpAddr>() {
            Ok(addr) => {
                allowlist.insert(addr);
            }
            Err(e) => {
                warn!("ignoring bad allow-list entry '{}': {}", client, e);
            }
        }
    }

    allowlist
}
