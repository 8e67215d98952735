use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use color_eyre::eyre::{eyre, Result};
use log::{debug, error, info, warn};
use russh::server;
use russh::Disconnect;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::auth::KeyAuthenticator;
use crate::config::Configuration;
use crate::db::Catalog;
use crate::hostkey;
use crate::logging::{AppLogger, ConnectionLogger};
use crate::models::NewConnectionLog;
use crate::proxy::{ProxySession, SessionRegistry, TargetDialer};
use crate::router::Router;

mod handler;

pub use handler::{AuthorizedClient, ClientHandler};

/// How long an authenticated client may take to open its first session
/// channel before the connection is abandoned.
const FIRST_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for live sessions to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Shared {
    authenticator: Arc<KeyAuthenticator>,
    router: Router,
    dialer: TargetDialer,
    registry: Arc<SessionRegistry>,
    catalog: Arc<dyn Catalog>,
    server_config: Arc<server::Config>,
    live_connections: Mutex<usize>,
    connection_cap: usize,
}

/// The listener and per-connection supervisor.
pub struct BastionServer {
    shared: Arc<Shared>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BastionServer {
    /// Loads the host identity, wires the components together and binds
    /// the listening socket.
    pub async fn bind(config: &Configuration, catalog: Arc<dyn Catalog>) -> Result<Self> {
        let host_key = hostkey::load_or_generate(&config.host_key_file, config.host_key_bits)
            .map_err(|e| eyre!("{e}"))?;

        let server_config = Arc::new(server::Config {
            methods: handler::publickey_methods(),
            keys: vec![host_key.clone()],
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        let shared = Arc::new(Shared {
            authenticator: Arc::new(KeyAuthenticator::new(catalog.clone())),
            router: Router::new(catalog.clone(), config.restricted_networks.clone()),
            dialer: TargetDialer::new(host_key, config.connection_timeout),
            registry: Arc::new(SessionRegistry::new()),
            catalog,
            server_config,
            live_connections: Mutex::new(0),
            connection_cap: config.global_connection_cap(),
        });

        let listener = TcpListener::bind((config.bind_addr, config.bind_port)).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            shared,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.shared.registry.clone()
    }

    /// Accepts until SIGINT or SIGTERM, then drains.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Accepts until `shutdown` resolves, then severs every live session
    /// and drains the connection handlers.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Self {
            shared,
            listener,
            local_addr,
        } = self;

        AppLogger::log_startup("bastion", env!("CARGO_PKG_VERSION"));
        info!("Bastion SSH server listening on {local_addr}");

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = shared.clone();
                        connections.spawn(handle_connection(shared, stream, peer));
                    }
                    Err(e) => error!("Error accepting connection: {e}"),
                },
                // Reap finished handlers so the set doesn't grow unbounded.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        AppLogger::log_shutdown("bastion", "shutdown requested");
        drop(listener);
        shared.registry.shutdown_all();

        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(
                "Forcibly aborting {} connection handler(s)",
                connections.len()
            );
            connections.shutdown().await;
        }

        info!("Bastion SSH server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {e}");
                    let _ = ctrl_c.await;
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// A slot against the global live-connection cap, released on drop.
struct ConnectionSlot {
    shared: Arc<Shared>,
}

impl ConnectionSlot {
    fn acquire(shared: &Arc<Shared>, source_ip: IpAddr) -> Option<Self> {
        let mut live = shared
            .live_connections
            .lock()
            .expect("connection counter poisoned");

        if *live >= shared.connection_cap {
            warn!("Connection limit exceeded, rejecting {source_ip}");
            return None;
        }

        *live += 1;
        Some(Self {
            shared: shared.clone(),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        *self
            .shared
            .live_connections
            .lock()
            .expect("connection counter poisoned") -= 1;
    }
}

/// Drives one client connection from handshake to teardown.
async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let source_ip = peer.ip();

    let Some(_slot) = ConnectionSlot::acquire(&shared, source_ip) else {
        return;
    };
    info!("New connection from {source_ip}");

    let (channel_tx, mut channel_rx) = mpsc::unbounded_channel();
    let handler = ClientHandler::new(shared.authenticator.clone(), source_ip, channel_tx);

    let session = match timeout(
        FIRST_CHANNEL_TIMEOUT,
        server::run_stream(shared.server_config.clone(), stream, handler),
    )
    .await
    {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            debug!("SSH handshake with {source_ip} failed: {e:?}");
            return;
        }
        Err(_) => {
            debug!("SSH handshake with {source_ip} timed out");
            return;
        }
    };
    let handle = session.handle();
    let transport = tokio::spawn(session);

    // The sender half dies with the handler, so a rejected or abandoned
    // authentication resolves this immediately instead of running out the
    // clock.
    let first_channel = timeout(FIRST_CHANNEL_TIMEOUT, channel_rx.recv()).await;

    let Some((channel, client)) = first_channel.ok().flatten() else {
        warn!("No authenticated channel established for {source_ip}");
        let _ = handle
            .disconnect(Disconnect::ByApplication, String::new(), String::new())
            .await;
        let _ = transport.await;
        return;
    };

    let Some(target) = shared
        .router
        .route(&client.binding, &client.username, source_ip)
    else {
        warn!("No target found for {source_ip}");
        let _ = handle
            .disconnect(Disconnect::ByApplication, String::new(), String::new())
            .await;
        let _ = transport.await;
        return;
    };

    let proxy_session = ProxySession {
        source_ip,
        fingerprint: client.fingerprint.clone(),
        target,
    };

    if let Err(e) = proxy_session
        .run(channel, &shared.dialer, &shared.registry)
        .await
    {
        error!("Failed to start proxy session for {source_ip}: {e}");
        ConnectionLogger::log_error(
            source_ip,
            &client.fingerprint,
            &client.username,
            &e.to_string(),
        );

        let event = NewConnectionLog::error(
            &client.fingerprint,
            source_ip,
            &proxy_session.target.host,
            &proxy_session.target.user,
            &client.username,
            &e.to_string(),
        );
        if let Err(log_error) = shared.catalog.record_event(&event) {
            error!("Failed to record connection event: {log_error}");
        }
    }

    let _ = handle
        .disconnect(
            Disconnect::ByApplication,
            String::from("session closed"),
            String::new(),
        )
        .await;
    let _ = transport.await;

    info!("Connection from {source_ip} closed");
}
