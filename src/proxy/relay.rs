use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use log::debug;
use russh::{client, server, Channel, Disconnect};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use super::dialer::TargetHandler;
use crate::logging::{ConnectionLogger, RelayLogger};

/// One relay frame.
const RELAY_BUFFER_SIZE: usize = 4096;

/// Registry key: source address plus a fingerprint prefix.
pub fn connection_id(source_ip: IpAddr, fingerprint: &str) -> String {
    format!(
        "{}:{}",
        source_ip,
        fingerprint.get(..8).unwrap_or(fingerprint)
    )
}

pub struct ActiveSession {
    pub fingerprint: String,
    pub source_ip: IpAddr,
    pub target_host: String,
    shutdown: watch::Sender<bool>,
}

impl ActiveSession {
    /// Builds a registry entry together with the shutdown signal its relay
    /// workers select against.
    pub(crate) fn new(
        fingerprint: String,
        source_ip: IpAddr,
        target_host: String,
    ) -> (Self, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        (
            Self {
                fingerprint,
                source_ip,
                target_host,
                shutdown,
            },
            shutdown_rx,
        )
    }
}

/// Live sessions keyed by connection id. One mutex, constant-time ops.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, ActiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: String, session: ActiveSession) {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .insert(id, session);
    }

    pub(crate) fn remove(&self, id: &str) -> Option<ActiveSession> {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Severs every live session. Relay workers observe the signal and
    /// exit, which drives each session through its normal teardown.
    pub fn shutdown_all(&self) {
        for session in self
            .sessions
            .lock()
            .expect("session registry poisoned")
            .values()
        {
            let _ = session.shutdown.send(true);
        }
    }
}

/// Pairs the two channels and moves bytes both ways until either side
/// closes, then tears the session down: both channels, then the outbound
/// client, each close isolated from the others.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_relay(
    client_channel: Channel<server::Msg>,
    target_channel: Channel<client::Msg>,
    target_handle: client::Handle<TargetHandler>,
    registry: Arc<SessionRegistry>,
    source_ip: IpAddr,
    fingerprint: String,
    target_host: String,
) {
    let id = connection_id(source_ip, &fingerprint);
    let (session, shutdown_rx) =
        ActiveSession::new(fingerprint.clone(), source_ip, target_host.clone());

    registry.register(id.clone(), session);
    RelayLogger::log_started(&id);

    let (client_read, client_write) = tokio::io::split(client_channel.into_stream());
    let (target_read, target_write) = tokio::io::split(target_channel.into_stream());

    let mut client_to_target = tokio::spawn(relay_direction(
        client_read,
        target_write,
        shutdown_rx.clone(),
        "client->target",
        id.clone(),
    ));
    let mut target_to_client = tokio::spawn(relay_direction(
        target_read,
        client_write,
        shutdown_rx,
        "target->client",
        id.clone(),
    ));

    // Either direction finishing tears the whole session down.
    let client_to_target_finished = tokio::select! {
        _ = &mut client_to_target => true,
        _ = &mut target_to_client => false,
    };

    if let Some(session) = registry.remove(&id) {
        let _ = session.shutdown.send(true);
    }

    if client_to_target_finished {
        let _ = target_to_client.await;
    } else {
        let _ = client_to_target.await;
    }

    if let Err(e) = target_handle
        .disconnect(Disconnect::ByApplication, "session closed", "")
        .await
    {
        debug!("Outbound disconnect for {id}: {e}");
    }

    ConnectionLogger::log_closed(source_ip, &fingerprint, &target_host);
    RelayLogger::log_teardown(&id);
}

/// Moves bytes one way. Partial writes are retried by `write_all`; a zero
/// read is a clean EOF; any I/O error or the session shutdown signal
/// terminates the worker.
pub(crate) async fn relay_direction<R, W>(
    mut source: R,
    mut dest: W,
    mut shutdown_rx: watch::Receiver<bool>,
    direction: &'static str,
    id: String,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; RELAY_BUFFER_SIZE];
    let mut transferred: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            read = source.read(&mut buffer) => match read {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = dest.write_all(&buffer[..n]).await {
                        debug!("Relay {id} {direction} write error: {e}");
                        break;
                    }
                    transferred += n as u64;
                }
                Err(e) => {
                    debug!("Relay {id} {direction} read error: {e}");
                    break;
                }
            },
        }
    }

    let _ = dest.shutdown().await;
    RelayLogger::log_direction_closed(&id, direction, transferred);
    transferred
}
