use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, warn};
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty};
use tokio::sync::mpsc;

use crate::auth::KeyAuthenticator;
use crate::logging::ConnectionLogger;
use crate::models::SshKey;
use crate::proxy::ProxyError;

/// The only authentication method the bastion ever advertises.
pub(crate) fn publickey_methods() -> MethodSet {
    MethodSet::from([MethodKind::PublicKey].as_slice())
}

/// Snapshot of a successful public-key authentication, handed to the
/// connection task together with the session channel.
#[derive(Clone)]
pub struct AuthorizedClient {
    pub binding: SshKey,
    pub username: String,
    pub fingerprint: String,
}

/// Server-side callback surface for one client connection.
///
/// Single-use: russh instantiates one per TCP stream and invokes the
/// callbacks from that connection's task only. No shell, exec or
/// non-session channel ever passes this layer.
pub struct ClientHandler {
    authenticator: Arc<KeyAuthenticator>,
    source_ip: IpAddr,
    channel_tx: mpsc::UnboundedSender<(Channel<Msg>, AuthorizedClient)>,
    authorized: Option<AuthorizedClient>,
}

impl ClientHandler {
    pub fn new(
        authenticator: Arc<KeyAuthenticator>,
        source_ip: IpAddr,
        channel_tx: mpsc::UnboundedSender<(Channel<Msg>, AuthorizedClient)>,
    ) -> Self {
        Self {
            authenticator,
            source_ip,
            channel_tx,
            authorized: None,
        }
    }

    fn presented_username(&self) -> &str {
        self.authorized
            .as_ref()
            .map_or("unauthenticated", |client| client.username.as_str())
    }
}

impl russh::server::Handler for ClientHandler {
    type Error = ProxyError;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let blob = public_key.public_key_bytes();

        match self.authenticator.authenticate(user, &blob, self.source_ip) {
            Some(binding) => {
                self.authorized = Some(AuthorizedClient {
                    fingerprint: binding.fingerprint.clone(),
                    username: user.to_owned(),
                    binding,
                });
                Ok(Auth::Accept)
            }
            None => Ok(Auth::Reject {
                proceed_with_methods: None,
            }),
        }
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        ConnectionLogger::log_denied(
            self.source_ip,
            "N/A",
            user,
            "password authentication not allowed",
        );
        Ok(Auth::Reject {
            proceed_with_methods: Some(publickey_methods()),
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(client) = self.authorized.clone() else {
            return Ok(false);
        };

        // The connection task owns the channel from here on. When it is
        // gone there is nothing left to relay into.
        Ok(self.channel_tx.send((channel, client)).is_ok())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            "Direct-tcpip channel to {host_to_connect}:{port_to_connect} refused for {} from {}",
            self.presented_username(),
            self.source_ip
        );
        Ok(false)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Pty request denied for {} from {}",
            self.presented_username(),
            self.source_ip
        );
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(
            "Shell request denied for {} from {}",
            self.presented_username(),
            self.source_ip
        );
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(
            "Exec request denied for {} from {} (command: {})",
            self.presented_username(),
            self.source_ip,
            String::from_utf8_lossy(data)
        );
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name == "sftp" {
            session.channel_success(channel)?;
        } else {
            warn!(
                "Subsystem request denied: {name} for {} from {}",
                self.presented_username(),
                self.source_ip
            );
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        _address: &str,
        _port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // The port is left untouched so the requested value is echoed back.
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
