use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey};
use russh::Channel;
use tokio::net::lookup_host;
use tokio::time::timeout;

use super::ProxyError;
use crate::logging::SshLogger;
use crate::models::Target;

/// Outbound authentication is bounded separately from dial+handshake.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TargetHandler;

impl client::Handler for TargetHandler {
    type Error = ProxyError;

    // The bastion trusts the target network; bindings carry no pinned host
    // key to verify against.
    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Dials targets authenticated by the bastion's own key. The explicitly
/// passed key is the only credential ever offered; russh consults neither
/// an agent nor local key files.
#[derive(Clone)]
pub struct TargetDialer {
    key: Arc<PrivateKey>,
    connection_config: Arc<client::Config>,
    connect_timeout: Duration,
}

impl TargetDialer {
    pub fn new(key: PrivateKey, connect_timeout: Duration) -> Self {
        Self {
            key: key.into(),
            connection_config: Arc::new(client::Config::default()),
            connect_timeout,
        }
    }

    /// Opens an SSH session to the target. Returns the connected client
    /// together with an opened session channel.
    pub async fn connect(
        &self,
        target: &Target,
    ) -> Result<(client::Handle<TargetHandler>, Channel<client::Msg>), ProxyError> {
        let address = self.resolve(target).await?;

        SshLogger::log_outbound_attempt(target);

        let mut handle = timeout(
            self.connect_timeout,
            client::connect(self.connection_config.clone(), address, TargetHandler),
        )
        .await
        .map_err(|_| {
            SshLogger::log_outbound_failure(target, "connection timeout");
            ProxyError::Timeout
        })??;

        let hash_alg = handle.best_supported_rsa_hash().await?;

        let auth_result = timeout(
            AUTH_TIMEOUT,
            handle.authenticate_publickey(
                target.user.clone(),
                PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg.flatten()),
            ),
        )
        .await
        .map_err(|_| {
            SshLogger::log_outbound_failure(target, "authentication timeout");
            ProxyError::Timeout
        })??;

        if !auth_result.success() {
            SshLogger::log_outbound_failure(target, "authentication failed");
            return Err(ProxyError::NotAuthenticated);
        }

        let channel = handle.channel_open_session().await?;

        SshLogger::log_outbound_success(target);
        Ok((handle, channel))
    }

    async fn resolve(&self, target: &Target) -> Result<SocketAddr, ProxyError> {
        let lookup = format!("{}:{}", target.host, target.port);
        debug!("Resolving target address {lookup}");

        match lookup_host(lookup).await {
            Ok(mut addresses) => addresses.next().ok_or(ProxyError::LookupFailure),
            Err(e) => {
                debug!("Lookup failed: {e}");
                Err(ProxyError::LookupFailure)
            }
        }
    }
}
