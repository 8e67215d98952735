use core::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use russh::server;
use russh::Channel;

use crate::models::Target;

mod dialer;
pub(crate) mod relay;

pub use dialer::TargetDialer;
pub use relay::{connection_id, SessionRegistry};

#[derive(Debug, Clone)]
pub enum ProxyError {
    /// Failed to get an address from the name lookup
    LookupFailure,
    Timeout,
    /// The target rejected the bastion's key
    NotAuthenticated,

    SshError(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LookupFailure => write!(f, "Failed to lookup IP address from hostname"),
            Self::Timeout => write!(f, "Connection to the target timed out."),
            Self::NotAuthenticated => write!(f, "Couldn't authenticate on the target."),
            Self::SshError(t) => write!(f, "{t}"),
        }
    }
}

impl std::error::Error for ProxyError {}

// Because russh::Error doesn't impl Clone we copy the errors we care about
// from russh, the rest gets converted to Strings
impl From<russh::Error> for ProxyError {
    fn from(value: russh::Error) -> Self {
        match value {
            russh::Error::NotAuthenticated => Self::NotAuthenticated,
            _ => Self::SshError(value.to_string()),
        }
    }
}

/// One authenticated client paired with its validated target.
///
/// `run` owns the whole outbound leg: it dials, relays until either side
/// closes and tears every held resource down before returning.
pub struct ProxySession {
    pub source_ip: IpAddr,
    pub fingerprint: String,
    pub target: Target,
}

impl ProxySession {
    pub async fn run(
        &self,
        client_channel: Channel<server::Msg>,
        dialer: &TargetDialer,
        registry: &Arc<SessionRegistry>,
    ) -> Result<(), ProxyError> {
        let (target_handle, target_channel) = dialer.connect(&self.target).await?;

        relay::run_relay(
            client_channel,
            target_channel,
            target_handle,
            registry.clone(),
            self.source_ip,
            self.fingerprint.clone(),
            self.target.host.clone(),
        )
        .await;

        Ok(())
    }
}
