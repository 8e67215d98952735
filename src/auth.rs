use std::net::IpAddr;
use std::sync::Arc;

use log::error;

use crate::db::Catalog;
use crate::fingerprint::key_fingerprint;
use crate::logging::ConnectionLogger;
use crate::models::{NewConnectionLog, SshKey};

/// Public-key authentication against the catalog.
///
/// The fingerprint alone decides. The presented username is recorded in the
/// event log but never used as an authorization input.
pub struct KeyAuthenticator {
    catalog: Arc<dyn Catalog>,
}

impl KeyAuthenticator {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    /// Decides whether the presented key blob may connect. Returns the
    /// matching binding on acceptance.
    pub fn authenticate(
        &self,
        username: &str,
        key_blob: &[u8],
        source_ip: IpAddr,
    ) -> Option<SshKey> {
        let fingerprint = key_fingerprint(key_blob);
        if fingerprint.is_empty() {
            self.deny(&fingerprint, username, source_ip, "invalid key blob");
            return None;
        }

        ConnectionLogger::log_attempt(source_ip, &fingerprint, username);

        let binding = match self.catalog.find_any(&fingerprint) {
            Ok(binding) => binding,
            Err(e) => {
                error!("Catalog lookup failed: {e}");
                None
            }
        };

        let Some(binding) = binding else {
            self.deny(&fingerprint, username, source_ip, "unknown fingerprint");
            return None;
        };

        if !binding.enabled {
            self.deny(&fingerprint, username, source_ip, "disabled");
            return None;
        }

        ConnectionLogger::log_auth_success(source_ip, &fingerprint, username);
        Some(binding)
    }

    fn deny(&self, fingerprint: &str, username: &str, source_ip: IpAddr, reason: &str) {
        ConnectionLogger::log_denied(source_ip, fingerprint, username, reason);

        let event = NewConnectionLog::denied(fingerprint, source_ip, username, reason);
        if let Err(e) = self.catalog.record_event(&event) {
            error!("Failed to record connection event: {e}");
        }
    }
}
