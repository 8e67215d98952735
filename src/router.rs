use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use log::{error, info};

use crate::db::Catalog;
use crate::logging::ConnectionLogger;
use crate::models::{NewConnectionLog, SshKey, Target};

/// Turns an authenticated binding into a validated routing target.
pub struct Router {
    catalog: Arc<dyn Catalog>,
    restricted_networks: Vec<IpNet>,
}

impl Router {
    pub fn new(catalog: Arc<dyn Catalog>, restricted_networks: Vec<IpNet>) -> Self {
        Self {
            catalog,
            restricted_networks,
        }
    }

    /// Validates the binding's routing fields and returns the target, or
    /// `None` when the binding must not be routed. Every decision is
    /// recorded in the event log.
    pub fn route(&self, binding: &SshKey, username: &str, source_ip: IpAddr) -> Option<Target> {
        if !binding.enabled {
            self.deny(binding, username, source_ip, "key not valid or disabled");
            return None;
        }

        match self.validate_target(binding) {
            Ok(target) => {
                ConnectionLogger::log_success(
                    source_ip,
                    &binding.fingerprint,
                    username,
                    &target.host,
                );
                self.record(NewConnectionLog::success(
                    &binding.fingerprint,
                    source_ip,
                    &target,
                    username,
                ));

                info!("Routing {username}@{source_ip} -> {target}");
                Some(target)
            }
            Err(reason) => {
                self.deny(binding, username, source_ip, &reason);
                None
            }
        }
    }

    fn validate_target(&self, binding: &SshKey) -> Result<Target, String> {
        if binding.target_host.is_empty() || binding.target_user.is_empty() {
            return Err(String::from("incomplete target configuration"));
        }

        let Some(target) = binding.to_target() else {
            return Err(format!("target port {} out of range", binding.target_port));
        };

        // Deny-by-match: hostnames pass through here, IP literals must not
        // fall inside any restricted network.
        if let Ok(address) = target.host.parse::<IpAddr>() {
            for network in &self.restricted_networks {
                if network.contains(&address) {
                    return Err(format!(
                        "target {address} is in restricted network {network}"
                    ));
                }
            }
        }

        Ok(target)
    }

    fn deny(&self, binding: &SshKey, username: &str, source_ip: IpAddr, reason: &str) {
        ConnectionLogger::log_denied(source_ip, &binding.fingerprint, username, reason);
        self.record(NewConnectionLog::denied(
            &binding.fingerprint,
            source_ip,
            username,
            reason,
        ));
    }

    fn record(&self, event: NewConnectionLog) {
        if let Err(e) = self.catalog.record_event(&event) {
            error!("Failed to record connection event: {e}");
        }
    }
}
