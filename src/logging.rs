/// Standardized logging utilities for consistent logging across the bastion
///
/// This module provides logging functions that:
/// - Use appropriate log levels (debug, info, warn, error)
/// - Include structured context information
/// - Avoid logging full fingerprints or key material
/// - Follow consistent formatting
use std::net::IpAddr;

use log::{debug, error, info, warn};

use crate::models::Target;

/// Fingerprints are truncated in log lines; the full value lives in the
/// catalog's event log.
pub fn fingerprint_prefix(fingerprint: &str) -> &str {
    if fingerprint.is_empty() {
        return "INVALID";
    }
    fingerprint.get(..16).unwrap_or(fingerprint)
}

/// Client connection lifecycle logging
pub struct ConnectionLogger;

impl ConnectionLogger {
    pub fn log_attempt(source_ip: IpAddr, fingerprint: &str, username: &str) {
        info!(
            "CONNECTION_ATTEMPT ip={} fingerprint={} user={}",
            source_ip,
            fingerprint_prefix(fingerprint),
            username
        );
    }

    pub fn log_auth_success(source_ip: IpAddr, fingerprint: &str, username: &str) {
        info!(
            "AUTH_SUCCESS ip={} fingerprint={} user={}",
            source_ip,
            fingerprint_prefix(fingerprint),
            username
        );
    }

    pub fn log_success(source_ip: IpAddr, fingerprint: &str, username: &str, target_host: &str) {
        info!(
            "CONNECTION_SUCCESS ip={} fingerprint={} user={} target={}",
            source_ip,
            fingerprint_prefix(fingerprint),
            username,
            target_host
        );
    }

    pub fn log_denied(source_ip: IpAddr, fingerprint: &str, username: &str, reason: &str) {
        warn!(
            "CONNECTION_DENIED ip={} fingerprint={} user={} reason={}",
            source_ip,
            fingerprint_prefix(fingerprint),
            username,
            reason
        );
    }

    pub fn log_error(source_ip: IpAddr, fingerprint: &str, username: &str, error: &str) {
        error!(
            "CONNECTION_ERROR ip={} fingerprint={} user={} error={}",
            source_ip,
            fingerprint_prefix(fingerprint),
            username,
            error
        );
    }

    pub fn log_closed(source_ip: IpAddr, fingerprint: &str, target_host: &str) {
        info!(
            "CONNECTION_CLOSED ip={} fingerprint={} target={}",
            source_ip,
            fingerprint_prefix(fingerprint),
            target_host
        );
    }
}

/// Outbound SSH leg logging
pub struct SshLogger;

impl SshLogger {
    pub fn log_outbound_attempt(target: &Target) {
        debug!("SSH_OUTBOUND_ATTEMPT target={target}");
    }

    pub fn log_outbound_success(target: &Target) {
        info!("SSH_OUTBOUND_SUCCESS target={target}");
    }

    pub fn log_outbound_failure(target: &Target, error: &str) {
        warn!("SSH_OUTBOUND_FAILURE target={target} error={error}");
    }
}

/// Relay worker lifecycle logging
pub struct RelayLogger;

impl RelayLogger {
    pub fn log_started(connection_id: &str) {
        info!("RELAY_STARTED connection={connection_id}");
    }

    pub fn log_direction_closed(connection_id: &str, direction: &str, bytes: u64) {
        debug!("RELAY_DIRECTION_CLOSED connection={connection_id} direction={direction} bytes={bytes}");
    }

    pub fn log_teardown(connection_id: &str) {
        debug!("RELAY_TEARDOWN connection={connection_id}");
    }
}

/// Application lifecycle logging
pub struct AppLogger;

impl AppLogger {
    pub fn log_startup(component: &str, version: &str) {
        info!("APP_STARTUP component={component} version={version}");
    }

    pub fn log_shutdown(component: &str, reason: &str) {
        info!("APP_SHUTDOWN component={component} reason={reason}");
    }

    pub fn log_config_loaded(source: &str) {
        info!("CONFIG_LOADED source={source}");
    }
}
