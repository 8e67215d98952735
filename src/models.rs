use core::fmt;
use std::net::IpAddr;

use diesel::prelude::*;
use serde::Serialize;

/// A catalog row binding a key fingerprint to its routing target.
#[derive(Queryable, Selectable, Clone, Debug, PartialEq, Eq, Serialize)]
#[diesel(table_name = crate::schema::ssh_key)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SshKey {
    pub id: i32,
    /// SHA256 fingerprint, unique among enabled rows
    pub fingerprint: String,
    /// Username the client is expected to present. Advisory only.
    pub username: String,
    pub target_host: String,
    pub target_port: i32,
    pub target_user: String,
    pub enabled: bool,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = crate::schema::ssh_key)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewSshKey {
    pub fingerprint: String,
    pub username: String,
    pub target_host: String,
    pub target_port: i32,
    pub target_user: String,
    pub enabled: bool,
}

/// The validated routing triple for one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

impl SshKey {
    /// Projects the routing fields, or `None` when the stored port is not a
    /// valid TCP port.
    pub fn to_target(&self) -> Option<Target> {
        let port = u16::try_from(self.target_port).ok().filter(|port| *port >= 1)?;

        Some(Target {
            host: self.target_host.clone(),
            port,
            user: self.target_user.clone(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Success,
    Denied,
    Error,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Denied => write!(f, "denied"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One connection decision, persisted append-only.
#[derive(Queryable, Selectable, Clone, Debug, Serialize)]
#[diesel(table_name = crate::schema::connection_log)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ConnectionLog {
    pub id: i32,
    pub fingerprint: String,
    pub source_ip: String,
    pub target_host: String,
    pub target_user: String,
    pub username: String,
    pub status: String,
    pub timestamp: i64,
    pub error_message: Option<String>,
}

#[derive(Insertable, Clone, Debug)]
#[diesel(table_name = crate::schema::connection_log)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewConnectionLog {
    pub fingerprint: String,
    pub source_ip: String,
    pub target_host: String,
    pub target_user: String,
    pub username: String,
    pub status: String,
    pub timestamp: i64,
    pub error_message: Option<String>,
}

impl NewConnectionLog {
    fn new(
        fingerprint: &str,
        source_ip: IpAddr,
        target_host: &str,
        target_user: &str,
        username: &str,
        status: EventStatus,
        error_message: Option<String>,
    ) -> Self {
        Self {
            fingerprint: fingerprint.to_owned(),
            source_ip: source_ip.to_string(),
            target_host: target_host.to_owned(),
            target_user: target_user.to_owned(),
            username: username.to_owned(),
            status: status.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            error_message,
        }
    }

    pub fn success(fingerprint: &str, source_ip: IpAddr, target: &Target, username: &str) -> Self {
        Self::new(
            fingerprint,
            source_ip,
            &target.host,
            &target.user,
            username,
            EventStatus::Success,
            None,
        )
    }

    pub fn denied(fingerprint: &str, source_ip: IpAddr, username: &str, reason: &str) -> Self {
        Self::new(
            fingerprint,
            source_ip,
            "",
            "",
            username,
            EventStatus::Denied,
            Some(reason.to_owned()),
        )
    }

    pub fn error(
        fingerprint: &str,
        source_ip: IpAddr,
        target_host: &str,
        target_user: &str,
        username: &str,
        message: &str,
    ) -> Self {
        Self::new(
            fingerprint,
            source_ip,
            target_host,
            target_user,
            username,
            EventStatus::Error,
            Some(message.to_owned()),
        )
    }
}
