use core::fmt;

use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use log::error;

use crate::models::{NewConnectionLog, NewSshKey, SshKey, Target};
use crate::{ConnectionPool, DbConnection};

mod event;
mod key;

#[derive(Debug, Clone)]
pub enum CatalogError {
    /// The backing store can't be reached right now
    Unavailable(String),
    /// Another enabled binding already carries this fingerprint
    Conflict,
    Query(String),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(e) => write!(f, "Catalog unavailable: {e}"),
            Self::Conflict => write!(f, "A binding with this fingerprint already exists."),
            Self::Query(e) => write!(f, "Catalog query failed: {e}"),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<DieselError> for CatalogError {
    fn from(value: DieselError) -> Self {
        match value {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => Self::Conflict,
            e => Self::Query(e.to_string()),
        }
    }
}

impl From<diesel::r2d2::PoolError> for CatalogError {
    fn from(value: diesel::r2d2::PoolError) -> Self {
        Self::Unavailable(value.to_string())
    }
}

/// The persistence capability the bastion core depends on.
///
/// Lookups only ever see enabled bindings; the event log is append-only and
/// its failures must never abort a session.
pub trait Catalog: Send + Sync {
    /// Returns the binding iff it exists and is enabled.
    fn find(&self, fingerprint: &str) -> Result<Option<SshKey>, CatalogError>;

    /// Like `find`, but also returns disabled rows so callers can tell
    /// "unknown" apart from "disabled".
    fn find_any(&self, fingerprint: &str) -> Result<Option<SshKey>, CatalogError>;

    /// Persists a new binding. `Conflict` on duplicate fingerprint.
    fn insert(&self, binding: &NewSshKey) -> Result<(), CatalogError>;

    /// Appends a connection event.
    fn record_event(&self, event: &NewConnectionLog) -> Result<(), CatalogError>;

    /// `find` projected to the routing fields.
    fn route_for(&self, fingerprint: &str) -> Result<Option<Target>, CatalogError>;

    /// All bindings, enabled or not.
    fn list(&self) -> Result<Vec<SshKey>, CatalogError>;
}

/// The embedded sqlite-backed catalog.
#[derive(Clone)]
pub struct SqliteCatalog {
    pool: ConnectionPool,
}

impl SqliteCatalog {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    fn conn(
        &self,
    ) -> Result<PooledConnection<ConnectionManager<DbConnection>>, CatalogError> {
        self.pool.get().map_err(|e| {
            error!("Failed to get database connection: {e}");
            CatalogError::from(e)
        })
    }
}

impl Catalog for SqliteCatalog {
    fn find(&self, fingerprint: &str) -> Result<Option<SshKey>, CatalogError> {
        let mut conn = self.conn()?;
        Ok(SshKey::find_by_fingerprint(&mut conn, fingerprint)?)
    }

    fn find_any(&self, fingerprint: &str) -> Result<Option<SshKey>, CatalogError> {
        let mut conn = self.conn()?;
        Ok(SshKey::find_by_fingerprint_any(&mut conn, fingerprint)?)
    }

    fn insert(&self, binding: &NewSshKey) -> Result<(), CatalogError> {
        let mut conn = self.conn()?;
        SshKey::add_key(&mut conn, binding)?;
        Ok(())
    }

    fn record_event(&self, event: &NewConnectionLog) -> Result<(), CatalogError> {
        let mut conn = self.conn()?;
        crate::models::ConnectionLog::record(&mut conn, event)?;
        Ok(())
    }

    fn route_for(&self, fingerprint: &str) -> Result<Option<Target>, CatalogError> {
        Ok(self.find(fingerprint)?.and_then(|key| key.to_target()))
    }

    fn list(&self) -> Result<Vec<SshKey>, CatalogError> {
        let mut conn = self.conn()?;
        Ok(SshKey::get_all_keys(&mut conn)?)
    }
}
