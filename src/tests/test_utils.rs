/// Test utilities for the bastion tests
///
/// Provides an isolated catalog fixture and helpers shared by the
/// integration tests.
use std::sync::Arc;

use tempfile::TempDir;

use crate::config::Configuration;
use crate::db::SqliteCatalog;
use crate::models::{ConnectionLog, NewSshKey};
use crate::ConnectionPool;

/// Catalog fixture over its own temporary sqlite database.
pub struct TestCatalog {
    pub pool: ConnectionPool,
    pub catalog: Arc<SqliteCatalog>,
    pub _temp_dir: TempDir,
}

impl TestCatalog {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let pool = crate::build_pool(&format!("sqlite://{}", db_path.display()))
            .expect("Failed to create test database pool");

        Self {
            catalog: Arc::new(SqliteCatalog::new(pool.clone())),
            pool,
            _temp_dir: temp_dir,
        }
    }

    /// Every recorded connection event, oldest first.
    pub fn events(&self) -> Vec<ConnectionLog> {
        use diesel::prelude::*;

        use crate::schema::connection_log;

        let mut conn = self.pool.get().expect("Failed to get connection");
        connection_log::table
            .order(connection_log::id.asc())
            .load::<ConnectionLog>(&mut conn)
            .expect("Failed to load connection events")
    }
}

/// A binding for `alice` pointing at the given target.
pub fn binding(fingerprint: &str, target_host: &str, target_port: i32, target_user: &str) -> NewSshKey {
    NewSshKey {
        fingerprint: fingerprint.to_owned(),
        username: String::from("alice"),
        target_host: target_host.to_owned(),
        target_port,
        target_user: target_user.to_owned(),
        enabled: true,
    }
}

/// Configuration with every field at its default.
pub fn base_configuration() -> Configuration {
    config::Config::builder()
        .build()
        .expect("empty configuration builds")
        .try_deserialize()
        .expect("defaults deserialize")
}
