use std::env;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, eyre, Result};
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::info;

mod auth;
mod config;
mod db;
mod fingerprint;
mod hostkey;
mod logging;
mod models;
mod proxy;
mod router;
mod schema;
mod server;

#[cfg(test)]
mod tests;

use crate::config::{get_configuration, Configuration};
use crate::db::{Catalog, CatalogError, SqliteCatalog};
use crate::logging::{fingerprint_prefix, AppLogger};
use crate::models::NewSshKey;
use crate::server::BastionServer;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

// TODO: postgres backend. Until then the embedded sqlite store is the only
// catalog provider.
#[derive(diesel::MultiConnection)]
pub enum DbConnection {
    Sqlite(diesel::SqliteConnection),
}

pub type ConnectionPool = Pool<ConnectionManager<DbConnection>>;

#[derive(Debug)]
struct SqliteConnectionCustomizer;

impl CustomizeConnection<DbConnection, diesel::r2d2::Error> for SqliteConnectionCustomizer {
    fn on_acquire(&self, conn: &mut DbConnection) -> Result<(), diesel::r2d2::Error> {
        use diesel::{sql_query, RunQueryDsl};

        match conn {
            DbConnection::Sqlite(_) => {
                // Writers from concurrent sessions back off instead of
                // failing immediately.
                sql_query("PRAGMA busy_timeout = 5000")
                    .execute(conn)
                    .map_err(diesel::r2d2::Error::QueryError)?;
            }
        }
        Ok(())
    }
}

#[derive(Parser)]
#[command(name = "ssb", about = "Identity-routing SSH bastion", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bastion server (default)
    Start,
    /// Register a key binding in the catalog
    AddKey {
        /// SSH key fingerprint (SHA256:...)
        fingerprint: String,
        /// SSH username the client presents
        username: String,
        /// Target host IP or name
        target_host: String,
        /// Login on the target
        target_user: String,
        /// Target SSH port
        #[arg(long, default_value_t = 22)]
        target_port: u16,
    },
    /// List registered key bindings
    ListKeys,
    /// Check configuration and catalog reachability
    Test,
}

pub(crate) fn build_pool(catalog_url: &str) -> Result<ConnectionPool> {
    let database_path = catalog_url
        .strip_prefix("sqlite://")
        .unwrap_or(catalog_url);

    let manager = ConnectionManager::<DbConnection>::new(database_path);
    let pool: ConnectionPool = Pool::builder()
        .connection_customizer(Box::new(SqliteConnectionCustomizer))
        .build(manager)?;

    {
        let mut conn = pool.get()?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| eyre!("Error while running migrations: {e}"))?;
    }

    Ok(pool)
}

fn open_catalog(configuration: &Configuration) -> Result<Arc<SqliteCatalog>> {
    info!("Using catalog '{}'", configuration.catalog_url);
    let pool = build_pool(&configuration.catalog_url)?;
    Ok(Arc::new(SqliteCatalog::new(pool)))
}

async fn start_server(configuration: Configuration) -> Result<()> {
    let catalog: Arc<dyn Catalog> = open_catalog(&configuration)?;
    let server = BastionServer::bind(&configuration, catalog).await?;
    server.run().await
}

fn add_key(
    configuration: &Configuration,
    fingerprint: String,
    username: String,
    target_host: String,
    target_user: String,
    target_port: u16,
) -> Result<()> {
    if fingerprint.is_empty() {
        bail!("Fingerprint must not be empty");
    }
    if target_host.is_empty() || target_user.is_empty() {
        bail!("Target host and target user must not be empty");
    }
    if target_port < 1 {
        bail!("Target port must be between 1 and 65535");
    }

    let catalog = open_catalog(configuration)?;
    let new_key = NewSshKey {
        fingerprint: fingerprint.clone(),
        username,
        target_host,
        target_port: i32::from(target_port),
        target_user,
        enabled: true,
    };

    match catalog.insert(&new_key) {
        Ok(()) => {
            println!("Added SSH key {}...", fingerprint_prefix(&fingerprint));
            Ok(())
        }
        Err(CatalogError::Conflict) => {
            bail!("A binding for fingerprint {fingerprint} already exists")
        }
        Err(e) => bail!("Failed to add SSH key: {e}"),
    }
}

fn list_keys(configuration: &Configuration) -> Result<()> {
    let catalog = open_catalog(configuration)?;
    let keys = catalog.list()?;

    if keys.is_empty() {
        println!("No key bindings registered.");
        return Ok(());
    }

    for key in keys {
        println!(
            "{} {} -> {}@{}:{} [{}]",
            key.fingerprint,
            key.username,
            key.target_user,
            key.target_host,
            key.target_port,
            if key.enabled { "enabled" } else { "disabled" }
        );
    }
    Ok(())
}

fn test_setup(configuration: &Configuration) -> Result<()> {
    println!("Configuration validation passed");

    let catalog = open_catalog(configuration)?;
    catalog.find("test-fingerprint")?;
    println!("Catalog connectivity test passed");

    if configuration.host_key_file.exists() {
        println!(
            "Host key file exists: {}",
            configuration.host_key_file.display()
        );
    } else {
        println!(
            "Host key file will be generated: {}",
            configuration.host_key_file.display()
        );
    }

    println!("Configuration test completed successfully");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    if env::var("RUST_SPANTRACE").is_err() {
        env::set_var("RUST_SPANTRACE", "0");
    }

    let cli = Cli::parse();

    let (configuration, config_source) = get_configuration().unwrap_or_else(|e| {
        eprintln!("{e}");
        std::process::exit(3);
    });

    if let Err(e) = configuration.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(3);
    }

    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", configuration.log_level.clone());
    }
    pretty_env_logger::init();
    AppLogger::log_config_loaded(&config_source);

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => start_server(configuration).await,
        Command::AddKey {
            fingerprint,
            username,
            target_host,
            target_user,
            target_port,
        } => add_key(
            &configuration,
            fingerprint,
            username,
            target_host,
            target_user,
            target_port,
        ),
        Command::ListKeys => list_keys(&configuration),
        Command::Test => test_setup(&configuration),
    }
}
