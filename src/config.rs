use std::{
    env,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    time::Duration,
};

use config::Config;
use ipnet::IpNet;
use serde::Deserialize;

const fn default_connection_timeout() -> Duration {
    Duration::from_secs(300)
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let seconds = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(seconds))
}

/// Restricted networks arrive as a comma separated CIDR list, e.g.
/// `10.10.254.0/24,192.168.0.0/16`.
fn deserialize_networks<'de, D>(deserializer: D) -> Result<Vec<IpNet>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;

    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry.parse::<IpNet>().map_err(|e| {
                serde::de::Error::custom(format!("invalid restricted network '{entry}': {e}"))
            })
        })
        .collect()
}

fn no_networks() -> Vec<IpNet> {
    Vec::new()
}

const fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_bind_port() -> u16 {
    2222
}

fn default_catalog_url() -> String {
    "sqlite://bastion.db".to_owned()
}

fn default_loglevel() -> String {
    "info".to_owned()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("bastion.log")
}

const fn default_max_connections_per_ip() -> u32 {
    5
}

fn default_host_key_file() -> PathBuf {
    PathBuf::from("keys/ssb_host_key")
}

const fn default_host_key_bits() -> usize {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct Configuration {
    /// Listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    /// Listen port
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Locator for the catalog store
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    /// Verbosity for textual logs
    #[serde(default = "default_loglevel")]
    pub log_level: String,
    /// Rotating file sink path, consumed by the log shipping setup
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    /// The global connection cap is derived from this (x10)
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,
    /// Outbound dial+handshake timeout in seconds (default 5m)
    #[serde(
        default = "default_connection_timeout",
        deserialize_with = "deserialize_timeout"
    )]
    pub connection_timeout: Duration,
    /// The bastion's own SSH identity file
    #[serde(default = "default_host_key_file")]
    pub host_key_file: PathBuf,
    /// RSA key size when generating a fresh host key
    #[serde(default = "default_host_key_bits")]
    pub host_key_bits: usize,
    /// CIDRs that may never be routing targets
    #[serde(default = "no_networks", deserialize_with = "deserialize_networks")]
    pub restricted_networks: Vec<IpNet>,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), String> {
        if self.bind_port < 1 {
            return Err(String::from("bind_port must be between 1 and 65535"));
        }
        if self.connection_timeout < Duration::from_secs(1) {
            return Err(String::from("connection_timeout must be at least 1 second"));
        }
        if self.max_connections_per_ip < 1 {
            return Err(String::from("max_connections_per_ip must be at least 1"));
        }
        Ok(())
    }

    /// Process-wide cap on live connections.
    pub fn global_connection_cap(&self) -> usize {
        self.max_connections_per_ip as usize * 10
    }
}

pub fn get_configuration() -> Result<(Configuration, String), String> {
    let config_path = env::var("CONFIG").unwrap_or_else(|_| String::from("./config.toml"));
    let config_builder = Config::builder();

    let (config_builder, config_source) = if std::path::Path::new(&config_path).exists() {
        use config::FileFormat::Toml;
        (
            config_builder.add_source(config::File::new(&config_path, Toml).required(false)),
            format!("Loading configuration from '{}'", &config_path),
        )
    } else {
        (
            config_builder,
            format!("No configuration file found at '{}'", &config_path),
        )
    };

    // Environment variables take precedence over config file settings
    let config: Configuration = config_builder
        .add_source(config::Environment::default())
        .build()
        .map_err(|e| format!("Error while reading configuration source: {e}"))?
        .try_deserialize()
        .map_err(|e| format!("Error while parsing configuration: {e}"))?;

    Ok((config, config_source))
}
