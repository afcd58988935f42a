use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // TCP listener bind address.
    pub listen_bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Broker license (cipher key + contract); generated when absent.
    pub license: Option<String>,
    // Max packet size accepted on client connections.
    pub max_packet_bytes: usize,
}

const DEFAULT_BROKER_CONFIG_PATH: &str = "/usr/local/beacon/config.yml";
const DEFAULT_MAX_PACKET_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    listen_bind: Option<String>,
    metrics_bind: Option<String>,
    license: Option<String>,
    max_packet_bytes: Option<usize>,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let listen_bind = std::env::var("BEACON_LISTEN_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse BEACON_LISTEN_BIND")?;
        let metrics_bind = std::env::var("BEACON_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
            .parse()
            .with_context(|| "parse BEACON_METRICS_BIND")?;
        let license = std::env::var("BEACON_LICENSE").ok().filter(|v| !v.is_empty());
        let max_packet_bytes = std::env::var("BEACON_MAX_PACKET_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_PACKET_BYTES);
        Ok(Self {
            listen_bind,
            metrics_bind,
            license,
            max_packet_bytes,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("BEACON_BROKER_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_BROKER_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if override_path.is_some() {
                    return Err(err)
                        .with_context(|| format!("read BEACON_BROKER_CONFIG: {config_path}"));
                }
                None
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read broker config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            // YAML overrides allow ops-friendly config files.
            let override_cfg: BrokerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?;
            if let Some(value) = override_cfg.listen_bind {
                config.listen_bind = value.parse().with_context(|| "parse listen_bind")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.license {
                config.license = Some(value);
            }
            if let Some(value) = override_cfg.max_packet_bytes
                && value > 0
            {
                config.max_packet_bytes = value;
            }
        }
        Ok(config)
    }
}
