//! Facilitator configuration from environment variables.
//!
//! Environment variables used:
//! - `FACILITATOR_PRIVATE_KEY` — required, 0x-prefixed settlement key,
//! - `RPC_URL` — chain RPC endpoint, defaults to the Base Sepolia public RPC,
//! - `NETWORK` — CAIP-2 network id, defaults to `eip155:84532`,
//! - `HOST`, `PORT` — bind address, defaulting to `0.0.0.0:4402`,
//! - `AUDIT_DB_PATH` — SQLite audit database path.

use std::env;
use url::Url;

use crate::chain::ChainId;
use crate::networks::Network;

pub const ENV_FACILITATOR_PRIVATE_KEY: &str = "FACILITATOR_PRIVATE_KEY";
pub const ENV_RPC_URL: &str = "RPC_URL";
pub const ENV_NETWORK: &str = "NETWORK";
pub const ENV_HOST: &str = "HOST";
pub const ENV_PORT: &str = "PORT";
pub const ENV_AUDIT_DB_PATH: &str = "AUDIT_DB_PATH";

const DEFAULT_RPC_URL: &str = "https://sepolia.base.org";
const DEFAULT_NETWORK: &str = "eip155:84532";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 4402;
const DEFAULT_AUDIT_DB_PATH: &str = "./upto-payments.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("env {ENV_FACILITATOR_PRIVATE_KEY} not set")]
    MissingPrivateKey,
    #[error("env {ENV_FACILITATOR_PRIVATE_KEY} must be a 0x-prefixed hex key")]
    InvalidPrivateKey,
    #[error("env {ENV_RPC_URL} is not a valid URL: {0}")]
    InvalidRpcUrl(url::ParseError),
    #[error("env {ENV_NETWORK} is not a supported network: {0}")]
    InvalidNetwork(String),
    #[error("env {ENV_PORT} is not a valid port: {0}")]
    InvalidPort(String),
}

/// Resolved facilitator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub private_key: String,
    pub rpc_url: Url,
    pub network: Network,
    pub host: String,
    pub port: u16,
    pub audit_db_path: String,
}

impl Config {
    /// Reads configuration from the process environment, applying defaults
    /// for everything except the private key.
    pub fn from_env() -> Result<Self, ConfigError> {
        let private_key =
            env::var(ENV_FACILITATOR_PRIVATE_KEY).map_err(|_| ConfigError::MissingPrivateKey)?;
        if !private_key.starts_with("0x") {
            return Err(ConfigError::InvalidPrivateKey);
        }

        let rpc_url = env::var(ENV_RPC_URL).unwrap_or_else(|_| DEFAULT_RPC_URL.to_string());
        let rpc_url = Url::parse(&rpc_url).map_err(ConfigError::InvalidRpcUrl)?;

        let network = env::var(ENV_NETWORK).unwrap_or_else(|_| DEFAULT_NETWORK.to_string());
        let chain_id: ChainId = network
            .parse()
            .map_err(|_| ConfigError::InvalidNetwork(network.clone()))?;
        let network =
            Network::try_from(&chain_id).map_err(|e| ConfigError::InvalidNetwork(e.to_string()))?;

        let host = env::var(ENV_HOST).unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = match env::var(ENV_PORT) {
            Ok(raw) => raw.parse::<u16>().map_err(|_| ConfigError::InvalidPort(raw))?,
            Err(_) => DEFAULT_PORT,
        };

        let audit_db_path =
            env::var(ENV_AUDIT_DB_PATH).unwrap_or_else(|_| DEFAULT_AUDIT_DB_PATH.to_string());

        Ok(Config {
            private_key,
            rpc_url,
            network,
            host,
            port,
            audit_db_path,
        })
    }
}
