// src/config/config.rs
use crate::{
    network::{
        node::NodeConfig,
        pool::{POOL_SERVERS, PoolConfig, SessionSettings},
        protocol::{MinerIdentity, normalize_address},
    },
    stats::reporter::DEFAULT_SAMPLE_WINDOW,
    types::{Network, ThreadCount},
    utils::error::MinerError,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Length of a wallet address without spaces
const ADDRESS_LENGTH: usize = 36;

/// Main configuration structure for the mining application
///
/// Produced once at startup (file plus command line overrides) and
/// validated before any component is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Wallet address receiving the payouts (e.g., "NQ07 0000 ...")
    pub address: String,

    /// Name shown by the pool for this device
    /// (default: host name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Number of worker threads, or "auto" for one per CPU
    #[serde(default)]
    pub threads: ThreadCount,

    /// Blockchain network ("main" or "test")
    #[serde(default)]
    pub network: Network,

    /// Samples averaged per statistics line
    #[serde(default = "default_stats_samples")]
    pub stats_samples: usize,

    /// Pool server
    #[serde(default)]
    pub pool: PoolConfig,

    /// Node providing consensus and ledger data
    #[serde(default)]
    pub node: NodeConfig,

    /// Session timers and thresholds
    #[serde(default)]
    pub session: SessionSettings,
}

fn default_stats_samples() -> usize {
    DEFAULT_SAMPLE_WINDOW
}

impl Config {
    /// Configuration with defaults for everything but the address
    pub fn with_address(address: impl Into<String>) -> Self {
        Config {
            address: address.into(),
            name: None,
            threads: ThreadCount::default(),
            network: Network::default(),
            stats_samples: default_stats_samples(),
            pool: PoolConfig::default(),
            node: NodeConfig::default(),
            session: SessionSettings::default(),
        }
    }

    /// Loads configuration from a file
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file (TOML format)
    ///
    /// # Returns
    /// * `Ok(Config)` - Successfully loaded configuration
    /// * `Err(MinerError)` - If file couldn't be read or parsed
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, MinerError> {
        let path = path.into();
        let config_str = std::fs::read_to_string(&path).map_err(|e| {
            MinerError::ConfigError(format!(
                "Failed to read config at {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(toml::from_str(&config_str)?)
    }

    /// Checks the settings that would otherwise fail late
    ///
    /// # Errors
    /// Returns `MinerError::ConfigError` naming the first invalid setting
    pub fn validate(&self) -> Result<(), MinerError> {
        validate_address(&self.address)?;

        if self.pool.host.trim().is_empty() {
            return Err(MinerError::ConfigError("Pool host is empty".into()));
        }
        if self.pool.port == 0 {
            return Err(MinerError::ConfigError("Pool port must not be 0".into()));
        }
        if self.stats_samples == 0 {
            return Err(MinerError::ConfigError(
                "stats_samples must be at least 1".into(),
            ));
        }
        if self.session.malformed_threshold == 0 {
            return Err(MinerError::ConfigError(
                "session.malformed_threshold must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.session.rejection_ratio) {
            return Err(MinerError::ConfigError(
                "session.rejection_ratio must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }

    /// Device name: the configured one, else the host name
    pub fn device_name(&self) -> String {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "pool-miner".into())
    }

    /// Identity registered with the pool
    pub fn identity(&self) -> MinerIdentity {
        MinerIdentity::new(self.network, &self.address, self.device_name())
    }

    /// Generates a configuration template string
    ///
    /// # Arguments
    /// * `address` - Wallet address to prefill, if known
    ///
    /// # Returns
    /// String containing a commented TOML configuration template
    pub fn generate_template(address: Option<&str>) -> String {
        let mut template = String::new();
        template.push_str("# Pool Miner Configuration\n\n");
        template.push_str("# Wallet address receiving the payouts\n");
        template.push_str(&format!(
            "address = \"{}\"\n",
            address.unwrap_or("NQXX XXXX XXXX XXXX XXXX XXXX XXXX XXXX XXXX")
        ));
        template.push_str("# Device name shown by the pool (default: host name)\n");
        template.push_str("# name = \"my-rig\"\n");
        template.push_str("# Number of worker threads, or \"auto\" for one per CPU\n");
        template.push_str("threads = \"auto\"\n");
        template.push_str("# Network: \"main\" or \"test\"\n");
        template.push_str("network = \"main\"\n");
        template.push_str("# Hashrate samples averaged per statistics line\n");
        template.push_str(&format!("stats_samples = {}\n\n", DEFAULT_SAMPLE_WINDOW));

        template.push_str("[pool]\n");
        template.push_str(&format!("# Servers: {}\n", POOL_SERVERS.join(", ")));
        template.push_str(&format!("host = \"{}\"\n", POOL_SERVERS[0]));
        template.push_str("port = 443\n");
        template.push_str("secure = true\n\n");

        template.push_str("[node]\n");
        template.push_str("rpc_url = \"http://127.0.0.1:8648\"\n");
        template.push_str("# rpc_user = \"user\"\n");
        template.push_str("# rpc_password = \"password\"\n");
        template.push_str("poll_secs = 5\n\n");

        let session = SessionSettings::default();
        template.push_str("[session]\n");
        template.push_str(&format!("keepalive_secs = {}\n", session.keepalive_secs));
        template.push_str(&format!("idle_timeout_secs = {}\n", session.idle_timeout_secs));
        template.push_str(&format!(
            "handshake_timeout_secs = {}\n",
            session.handshake_timeout_secs
        ));
        template.push_str(&format!(
            "malformed_threshold = {}\n",
            session.malformed_threshold
        ));
        template.push_str(&format!("rejection_window = {}\n", session.rejection_window));
        template.push_str(&format!(
            "rejection_min_results = {}\n",
            session.rejection_min_results
        ));
        template.push_str(&format!("rejection_ratio = {:.1}\n\n", session.rejection_ratio));

        template.push_str("[session.backoff]\n");
        template.push_str(&format!("base_ms = {}\n", session.backoff.base_ms));
        template.push_str(&format!("max_ms = {}\n", session.backoff.max_ms));
        template.push_str(&format!("jitter = {:.1}\n", session.backoff.jitter));

        template
    }
}

/// Checks length, prefix, alphabet and the IBAN-style check digits
pub fn validate_address(address: &str) -> Result<(), MinerError> {
    let normalized = normalize_address(address);

    if normalized.len() != ADDRESS_LENGTH || !normalized.starts_with("NQ") {
        return Err(MinerError::ConfigError(format!(
            "Invalid wallet address '{}': expected NQ followed by 34 characters",
            address
        )));
    }
    if !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(MinerError::ConfigError(format!(
            "Invalid wallet address '{}': unexpected characters",
            address
        )));
    }

    // Country code and check digits move to the end, then mod 97 must be 1
    let rearranged = normalized[4..].chars().chain(normalized[..4].chars());
    let mut remainder: u32 = 0;
    for c in rearranged {
        let value = c.to_digit(36).unwrap_or(0);
        remainder = if value < 10 {
            (remainder * 10 + value) % 97
        } else {
            (remainder * 100 + value) % 97
        };
    }
    if remainder != 1 {
        return Err(MinerError::ConfigError(format!(
            "Invalid wallet address '{}': checksum mismatch",
            address
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ADDRESS: &str = "NQ19 G07J 7K8P B3F3 H1X5 XT1X D2NR RJ8X JXBP";

    #[test]
    fn accepts_valid_addresses() {
        validate_address(ADDRESS).unwrap();
        validate_address("NQ07 0000 0000 0000 0000 0000 0000 0000 0000").unwrap();
        validate_address("nq30vle6k3x8vlx5gq1ymhhqb4ajnvvgepxv").unwrap();
    }

    #[test]
    fn rejects_bad_addresses() {
        for address in [
            "",
            "NQ08 0000 0000 0000 0000 0000 0000 0000 0000",
            "XX07 0000 0000 0000 0000 0000 0000 0000 0000",
            "NQ07 0000 0000 0000 0000 0000 0000 0000",
            "NQ07 0000 0000 0000 0000 0000 0000 0000 00-0",
        ] {
            assert!(validate_address(address).is_err(), "{address:?}");
        }
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "address = \"{}\"", ADDRESS).unwrap();

        let config = Config::load(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.threads, ThreadCount::Auto);
        assert_eq!(config.network, Network::Main);
        assert_eq!(config.pool.host, "eu.sushipool.com");
        assert_eq!(config.pool.port, 443);
        assert!(config.pool.secure);
        assert_eq!(config.stats_samples, 5);
        assert_eq!(config.session.malformed_threshold, 5);
    }

    #[test]
    fn generated_template_loads_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(Config::generate_template(Some(ADDRESS)).as_bytes())
            .unwrap();

        let config = Config::load(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.address, ADDRESS);
        assert_eq!(config.node.rpc_url, "http://127.0.0.1:8648");
        assert_eq!(config.session.backoff.max_ms, 60_000);
    }

    #[test]
    fn invalid_settings_fail_validation() {
        let mut config = Config::with_address(ADDRESS);
        config.pool.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::with_address(ADDRESS);
        config.pool.host = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(matches!(
            Config::load("/nonexistent/miner.toml"),
            Err(MinerError::ConfigError(_))
        ));
    }

    #[test]
    fn explicit_name_wins_over_host_name() {
        let mut config = Config::with_address(ADDRESS);
        config.name = Some("rig-7".into());
        assert_eq!(config.identity().device_name, "rig-7");

        config.name = Some("  ".into());
        assert!(!config.device_name().trim().is_empty());
    }
}
