// src/cli/commands.rs
use crate::config::Config;
use crate::types::{Network, ThreadCount};
use crate::utils::error::MinerError;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Pool Miner CLI - pool mining client with Blake2s proof-of-work
#[derive(Parser, Debug)]
#[command(name = "pool-miner-rs")]
#[command(version, about, long_about = None)]
pub struct Commands {
    /// The action to perform (start mining, run benchmarks, or generate config)
    #[command(subcommand)]
    pub action: Action,
}

/// Top-level commands for the miner application
#[derive(Subcommand, Debug)]
pub enum Action {
    /// Start mining with the given options
    Start(StartOptions),

    /// Measure the local hashrate
    Benchmark(BenchmarkOptions),

    /// Generate configuration file template
    Config(ConfigOptions),
}

/// Options for starting the mining operation
#[derive(Parser, Debug)]
pub struct StartOptions {
    /// Path to configuration file
    #[arg(short, long, default_value = "miner.toml")]
    pub config: PathBuf,

    /// Wallet address (overrides config; enough to start without a file)
    #[arg(long)]
    pub address: Option<String>,

    /// Number of worker threads or "auto" (overrides config)
    #[arg(short, long)]
    pub threads: Option<ThreadCount>,

    /// Pool server host (overrides config)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Pool server port (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Device name shown by the pool (overrides config)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Mine on the test network
    #[arg(long)]
    pub test: bool,

    /// Node JSON-RPC URL (overrides config)
    #[arg(long)]
    pub node: Option<String>,

    /// Write the resulting configuration back to the config path
    #[arg(long)]
    pub save: bool,
}

impl StartOptions {
    /// Builds the effective configuration: file (if present), then overrides
    ///
    /// # Errors
    /// Returns `MinerError::ConfigError` if there is neither a config file nor
    /// an address, or if the result does not validate
    pub fn resolve_config(&self) -> Result<Config, MinerError> {
        let mut config = if self.config.exists() {
            log::info!("Reading config from {}", self.config.display());
            Config::load(&self.config)?
        } else if let Some(address) = &self.address {
            log::info!("Reading config from command line");
            Config::with_address(address.clone())
        } else {
            return Err(MinerError::ConfigError(format!(
                "No configuration file at {}. Pass --address or run the config command",
                self.config.display()
            )));
        };

        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(server) = &self.server {
            config.pool.host = server.clone();
        }
        if let Some(port) = self.port {
            config.pool.port = port;
        }
        if let Some(name) = &self.name {
            config.name = Some(name.clone());
        }
        if self.test {
            config.network = Network::Test;
        }
        if let Some(node) = &self.node {
            config.node.rpc_url = node.clone();
        }

        config.validate()?;

        if self.save {
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| MinerError::ConfigError(format!("Cannot render config: {}", e)))?;
            std::fs::write(&self.config, rendered)?;
            log::info!("Configuration saved to {}", self.config.display());
        }
        Ok(config)
    }
}

/// Options for running mining benchmarks
#[derive(Parser, Debug)]
pub struct BenchmarkOptions {
    /// Duration of benchmark in seconds
    #[arg(short, long, default_value_t = 10)]
    pub duration: u64,

    /// Number of threads to use, or "auto"
    #[arg(short, long, default_value = "auto")]
    pub threads: ThreadCount,
}

/// Options for generating configuration files
#[derive(Parser, Debug)]
pub struct ConfigOptions {
    /// Output file path
    #[arg(short, long, default_value = "miner.toml")]
    pub output: PathBuf,

    /// Wallet address to prefill
    #[arg(short, long)]
    pub address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "NQ19 G07J 7K8P B3F3 H1X5 XT1X D2NR RJ8X JXBP";

    fn start(args: &[&str]) -> StartOptions {
        let mut argv = vec!["pool-miner-rs", "start"];
        argv.extend_from_slice(args);
        match Commands::try_parse_from(argv).unwrap().action {
            Action::Start(opts) => opts,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn address_alone_is_enough() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.toml");
        let opts = start(&[
            "--config",
            path.to_str().unwrap(),
            "--address",
            ADDRESS,
            "--threads",
            "2",
            "--server",
            "asia.sushipool.com",
            "--test",
        ]);

        let config = opts.resolve_config().unwrap();
        assert_eq!(config.threads.resolve(), 2);
        assert_eq!(config.pool.host, "asia.sushipool.com");
        assert_eq!(config.pool.port, 443);
        assert_eq!(config.network, Network::Test);
        assert!(!path.exists());
    }

    #[test]
    fn saved_config_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.toml");
        let config_path = path.to_str().unwrap();

        start(&["-c", config_path, "--address", ADDRESS, "-n", "rig", "--save"])
            .resolve_config()
            .unwrap();
        assert!(path.exists());

        let config = start(&["-c", config_path, "-t", "auto"]).resolve_config().unwrap();
        assert_eq!(config.address, ADDRESS);
        assert_eq!(config.name.as_deref(), Some("rig"));
        assert_eq!(config.threads, ThreadCount::Auto);
    }

    #[test]
    fn no_file_and_no_address_fails() {
        let dir = tempfile::tempdir().unwrap();
        let opts = start(&["-c", dir.path().join("missing.toml").to_str().unwrap()]);
        assert!(matches!(opts.resolve_config(), Err(MinerError::ConfigError(_))));
    }

    #[test]
    fn bad_thread_count_is_rejected_by_the_parser() {
        assert!(Commands::try_parse_from(["pool-miner-rs", "start", "-t", "0"]).is_err());
        assert!(Commands::try_parse_from(["pool-miner-rs", "benchmark", "-t", "x"]).is_err());
    }

    #[test]
    fn invalid_address_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let opts = start(&[
            "-c",
            dir.path().join("miner.toml").to_str().unwrap(),
            "--address",
            "NQ00 nope",
        ]);
        assert!(opts.resolve_config().is_err());
    }
}
