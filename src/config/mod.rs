// src/config/mod.rs
//! Miner configuration
//!
//! A TOML file where everything but the wallet address has a default. The
//! `start` command layers command line overrides on top and validates the
//! result once, before any component is built.

/// [`Config`], its defaults and the wallet address check
pub mod config;

pub use config::{Config, validate_address};

/// Commented configuration file, optionally prefilled with `address`
pub fn generate_template(address: Option<&str>) -> String {
    Config::generate_template(address)
}
