// src/types.rs
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

/// Blockchain network the miner works for
///
/// Selects the node's chain and is mixed into the device id, so the same
/// machine registers under different ids on main and test net.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network
    #[default]
    #[clap(name = "main")]
    Main,

    /// Test network
    #[clap(name = "test")]
    Test,
}

impl Network {
    /// Short lowercase tag
    pub fn tag(&self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Test => "test",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Test),
            _ => Err(format!("Unknown network: {}", s)),
        }
    }
}

/// Number of hashing threads: a fixed count or one per CPU
///
/// Written as a positive integer or the word `auto`, both in config files
/// and on the command line.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawThreadCount", into = "RawThreadCount")]
pub enum ThreadCount {
    /// Exactly this many threads
    Fixed(NonZeroUsize),
    /// Hardware concurrency
    #[default]
    Auto,
}

impl ThreadCount {
    /// Concrete thread count; resolved once at startup
    pub fn resolve(&self) -> usize {
        match self {
            ThreadCount::Fixed(n) => n.get(),
            ThreadCount::Auto => num_cpus::get().max(1),
        }
    }
}

impl fmt::Display for ThreadCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadCount::Fixed(n) => write!(f, "{}", n),
            ThreadCount::Auto => f.write_str("auto"),
        }
    }
}

impl FromStr for ThreadCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(ThreadCount::Auto);
        }
        let count: usize = s
            .parse()
            .map_err(|_| format!("Specify a valid thread number or 'auto', got '{}'", s))?;
        NonZeroUsize::new(count)
            .map(ThreadCount::Fixed)
            .ok_or_else(|| "Thread count must be at least 1".to_string())
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawThreadCount {
    Count(u64),
    Word(String),
}

impl TryFrom<RawThreadCount> for ThreadCount {
    type Error = String;

    fn try_from(raw: RawThreadCount) -> Result<Self, Self::Error> {
        match raw {
            RawThreadCount::Count(n) => usize::try_from(n)
                .ok()
                .and_then(NonZeroUsize::new)
                .map(ThreadCount::Fixed)
                .ok_or_else(|| "Thread count must be at least 1".to_string()),
            RawThreadCount::Word(word) => word.parse(),
        }
    }
}

impl From<ThreadCount> for RawThreadCount {
    fn from(threads: ThreadCount) -> Self {
        match threads {
            ThreadCount::Fixed(n) => RawThreadCount::Count(n.get() as u64),
            ThreadCount::Auto => RawThreadCount::Word("auto".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Holder {
        threads: ThreadCount,
    }

    #[test]
    fn thread_count_parses_numbers_and_auto() {
        assert_eq!("4".parse::<ThreadCount>().unwrap().resolve(), 4);
        assert_eq!("AUTO".parse::<ThreadCount>().unwrap(), ThreadCount::Auto);
        assert!("0".parse::<ThreadCount>().is_err());
        assert!("many".parse::<ThreadCount>().is_err());
    }

    #[test]
    fn thread_count_in_toml() {
        let fixed: Holder = toml::from_str("threads = 3").unwrap();
        assert_eq!(fixed.threads.to_string(), "3");

        let auto: Holder = toml::from_str("threads = \"auto\"").unwrap();
        assert_eq!(auto.threads, ThreadCount::Auto);
        assert!(auto.threads.resolve() >= 1);

        assert!(toml::from_str::<Holder>("threads = 0").is_err());
        assert!(toml::from_str::<Holder>("threads = \"lots\"").is_err());

        assert_eq!(toml::to_string(&auto).unwrap().trim(), "threads = \"auto\"");
    }

    #[test]
    fn network_names() {
        assert_eq!("testnet".parse::<Network>().unwrap(), Network::Test);
        assert_eq!(Network::default().to_string(), "main");
        assert!("moon".parse::<Network>().is_err());
    }
}
