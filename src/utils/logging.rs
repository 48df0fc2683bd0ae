// src/utils/logging.rs
//! Logging setup on top of `env_logger`
//!
//! Every line carries the emitting thread, so output from the hash workers
//! (`hash-worker-N`), the pool supervisor and the async control loop can be
//! told apart. Transport crates are held at `warn` unless `RUST_LOG` says
//! otherwise.

use env_logger::{Builder, Target};
use log::LevelFilter;
use std::env;

/// Dependencies that are chatty at debug level
const QUIET_MODULES: [&str; 5] = ["tungstenite", "tokio_tungstenite", "rustls", "hyper_util", "reqwest"];

/// Initializes logging for mining
///
/// Logs to stdout at `info` unless `RUST_LOG` is set.
pub fn init_logging() {
    init_with_default(LevelFilter::Info);
}

/// Initializes logging for the benchmark
///
/// Defaults to `debug` so per-window pool hashrate is visible.
pub fn init_bench_logging() {
    init_with_default(LevelFilter::Debug);
}

fn init_with_default(level: LevelFilter) {
    let mut builder = line_format();

    match env::var("RUST_LOG") {
        Ok(filters) => {
            builder.parse_filters(&filters);
        }
        Err(_) => {
            builder.filter_level(level);
            for module in QUIET_MODULES {
                builder.filter_module(module, LevelFilter::Warn);
            }
        }
    }

    // Tests may initialize more than once; the first logger stays
    let _ = builder.try_init();
}

/// `[<seconds> <LEVEL> <thread> <module>:<line>] <message>` on stdout
fn line_format() -> Builder {
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            use std::io::Write;
            let thread = std::thread::current();
            writeln!(
                buf,
                "[{} {:<5} {} {}:{}] {}",
                buf.timestamp_seconds(),
                record.level(),
                thread.name().unwrap_or("-"),
                record.module_path().unwrap_or_default(),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .target(Target::Stdout);
    builder
}
