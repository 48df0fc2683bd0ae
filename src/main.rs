// src/main.rs
use clap::Parser;
use pool_miner_rs::miner::template::{DEFAULT_NONCE_RANGE, WorkTemplate};
use pool_miner_rs::stats::humanize_hashrate;
use pool_miner_rs::utils::init_bench_logging;
use pool_miner_rs::{self, *};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Main entry point for the pool miner
///
/// # Returns
/// - `Ok(())` on successful execution
/// - `Err(MinerError)` if any operation fails
///
/// # Flow
/// 1. Parses command line arguments
/// 2. Delegates to appropriate subcommand handler
/// 3. Propagates any errors upward
fn main() -> Result<(), MinerError> {
    let cli = cli::Commands::parse();

    match cli.action {
        cli::Action::Start(opts) => start_mining(opts),
        cli::Action::Benchmark(opts) => run_benchmark(opts),
        cli::Action::Config(opts) => generate_config(opts),
    }
}

/// Starts the mining operation with given configuration options
///
/// # Arguments
/// * `opts` - Command line options for mining operation
///
/// # Operations
/// 1. Initializes logging
/// 2. Loads and validates configuration
/// 3. Builds the worker pool, node client and pool transport
/// 4. Watches consensus and runs the controller until Ctrl-C
fn start_mining(opts: cli::StartOptions) -> Result<(), MinerError> {
    utils::init_logging();

    let config = opts.resolve_config()?;
    let identity = config.identity();

    log::info!("Pool Miner {} starting", env!("CARGO_PKG_VERSION"));
    if config.network == Network::Test {
        log::warn!("----- YOU ARE CONNECTING TO TESTNET -----");
    }
    log::info!("- network          = {}", config.network);
    log::info!("- no. of threads   = {}", config.threads);
    log::info!("- pool server      = {}:{}", config.pool.host, config.pool.port);
    log::info!("- address          = {}", identity.wallet_address);
    log::info!("- device name      = {}", identity.device_name);

    let pool = WorkerPool::new(Arc::new(Blake2sAlgo::new()), PoolSettings::default())?;
    let node = Arc::new(NodeClient::new(config.node.clone()));
    let connector = Arc::new(WsConnector::new(
        config.pool.secure,
        Duration::from_secs(config.session.handshake_timeout_secs),
    ));
    let controller = MinerController::new(
        identity,
        ControllerSettings::from_config(&config),
        pool,
        connector,
        node.clone(),
    );

    // Current-thread runtime: hashing happens on the worker threads
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async move {
        let (consensus_tx, consensus_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let watcher = {
            let node = node.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { node.watch_consensus(consensus_tx, cancel).await })
        };

        log::info!("Please wait while we establish consensus.");
        let result = controller.run(consensus_rx, shutdown_signal()).await;

        cancel.cancel();
        let watched = watcher.await;
        result?;
        watched?
    })
}

/// Resolves on Ctrl-C
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Runs a hashrate benchmark through the worker pool
///
/// # Arguments
/// * `opts` - Benchmark configuration options
///
/// # Operations
/// 1. Initializes benchmark-specific logging
/// 2. Feeds the pool a template no hash can meet
/// 3. Collects pool-wide hashrate samples for the duration
/// 4. Reports the average
fn run_benchmark(opts: cli::BenchmarkOptions) -> Result<(), MinerError> {
    init_bench_logging();

    let threads = opts.threads.resolve();
    let algorithm: Arc<dyn Algorithm> = Arc::new(Blake2sAlgo::new());
    let name = algorithm.name();
    let pool = WorkerPool::new(algorithm, PoolSettings::default())?;
    let (rate_tx, rate_rx) = crossbeam_channel::unbounded();
    pool.on_hashrate_sample(move |rate| {
        log::debug!("Pool hashrate: {}", humanize_hashrate(rate));
        let _ = rate_tx.send(rate);
    });

    log::info!(
        "Starting {} benchmark on {} threads for {} seconds",
        name,
        threads,
        opts.duration
    );

    pool.set_template(WorkTemplate {
        template_id: "benchmark".into(),
        header: (0..146).map(|_| rand::random::<u8>()).collect(),
        target: [0u8; 32],
        block_target: None,
        height: 0,
        nonce_range: DEFAULT_NONCE_RANGE,
    });
    pool.start(threads)?;
    std::thread::sleep(Duration::from_secs(opts.duration));
    pool.shutdown();

    let rates: Vec<f64> = rate_rx.try_iter().collect();
    if rates.is_empty() {
        log::warn!("Benchmark too short for a hashrate sample");
        return Ok(());
    }

    let average = rates.iter().sum::<f64>() / rates.len() as f64;
    log::info!("Benchmark results:");
    log::info!("Samples: {}", rates.len());
    log::info!("Average hashrate: {}", humanize_hashrate(average));
    log::logger().flush(); // Ensure final results appear

    Ok(())
}

/// Generates configuration template file
///
/// # Arguments
/// * `opts` - Configuration generation options
///
/// # Operations
/// 1. Generates template content based on options
/// 2. Writes template to specified output file
fn generate_config(opts: cli::ConfigOptions) -> Result<(), MinerError> {
    if let Some(address) = &opts.address {
        config::validate_address(address)?;
    }
    let config = config::generate_template(opts.address.as_deref());
    std::fs::write(&opts.output, config)?;
    println!("Configuration written to {}", opts.output.display());
    Ok(())
}
