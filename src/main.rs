//! # memserver-sim - Concurrent Client Simulation
//!
//! Drives a memserver instance with many simulated clients at once, each on
//! its own connection:
//!
//! 1. Connect
//! 2. Run `--iterations` rounds of `SET mykey-<i> myvalue` then `GET mykey-<i>`
//! 3. Disconnect (early on the first failed call)
//! 4. Pause for a random 0..`--max-restart-delay` seconds and start over
//!
//! Runs until interrupted, or until `--rounds` client runs have finished.
//!
//! Use the RUST_LOG environment variable to control verbosity, e.g.
//! `RUST_LOG=memserver_client=debug memserver-sim --clients 10`.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use memserver_client::{Client, ClientConfig};
use rand::Rng;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "memserver-sim")]
#[command(about = "Simulate many concurrent clients against a memserver instance")]
struct Args {
    /// Client configuration file (TOML); MEMSERVER_* variables still apply
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server host (overrides the configuration)
    #[arg(long)]
    host: Option<String>,

    /// Server port (overrides the configuration)
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of simulated clients running at once
    #[arg(long, default_value_t = 100)]
    clients: usize,

    /// SET/GET rounds per client run
    #[arg(long, default_value_t = 20)]
    iterations: usize,

    /// Upper bound (exclusive, seconds) of the pause before a client restarts
    #[arg(long, default_value_t = 3)]
    max_restart_delay: u64,

    /// Stop after this many client runs have finished
    #[arg(long)]
    rounds: Option<usize>,
}

/// What one client run did, reported back to the driver.
#[derive(Debug)]
struct RunReport {
    client: usize,
    completed: usize,
    error: Option<String>,
    elapsed: Duration,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => ClientConfig::from_env().context("failed to read MEMSERVER_* settings")?,
    };
    if let Some(host) = args.host.clone() {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(simulate(args, config))
}

async fn simulate(args: Args, config: ClientConfig) -> Result<()> {
    info!(
        "Simulating {} clients x {} iterations against {}",
        args.clients,
        args.iterations,
        config.addr()
    );

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<RunReport>();
    for client in 0..args.clients {
        spawn_client(client, Duration::ZERO, args.iterations, config.clone(), done_tx.clone());
    }

    let mut finished = 0usize;
    let mut failed = 0usize;
    while let Some(report) = done_rx.recv().await {
        finished += 1;
        match &report.error {
            Some(err) => {
                failed += 1;
                warn!(
                    "Client {} stopped after {} iterations in {:?}: {}",
                    report.client, report.completed, report.elapsed, err
                );
            }
            None => info!(
                "Client {} done: {} iterations in {:?}",
                report.client, report.completed, report.elapsed
            ),
        }

        if args.rounds.is_some_and(|limit| finished >= limit) {
            break;
        }

        let delay = rand::thread_rng().gen_range(0..args.max_restart_delay.max(1));
        info!("Client {} restarting in {} seconds...", report.client, delay);
        spawn_client(
            report.client,
            Duration::from_secs(delay),
            args.iterations,
            config.clone(),
            done_tx.clone(),
        );
    }

    info!("{} client runs finished, {} with errors", finished, failed);
    Ok(())
}

fn spawn_client(
    client: usize,
    delay: Duration,
    iterations: usize,
    config: ClientConfig,
    done: mpsc::UnboundedSender<RunReport>,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let report = run_client(client, iterations, &config).await;
        let _ = done.send(report);
    });
}

async fn run_client(client: usize, iterations: usize, config: &ClientConfig) -> RunReport {
    let started = Instant::now();
    let mut report = RunReport {
        client,
        completed: 0,
        error: None,
        elapsed: Duration::ZERO,
    };

    let conn = match Client::connect_with_config(config).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("Error connecting client {}: {}", client, e);
            report.error = Some(e.to_string());
            report.elapsed = started.elapsed();
            return report;
        }
    };

    for i in 0..iterations {
        let key = format!("mykey-{}", i);
        let outcome = match conn.set(&key, "myvalue").await {
            Ok(_) => conn.get(&key).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            report.error = Some(e.to_string());
            break;
        }
        report.completed += 1;
    }

    if let Err(e) = conn.disconnect().await {
        warn!("Error disconnecting client {}: {}", client, e);
    }
    report.elapsed = started.elapsed();
    report
}
