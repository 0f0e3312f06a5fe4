mod broadcast;
mod collectors;
mod config;
mod hardware;
mod http;
mod metrics;
mod parse;
mod state;
mod tools;
mod tuning;

use axum::serve;
use broadcast::Broadcaster;
use clap::Parser;
use collectors::system::SystemSource;
use collectors::Sampler;
use config::Config;
use hardware::SystemSummary;
use http::HttpAppState;
use metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::SystemExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tools::ProcessRunner;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tuning::{TuningEngine, KERNEL_PARAMS};

const WEBSOCKET_DRAIN: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "nasd")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Skip the startup tuning pass.
    #[arg(long)]
    no_tune: bool,
    /// Print the tuning directives for this machine and exit without writing.
    #[arg(long, conflicts_with = "no_tune")]
    print_tuning: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        "starting nasd"
    );

    let runner = ProcessRunner::new(Duration::from_millis(cfg.tool_timeout_ms));
    let cpu_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let profile = Arc::new(hardware::detect(&runner, &cfg.sources.meminfo_path, cpu_cores).await);
    let host = sysinfo::System::new();
    let summary = Arc::new(SystemSummary::new(
        &profile,
        host.host_name(),
        host.kernel_version(),
    ));

    let engine = TuningEngine::from_config(&cfg.tuning, runner.clone());
    if cli.print_tuning {
        for directive in engine.plan(&profile) {
            println!("# {}", directive.target.display());
            for line in &directive.lines {
                println!("{line}");
            }
        }
        if cfg.tuning.apply_sysctl {
            println!("# sysctl");
            for (key, value) in KERNEL_PARAMS {
                println!("{key}={value}");
            }
        }
        return;
    }

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    if cfg.tuning.enabled && !cli.no_tune {
        let report = engine.tune(&profile).await;
        metrics.record_tuning(&report);
    } else {
        info!("auto-tune disabled");
    }

    let addr: SocketAddr = match cfg.listen.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, listen = %cfg.listen, "invalid listen address");
            std::process::exit(1);
        }
    };
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(err) => {
            error!(error = %err, listen = %addr, "failed to bind HTTP listener");
            std::process::exit(1);
        }
    };

    let broadcaster = Broadcaster::new(cfg.subscriber_queue);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (connections, mut open_connections) = mpsc::channel::<()>(1);

    let http_task = {
        let app = http::build_router(HttpAppState {
            metrics: metrics.clone(),
            broadcaster: broadcaster.clone(),
            profile: profile.clone(),
            summary,
            connections,
        });
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let sampler_task = {
        let metrics = metrics.clone();
        let broadcaster = broadcaster.clone();
        let mut shutdown = shutdown_rx.clone();
        let source = SystemSource::new(runner, cfg.sources.clone(), &cfg.storage);
        let interval_secs = cfg.interval_secs;
        tokio::spawn(async move {
            let mut sampler = Sampler::new(source);
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("sampler stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        // Dropping an unfinished sample kills its child processes.
                        let sampled = tokio::select! {
                            _ = shutdown.changed() => None,
                            out = sampler.sample() => Some(out),
                        };
                        let Some((snapshot, failed)) = sampled else {
                            info!("sampler stopping mid-tick");
                            break;
                        };

                        for source in &failed {
                            metrics.inc_collect_error(source);
                        }
                        metrics.update_from_snapshot(&snapshot);

                        match broadcaster.publish(snapshot).await {
                            Ok(report) if report.evicted > 0 => {
                                debug!(evicted = report.evicted, "slow subscribers dropped");
                            }
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "snapshot not published"),
                        }
                        metrics.set_subscribers(broadcaster.subscriber_count().await);
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
    info!("Ctrl+C received, shutting down");

    let _ = shutdown_tx.send(true);
    let _ = sampler_task.await;
    broadcaster.close_all().await;
    let _ = http_task.await;

    // Upgraded sockets outlive the server; give them time to send their close frame.
    if tokio::time::timeout(WEBSOCKET_DRAIN, open_connections.recv())
        .await
        .is_err()
    {
        warn!("websocket connections still open at exit");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
