// src/main.rs

//! The main entry point for the groupd daemon.

use std::env;

use anyhow::Result;
use groupd::config::Config;
use groupd::core::daemon::{Context, InboundClientMessage};
use groupd::core::endpoint::listener;
use groupd::core::introspection;
use groupd::core::messaging::udp::{PeerTable, UdpBus};
use groupd::core::oracle::static_table::StaticOracle;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "\
Usage: groupd [-D] [-v]... [-h] [-V] [--config <path>] [--nodeid <id>]

  -D              run in the foreground with debug-friendly logging
  -v              raise verbosity (may be repeated, up to 3 times)
  -h              print this help text and exit
  -V              print the version and exit
  --config PATH   load tunables from a TOML file (optional)
  --nodeid ID     this daemon's node id (default: 1)
";

struct Cli {
    foreground: bool,
    verbosity: u8,
    config_path: Option<String>,
    our_nodeid: u32,
}

fn parse_args(args: &[String]) -> Result<Option<Cli>> {
    let mut foreground = false;
    let mut verbosity = 0u8;
    let mut config_path = None;
    let mut our_nodeid = 1u32;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-D" => foreground = true,
            "-v" => verbosity = (verbosity + 1).min(3),
            "-h" => {
                print!("{USAGE}");
                return Ok(None);
            }
            "-V" => {
                println!("groupd version {VERSION}");
                return Ok(None);
            }
            "--config" => {
                i += 1;
                config_path = Some(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?
                        .clone(),
                );
            }
            "--nodeid" => {
                i += 1;
                our_nodeid = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--nodeid requires a value"))?
                    .parse()
                    .map_err(|_| anyhow::anyhow!("--nodeid must be a number"))?;
            }
            other => return Err(anyhow::anyhow!("unrecognized argument: {other}")),
        }
        i += 1;
    }

    Ok(Some(Cli { foreground, verbosity, config_path, our_nodeid }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let cli = match parse_args(&args) {
        Ok(Some(cli)) => cli,
        Ok(None) => return Ok(()),
        Err(e) => {
            eprintln!("{e}");
            print!("{USAGE}");
            std::process::exit(1);
        }
    };

    let default_level = match cli.verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let initial_filter = env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new(initial_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(cli.foreground))
        .init();

    if let Err(e) = run_app(cli).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run_app(cli: Cli) -> Result<()> {
    let config = match cli.config_path {
        Some(path) => Config::from_file(&path).await?,
        None => Config::default(),
    };

    info!(nodeid = cli.our_nodeid, "starting groupd");

    let bind_addr = config.bus_bind_addr.parse()?;
    let oracle = StaticOracle::new(cli.our_nodeid, vec![cli.our_nodeid]);
    let (bus, bus_events) = UdpBus::bind(bind_addr, cli.our_nodeid, PeerTable::new()).await?;

    let ctx: Context<StaticOracle> = Context::new(config.clone(), oracle, bus);

    let (client_tx, client_rx) = mpsc::unbounded_channel::<InboundClientMessage>();
    listener::serve(&config.client_socket_path, client_tx).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    spawn_shutdown_signals(shutdown_tx);
    spawn_ring_flush_signal(&config, &ctx);

    ctx.run(bus_events, client_rx, shutdown_rx).await;
    Ok(())
}

#[cfg(unix)]
fn spawn_ring_flush_signal(config: &Config, ctx: &Context<StaticOracle>) {
    let ring_path = std::path::PathBuf::from(&config.ring_dump_path);
    let ring = ctx.ring.clone();
    tokio::spawn(introspection::flush_on_signal(ring_path, ring));
}

#[cfg(windows)]
fn spawn_ring_flush_signal(_config: &Config, _ctx: &Context<StaticOracle>) {}

#[cfg(unix)]
fn spawn_shutdown_signals(shutdown_tx: broadcast::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        let _ = shutdown_tx.send(());
    });
}

#[cfg(windows)]
fn spawn_shutdown_signals(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });
}
