//! `landrop-node`: a thin daemon binary around `landrop-core::Node`.
//!
//! Parses CLI flags, loads layered configuration, initializes logging, binds
//! a `Node`, and then runs a minimal line-oriented front end on stdin so the
//! crate is manually exercisable end to end. This front end is not the
//! "interactive command shell" the core treats as an external collaborator:
//! it never parses anything beyond the four typed operations the core
//! exposes (`announce`, `list_peers`, `send_text`, `send_file`).

mod config;

use std::path::PathBuf;

use clap::Parser;
use landrop_core::{Node, NodeConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Join a self-organizing LAN peer group: discover peers, chat, and send files.
#[derive(Parser, Debug)]
#[command(name = "landrop-node", version, about)]
struct Cli {
    /// Name this node announces itself as (default: from config file or landrop-<pid>).
    #[arg(long)]
    name: Option<String>,

    /// UDP port to bind and broadcast HEARTBEAT on.
    #[arg(long)]
    port: Option<u16>,

    /// Directory received files are written into.
    #[arg(long = "dest-dir")]
    dest_dir: Option<PathBuf>,

    /// Log verbosity, overridden by `RUST_LOG` if set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = config::load();
    if let Some(name) = cli.name {
        config.name = name;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(dest_dir) = cli.dest_dir {
        config.dest_dir = dest_dir;
    }

    tracing::info!(name = %config.name, port = config.port, dest_dir = ?config.dest_dir, "starting landrop-node");

    let node_config = NodeConfig { name: config.name.clone(), port: config.port, dest_dir: config.dest_dir.clone() };
    let node = Node::bind(node_config).await?;

    println!("landrop-node: joined as '{}' on UDP port {}", config.name, config.port);
    println!("commands: devices | talk <name> <message> | sendfile <name> <path> | exit");

    tokio::select! {
        result = run_repl(node.clone()) => result?,
        _ = shutdown_signal() => {
            tracing::info!("signal received, shutting down");
        }
    }

    node.shutdown();
    Ok(())
}

async fn run_repl(node: Node) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();

        match cmd {
            "devices" => {
                let peers = node.list_peers().await;
                if peers.is_empty() {
                    println!("(no peers seen yet)");
                } else {
                    for (name, addr, port, age) in peers {
                        println!("{name}\t{addr}:{port}\tlast seen {}s ago", age.as_secs());
                    }
                }
            }
            "talk" => {
                let mut args = rest.splitn(2, ' ');
                let name = args.next().unwrap_or("");
                let text = args.next().unwrap_or("");
                if name.is_empty() || text.is_empty() {
                    println!("usage: talk <name> <message>");
                    continue;
                }
                match node.send_text(name, text).await {
                    Ok(()) => println!("sent"),
                    Err(e) => println!("failed: {e}"),
                }
            }
            "sendfile" => {
                let mut args = rest.splitn(2, ' ');
                let name = args.next().unwrap_or("");
                let path = args.next().unwrap_or("");
                if name.is_empty() || path.is_empty() {
                    println!("usage: sendfile <name> <path>");
                    continue;
                }
                match node.send_file(name, std::path::Path::new(path)).await {
                    Ok(()) => println!("sent"),
                    Err(e) => println!("failed: {e}"),
                }
            }
            "exit" | "quit" => break,
            other => println!("unknown command: {other}"),
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
