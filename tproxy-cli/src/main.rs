//! Operator CLI for the tunnel proxy.
//!
//! Talks the control-plane line protocol to a running client-side proxy:
//! establish the carrier tunnel, arm the auto-start defense, stop an
//! active session, or dump the channel counters.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::debug;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Tunnel Proxy CLI Tool
#[derive(Parser)]
#[command(name = "tproxy")]
#[command(about = "CLI for the tunnel proxy control plane", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Control endpoint of the running client-side proxy
    #[arg(long, global = true, default_value = "127.0.0.1:12000")]
    control_addr: String,
}

#[derive(Subcommand)]
enum Commands {
    /// (Re-)establish the carrier tunnel to the server-side proxy
    Establish {
        /// Reconnect even if a tunnel is already up
        #[arg(long)]
        force: bool,
    },
    /// Arm the defense session to start on the next socket send
    AutoStart,
    /// Stop the active defense session
    Stop {
        /// Ask for an immediate stop instead of the graceful one
        #[arg(long)]
        now: bool,
    },
    /// Print the channel traffic counters
    Stats,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let line = match &cli.command {
        Commands::Establish { force: false } => "establish-tunnel",
        Commands::Establish { force: true } => "establish-tunnel force",
        Commands::AutoStart => "auto-start-defense",
        Commands::Stop { now: false } => "stop-defense",
        Commands::Stop { now: true } => "stop-defense now",
        Commands::Stats => "stats",
    };

    debug!("sending [{}] to {}", line, cli.control_addr);
    let response = send_command(&cli.control_addr, line)?;
    println!("{}", response);

    if response.starts_with("err") {
        bail!("the proxy rejected the command");
    }
    Ok(())
}

fn send_command(addr: &str, line: &str) -> Result<String> {
    let mut conn = TcpStream::connect(addr)
        .with_context(|| format!("cannot reach the control plane at {}", addr))?;
    conn.set_read_timeout(Some(Duration::from_secs(10)))?;

    conn.write_all(line.as_bytes())?;
    conn.write_all(b"\n")?;

    let mut reader = BufReader::new(conn);
    let mut response = String::new();
    reader
        .read_line(&mut response)
        .context("no response from the proxy")?;
    if response.is_empty() {
        bail!("the proxy closed the control connection");
    }
    Ok(response.trim_end().to_string())
}
