//! # Configuration
//!
//! The proxy is one binary that runs as either endpoint of the tunnel.
//! Presence of `--ssp=<host:port>` selects the client side (the endpoint
//! the browser talks SOCKS5 to); without it the process is the server
//! side, accepting carrier connections and dialing real targets.
//!
//! Every key can come from the command line (`--name=value`) or from a
//! JSON config file passed with `--conf`; command-line values win. The
//! defense parameters are all-or-nothing: either the packet interval, L
//! and the time limit are all set (cells of 750 bytes), or none are
//! (pass-through carrier, no cells).

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

use crate::system::channel::cell::CELL_SIZE;
use crate::system::channel::peer::{l_is_allowed, pkt_interval_is_allowed};

/// Default browser-facing SOCKS5 port on the client side.
const DEFAULT_CSP_LISTEN_PORT: u16 = 1080;
/// Default carrier port on the server side.
const DEFAULT_SSP_LISTEN_PORT: u16 = 2081;
/// Upper bound on the defense session time limit, in seconds.
const MAX_TIME_LIMIT_SECS: u32 = 180;

#[derive(Parser, Debug, Default)]
#[command(name = "tproxy-core", about = "Two-endpoint traffic-shaping tunnel proxy")]
pub struct Cli {
    /// Server-side proxy to tunnel through, as host:port. Selects client
    /// mode.
    #[arg(long)]
    pub ssp: Option<String>,

    /// Listen port: SOCKS5 on the client side, carrier on the server side.
    #[arg(long)]
    pub port: Option<u16>,

    /// Reach the server through a local SOCKS5 proxy (a Tor client) on
    /// this port.
    #[arg(long = "tor-socks-port")]
    pub tor_socks_port: Option<u16>,

    /// Milliseconds between defended sends on this side.
    #[arg(long = "tamaraw-packet-interval")]
    pub tamaraw_packet_interval: Option<u16>,

    /// Client only: the packet interval the server should adopt.
    #[arg(long = "ssp-tamaraw-packet-interval")]
    pub ssp_tamaraw_packet_interval: Option<u16>,

    /// Stopping modulus; defense ends only on a multiple of L attempts.
    #[arg(long = "tamaraw-L")]
    pub tamaraw_l: Option<u16>,

    /// Hard cap on how long one defense session may stay active.
    #[arg(long = "tamaraw-time-limit-secs")]
    pub tamaraw_time_limit_secs: Option<u32>,

    /// Client only: arm the defense to start on the next socket send.
    #[arg(long = "auto-start-defense-session-on-next-send", value_name = "yes|no")]
    pub auto_start_defense_session_on_next_send: Option<String>,

    /// Client only: write the session snapshot to this file when a defense
    /// session finishes.
    #[arg(long = "write-file-on-a-defense-session-done", value_name = "path")]
    pub write_file_on_a_defense_session_done: Option<PathBuf>,

    /// Client only: exit once a defense session finishes.
    #[arg(long = "exit-on-a-defense-session-done", value_name = "yes|no")]
    pub exit_on_a_defense_session_done: Option<String>,

    /// Client only: localhost port for the control-plane protocol
    /// (0 or absent disables it).
    #[arg(long = "control-port")]
    pub control_port: Option<u16>,

    /// JSON config file; command-line flags override its values.
    #[arg(long)]
    pub conf: Option<PathBuf>,
}

/// The same keys, as they appear in a `--conf` file.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub ssp: Option<String>,
    pub port: Option<u16>,
    #[serde(rename = "tor-socks-port")]
    pub tor_socks_port: Option<u16>,
    #[serde(rename = "tamaraw-packet-interval")]
    pub tamaraw_packet_interval: Option<u16>,
    #[serde(rename = "ssp-tamaraw-packet-interval")]
    pub ssp_tamaraw_packet_interval: Option<u16>,
    #[serde(rename = "tamaraw-L")]
    pub tamaraw_l: Option<u16>,
    #[serde(rename = "tamaraw-time-limit-secs")]
    pub tamaraw_time_limit_secs: Option<u32>,
    #[serde(rename = "auto-start-defense-session-on-next-send")]
    pub auto_start_defense_session_on_next_send: Option<String>,
    #[serde(rename = "write-file-on-a-defense-session-done")]
    pub write_file_on_a_defense_session_done: Option<PathBuf>,
    #[serde(rename = "exit-on-a-defense-session-done")]
    pub exit_on_a_defense_session_done: Option<String>,
    #[serde(rename = "control-port")]
    pub control_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Client { ssp_host: String, ssp_port: u16 },
    Server,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub listen_port: u16,
    /// 0 means connect to the server directly.
    pub tor_socks_port: u16,
    /// 0 (pass-through) or 750, derived from the defense parameters.
    pub cell_size: usize,
    pub tamaraw_packet_interval_ms: u16,
    pub ssp_tamaraw_packet_interval_ms: u16,
    pub tamaraw_l: u16,
    pub tamaraw_time_limit_secs: u32,
    pub auto_start_defense_session_on_next_send: bool,
    pub write_file_on_a_defense_session_done: Option<PathBuf>,
    pub exit_on_a_defense_session_done: bool,
    /// 0 disables the control listener.
    pub control_port: u16,
}

impl Config {
    pub fn is_client(&self) -> bool {
        matches!(self.role, Role::Client { .. })
    }
}

fn parse_yes_no(key: &str, value: &str) -> Result<bool> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => bail!("{} must be yes or no, not [{}]", key, other),
    }
}

fn parse_host_port(value: &str) -> Result<(String, u16)> {
    let (host, port) = value
        .rsplit_once(':')
        .with_context(|| format!("[{}] is not host:port", value))?;
    if host.is_empty() {
        bail!("[{}] has an empty host", value);
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("[{}] has a bad port", value))?;
    Ok((host.to_string(), port))
}

/// Parses the command line (and the optional config file) into a validated
/// `Config`.
pub fn load() -> Result<Config> {
    let cli = Cli::parse();
    let file = match &cli.conf {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("cannot parse config file {}", path.display()))?
        }
        None => FileConfig::default(),
    };
    resolve(cli, file)
}

/// Applies file values under command-line values and validates the result.
pub fn resolve(cli: Cli, file: FileConfig) -> Result<Config> {
    let ssp = cli.ssp.or(file.ssp);
    let role = match ssp {
        Some(value) => {
            let (ssp_host, ssp_port) = parse_host_port(&value)?;
            Role::Client { ssp_host, ssp_port }
        }
        None => Role::Server,
    };
    let is_client = matches!(role, Role::Client { .. });

    let listen_port = cli.port.or(file.port).unwrap_or(if is_client {
        DEFAULT_CSP_LISTEN_PORT
    } else {
        DEFAULT_SSP_LISTEN_PORT
    });

    let interval = cli
        .tamaraw_packet_interval
        .or(file.tamaraw_packet_interval)
        .unwrap_or(0);
    let l = cli.tamaraw_l.or(file.tamaraw_l).unwrap_or(0);
    let time_limit = cli
        .tamaraw_time_limit_secs
        .or(file.tamaraw_time_limit_secs)
        .unwrap_or(0);
    let ssp_interval = cli
        .ssp_tamaraw_packet_interval
        .or(file.ssp_tamaraw_packet_interval)
        .unwrap_or(0);

    if !pkt_interval_is_allowed(interval) {
        bail!("unsupported tamaraw-packet-interval {}", interval);
    }
    if !l_is_allowed(l) {
        bail!("unsupported tamaraw-L {}", l);
    }
    if !pkt_interval_is_allowed(ssp_interval) {
        bail!("unsupported ssp-tamaraw-packet-interval {}", ssp_interval);
    }
    if time_limit > MAX_TIME_LIMIT_SECS {
        bail!(
            "tamaraw-time-limit-secs {} exceeds the maximum of {}",
            time_limit,
            MAX_TIME_LIMIT_SECS
        );
    }

    let any_defense = interval != 0 || l != 0 || time_limit != 0;
    let all_defense = interval != 0 && l != 0 && time_limit != 0;
    if any_defense && !all_defense {
        bail!(
            "tamaraw-packet-interval, tamaraw-L and tamaraw-time-limit-secs \
             must be given together (or all omitted for pass-through)"
        );
    }

    let auto_start = match cli
        .auto_start_defense_session_on_next_send
        .or(file.auto_start_defense_session_on_next_send)
    {
        Some(v) => parse_yes_no("auto-start-defense-session-on-next-send", &v)?,
        None => false,
    };
    let exit_on_done = match cli
        .exit_on_a_defense_session_done
        .or(file.exit_on_a_defense_session_done)
    {
        Some(v) => parse_yes_no("exit-on-a-defense-session-done", &v)?,
        None => false,
    };
    let write_file = cli
        .write_file_on_a_defense_session_done
        .or(file.write_file_on_a_defense_session_done);
    let tor_socks_port = cli.tor_socks_port.or(file.tor_socks_port).unwrap_or(0);
    let control_port = cli.control_port.or(file.control_port).unwrap_or(0);

    if !is_client {
        if auto_start {
            bail!("auto-start-defense-session-on-next-send only applies to the client side");
        }
        if exit_on_done {
            bail!("exit-on-a-defense-session-done only applies to the client side");
        }
        if write_file.is_some() {
            bail!("write-file-on-a-defense-session-done only applies to the client side");
        }
        if ssp_interval != 0 {
            bail!("ssp-tamaraw-packet-interval only applies to the client side");
        }
        if tor_socks_port != 0 {
            bail!("tor-socks-port only applies to the client side");
        }
        if control_port != 0 {
            bail!("control-port only applies to the client side");
        }
    }
    if auto_start && !all_defense {
        bail!("auto-start requires the tamaraw parameters to be set");
    }

    Ok(Config {
        role,
        listen_port,
        tor_socks_port,
        cell_size: if all_defense { CELL_SIZE } else { 0 },
        tamaraw_packet_interval_ms: interval,
        ssp_tamaraw_packet_interval_ms: ssp_interval,
        tamaraw_l: l,
        tamaraw_time_limit_secs: time_limit,
        auto_start_defense_session_on_next_send: auto_start,
        write_file_on_a_defense_session_done: write_file,
        exit_on_a_defense_session_done: exit_on_done,
        control_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_cli() -> Cli {
        Cli {
            ssp: Some("ssp.example:2081".to_string()),
            ..Cli::default()
        }
    }

    #[test]
    fn pass_through_client() {
        let cfg = resolve(client_cli(), FileConfig::default()).unwrap();
        assert!(cfg.is_client());
        assert_eq!(cfg.cell_size, 0);
        assert_eq!(cfg.listen_port, DEFAULT_CSP_LISTEN_PORT);
        assert_eq!(
            cfg.role,
            Role::Client {
                ssp_host: "ssp.example".to_string(),
                ssp_port: 2081
            }
        );
    }

    #[test]
    fn defended_client() {
        let mut cli = client_cli();
        cli.tamaraw_packet_interval = Some(20);
        cli.tamaraw_l = Some(100);
        cli.tamaraw_time_limit_secs = Some(30);
        let cfg = resolve(cli, FileConfig::default()).unwrap();
        assert_eq!(cfg.cell_size, CELL_SIZE);
        assert_eq!(cfg.tamaraw_l, 100);
    }

    #[test]
    fn partial_defense_parameters_are_rejected() {
        let mut cli = client_cli();
        cli.tamaraw_packet_interval = Some(20);
        assert!(resolve(cli, FileConfig::default()).is_err());
    }

    #[test]
    fn out_of_set_values_are_rejected() {
        let mut cli = client_cli();
        cli.tamaraw_packet_interval = Some(13);
        cli.tamaraw_l = Some(100);
        cli.tamaraw_time_limit_secs = Some(30);
        assert!(resolve(cli, FileConfig::default()).is_err());

        let mut cli = client_cli();
        cli.tamaraw_packet_interval = Some(20);
        cli.tamaraw_l = Some(42);
        cli.tamaraw_time_limit_secs = Some(30);
        assert!(resolve(cli, FileConfig::default()).is_err());
    }

    #[test]
    fn client_only_keys_rejected_on_server() {
        let cli = Cli {
            auto_start_defense_session_on_next_send: Some("yes".to_string()),
            tamaraw_packet_interval: Some(20),
            tamaraw_l: Some(100),
            tamaraw_time_limit_secs: Some(30),
            ..Cli::default()
        };
        assert!(resolve(cli, FileConfig::default()).is_err());
    }

    #[test]
    fn server_defaults() {
        let cfg = resolve(Cli::default(), FileConfig::default()).unwrap();
        assert!(!cfg.is_client());
        assert_eq!(cfg.listen_port, DEFAULT_SSP_LISTEN_PORT);
    }

    #[test]
    fn command_line_wins_over_file() {
        let mut cli = client_cli();
        cli.port = Some(7777);
        let file: FileConfig = serde_json::from_str(
            r#"{"port": 1111, "tamaraw-packet-interval": 20,
                "tamaraw-L": 100, "tamaraw-time-limit-secs": 30}"#,
        )
        .unwrap();
        let cfg = resolve(cli, file).unwrap();
        assert_eq!(cfg.listen_port, 7777);
        assert_eq!(cfg.tamaraw_l, 100);
    }

    #[test]
    fn yes_no_parsing() {
        let mut cli = client_cli();
        cli.tamaraw_packet_interval = Some(20);
        cli.tamaraw_l = Some(100);
        cli.tamaraw_time_limit_secs = Some(30);
        cli.exit_on_a_defense_session_done = Some("yes".to_string());
        let cfg = resolve(cli, FileConfig::default()).unwrap();
        assert!(cfg.exit_on_a_defense_session_done);

        let mut cli = client_cli();
        cli.exit_on_a_defense_session_done = Some("maybe".to_string());
        assert!(resolve(cli, FileConfig::default()).is_err());
    }
}
