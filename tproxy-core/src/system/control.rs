//! Control-plane protocol server.
//!
//! The client-side proxy exposes a small line-oriented TCP protocol on a
//! localhost port so an external driver (or the operator CLI) can steer
//! defense sessions without signals. One command per line; the response is
//! a single line starting with `ok` or `err`.
//!
//! Commands:
//! - `establish-tunnel [force]`
//! - `auto-start-defense`
//! - `stop-defense [now]`
//! - `stats`

use std::io;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    EstablishTunnel { force: bool },
    AutoStartDefense,
    StopDefense { right_now: bool },
    Stats,
}

/// A parsed request plus the slot the response line goes into.
pub struct ControlMessage {
    pub request: ControlRequest,
    pub reply: oneshot::Sender<String>,
}

pub fn parse_request(line: &str) -> Option<ControlRequest> {
    let mut words = line.split_whitespace();
    let cmd = words.next()?;
    let arg = words.next();
    if words.next().is_some() {
        return None;
    }
    match (cmd, arg) {
        ("establish-tunnel", None) => Some(ControlRequest::EstablishTunnel { force: false }),
        ("establish-tunnel", Some("force")) => Some(ControlRequest::EstablishTunnel { force: true }),
        ("auto-start-defense", None) => Some(ControlRequest::AutoStartDefense),
        ("stop-defense", None) => Some(ControlRequest::StopDefense { right_now: false }),
        ("stop-defense", Some("now")) => Some(ControlRequest::StopDefense { right_now: true }),
        ("stats", None) => Some(ControlRequest::Stats),
        _ => None,
    }
}

/// Accept loop for the control listener. Each connection gets its own task
/// and may issue any number of commands.
pub async fn serve(listener: TcpListener, requests: mpsc::UnboundedSender<ControlMessage>) {
    loop {
        match listener.accept().await {
            Ok((conn, addr)) => {
                log::debug!("control connection from {}", addr);
                let requests = requests.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(conn, requests).await {
                        log::debug!("control connection ended: {}", e);
                    }
                });
            }
            Err(e) => {
                log::warn!("control accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(
    conn: TcpStream,
    requests: mpsc::UnboundedSender<ControlMessage>,
) -> io::Result<()> {
    let (read_half, mut write_half) = conn.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match parse_request(line) {
            Some(request) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let msg = ControlMessage { request, reply: reply_tx };
                if requests.send(msg).is_err() {
                    "err: proxy is shutting down".to_string()
                } else {
                    reply_rx
                        .await
                        .unwrap_or_else(|_| "err: request dropped".to_string())
                }
            }
            None => format!("err: unknown command [{}]", line),
        };
        write_half.write_all(response.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
    Ok(())
}
