//! # Server-Side Proxy
//!
//! The endpoint that faces the open internet. It accepts any number of
//! carrier connections (one independent channel per client-side proxy) and
//! serves their stream connect requests by dialing the real targets.

use anyhow::{Context, Result};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use crate::app::forward::forward;
use crate::config::Config;
use crate::system::channel::{
    Channel, ChannelConfig, ChannelHandle, ChannelStatus, OwnerEvent, StreamHandle,
};
use crate::system::signal::{OperatorSignal, OperatorSignals};

/// How long a target connect (including resolution) may take.
const TARGET_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct ServerSideProxy {
    cfg: Config,
    listener: TcpListener,
}

impl ServerSideProxy {
    pub async fn bind(cfg: Config) -> Result<ServerSideProxy> {
        debug_assert!(!cfg.is_client());
        let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
            .await
            .with_context(|| format!("cannot listen on port {}", cfg.listen_port))?;
        log::info!(
            "server-side proxy; accepting carriers on port {}",
            listener.local_addr()?.port()
        );
        Ok(ServerSideProxy { cfg, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until shutdown; the returned value is the process exit code.
    pub async fn run(self) -> Result<i32> {
        let mut signals = OperatorSignals::new()?;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        log::info!("carrier connection from {}", peer);
                        tokio::spawn(serve_carrier(socket, self.cfg.clone()));
                    }
                    Err(e) => log::warn!("accept error: {}", e),
                },
                sig = signals.recv() => match sig {
                    OperatorSignal::Shutdown => {
                        log::info!("shutting down");
                        return Ok(0);
                    }
                    other => log::debug!("ignoring client-side signal {:?}", other),
                },
            }
        }
    }
}

/// One carrier session: a channel actor plus a loop over its events.
async fn serve_carrier(socket: TcpStream, cfg: Config) {
    let my_addr = match socket.local_addr() {
        Ok(SocketAddr::V4(v4)) => *v4.ip(),
        _ => Ipv4Addr::UNSPECIFIED,
    };
    let (handle, mut events) = Channel::spawn(
        socket,
        ChannelConfig {
            is_client: false,
            my_addr,
            cell_size: cfg.cell_size,
            pkt_interval_ms: cfg.tamaraw_packet_interval_ms,
            requested_peer_pkt_interval_ms: 0,
            l: cfg.tamaraw_l,
            defense_time_limit_secs: cfg.tamaraw_time_limit_secs,
        },
    );

    while let Some(event) = events.recv().await {
        match event {
            OwnerEvent::Status(ChannelStatus::Ready) => {
                log::info!("carrier session ready");
            }
            OwnerEvent::Status(ChannelStatus::Closed(err)) => {
                match err {
                    Some(e) => log::info!("carrier session ended: {}", e),
                    None => log::info!("carrier session ended"),
                }
                return;
            }
            OwnerEvent::ConnectRequest { sid, host, port } => {
                tokio::spawn(connect_target(handle.clone(), sid, host, port));
            }
            OwnerEvent::DefenseSessionDone(snapshot) => {
                // only the client aggregates session-done; log and move on
                log::debug!("defense session snapshot: {:?}", snapshot);
            }
        }
    }
}

/// Resolves and connects one requested target, then forwards. A failed or
/// timed-out connect closes the stream, which the peer's SOCKS5 front-end
/// surfaces as a failed CONNECT.
async fn connect_target(channel: ChannelHandle, sid: u32, host: String, port: u16) {
    log::debug!("stream {}: connecting to [{}]:{}", sid, host, port);
    let started = Instant::now();

    match timeout(TARGET_CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(socket)) => {
            log::debug!(
                "stream {}: connected to [{}]:{} in {} ms",
                sid,
                host,
                port,
                started.elapsed().as_millis()
            );
            let (tx, rx) = mpsc::unbounded_channel();
            channel.set_stream_observer(sid, tx);
            channel.set_stream_connected(sid);

            let mut stream = StreamHandle::new(sid, rx, channel.clone());
            let inner_closed = forward(socket, &mut stream).await;
            if !inner_closed {
                stream.close();
            }
            log::debug!("stream {} finished", sid);
        }
        Ok(Err(e)) => {
            log::warn!("stream {}: connect to [{}]:{} failed: {}", sid, host, port, e);
            channel.close_stream(sid);
        }
        Err(_) => {
            log::warn!("stream {}: connect to [{}]:{} timed out", sid, host, port);
            channel.close_stream(sid);
        }
    }
}
