//! # Client-Side Proxy
//!
//! The endpoint co-located with the browser. It accepts SOCKS5 connections,
//! turns each CONNECT into a stream on the carrier channel to the
//! server-side proxy, and steers defense sessions on behalf of the control
//! plane and the operator signals.
//!
//! ## Tunnel lifecycle
//!
//! The carrier is established at startup (directly, or through a local Tor
//! SOCKS port) and re-established on request via the control plane. When
//! the carrier closes unexpectedly the proxy resets to the unestablished
//! state and keeps serving the control plane; browser connections accepted
//! while no tunnel is ready are dropped. Version mismatch and an exceeded
//! defense time limit are fatal and end the process with a non-zero code.

use anyhow::{Context, Result};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::app::forward::forward;
use crate::app::socks;
use crate::config::{Config, Role};
use crate::system::channel::{
    Channel, ChannelConfig, ChannelHandle, ChannelStatus, DefenseSessionSnapshot, OwnerEvent,
    StreamEvent, StreamHandle,
};
use crate::system::control::{ControlMessage, ControlRequest};
use crate::system::signal::{OperatorSignal, OperatorSignals};

pub struct ClientSideProxy {
    cfg: Config,
    listener: TcpListener,
    tunnel: Option<ChannelHandle>,
    tunnel_events: Option<mpsc::UnboundedReceiver<OwnerEvent>>,
    tunnel_ready: bool,
}

enum Step {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Tunnel(Option<OwnerEvent>),
    Control(Option<ControlMessage>),
    Sig(OperatorSignal),
}

impl ClientSideProxy {
    pub async fn bind(cfg: Config) -> Result<ClientSideProxy> {
        debug_assert!(cfg.is_client());
        let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
            .await
            .with_context(|| format!("cannot listen on port {}", cfg.listen_port))?;
        log::info!(
            "client-side proxy; accepting socks5 clients on port {}",
            listener.local_addr()?.port()
        );
        Ok(ClientSideProxy {
            cfg,
            listener,
            tunnel: None,
            tunnel_events: None,
            tunnel_ready: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until shutdown; the returned value is the process exit code.
    pub async fn run(mut self) -> Result<i32> {
        let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel();
        if self.cfg.control_port != 0 {
            let control_listener = TcpListener::bind(("127.0.0.1", self.cfg.control_port))
                .await
                .with_context(|| {
                    format!("cannot listen on control port {}", self.cfg.control_port)
                })?;
            log::info!("control plane on port {}", self.cfg.control_port);
            tokio::spawn(crate::system::control::serve(control_listener, ctrl_tx.clone()));
        }
        // _ctrl_tx keeps the receiver open when the control plane is off
        let _ctrl_tx = ctrl_tx;

        let mut signals = OperatorSignals::new()?;

        // a dead server at startup is an operator error, not something to
        // retry silently
        self.establish_tunnel(true).await?;

        loop {
            let have_tunnel_events = self.tunnel_events.is_some();
            let step = tokio::select! {
                r = self.listener.accept() => Step::Accepted(r),
                ev = async { self.tunnel_events.as_mut().expect("guarded").recv().await },
                    if have_tunnel_events => Step::Tunnel(ev),
                msg = ctrl_rx.recv() => Step::Control(msg),
                sig = signals.recv() => Step::Sig(sig),
            };

            match step {
                Step::Accepted(Ok((conn, peer))) => self.on_browser_connection(conn, peer),
                Step::Accepted(Err(e)) => log::warn!("accept error: {}", e),
                Step::Tunnel(Some(ev)) => {
                    if let Some(exit_code) = self.on_tunnel_event(ev)? {
                        return Ok(exit_code);
                    }
                }
                Step::Tunnel(None) => self.reset_tunnel("channel task ended"),
                Step::Control(Some(msg)) => self.on_control(msg).await,
                Step::Control(None) => unreachable!("a control sender is kept alive"),
                Step::Sig(OperatorSignal::CloseAllStreams) => {
                    log::info!("SIGUSR1: closing all streams");
                    if let Some(handle) = &self.tunnel {
                        handle.close_all_streams();
                    }
                }
                Step::Sig(OperatorSignal::StopDefense) => {
                    log::info!("SIGUSR2: requesting defense stop");
                    if let Some(handle) = &self.tunnel {
                        handle.stop_defense_session(false);
                    }
                }
                Step::Sig(OperatorSignal::Shutdown) => {
                    if let Some(handle) = &self.tunnel {
                        if let Some(stats) = handle.stats().await {
                            log::info!("shutting down; {}", stats);
                        }
                    }
                    return Ok(0);
                }
            }
        }
    }

    /// Connects the carrier, through the Tor SOCKS port when configured.
    /// Returns false when an established tunnel was kept (no force).
    async fn establish_tunnel(&mut self, force: bool) -> Result<bool> {
        if self.tunnel.is_some() && self.tunnel_ready && !force {
            log::info!("tunnel already ready; not reconnecting");
            return Ok(false);
        }
        self.reset_tunnel("establishing tunnel");

        let (ssp_host, ssp_port) = match &self.cfg.role {
            Role::Client { ssp_host, ssp_port } => (ssp_host.clone(), *ssp_port),
            Role::Server => unreachable!("csp built from a server config"),
        };

        let socket = if self.cfg.tor_socks_port != 0 {
            log::info!(
                "connecting to [{}]:{} through tor socks port {}",
                ssp_host,
                ssp_port,
                self.cfg.tor_socks_port
            );
            let mut s = TcpStream::connect(("127.0.0.1", self.cfg.tor_socks_port))
                .await
                .context("cannot reach the tor socks port")?;
            socks::connect_through(&mut s, &ssp_host, ssp_port)
                .await
                .context("socks connect to the ssp failed")?;
            s
        } else {
            log::info!("connecting to [{}]:{}", ssp_host, ssp_port);
            TcpStream::connect((ssp_host.as_str(), ssp_port))
                .await
                .context("cannot connect to the ssp")?
        };

        let my_addr = match socket.local_addr() {
            Ok(SocketAddr::V4(v4)) => *v4.ip(),
            _ => Ipv4Addr::UNSPECIFIED,
        };
        let (handle, events) = Channel::spawn(
            socket,
            ChannelConfig {
                is_client: true,
                my_addr,
                cell_size: self.cfg.cell_size,
                pkt_interval_ms: self.cfg.tamaraw_packet_interval_ms,
                requested_peer_pkt_interval_ms: self.cfg.ssp_tamaraw_packet_interval_ms,
                l: self.cfg.tamaraw_l,
                defense_time_limit_secs: self.cfg.tamaraw_time_limit_secs,
            },
        );
        self.tunnel = Some(handle);
        self.tunnel_events = Some(events);
        self.tunnel_ready = false;
        Ok(true)
    }

    fn reset_tunnel(&mut self, reason: &str) {
        if let Some(handle) = self.tunnel.take() {
            log::info!("dropping the tunnel: {}", reason);
            handle.close_carrier();
        }
        self.tunnel_events = None;
        self.tunnel_ready = false;
    }

    fn on_browser_connection(&mut self, conn: TcpStream, peer: SocketAddr) {
        if !self.tunnel_ready {
            log::warn!("no tunnel; dropping browser connection from {}", peer);
            return;
        }
        let handle = match &self.tunnel {
            Some(handle) => handle.clone(),
            None => return,
        };
        tokio::spawn(handle_browser_client(conn, peer, handle));
    }

    /// Returns `Some(exit_code)` when the proxy should stop.
    fn on_tunnel_event(&mut self, event: OwnerEvent) -> Result<Option<i32>> {
        match event {
            OwnerEvent::Status(ChannelStatus::Ready) => {
                log::info!("tunnel ready; accepting browser clients");
                self.tunnel_ready = true;
                if self.cfg.auto_start_defense_session_on_next_send {
                    if let Some(handle) = &self.tunnel {
                        handle.set_auto_start_defense_on_next_send();
                    }
                }
            }
            OwnerEvent::Status(ChannelStatus::Closed(err)) => {
                match err {
                    Some(e) if e.is_fatal_for_client() => {
                        log::error!("carrier failed fatally: {}", e);
                        return Err(e.into());
                    }
                    Some(e) => {
                        log::warn!("carrier closed: {}", e);
                        self.reset_tunnel("carrier closed");
                    }
                    None => self.reset_tunnel("carrier closed"),
                }
            }
            OwnerEvent::ConnectRequest { sid, .. } => {
                // the channel rejects server-to-client stream opens before
                // this could ever fire
                log::error!("unexpected connect request for stream {}", sid);
            }
            OwnerEvent::DefenseSessionDone(snapshot) => {
                self.on_defense_session_done(&snapshot);
                if self.cfg.exit_on_a_defense_session_done {
                    log::info!("exiting on defense session done, as configured");
                    return Ok(Some(0));
                }
            }
        }
        Ok(None)
    }

    fn on_defense_session_done(&self, snapshot: &DefenseSessionSnapshot) {
        log::info!(
            "a defense session is done: {} send attempts, {} defensive cells from peer; {}",
            snapshot.write_attempts,
            snapshot.peer_defensive_cells,
            snapshot.stats
        );
        if let Some(path) = &self.cfg.write_file_on_a_defense_session_done {
            let text = format!(
                "write_attempts={}\npeer_defensive_cells={}\n{}\n",
                snapshot.write_attempts, snapshot.peer_defensive_cells, snapshot.stats
            );
            if let Err(e) = std::fs::write(path, text) {
                log::error!("cannot write {}: {}", path.display(), e);
            }
        }
    }

    async fn on_control(&mut self, msg: ControlMessage) {
        let response = match msg.request {
            ControlRequest::EstablishTunnel { force } => {
                match self.establish_tunnel(force).await {
                    Ok(true) => "ok: establishing".to_string(),
                    Ok(false) => "ok: already ready".to_string(),
                    Err(e) => format!("err: {:#}", e),
                }
            }
            ControlRequest::AutoStartDefense => match &self.tunnel {
                Some(handle) => {
                    handle.set_auto_start_defense_on_next_send();
                    "ok".to_string()
                }
                None => "err: no tunnel".to_string(),
            },
            ControlRequest::StopDefense { right_now } => match &self.tunnel {
                Some(handle) => {
                    handle.stop_defense_session(right_now);
                    "ok".to_string()
                }
                None => "err: no tunnel".to_string(),
            },
            ControlRequest::Stats => match &self.tunnel {
                Some(handle) => match handle.stats().await {
                    Some(stats) => format!("ok: {}", stats),
                    None => "err: channel gone".to_string(),
                },
                None => "err: no tunnel".to_string(),
            },
        };
        let _ = msg.reply.send(response);
    }
}

/// One browser connection: SOCKS5 handshake, stream creation, forwarding.
async fn handle_browser_client(mut conn: TcpStream, peer: SocketAddr, channel: ChannelHandle) {
    let (host, port) = match socks::accept_connect(&mut conn).await {
        Ok(target) => target,
        Err(e) => {
            log::debug!("socks handshake with {} failed: {}", peer, e);
            return;
        }
    };
    log::info!("{} requests [{}]:{}", peer, host, port);

    let mut events = channel.create_stream(&host, port);
    let sid = match events.recv().await {
        Some(StreamEvent::IdAssigned(sid)) => sid,
        other => {
            log::debug!("stream creation for {} failed early: {:?}", peer, other);
            return;
        }
    };
    match events.recv().await {
        Some(StreamEvent::CreateResult(true)) => {}
        Some(StreamEvent::CreateResult(false)) => {
            log::info!("ssp refused [{}]:{}", host, port);
            channel.close_stream(sid);
            return;
        }
        other => {
            // Closed here means the ssp could not reach the target
            log::info!("stream {} closed before it was established: {:?}", sid, other);
            return;
        }
    }

    if conn.write_all(&socks::CONNECT_GRANTED_REPLY).await.is_err() {
        channel.close_stream(sid);
        return;
    }

    let mut stream = StreamHandle::new(sid, events, channel.clone());
    let inner_closed = forward(conn, &mut stream).await;
    if !inner_closed {
        stream.close();
    }
    log::debug!("browser client {} finished (stream {})", peer, sid);
}
