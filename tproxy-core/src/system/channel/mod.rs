//! # Carrier Channel
//!
//! One `Channel` owns the long-lived TCP connection between the client-side
//! and server-side proxies, and everything that rides on it: the peer-info
//! handshake, the stream multiplexer, the staged cell output, the defense
//! scheduler and the traffic counters.
//!
//! ## Actor model
//!
//! The channel runs as a single task that exclusively owns its socket and
//! all of its state; there are no locks. The public operations are a
//! command enum delivered over an mpsc sender (`ChannelHandle`), stream
//! observers are per-stream event senders, and channel-level callbacks are
//! owner events. The select loop is biased so a pending defense tick is
//! always served before socket I/O.
//!
//! ## Write scheduling
//!
//! Outside of a defense session the socket-writable branch of the loop is
//! armed whenever staged bytes exist (minus a droppable tail dummy). While
//! a defense session is active that branch is disarmed entirely and the
//! timer is the only thing that writes: one cell per tick, dummy padding
//! when no data is pending. Writes go through `try_write` so a kernel
//! refusal keeps the attempt accounting exact.

pub mod cell;
pub mod defense;
pub mod mux;
pub mod outbuf;
pub mod peer;

use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use self::cell::{decode_header, encode_header, flags, CellType, CELL_HEADER_SIZE, CELL_SIZE};
use self::defense::{apply_cell_flags, DefenseInfo, DefenseState};
use self::mux::{Mux, MuxAction};
use self::outbuf::CellOutbuf;
use self::peer::{l_is_allowed, pkt_interval_is_allowed, PeerInfo, PEER_INFO_LEN, PROTOCOL_VERSION};

pub use self::mux::StreamEvent;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("peer protocol version {peer} does not match ours ({ours})")]
    VersionMismatch { ours: u8, peer: u8 },
    #[error("peer closed the carrier")]
    PeerEof,
    #[error("defense session exceeded its time limit")]
    DefenseTimeLimitExceeded,
    #[error("carrier i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// Errors the client-side owner must treat as fatal rather than
    /// recover from by reconnecting.
    pub fn is_fatal_for_client(&self) -> bool {
        matches!(
            self,
            ChannelError::VersionMismatch { .. } | ChannelError::DefenseTimeLimitExceeded
        )
    }
}

/// Monotonic traffic counters, as seen at the socket.
#[derive(Debug, Default, Clone)]
pub struct ChannelStats {
    pub all_send_bytes: u64,
    pub useful_send_bytes: u64,
    pub dummy_send_cells: u32,
    pub all_recv_bytes: u64,
    pub useful_recv_bytes: u64,
    pub dummy_recv_cells: u32,
    /// Whole dummy cells replaced by real data before they were written.
    pub dummy_cells_avoided: u32,
}

impl fmt::Display for ChannelStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {} bytes ({} useful, {} dummy cells, {} avoided); \
             received {} bytes ({} useful, {} dummy cells)",
            self.all_send_bytes,
            self.useful_send_bytes,
            self.dummy_send_cells,
            self.dummy_cells_avoided,
            self.all_recv_bytes,
            self.useful_recv_bytes,
            self.dummy_recv_cells,
        )
    }
}

/// Snapshot delivered when a defense session has finished in both
/// directions.
#[derive(Debug, Clone)]
pub struct DefenseSessionSnapshot {
    /// Socket write attempts made over the session's send direction.
    pub write_attempts: u32,
    /// DEFENSIVE-flagged cells received from the peer.
    pub peer_defensive_cells: u32,
    pub stats: ChannelStats,
}

#[derive(Debug)]
pub enum ChannelStatus {
    Ready,
    /// The carrier is gone. `None` means a locally requested close.
    Closed(Option<ChannelError>),
}

/// Events delivered to whoever spawned the channel.
#[derive(Debug)]
pub enum OwnerEvent {
    Status(ChannelStatus),
    /// Server side only: the peer asked for a stream to `host:port`.
    ConnectRequest { sid: u32, host: String, port: u16 },
    DefenseSessionDone(DefenseSessionSnapshot),
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub is_client: bool,
    /// Sent to the peer in the preamble, for troubleshooting.
    pub my_addr: Ipv4Addr,
    /// 0 (pass-through) or `cell::CELL_SIZE`.
    pub cell_size: usize,
    /// Interval between defended sends on our side.
    pub pkt_interval_ms: u16,
    /// Client only: the interval we ask the server to adopt.
    pub requested_peer_pkt_interval_ms: u16,
    /// Stopping modulus; the client's value is also requested of the
    /// server.
    pub l: u16,
    pub defense_time_limit_secs: u32,
}

enum Command {
    CreateStream {
        host: String,
        port: u16,
        observer: mpsc::UnboundedSender<StreamEvent>,
    },
    SetStreamObserver {
        sid: u32,
        observer: mpsc::UnboundedSender<StreamEvent>,
    },
    SetStreamConnected {
        sid: u32,
    },
    WriteBuffer {
        sid: u32,
        data: Bytes,
    },
    SetWriteEof {
        sid: u32,
    },
    CloseStream {
        sid: u32,
    },
    CloseAllStreams,
    SetAutoStartDefenseOnNextSend,
    StopDefense {
        right_now: bool,
    },
    Stats {
        reply: oneshot::Sender<ChannelStats>,
    },
    CloseCarrier,
}

/// Cheaply clonable front to a channel actor.
#[derive(Clone)]
pub struct ChannelHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ChannelHandle {
    /// Client only. Returns the observer's event receiver; the first event
    /// is always `IdAssigned`, then `CreateResult` once the peer answers.
    pub fn create_stream(&self, host: &str, port: u16) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.cmd_tx.send(Command::CreateStream {
            host: host.to_string(),
            port,
            observer: tx,
        });
        rx
    }

    pub fn set_stream_observer(&self, sid: u32, observer: mpsc::UnboundedSender<StreamEvent>) {
        let _ = self.cmd_tx.send(Command::SetStreamObserver { sid, observer });
    }

    /// Server only: acknowledges that the outward target is connected.
    pub fn set_stream_connected(&self, sid: u32) {
        let _ = self.cmd_tx.send(Command::SetStreamConnected { sid });
    }

    pub fn write_buffer(&self, sid: u32, data: Bytes) {
        let _ = self.cmd_tx.send(Command::WriteBuffer { sid, data });
    }

    pub fn set_write_eof(&self, sid: u32) {
        let _ = self.cmd_tx.send(Command::SetWriteEof { sid });
    }

    pub fn close_stream(&self, sid: u32) {
        let _ = self.cmd_tx.send(Command::CloseStream { sid });
    }

    pub fn close_all_streams(&self) {
        let _ = self.cmd_tx.send(Command::CloseAllStreams);
    }

    pub fn set_auto_start_defense_on_next_send(&self) {
        let _ = self.cmd_tx.send(Command::SetAutoStartDefenseOnNextSend);
    }

    pub fn stop_defense_session(&self, right_now: bool) {
        let _ = self.cmd_tx.send(Command::StopDefense { right_now });
    }

    pub fn close_carrier(&self) {
        let _ = self.cmd_tx.send(Command::CloseCarrier);
    }

    /// Fetches the current counters. `None` when the channel is gone.
    pub async fn stats(&self) -> Option<ChannelStats> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Stats { reply: tx }).ok()?;
        rx.await.ok()
    }
}

/// One logical stream plus the plumbing a forwarder needs.
pub struct StreamHandle {
    sid: u32,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    channel: ChannelHandle,
}

impl StreamHandle {
    pub fn new(
        sid: u32,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        channel: ChannelHandle,
    ) -> StreamHandle {
        StreamHandle { sid, events, channel }
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn write(&self, data: Bytes) {
        self.channel.write_buffer(self.sid, data);
    }

    pub fn set_write_eof(&self) {
        self.channel.set_write_eof(self.sid);
    }

    pub fn close(&self) {
        self.channel.close_stream(self.sid);
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMonitor {
    ForceEnable,
    ForceDisable,
    /// Arm iff bytes are pending (excluding a droppable tail dummy).
    Auto,
}

enum Wake {
    Tick,
    Cmd(Option<Command>),
    CanRead(io::Result<()>),
    CanWrite(io::Result<()>),
}

pub struct Channel {
    socket: TcpStream,
    cfg: ChannelConfig,

    /// Working copies; the server side adopts the client's requests here.
    l: u32,
    pkt_interval: Duration,
    defense_time_limit: Duration,

    /// What the peer told us in its preamble.
    peer_cell_size: usize,
    peer_addr: Ipv4Addr,

    mux: Mux,
    outq: CellOutbuf,
    cell_inbuf: BytesMut,
    /// Header of the inbound cell whose body has not fully arrived yet.
    pending_cell: Option<(CellType, u8, u16)>,

    defense: DefenseInfo,
    next_tick: Option<Instant>,
    write_interest: bool,

    stats: ChannelStats,
    owner: mpsc::UnboundedSender<OwnerEvent>,
}

impl Channel {
    /// Spawns the channel actor on the current runtime. The returned
    /// receiver carries `Ready`/`Closed`, connect requests (server side)
    /// and defense-session-done notifications.
    pub fn spawn(
        socket: TcpStream,
        cfg: ChannelConfig,
    ) -> (ChannelHandle, mpsc::UnboundedReceiver<OwnerEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (owner_tx, owner_rx) = mpsc::unbounded_channel();

        // one whole cell per tick; coalescing delays would distort the
        // schedule the defense depends on
        let _ = socket.set_nodelay(true);

        let channel = Channel {
            socket,
            l: u32::from(cfg.l),
            pkt_interval: Duration::from_millis(u64::from(cfg.pkt_interval_ms)),
            defense_time_limit: Duration::from_secs(u64::from(cfg.defense_time_limit_secs)),
            peer_cell_size: 0,
            peer_addr: Ipv4Addr::UNSPECIFIED,
            mux: Mux::new(cfg.is_client),
            outq: CellOutbuf::new(if cfg.cell_size > 0 { cfg.cell_size } else { CELL_SIZE }),
            cell_inbuf: BytesMut::new(),
            pending_cell: None,
            defense: DefenseInfo::new(),
            next_tick: None,
            write_interest: false,
            stats: ChannelStats::default(),
            owner: owner_tx,
            cfg,
        };
        tokio::spawn(channel.run(cmd_rx));
        (ChannelHandle { cmd_tx }, owner_rx)
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let result = self.run_inner(&mut cmd_rx).await;
        match &result {
            Ok(()) => log::info!("carrier closed; {}", self.stats),
            Err(ChannelError::PeerEof) => log::info!("carrier closed by peer; {}", self.stats),
            Err(e) => log::warn!("carrier closed on error: {}; {}", e, self.stats),
        }
        // drop every stream; their observers get a final Closed
        self.mux.close_all();
        let _ = self
            .owner
            .send(OwnerEvent::Status(ChannelStatus::Closed(result.err())));
    }

    async fn run_inner(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), ChannelError> {
        self.exchange_peer_info().await?;
        let _ = self.owner.send(OwnerEvent::Status(ChannelStatus::Ready));

        loop {
            let tick_at = self.next_tick;
            let write_armed = self.write_interest;

            let wake = tokio::select! {
                biased;
                _ = tokio::time::sleep_until(
                    tick_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
                ), if tick_at.is_some() => Wake::Tick,
                cmd = cmd_rx.recv() => Wake::Cmd(cmd),
                r = self.socket.readable() => Wake::CanRead(r),
                r = self.socket.writable(), if write_armed => Wake::CanWrite(r),
            };

            match wake {
                Wake::Tick => self.on_defense_tick()?,
                Wake::Cmd(None) | Wake::Cmd(Some(Command::CloseCarrier)) => {
                    log::debug!("owner released the carrier");
                    return Ok(());
                }
                Wake::Cmd(Some(cmd)) => self.on_command(cmd)?,
                Wake::CanRead(r) => {
                    r?;
                    self.on_readable()?;
                }
                Wake::CanWrite(r) => {
                    r?;
                    self.on_writable()?;
                }
            }
        }
    }

    /// The one-shot preamble. The client writes first; the server answers
    /// only after consuming the client's 11 bytes, so its preamble cannot
    /// trail into another handshake's reply.
    async fn exchange_peer_info(&mut self) -> Result<(), ChannelError> {
        let my_info = PeerInfo {
            version: PROTOCOL_VERSION,
            cell_size: self.cfg.cell_size as u16,
            addr: self.cfg.my_addr,
            requested_l: if self.cfg.is_client { self.cfg.l } else { 0 },
            requested_pkt_interval_ms: if self.cfg.is_client {
                self.cfg.requested_peer_pkt_interval_ms
            } else {
                0
            },
        };

        if self.cfg.is_client {
            self.socket.write_all(&my_info.encode()).await?;
        }

        let mut raw = [0u8; PEER_INFO_LEN];
        self.socket.read_exact(&mut raw).await?;
        let info = PeerInfo::parse(&raw);

        log::info!(
            "peer is {} version={} cell_size={}",
            info.addr,
            info.version,
            info.cell_size
        );

        if info.version != PROTOCOL_VERSION {
            return Err(ChannelError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                peer: info.version,
            });
        }
        if info.cell_size != 0 && usize::from(info.cell_size) != CELL_SIZE {
            return Err(ChannelError::Protocol(format!(
                "unsupported peer cell size {}",
                info.cell_size
            )));
        }
        self.peer_cell_size = usize::from(info.cell_size);
        self.peer_addr = info.addr;

        if self.cfg.is_client {
            if info.requested_l != 0 || info.requested_pkt_interval_ms != 0 {
                return Err(ChannelError::Protocol(
                    "server must not request defense parameters".into(),
                ));
            }
        } else {
            if info.requested_l != 0 {
                if !l_is_allowed(info.requested_l) {
                    return Err(ChannelError::Protocol(format!(
                        "peer requested unsupported L {}",
                        info.requested_l
                    )));
                }
                log::info!("adopting peer-requested L {}", info.requested_l);
                self.l = u32::from(info.requested_l);
            }
            if info.requested_pkt_interval_ms != 0 {
                if !pkt_interval_is_allowed(info.requested_pkt_interval_ms) {
                    return Err(ChannelError::Protocol(format!(
                        "peer requested unsupported packet interval {}",
                        info.requested_pkt_interval_ms
                    )));
                }
                log::info!(
                    "adopting peer-requested packet interval {} ms",
                    info.requested_pkt_interval_ms
                );
                self.pkt_interval =
                    Duration::from_millis(u64::from(info.requested_pkt_interval_ms));
            }
            self.socket.write_all(&my_info.encode()).await?;
        }

        log::info!(
            "carrier ready; cell_size={} interval={}ms L={} time_limit={}s",
            self.cfg.cell_size,
            self.pkt_interval.as_millis(),
            self.l,
            self.defense_time_limit.as_secs()
        );
        Ok(())
    }

    fn on_command(&mut self, cmd: Command) -> Result<(), ChannelError> {
        match cmd {
            Command::CreateStream { host, port, observer } => {
                if !self.cfg.is_client {
                    log::warn!("server side cannot create streams; dropping request");
                    let _ = observer.send(StreamEvent::Closed);
                    return Ok(());
                }
                self.mux.open_stream(&host, port, observer);
                self.pump_send(false)?;
            }
            Command::SetStreamObserver { sid, observer } => {
                if !self.mux.set_observer(sid, observer.clone()) {
                    // stream already gone; tell the would-be observer
                    let _ = observer.send(StreamEvent::Closed);
                }
            }
            Command::SetStreamConnected { sid } => {
                if self.mux.submit_reply(sid, true) {
                    self.pump_send(false)?;
                }
            }
            Command::WriteBuffer { sid, data } => {
                if self.mux.write_buffer(sid, &data) {
                    self.pump_send(false)?;
                }
            }
            Command::SetWriteEof { sid } => {
                if self.mux.set_write_eof(sid) {
                    self.pump_send(false)?;
                }
            }
            Command::CloseStream { sid } => {
                self.mux.reset_stream(sid);
                self.pump_send(false)?;
            }
            Command::CloseAllStreams => {
                log::info!("closing all {} streams", self.mux.stream_count());
                self.mux.close_all();
                self.pump_send(false)?;
            }
            Command::SetAutoStartDefenseOnNextSend => self.set_auto_start_defense_on_next_send(),
            Command::StopDefense { right_now } => self.stop_defense_session(right_now),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats.clone());
            }
            Command::CloseCarrier => unreachable!("handled by the run loop"),
        }
        Ok(())
    }

    // ----- defense session control -----

    fn set_auto_start_defense_on_next_send(&mut self) {
        if !self.cfg.is_client {
            log::warn!("only the client side can auto-start a defense; ignoring");
            return;
        }
        if self.cfg.cell_size == 0 {
            log::warn!("pass-through carrier cannot defend; ignoring auto-start");
            return;
        }
        if self.defense.state != DefenseState::None {
            log::warn!(
                "defense state is {:?}; ignoring auto-start request",
                self.defense.state
            );
            return;
        }
        if !self.mux.outbuf.is_empty() || !self.outq.is_empty() {
            log::warn!("outbound buffers are not empty; ignoring auto-start request");
            return;
        }
        self.defense.state = DefenseState::PendingNextSocketSend;
        debug_assert!(!self.defense.need_start_flag_in_next_cell);
        self.defense.need_start_flag_in_next_cell = true;
        log::info!("defense armed; it starts on the next socket send");
    }

    fn start_defense_session(&mut self) -> Result<(), ChannelError> {
        if self.defense.state != DefenseState::None {
            return Err(ChannelError::Protocol(format!(
                "defense start requested while {:?}",
                self.defense.state
            )));
        }
        if self.cfg.cell_size == 0 || self.l == 0 || self.pkt_interval.is_zero() {
            return Err(ChannelError::Protocol(
                "defense start on a carrier without defense parameters".into(),
            ));
        }

        let now = Instant::now();
        self.defense.auto_stop_at = Some(now + self.defense_time_limit);
        self.next_tick = Some(now + self.pkt_interval);
        self.defense.state = DefenseState::Active;

        // the timer owns the socket now
        self.toggle_write_monitoring(WriteMonitor::ForceDisable);

        log::info!(
            "defense started; interval={}ms L={}",
            self.pkt_interval.as_millis(),
            self.l
        );
        Ok(())
    }

    fn stop_defense_session(&mut self, right_now: bool) {
        log::info!(
            "requested to stop defense; defensive cells sent/attempted so far: {}",
            self.defense.num_write_attempts
        );
        if self.defense.state != DefenseState::Active {
            log::info!("defense not currently active; resetting session state");
            self.defense.reset();
            return;
        }
        if right_now {
            // an immediate stop would leave the attempt count off the L
            // modulus, so it degrades to the graceful path
            log::warn!("immediate stop is not supported; stopping on the next L boundary");
        }
        self.defense.request_stop();
        if self.cfg.is_client {
            self.defense.need_stop_flag_in_next_cell = true;
        }
    }

    /// One firing of the defense timer.
    fn on_defense_tick(&mut self) -> Result<(), ChannelError> {
        debug_assert_eq!(self.defense.state, DefenseState::Active);

        // keep the cadence fixed regardless of how long this tick takes
        if let Some(at) = self.next_tick {
            self.next_tick = Some(at + self.pkt_interval);
        }

        if self.defense.is_done_defending_send(self.l) {
            log::info!(
                "done defending send; defensive cells sent/attempted = {}",
                self.defense.num_write_attempts
            );
            self.defense.saved_num_write_attempts = self.defense.num_write_attempts;
            self.next_tick = None;

            // reset so the flush below runs under NONE, preserving the
            // flags that still have to reach the peer
            let need_stop = self.defense.need_stop_flag_in_next_cell;
            self.defense.reset();
            self.defense.need_stop_flag_in_next_cell = need_stop;
            if !self.cfg.is_client {
                // tell the client its receive direction is done
                self.defense.need_done_flag_in_next_cell = true;
            }

            self.pump_send(true)?;

            if self.defense.need_stop_flag_in_next_cell
                || self.defense.need_done_flag_in_next_cell
            {
                // no data cell carried the flag, so a dummy has to
                log::debug!("no data cell carried the stop/done flag; adding a dummy");
                self.outq.drop_tail_dummy();
                self.add_one_dummy_cell_to_outbuf();
                self.toggle_write_monitoring(WriteMonitor::ForceEnable);
            }
            debug_assert!(!self.defense.need_stop_flag_in_next_cell);
            debug_assert!(!self.defense.need_done_flag_in_next_cell);

            self.check_notify_a_defense_session_done();
            return Ok(());
        }

        if let Some(deadline) = self.defense.auto_stop_at {
            if Instant::now() >= deadline {
                if self.cfg.is_client {
                    log::error!(
                        "defense session exceeded its time limit; \
                         was stop_defense forgotten after the page load?"
                    );
                    return Err(ChannelError::DefenseTimeLimitExceeded);
                }
                log::warn!(
                    "defense session exceeded its time limit; auto-stopping after {} attempts",
                    self.defense.num_write_attempts
                );
                self.defense.saved_num_write_attempts = self.defense.num_write_attempts;
                self.next_tick = None;
                self.defense.reset();
                self.defense.need_auto_stopped_flag_in_next_cell = true;

                self.pump_send(true)?;

                if self.defense.need_auto_stopped_flag_in_next_cell {
                    self.outq.drop_tail_dummy();
                    self.add_one_dummy_cell_to_outbuf();
                    self.toggle_write_monitoring(WriteMonitor::ForceEnable);
                }
                debug_assert!(!self.defense.need_auto_stopped_flag_in_next_cell);
                return Ok(());
            }
        }

        // normal tick: ensure one whole cell is staged, then write exactly
        // one cell's worth of bytes
        if !self.outq.has_whole_cell() {
            if !self.maybe_add_one_data_cell_to_outbuf() {
                self.ensure_whole_dummy_cell_at_tail();
            }
        }
        debug_assert!(self.outq.has_whole_cell());
        self.send_cell_outbuf()
    }

    // ----- staging cells -----

    /// Adds one DATA cell from pending framed bytes, replacing a droppable
    /// tail dummy if one is staged. Returns false when no data is pending.
    fn maybe_add_one_data_cell_to_outbuf(&mut self) -> bool {
        let body_size = self.cfg.cell_size - CELL_HEADER_SIZE;
        let payload_len = self.mux.outbuf.len().min(body_size);
        if payload_len == 0 {
            return false;
        }

        if self.outq.drop_tail_dummy() {
            self.stats.dummy_cells_avoided += 1;
            log::debug!("replaced a staged dummy cell with a data cell");
        }

        let (cell_flags, _) =
            apply_cell_flags(&mut self.defense, self.cfg.is_client, CellType::Data);
        let header = encode_header(CellType::Data, cell_flags, payload_len as u16);
        let payload = self.mux.outbuf.split_to(payload_len);
        self.outq.push_data_cell(header, &payload);

        if self.defense.state == DefenseState::PendingNextSocketSend {
            self.defense.num_data_cells_added += 1;
        }
        true
    }

    fn add_one_dummy_cell_to_outbuf(&mut self) {
        let (cell_flags, important) =
            apply_cell_flags(&mut self.defense, self.cfg.is_client, CellType::Dummy);
        let header = encode_header(CellType::Dummy, cell_flags, 0);
        self.outq.push_dummy_cell(header, important);
    }

    /// Active defense only: make sure a whole dummy sits at the tail so
    /// the coming write always has a full cell available.
    fn ensure_whole_dummy_cell_at_tail(&mut self) {
        debug_assert_eq!(self.defense.state, DefenseState::Active);
        if self.outq.has_droppable_tail_dummy() {
            return;
        }
        debug_assert!(!self.outq.has_whole_cell());
        self.add_one_dummy_cell_to_outbuf();
    }

    /// Moves multiplexer output towards the socket according to the
    /// defense state: flush everything when idle, stage exactly one cell
    /// when pending, and leave it for the timer when active.
    fn pump_send(&mut self, log_flushed: bool) -> Result<(), ChannelError> {
        self.mux.fill_outbuf();
        self.mux.sweep_closed();

        if self.cfg.cell_size == 0 {
            self.toggle_write_monitoring(WriteMonitor::Auto);
            return Ok(());
        }

        match self.defense.state {
            DefenseState::None => {
                let mut added = 0usize;
                while !self.mux.outbuf.is_empty() {
                    let ok = self.maybe_add_one_data_cell_to_outbuf();
                    debug_assert!(ok);
                    added += 1;
                }
                if added > 0 {
                    self.toggle_write_monitoring(WriteMonitor::ForceEnable);
                    if log_flushed {
                        log::info!("flushed {} data cells", added);
                    }
                }
            }
            DefenseState::PendingNextSocketSend => {
                if self.outq.is_empty() && !self.mux.outbuf.is_empty() {
                    let ok = self.maybe_add_one_data_cell_to_outbuf();
                    debug_assert!(ok);
                }
                if !self.outq.is_empty() {
                    self.toggle_write_monitoring(WriteMonitor::ForceEnable);
                }
            }
            DefenseState::Active => {
                // the timer moves data on its own schedule
            }
        }
        Ok(())
    }

    // ----- socket I/O -----

    fn toggle_write_monitoring(&mut self, mode: WriteMonitor) {
        debug_assert!(
            self.defense.state != DefenseState::Active || mode == WriteMonitor::ForceDisable
        );
        self.write_interest = match mode {
            WriteMonitor::ForceEnable => true,
            WriteMonitor::ForceDisable => false,
            WriteMonitor::Auto => {
                let pending = if self.cfg.cell_size > 0 {
                    self.outq.writable_len()
                } else {
                    self.mux.outbuf.len()
                };
                pending > 0
            }
        };
    }

    fn on_writable(&mut self) -> Result<(), ChannelError> {
        if self.cfg.cell_size == 0 {
            return self.send_raw_outbuf();
        }

        if self.defense.state == DefenseState::PendingNextSocketSend {
            // first chance to write since auto-start was armed; the one
            // staged cell goes out under the newly started session
            debug_assert_eq!(self.outq.len(), self.cfg.cell_size);
            log::debug!("auto-starting the defense session");
            self.defense.state = DefenseState::None;
            self.start_defense_session()?;
        }
        self.send_cell_outbuf()
    }

    /// Pass-through carrier: multiplexer frames go to the socket as-is.
    fn send_raw_outbuf(&mut self) -> Result<(), ChannelError> {
        if self.mux.outbuf.is_empty() {
            self.toggle_write_monitoring(WriteMonitor::ForceDisable);
            return Ok(());
        }
        match self.socket.try_write(&self.mux.outbuf) {
            Ok(0) => Err(ChannelError::PeerEof),
            Ok(n) => {
                self.stats.all_send_bytes += n as u64;
                self.stats.useful_send_bytes += n as u64;
                self.mux.outbuf.advance(n);
                if self.mux.outbuf.is_empty() {
                    self.toggle_write_monitoring(WriteMonitor::ForceDisable);
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes staged cells. While defending: exactly one cell's worth,
    /// counted as an attempt whether or not the kernel takes it. Otherwise
    /// everything except a droppable tail dummy, which gets dropped.
    fn send_cell_outbuf(&mut self) -> Result<(), ChannelError> {
        debug_assert!(self.cfg.cell_size > 0);

        if self.defense.state == DefenseState::Active {
            debug_assert!(self.outq.has_whole_cell());
            let want = self.cfg.cell_size;
            let res = self.socket.try_write(&self.outq.as_slice()[..want]);
            self.defense.increment_send_attempt();
            match res {
                Ok(0) => return Err(ChannelError::PeerEof),
                Ok(n) => self.account_sent(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    log::trace!("defended write refused by the kernel; attempt still counted");
                }
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        let droppable = self.outq.has_droppable_tail_dummy();
        let want = self.outq.writable_len();
        if want > 0 {
            match self.socket.try_write(&self.outq.as_slice()[..want]) {
                Ok(0) => return Err(ChannelError::PeerEof),
                Ok(n) => {
                    self.account_sent(n);
                    self.toggle_write_monitoring(if n == want && droppable {
                        WriteMonitor::ForceDisable
                    } else {
                        WriteMonitor::Auto
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.toggle_write_monitoring(WriteMonitor::Auto);
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            // nothing but (at most) a droppable tail dummy to write
            self.toggle_write_monitoring(WriteMonitor::ForceDisable);
        }

        if self.outq.drop_tail_dummy() {
            self.stats.dummy_cells_avoided += 1;
        }
        Ok(())
    }

    fn account_sent(&mut self, n: usize) {
        self.stats.all_send_bytes += n as u64;
        let progress = self.outq.consume(n);
        self.stats.useful_send_bytes += progress.useful_bytes;
        self.stats.dummy_send_cells += progress.dummy_cells;
    }

    fn on_readable(&mut self) -> Result<(), ChannelError> {
        let mut buf = [0u8; 16384];
        match self.socket.try_read(&mut buf) {
            Ok(0) => Err(ChannelError::PeerEof),
            Ok(n) => {
                self.stats.all_recv_bytes += n as u64;
                if self.peer_cell_size > 0 {
                    self.cell_inbuf.extend_from_slice(&buf[..n]);
                    self.read_cells()
                } else {
                    // peer is not sending cells; bytes go straight to the
                    // multiplexer
                    self.stats.useful_recv_bytes += n as u64;
                    self.mux.inbuf.extend_from_slice(&buf[..n]);
                    self.pump_recv()
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Consumes as many whole inbound cells as are buffered. A header is
    /// decoded as soon as it is available; the cell is processed once the
    /// full `peer_cell_size` bytes are in.
    fn read_cells(&mut self) -> Result<(), ChannelError> {
        debug_assert!(self.peer_cell_size > 0);
        loop {
            if self.pending_cell.is_none() {
                if self.cell_inbuf.len() < CELL_HEADER_SIZE {
                    return Ok(());
                }
                let header = [self.cell_inbuf[0], self.cell_inbuf[1], self.cell_inbuf[2]];
                let (ty, cell_flags, payload_len) = decode_header(&header)
                    .map_err(|e| ChannelError::Protocol(e.to_string()))?;
                if usize::from(payload_len) > self.peer_cell_size - CELL_HEADER_SIZE {
                    return Err(ChannelError::Protocol(format!(
                        "payload length {} exceeds the peer cell body",
                        payload_len
                    )));
                }
                self.pending_cell = Some((ty, cell_flags, payload_len));
            }

            if self.cell_inbuf.len() < self.peer_cell_size {
                return Ok(());
            }
            let (ty, cell_flags, payload_len) =
                self.pending_cell.take().expect("pending cell header");
            self.handle_input_cell(ty, cell_flags, payload_len)?;
        }
    }

    fn handle_input_cell(
        &mut self,
        ty: CellType,
        cell_flags: u8,
        payload_len: u16,
    ) -> Result<(), ChannelError> {
        let mut done_defending_recv = false;

        if cell_flags != 0 {
            log::debug!("received cell flags {:05b}", cell_flags);
            let start = cell_flags & flags::START_DEFENSE != 0;
            let stop = cell_flags & flags::STOP_DEFENSE != 0;
            let auto_stopped = cell_flags & flags::AUTO_STOPPED != 0;
            let defensive = cell_flags & flags::DEFENSIVE != 0;
            done_defending_recv = cell_flags & flags::DONE != 0;

            if start && stop {
                return Err(ChannelError::Protocol(
                    "cell carries both START and STOP".into(),
                ));
            }

            if auto_stopped {
                if !self.cfg.is_client {
                    return Err(ChannelError::Protocol(
                        "AUTO_STOPPED flag sent to the server".into(),
                    ));
                }
                log::warn!("peer has auto-stopped its defense");
                if self.defense.state == DefenseState::Active && !self.defense.stop_requested {
                    log::info!("asking the peer to start defending again");
                    debug_assert!(!self.defense.need_start_flag_in_next_cell);
                    self.defense.need_start_flag_in_next_cell = true;
                }
            }

            if start {
                if self.cfg.is_client {
                    return Err(ChannelError::Protocol("START flag sent to the client".into()));
                }
                log::info!("starting defense as requested by the peer");
                self.start_defense_session()?;
            }
            if stop {
                if self.cfg.is_client {
                    return Err(ChannelError::Protocol("STOP flag sent to the client".into()));
                }
                log::info!("scheduling defense stop as requested by the peer");
                self.stop_defense_session(false);
            }
            if done_defending_recv && !self.cfg.is_client {
                return Err(ChannelError::Protocol("DONE flag sent to the server".into()));
            }

            if defensive {
                self.defense.num_cells_recv += 1;
            }
        }

        match ty {
            CellType::Data => {
                let body = &self.cell_inbuf[CELL_HEADER_SIZE..CELL_HEADER_SIZE + usize::from(payload_len)];
                self.mux.inbuf.extend_from_slice(body);
                self.stats.useful_recv_bytes += u64::from(payload_len);
            }
            CellType::Dummy => {
                self.stats.dummy_recv_cells += 1;
            }
            CellType::Control => {
                // scaffolded in the wire format, never produced
                return Err(ChannelError::Protocol("unexpected CONTROL cell".into()));
            }
        }
        self.cell_inbuf.advance(self.peer_cell_size);

        if ty == CellType::Data {
            self.pump_recv()?;
        }

        if done_defending_recv {
            self.defense.done_defending_recv = true;
            log::info!(
                "peer is done defending our receive direction (via a {:?} cell)",
                ty
            );
            self.check_notify_a_defense_session_done();
        }
        Ok(())
    }

    fn pump_recv(&mut self) -> Result<(), ChannelError> {
        let actions = self
            .mux
            .process_inbuf()
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        for action in actions {
            match action {
                MuxAction::ConnectRequest { sid, host, port } => {
                    let _ = self.owner.send(OwnerEvent::ConnectRequest { sid, host, port });
                }
            }
        }
        self.mux.sweep_closed();
        // replies and resets framed while processing still have to leave
        self.pump_send(false)
    }

    /// Both directions of a defense session are done exactly when the
    /// send side is NONE and the peer has signalled DONE. Counters are
    /// snapshotted and the per-session receive state is cleared.
    fn check_notify_a_defense_session_done(&mut self) {
        if self.defense.state == DefenseState::None && self.defense.done_defending_recv {
            log::info!(
                "defense session done in both directions; sent/attempted={} received={}",
                self.defense.saved_num_write_attempts,
                self.defense.num_cells_recv
            );
            let snapshot = DefenseSessionSnapshot {
                write_attempts: self.defense.saved_num_write_attempts,
                peer_defensive_cells: self.defense.num_cells_recv,
                stats: self.stats.clone(),
            };
            self.defense.done_defending_recv = false;
            self.defense.num_cells_recv = 0;
            self.defense.saved_num_write_attempts = 0;
            let _ = self.owner.send(OwnerEvent::DefenseSessionDone(snapshot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (a, (b, _)) = tokio::join!(connect, async {
            listener.accept().await.unwrap()
        });
        (a.unwrap(), b)
    }

    fn passthrough_cfg(is_client: bool) -> ChannelConfig {
        ChannelConfig {
            is_client,
            my_addr: Ipv4Addr::new(127, 0, 0, 1),
            cell_size: 0,
            pkt_interval_ms: 0,
            requested_peer_pkt_interval_ms: 0,
            l: 0,
            defense_time_limit_secs: 0,
        }
    }

    fn defended_client_cfg() -> ChannelConfig {
        ChannelConfig {
            is_client: true,
            my_addr: Ipv4Addr::new(127, 0, 0, 1),
            cell_size: CELL_SIZE,
            pkt_interval_ms: 5,
            requested_peer_pkt_interval_ms: 5,
            l: 50,
            defense_time_limit_secs: 30,
        }
    }

    async fn wait_ready(events: &mut mpsc::UnboundedReceiver<OwnerEvent>) {
        loop {
            match timeout(WAIT, events.recv()).await.unwrap() {
                Some(OwnerEvent::Status(ChannelStatus::Ready)) => return,
                Some(other) => panic!("unexpected owner event {:?}", other),
                None => panic!("channel died before Ready"),
            }
        }
    }

    async fn next_stream_event(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
        timeout(WAIT, rx.recv()).await.unwrap().expect("stream events closed")
    }

    /// Plays the server end of the preamble on a raw socket.
    async fn raw_server_handshake(sock: &mut TcpStream, cell_size: u16) -> PeerInfo {
        let mut raw = [0u8; PEER_INFO_LEN];
        sock.read_exact(&mut raw).await.unwrap();
        let client_info = PeerInfo::parse(&raw);
        let reply = PeerInfo {
            version: PROTOCOL_VERSION,
            cell_size,
            addr: Ipv4Addr::new(127, 0, 0, 1),
            requested_l: 0,
            requested_pkt_interval_ms: 0,
        };
        sock.write_all(&reply.encode()).await.unwrap();
        client_info
    }

    async fn read_cell(sock: &mut TcpStream) -> Option<(CellType, u8, u16)> {
        let mut cell = vec![0u8; CELL_SIZE];
        match timeout(Duration::from_millis(500), sock.read_exact(&mut cell)).await {
            Ok(Ok(_)) => {
                let header = [cell[0], cell[1], cell[2]];
                Some(decode_header(&header).unwrap())
            }
            _ => None,
        }
    }

    #[tokio::test]
    async fn pass_through_stream_end_to_end() {
        let (a, b) = socket_pair().await;
        let (client, mut client_owner) = Channel::spawn(a, passthrough_cfg(true));
        let (server, mut server_owner) = Channel::spawn(b, passthrough_cfg(false));

        wait_ready(&mut client_owner).await;
        wait_ready(&mut server_owner).await;

        let mut obs = client.create_stream("example.invalid", 80);
        let sid = match next_stream_event(&mut obs).await {
            StreamEvent::IdAssigned(sid) => sid,
            other => panic!("expected IdAssigned, got {:?}", other),
        };

        let (req_sid, host, port) = match timeout(WAIT, server_owner.recv()).await.unwrap() {
            Some(OwnerEvent::ConnectRequest { sid, host, port }) => (sid, host, port),
            other => panic!("expected ConnectRequest, got {:?}", other),
        };
        assert_eq!(req_sid, sid);
        assert_eq!(host, "example.invalid");
        assert_eq!(port, 80);

        let (stx, mut srx) = mpsc::unbounded_channel();
        server.set_stream_observer(req_sid, stx);
        server.set_stream_connected(req_sid);

        match next_stream_event(&mut obs).await {
            StreamEvent::CreateResult(true) => {}
            other => panic!("expected CreateResult(true), got {:?}", other),
        }

        client.write_buffer(sid, Bytes::from_static(b"AAAAA"));
        let mut got = Vec::new();
        while got.len() < 5 {
            match next_stream_event(&mut srx).await {
                StreamEvent::Data(d) => got.extend_from_slice(&d),
                other => panic!("expected Data, got {:?}", other),
            }
        }
        assert_eq!(got, b"AAAAA");

        // closing the outer side propagates an EOF
        client.set_write_eof(sid);
        loop {
            match next_stream_event(&mut srx).await {
                StreamEvent::RecvEof => break,
                StreamEvent::Data(_) => {}
                other => panic!("expected RecvEof, got {:?}", other),
            }
        }

        // reverse direction still works after the forward EOF
        server.write_buffer(req_sid, Bytes::from_static(b"pong"));
        let mut got = Vec::new();
        while got.len() < 4 {
            match next_stream_event(&mut obs).await {
                StreamEvent::Data(d) => got.extend_from_slice(&d),
                other => panic!("expected Data, got {:?}", other),
            }
        }
        assert_eq!(got, b"pong");
    }

    #[tokio::test]
    async fn cells_mode_preserves_stream_bytes() {
        let (a, b) = socket_pair().await;
        let mut client_cfg = defended_client_cfg();
        client_cfg.requested_peer_pkt_interval_ms = 0;
        let server_cfg = ChannelConfig {
            is_client: false,
            my_addr: Ipv4Addr::new(127, 0, 0, 1),
            cell_size: CELL_SIZE,
            pkt_interval_ms: 20,
            requested_peer_pkt_interval_ms: 0,
            l: 100,
            defense_time_limit_secs: 30,
        };
        let (client, mut client_owner) = Channel::spawn(a, client_cfg);
        let (server, mut server_owner) = Channel::spawn(b, server_cfg);
        wait_ready(&mut client_owner).await;
        wait_ready(&mut server_owner).await;

        let mut obs = client.create_stream("t.example", 9);
        let sid = match next_stream_event(&mut obs).await {
            StreamEvent::IdAssigned(sid) => sid,
            other => panic!("unexpected {:?}", other),
        };
        let req_sid = match timeout(WAIT, server_owner.recv()).await.unwrap() {
            Some(OwnerEvent::ConnectRequest { sid, .. }) => sid,
            other => panic!("unexpected {:?}", other),
        };
        let (stx, mut srx) = mpsc::unbounded_channel();
        server.set_stream_observer(req_sid, stx);
        server.set_stream_connected(req_sid);
        match next_stream_event(&mut obs).await {
            StreamEvent::CreateResult(true) => {}
            other => panic!("unexpected {:?}", other),
        }

        // more than one cell body's worth, so the payload spans cells
        let blob: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        client.write_buffer(sid, Bytes::from(blob.clone()));
        let mut got = Vec::new();
        while got.len() < blob.len() {
            match next_stream_event(&mut srx).await {
                StreamEvent::Data(d) => got.extend_from_slice(&d),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(got, blob);
    }

    #[tokio::test]
    async fn defended_send_is_cell_aligned_and_stops_on_l_multiple() {
        let (a, mut raw) = socket_pair().await;
        let (client, mut owner) = Channel::spawn(a, defended_client_cfg());

        let client_info = raw_server_handshake(&mut raw, CELL_SIZE as u16).await;
        assert_eq!(client_info.version, PROTOCOL_VERSION);
        assert_eq!(client_info.requested_l, 50);
        assert_eq!(client_info.requested_pkt_interval_ms, 5);

        wait_ready(&mut owner).await;

        client.set_auto_start_defense_on_next_send();
        let mut obs = client.create_stream("t.example", 80);
        match next_stream_event(&mut obs).await {
            StreamEvent::IdAssigned(_) => {}
            other => panic!("unexpected {:?}", other),
        }

        // the first cell is the staged connect request, defended from the
        // first byte
        let (ty, f, len) = read_cell(&mut raw).await.expect("first cell");
        assert_eq!(ty, CellType::Data);
        assert!(len > 0);
        assert!(f & flags::START_DEFENSE != 0, "first cell must carry START");
        assert!(f & flags::DEFENSIVE != 0);

        let mut defensive_cells = 1u32;
        // let a few dummy ticks pass, then ask to stop
        for _ in 0..7 {
            let (ty, f, _) = read_cell(&mut raw).await.expect("defended cell");
            assert!(f & flags::DEFENSIVE != 0);
            if ty == CellType::Dummy {
                assert!(f & flags::START_DEFENSE == 0);
            }
            defensive_cells += 1;
        }
        client.stop_defense_session(false);

        let mut saw_stop = false;
        while let Some((_, f, _)) = read_cell(&mut raw).await {
            if f & flags::DEFENSIVE != 0 {
                defensive_cells += 1;
            }
            if f & flags::STOP_DEFENSE != 0 {
                saw_stop = true;
            }
        }
        assert!(saw_stop, "a cell must carry the STOP flag");
        // every socket write while active was one whole cell, and the
        // stream of defended cells ended on a multiple of L
        assert!(defensive_cells > 0);
        assert_eq!(defensive_cells % 50, 0, "got {} defensive cells", defensive_cells);
    }

    #[tokio::test]
    async fn auto_stopped_peer_is_asked_to_resume() {
        let (a, mut raw) = socket_pair().await;
        let (client, mut owner) = Channel::spawn(a, defended_client_cfg());
        raw_server_handshake(&mut raw, CELL_SIZE as u16).await;
        wait_ready(&mut owner).await;

        client.set_auto_start_defense_on_next_send();
        let mut obs = client.create_stream("t.example", 80);
        match next_stream_event(&mut obs).await {
            StreamEvent::IdAssigned(_) => {}
            other => panic!("unexpected {:?}", other),
        }
        // swallow the first defended cell
        assert!(read_cell(&mut raw).await.is_some());

        // peer claims it auto-stopped, on a dummy cell
        let mut cell = vec![0u8; CELL_SIZE];
        let header = encode_header(CellType::Dummy, flags::AUTO_STOPPED | flags::DEFENSIVE, 0);
        cell[..CELL_HEADER_SIZE].copy_from_slice(&header);
        raw.write_all(&cell).await.unwrap();

        // a following cell must re-arm the peer with START
        let mut saw_start = false;
        for _ in 0..20 {
            match read_cell(&mut raw).await {
                Some((_, f, _)) if f & flags::START_DEFENSE != 0 => {
                    saw_start = true;
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
        assert!(saw_start, "client must re-send START after peer auto-stop");
    }

    #[tokio::test]
    async fn control_cell_is_a_protocol_error() {
        let (a, mut raw) = socket_pair().await;
        let (_client, mut owner) = Channel::spawn(a, defended_client_cfg());
        raw_server_handshake(&mut raw, CELL_SIZE as u16).await;
        wait_ready(&mut owner).await;

        let mut cell = vec![0u8; CELL_SIZE];
        let header = encode_header(CellType::Control, 0, 0);
        cell[..CELL_HEADER_SIZE].copy_from_slice(&header);
        raw.write_all(&cell).await.unwrap();

        match timeout(WAIT, owner.recv()).await.unwrap() {
            Some(OwnerEvent::Status(ChannelStatus::Closed(Some(ChannelError::Protocol(_))))) => {}
            other => panic!("expected protocol-error close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn version_mismatch_is_fatal_for_client() {
        let (a, mut raw) = socket_pair().await;
        let (_client, mut owner) = Channel::spawn(a, defended_client_cfg());

        let mut buf = [0u8; PEER_INFO_LEN];
        raw.read_exact(&mut buf).await.unwrap();
        let bad = PeerInfo {
            version: PROTOCOL_VERSION - 1,
            cell_size: CELL_SIZE as u16,
            addr: Ipv4Addr::new(127, 0, 0, 1),
            requested_l: 0,
            requested_pkt_interval_ms: 0,
        };
        raw.write_all(&bad.encode()).await.unwrap();

        match timeout(WAIT, owner.recv()).await.unwrap() {
            Some(OwnerEvent::Status(ChannelStatus::Closed(Some(err)))) => {
                assert!(matches!(err, ChannelError::VersionMismatch { .. }));
                assert!(err.is_fatal_for_client());
            }
            other => panic!("expected version-mismatch close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_payload_length_closes_the_carrier() {
        let (a, mut raw) = socket_pair().await;
        let (_client, mut owner) = Channel::spawn(a, defended_client_cfg());
        raw_server_handshake(&mut raw, CELL_SIZE as u16).await;
        wait_ready(&mut owner).await;

        let mut cell = vec![0u8; CELL_SIZE];
        let header = encode_header(CellType::Data, 0, (CELL_SIZE - CELL_HEADER_SIZE + 1) as u16);
        cell[..CELL_HEADER_SIZE].copy_from_slice(&header);
        raw.write_all(&cell).await.unwrap();

        match timeout(WAIT, owner.recv()).await.unwrap() {
            Some(OwnerEvent::Status(ChannelStatus::Closed(Some(ChannelError::Protocol(_))))) => {}
            other => panic!("expected protocol-error close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn peer_eof_closes_cleanly() {
        let (a, mut raw) = socket_pair().await;
        let (_client, mut owner) = Channel::spawn(a, passthrough_cfg(true));
        raw_server_handshake(&mut raw, 0).await;
        wait_ready(&mut owner).await;

        drop(raw);
        match timeout(WAIT, owner.recv()).await.unwrap() {
            Some(OwnerEvent::Status(ChannelStatus::Closed(Some(ChannelError::PeerEof)))) => {}
            other => panic!("expected clean peer-eof close, got {:?}", other),
        }
    }
}
