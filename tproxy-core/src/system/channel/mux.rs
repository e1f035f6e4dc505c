//! Stream multiplexing inside the carrier.
//!
//! The multiplexer turns any number of logical byte streams into one frame
//! sequence that rides inside the carrier's cell payloads (or raw on a
//! pass-through carrier). Framing is deliberately small: a 7-byte header
//! of kind, stream id and payload length, followed by the payload.
//!
//! Frame kinds:
//! - `OPEN(id, "host:port")` - client to server only, requests a stream.
//! - `OPEN_REPLY(id, ok)` - server's answer once the target is connected.
//! - `DATA(id, bytes)` - stream payload, FIFO per stream.
//! - `FIN(id)` - graceful end of the sender's write direction.
//! - `RESET(id)` - abrupt close from either side.
//!
//! Stream ids are assigned by the client side only, odd and increasing.
//! The server never originates streams.
//!
//! Outbound data is pulled, not pushed: `fill_outbuf` drains the runnable
//! streams round-robin into the frame buffer. A stream with no buffered
//! bytes and no EOF is parked (`inward_deferred`) and resumed by the next
//! `write_buffer` or `set_write_eof` on it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;

const FRAME_HEADER_SIZE: usize = 7;
/// Cap on a single DATA frame payload so concurrent streams interleave.
const MAX_DATA_FRAME_PAYLOAD: usize = 4096;

const KIND_OPEN: u8 = 1;
const KIND_OPEN_REPLY: u8 = 2;
const KIND_DATA: u8 = 3;
const KIND_FIN: u8 = 4;
const KIND_RESET: u8 = 5;

/// Events delivered to a stream's observer, in order. `IdAssigned` always
/// comes first; `CreateResult` only ever arrives on the client side.
#[derive(Debug)]
pub enum StreamEvent {
    IdAssigned(u32),
    CreateResult(bool),
    Data(Bytes),
    RecvEof,
    Closed,
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("multiplexer protocol error: {0}")]
    Protocol(String),
}

/// Channel-level work the multiplexer cannot do itself.
#[derive(Debug)]
pub enum MuxAction {
    /// Server side: a peer asked for a new stream to `host:port`.
    ConnectRequest { sid: u32, host: String, port: u16 },
}

struct StreamEntry {
    /// Bytes from the outer side waiting to be framed into the tunnel.
    inward_buf: BytesMut,
    /// Parked: the last pull found no data and no EOF.
    inward_deferred: bool,
    /// The outer side has closed gracefully; buffered bytes still go out,
    /// then a FIN frame.
    inward_has_seen_eof: bool,
    fin_sent: bool,
    /// We have received the peer's FIN for this stream.
    inner_recv_eof: bool,
    recv_eof_delivered: bool,
    /// Bytes received from the tunnel while no observer is attached.
    outward_buf: BytesMut,
    observer: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl StreamEntry {
    fn new(observer: Option<mpsc::UnboundedSender<StreamEvent>>) -> StreamEntry {
        StreamEntry {
            inward_buf: BytesMut::new(),
            inward_deferred: false,
            inward_has_seen_eof: false,
            fin_sent: false,
            inner_recv_eof: false,
            recv_eof_delivered: false,
            outward_buf: BytesMut::new(),
            observer,
        }
    }

    fn notify(&self, event: StreamEvent) {
        if let Some(observer) = &self.observer {
            // a gone observer just means the handler already finished
            let _ = observer.send(event);
        }
    }

    /// Flushes buffered outward data and a pending EOF to the observer.
    fn deliver_pending(&mut self) {
        if self.observer.is_none() {
            return;
        }
        if !self.outward_buf.is_empty() {
            let data = self.outward_buf.split().freeze();
            self.notify(StreamEvent::Data(data));
        }
        if self.inner_recv_eof && !self.recv_eof_delivered {
            self.recv_eof_delivered = true;
            self.notify(StreamEvent::RecvEof);
        }
    }
}

pub struct Mux {
    is_client: bool,
    next_sid: u32,
    streams: BTreeMap<u32, StreamEntry>,
    /// Framed bytes waiting to be packed into cells (or written raw).
    pub outbuf: BytesMut,
    /// Frame bytes received from the peer, not yet parsed.
    pub inbuf: BytesMut,
}

impl Mux {
    pub fn new(is_client: bool) -> Mux {
        Mux {
            is_client,
            next_sid: 1,
            streams: BTreeMap::new(),
            outbuf: BytesMut::new(),
            inbuf: BytesMut::new(),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn push_frame(&mut self, kind: u8, sid: u32, payload: &[u8]) {
        debug_assert!(payload.len() <= u16::MAX as usize);
        self.outbuf.put_u8(kind);
        self.outbuf.put_u32(sid);
        self.outbuf.put_u16(payload.len() as u16);
        self.outbuf.put_slice(payload);
    }

    /// Client side: allocates a stream id, frames the connect request and
    /// notifies the observer of the id.
    pub fn open_stream(
        &mut self,
        host: &str,
        port: u16,
        observer: mpsc::UnboundedSender<StreamEvent>,
    ) -> u32 {
        debug_assert!(self.is_client, "only the client side creates streams");
        let sid = self.next_sid;
        self.next_sid += 2;

        let entry = StreamEntry::new(Some(observer));
        entry.notify(StreamEvent::IdAssigned(sid));
        self.streams.insert(sid, entry);

        let hostport = format!("{}:{}", host, port);
        self.push_frame(KIND_OPEN, sid, hostport.as_bytes());
        log::debug!("stream {}: connect request for [{}]", sid, hostport);
        sid
    }

    /// Server side: frames the ok reply for a stream whose target is now
    /// connected.
    pub fn submit_reply(&mut self, sid: u32, ok: bool) -> bool {
        debug_assert!(!self.is_client);
        if !self.streams.contains_key(&sid) {
            log::warn!("reply for unknown stream {}", sid);
            return false;
        }
        self.push_frame(KIND_OPEN_REPLY, sid, &[u8::from(ok)]);
        true
    }

    /// Attaches (or replaces) the observer of a stream and immediately
    /// flushes anything that arrived before it was attached. Returns false
    /// if the stream is gone, in which case the caller should tell the
    /// would-be observer the stream is closed.
    pub fn set_observer(&mut self, sid: u32, observer: mpsc::UnboundedSender<StreamEvent>) -> bool {
        match self.streams.get_mut(&sid) {
            Some(entry) => {
                entry.observer = Some(observer);
                entry.deliver_pending();
                true
            }
            None => false,
        }
    }

    /// Appends outer-side bytes to the stream's inward buffer, resuming it
    /// if it was parked. Returns false for an unknown stream.
    pub fn write_buffer(&mut self, sid: u32, data: &[u8]) -> bool {
        match self.streams.get_mut(&sid) {
            Some(entry) => {
                entry.inward_buf.extend_from_slice(data);
                if entry.inward_deferred {
                    log::trace!("stream {} was deferred; resuming", sid);
                    entry.inward_deferred = false;
                }
                true
            }
            None => {
                log::warn!("write_buffer: unknown stream {}", sid);
                false
            }
        }
    }

    /// Marks the outer side of a stream as closed. Buffered bytes are
    /// still framed; a FIN follows them.
    pub fn set_write_eof(&mut self, sid: u32) -> bool {
        match self.streams.get_mut(&sid) {
            Some(entry) => {
                debug_assert!(!entry.inward_has_seen_eof);
                entry.inward_has_seen_eof = true;
                entry.inward_deferred = false;
                true
            }
            None => {
                log::warn!("set_write_eof: unknown stream {}", sid);
                false
            }
        }
    }

    /// Abruptly closes a stream from this side. The local observer is
    /// dropped without notification (the closer already knows); the peer
    /// gets a RESET.
    pub fn reset_stream(&mut self, sid: u32) {
        if self.streams.remove(&sid).is_some() {
            log::debug!("RESET stream {}", sid);
            self.push_frame(KIND_RESET, sid, &[]);
        }
    }

    /// Closes every stream, notifying the observers. Used for the
    /// close-all-streams operator signal and carrier teardown.
    pub fn close_all(&mut self) {
        let sids: Vec<u32> = self.streams.keys().copied().collect();
        for sid in sids {
            if let Some(entry) = self.streams.remove(&sid) {
                entry.notify(StreamEvent::Closed);
                self.push_frame(KIND_RESET, sid, &[]);
            }
        }
    }

    /// Pulls runnable streams round-robin into the frame buffer. One DATA
    /// frame per stream per pass keeps a single busy stream from starving
    /// the rest.
    pub fn fill_outbuf(&mut self) {
        loop {
            let mut progressed = false;
            let mut frames: Vec<(u8, u32, BytesMut)> = Vec::new();

            for (&sid, entry) in self.streams.iter_mut() {
                if entry.fin_sent || entry.inward_deferred {
                    continue;
                }
                if !entry.inward_buf.is_empty() {
                    let n = entry.inward_buf.len().min(MAX_DATA_FRAME_PAYLOAD);
                    frames.push((KIND_DATA, sid, entry.inward_buf.split_to(n)));
                    progressed = true;
                } else if entry.inward_has_seen_eof {
                    entry.fin_sent = true;
                    frames.push((KIND_FIN, sid, BytesMut::new()));
                    progressed = true;
                } else {
                    entry.inward_deferred = true;
                }
            }

            for (kind, sid, payload) in frames {
                self.push_frame(kind, sid, &payload);
            }
            if !progressed {
                break;
            }
        }
    }

    /// Parses complete frames out of `inbuf`, delivering stream events and
    /// returning the actions the channel has to act on.
    pub fn process_inbuf(&mut self) -> Result<Vec<MuxAction>, MuxError> {
        let mut actions = Vec::new();

        while self.inbuf.len() >= FRAME_HEADER_SIZE {
            let kind = self.inbuf[0];
            let sid = u32::from_be_bytes([self.inbuf[1], self.inbuf[2], self.inbuf[3], self.inbuf[4]]);
            let len = u16::from_be_bytes([self.inbuf[5], self.inbuf[6]]) as usize;
            if self.inbuf.len() < FRAME_HEADER_SIZE + len {
                break;
            }
            self.inbuf.advance(FRAME_HEADER_SIZE);
            let payload = self.inbuf.split_to(len);

            match kind {
                KIND_OPEN => {
                    if self.is_client {
                        return Err(MuxError::Protocol(
                            "client received a stream connect request".into(),
                        ));
                    }
                    if self.streams.contains_key(&sid) {
                        return Err(MuxError::Protocol(format!(
                            "connect request for existing stream {}",
                            sid
                        )));
                    }
                    let (host, port) = parse_hostport(&payload)?;
                    self.streams.insert(sid, StreamEntry::new(None));
                    actions.push(MuxAction::ConnectRequest { sid, host, port });
                }
                KIND_OPEN_REPLY => {
                    if !self.is_client {
                        return Err(MuxError::Protocol(
                            "server received a stream connect reply".into(),
                        ));
                    }
                    let ok = payload.first().copied() == Some(1);
                    match self.streams.get(&sid) {
                        Some(entry) => entry.notify(StreamEvent::CreateResult(ok)),
                        None => log::warn!("connect reply for unknown stream {}", sid),
                    }
                }
                KIND_DATA => match self.streams.get_mut(&sid) {
                    Some(entry) => {
                        entry.outward_buf.extend_from_slice(&payload);
                        entry.deliver_pending();
                    }
                    None => {
                        // stale frame for a stream we already dropped;
                        // answer with a reset and move on
                        log::debug!("data for unknown stream {}, resetting", sid);
                        self.push_frame(KIND_RESET, sid, &[]);
                    }
                },
                KIND_FIN => match self.streams.get_mut(&sid) {
                    Some(entry) => {
                        entry.inner_recv_eof = true;
                        entry.deliver_pending();
                    }
                    None => {
                        log::debug!("fin for unknown stream {}, resetting", sid);
                        self.push_frame(KIND_RESET, sid, &[]);
                    }
                },
                KIND_RESET => {
                    if let Some(entry) = self.streams.remove(&sid) {
                        log::debug!("stream {} reset by peer", sid);
                        entry.notify(StreamEvent::Closed);
                    }
                }
                other => {
                    return Err(MuxError::Protocol(format!("unknown frame kind {}", other)));
                }
            }
        }

        Ok(actions)
    }

    /// Retires streams that have exchanged FINs in both directions. The
    /// observer gets a final `Closed`; afterwards the id is invalid.
    pub fn sweep_closed(&mut self) {
        let done: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, e)| e.fin_sent && e.inner_recv_eof && e.recv_eof_delivered)
            .map(|(&sid, _)| sid)
            .collect();
        for sid in done {
            if let Some(entry) = self.streams.remove(&sid) {
                log::debug!("stream {} finished in both directions", sid);
                entry.notify(StreamEvent::Closed);
            }
        }
    }
}

fn parse_hostport(payload: &[u8]) -> Result<(String, u16), MuxError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| MuxError::Protocol("connect request is not utf-8".into()))?;
    let (host, port) = text
        .rsplit_once(':')
        .ok_or_else(|| MuxError::Protocol(format!("malformed connect target [{}]", text)))?;
    if host.is_empty() {
        return Err(MuxError::Protocol("empty host in connect target".into()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| MuxError::Protocol(format!("bad port in connect target [{}]", text)))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Mux, Mux) {
        (Mux::new(true), Mux::new(false))
    }

    /// Moves everything the sender framed into the receiver's inbuf.
    fn transfer(from: &mut Mux, to: &mut Mux) -> Vec<MuxAction> {
        from.fill_outbuf();
        let bytes = from.outbuf.split();
        to.inbuf.extend_from_slice(&bytes);
        let actions = to.process_inbuf().unwrap();
        to.sweep_closed();
        from.sweep_closed();
        actions
    }

    #[test]
    fn open_assigns_odd_increasing_ids() {
        let (mut client, _) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = client.open_stream("example.com", 80, tx.clone());
        let b = client.open_stream("example.com", 443, tx);
        assert_eq!(a, 1);
        assert_eq!(b, 3);
        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::IdAssigned(1)));
        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::IdAssigned(3)));
    }

    #[test]
    fn connect_request_reaches_server() {
        let (mut client, mut server) = pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sid = client.open_stream("target.test", 8080, tx);

        let actions = transfer(&mut client, &mut server);
        match &actions[..] {
            [MuxAction::ConnectRequest { sid: got, host, port }] => {
                assert_eq!(*got, sid);
                assert_eq!(host, "target.test");
                assert_eq!(*port, 8080);
            }
            other => panic!("unexpected actions: {:?}", other),
        }
    }

    #[test]
    fn data_roundtrip_preserves_bytes() {
        let (mut client, mut server) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sid = client.open_stream("t:1", 1, tx);
        transfer(&mut client, &mut server);

        // server side attaches its observer and replies
        let (stx, mut srx) = mpsc::unbounded_channel();
        assert!(server.set_observer(sid, stx));
        assert!(server.submit_reply(sid, true));

        client.write_buffer(sid, b"hello ");
        client.write_buffer(sid, b"world");
        transfer(&mut client, &mut server);
        transfer(&mut server, &mut client);

        let mut got = Vec::new();
        while let Ok(ev) = srx.try_recv() {
            if let StreamEvent::Data(d) = ev {
                got.extend_from_slice(&d);
            }
        }
        assert_eq!(got, b"hello world");

        // drain the client events; last must be the ok reply
        let mut saw_ok = false;
        while let Ok(ev) = rx.try_recv() {
            if let StreamEvent::CreateResult(ok) = ev {
                saw_ok = ok;
            }
        }
        assert!(saw_ok);
    }

    #[test]
    fn eof_then_both_directions_close() {
        let (mut client, mut server) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sid = client.open_stream("t:1", 1, tx);
        transfer(&mut client, &mut server);
        let (stx, mut srx) = mpsc::unbounded_channel();
        server.set_observer(sid, stx);

        client.write_buffer(sid, b"bye");
        client.set_write_eof(sid);
        transfer(&mut client, &mut server);

        let mut saw_eof = false;
        while let Ok(ev) = srx.try_recv() {
            match ev {
                StreamEvent::RecvEof => saw_eof = true,
                StreamEvent::Data(d) => assert_eq!(&d[..], b"bye"),
                _ => {}
            }
        }
        assert!(saw_eof);

        // server closes its write direction too; both sides retire the id
        server.set_write_eof(sid);
        transfer(&mut server, &mut client);
        transfer(&mut client, &mut server);
        assert_eq!(server.stream_count(), 0);
        assert_eq!(client.stream_count(), 0);

        let mut saw_closed = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, StreamEvent::Closed) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }

    #[test]
    fn reset_notifies_peer_observer() {
        let (mut client, mut server) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sid = client.open_stream("t:1", 1, tx);
        transfer(&mut client, &mut server);

        server.reset_stream(sid);
        transfer(&mut server, &mut client);

        let mut saw_closed = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, StreamEvent::Closed) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
        assert_eq!(client.stream_count(), 0);
    }

    #[test]
    fn data_for_unknown_stream_is_answered_with_reset() {
        let (mut client, mut server) = pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sid = client.open_stream("t:1", 1, tx);
        transfer(&mut client, &mut server);

        server.reset_stream(sid);
        server.outbuf.clear(); // pretend the reset is still in flight

        client.write_buffer(sid, b"late");
        let actions = transfer(&mut client, &mut server);
        assert!(actions.is_empty());
        // the server framed a reset in response, and nothing blew up
        server.fill_outbuf();
        assert!(!server.outbuf.is_empty());
    }

    #[test]
    fn open_on_client_is_protocol_error() {
        let (mut client, mut server) = pair();
        // hand-build an OPEN aimed at the client
        server.push_frame(KIND_OPEN, 2, b"evil:80");
        let bytes = server.outbuf.split();
        client.inbuf.extend_from_slice(&bytes);
        assert!(client.process_inbuf().is_err());
    }

    #[test]
    fn buffered_data_flushes_on_observer_attach() {
        let (mut client, mut server) = pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sid = client.open_stream("t:1", 1, tx);
        transfer(&mut client, &mut server);

        // data lands before the target connector attaches
        client.write_buffer(sid, b"early");
        transfer(&mut client, &mut server);

        let (stx, mut srx) = mpsc::unbounded_channel();
        assert!(server.set_observer(sid, stx));
        match srx.try_recv().unwrap() {
            StreamEvent::Data(d) => assert_eq!(&d[..], b"early"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn hostport_parsing() {
        assert_eq!(parse_hostport(b"a.example:80").unwrap(), ("a.example".into(), 80));
        assert!(parse_hostport(b"noport").is_err());
        assert!(parse_hostport(b":80").is_err());
        assert!(parse_hostport(b"h:99999").is_err());
        assert!(parse_hostport(&[0xff, 0xfe]).is_err());
    }
}
