//! Bidirectional bridge between one outer TCP connection and one carrier
//! stream. Both endpoint sides reuse it: the client side couples a browser
//! connection to the stream it created, the server side couples the stream
//! to the target connection it opened.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::system::channel::{StreamEvent, StreamHandle};

const READ_BUF_SIZE: usize = 16384;

/// Moves bytes both ways until either side closes. There is no half-open
/// support: a stream EOF or close shuts the outer connection down, and the
/// function returns.
///
/// Returns true when the inner stream is already closed, so the caller
/// knows whether it still has to close it.
pub async fn forward(mut outer: TcpStream, stream: &mut StreamHandle) -> bool {
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut outer_read_open = true;

    loop {
        tokio::select! {
            r = outer.read(&mut buf), if outer_read_open => match r {
                Ok(0) => {
                    // outer closed its write side; buffered bytes still
                    // get framed, followed by an EOF marker
                    log::debug!("stream {}: outer eof", stream.sid());
                    stream.set_write_eof();
                    outer_read_open = false;
                }
                Ok(n) => {
                    stream.write(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    log::debug!("stream {}: outer read error: {}", stream.sid(), e);
                    return false;
                }
            },
            ev = stream.next_event() => match ev {
                Some(StreamEvent::Data(data)) => {
                    if let Err(e) = outer.write_all(&data).await {
                        log::debug!("stream {}: outer write error: {}", stream.sid(), e);
                        return false;
                    }
                }
                Some(StreamEvent::RecvEof) => {
                    log::debug!("stream {}: inner eof; closing outer", stream.sid());
                    let _ = outer.shutdown().await;
                    return false;
                }
                Some(StreamEvent::Closed) | None => {
                    log::debug!("stream {}: inner closed", stream.sid());
                    return true;
                }
                Some(other) => {
                    // create-phase events cannot arrive once forwarding
                    log::warn!("stream {}: unexpected event {:?}", stream.sid(), other);
                }
            },
        }
    }
}
