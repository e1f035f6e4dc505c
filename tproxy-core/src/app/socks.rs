//! SOCKS5 plumbing.
//!
//! Two independent pieces live here. `accept_connect` is the browser-facing
//! side of the client proxy: it drives the no-auth greeting and the CONNECT
//! request on a freshly accepted connection and hands back the requested
//! target. `connect_through` is the outbound counterpart used to reach the
//! server proxy through a local Tor SOCKS port.
//!
//! Only CONNECT is supported, with IPv4 and hostname address types; BIND
//! and UDP ASSOCIATE are not. The success reply sent to the browser uses a
//! zeroed bind address and port, which is what well-known SOCKS5 servers
//! answer when the value is not meaningful.

use std::io;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// The reply written to the browser once the tunnel stream is up.
pub const CONNECT_GRANTED_REPLY: [u8; 10] =
    [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

fn proto_err(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Serves the greeting and CONNECT request on an accepted connection and
/// returns the requested `(host, port)`. The caller sends the success
/// reply itself once the tunnel stream is actually established.
pub async fn accept_connect<S>(conn: &mut S) -> io::Result<(String, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // greeting: version, method count, methods
    let mut head = [0u8; 2];
    conn.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(proto_err(format!("bad socks version {:#04x}", head[0])));
    }
    let nmethods = usize::from(head[1]);
    let mut methods = vec![0u8; nmethods];
    conn.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        log::warn!("client offers no acceptable auth method");
        return Err(proto_err("only the no-authentication method is supported"));
    }
    conn.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // connect request: version, command, reserved, address type
    let mut head = [0u8; 4];
    conn.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION || head[2] != 0x00 {
        return Err(proto_err("malformed connect request"));
    }
    if head[1] != CMD_CONNECT {
        log::warn!("unsupported socks command {:#04x}", head[1]);
        return Err(proto_err("only CONNECT is supported"));
    }

    match head[3] {
        ATYP_IPV4 => {
            let mut rest = [0u8; 6];
            conn.read_exact(&mut rest).await?;
            let addr = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            Ok((addr.to_string(), port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await?;
            let mut rest = vec![0u8; usize::from(len[0]) + 2];
            conn.read_exact(&mut rest).await?;
            let (name, port_bytes) = rest.split_at(usize::from(len[0]));
            let host = String::from_utf8(name.to_vec())
                .map_err(|_| proto_err("hostname is not utf-8"))?;
            let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
            Ok((host, port))
        }
        other => Err(proto_err(format!("unsupported address type {:#04x}", other))),
    }
}

/// Issues a no-auth CONNECT for `host:port` on an already connected socket
/// to a SOCKS5 proxy (the local Tor client). On success the socket carries
/// the tunneled connection.
pub async fn connect_through<S>(conn: &mut S, host: &str, port: u16) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH]).await?;
    let mut resp = [0u8; 2];
    conn.read_exact(&mut resp).await?;
    if resp != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(proto_err("socks proxy refused the no-auth method"));
    }

    let mut req = Vec::with_capacity(7 + host.len());
    req.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00]);
    match host.parse::<Ipv4Addr>() {
        Ok(addr) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&addr.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(proto_err("hostname too long for socks"));
            }
            req.push(ATYP_DOMAIN);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
        }
    }
    req.extend_from_slice(&port.to_be_bytes());
    conn.write_all(&req).await?;

    let mut head = [0u8; 4];
    conn.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(proto_err("bad version in socks reply"));
    }
    if head[1] != 0x00 {
        return Err(proto_err(format!("socks connect failed with code {:#04x}", head[1])));
    }
    // consume the bound address, whatever its type
    let skip = match head[3] {
        ATYP_IPV4 => 6,
        ATYP_IPV6 => 18,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        other => return Err(proto_err(format!("bad address type {:#04x} in socks reply", other))),
    };
    let mut rest = vec![0u8; skip];
    conn.read_exact(&mut rest).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn greeting_and_ipv4_connect() {
        let (mut client, mut server) = duplex(256);

        let serve = tokio::spawn(async move {
            let target = accept_connect(&mut server).await.unwrap();
            (target, server)
        });

        // the literal handshake a browser performs
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x05, 0x00]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50])
            .await
            .unwrap();

        let ((target, port), mut server) = serve.await.unwrap();
        assert_eq!(target, "127.0.0.1");
        assert_eq!(port, 80);

        server.write_all(&CONNECT_GRANTED_REPLY).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(
            reply,
            [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn hostname_connect() {
        let (mut client, mut server) = duplex(256);
        let serve = tokio::spawn(async move { accept_connect(&mut server).await });

        client.write_all(&[0x05, 0x02, 0x00, 0x01]).await.unwrap();
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();

        let mut req = vec![0x05, 0x01, 0x00, 0x03, 0x0b];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let (host, port) = serve.await.unwrap().unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn rejects_auth_only_clients() {
        let (mut client, mut server) = duplex(256);
        let serve = tokio::spawn(async move { accept_connect(&mut server).await });

        // offers only username/password auth
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        assert!(serve.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn rejects_non_connect_commands() {
        let (mut client, mut server) = duplex(256);
        let serve = tokio::spawn(async move { accept_connect(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        // BIND request
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        assert!(serve.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn outbound_connect_through_proxy() {
        let (mut client, mut proxy) = duplex(256);

        let fake_proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            proxy.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            proxy.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..3], &[0x05, 0x01, 0x00]);
            assert_eq!(head[3], 0x03);
            let mut len = [0u8; 1];
            proxy.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; usize::from(len[0]) + 2];
            proxy.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..usize::from(len[0])], b"ssp.test");

            proxy
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        connect_through(&mut client, "ssp.test", 2081).await.unwrap();
        fake_proxy.await.unwrap();
    }

    #[tokio::test]
    async fn outbound_connect_failure_surfaces() {
        let (mut client, mut proxy) = duplex(256);
        let fake_proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).await.unwrap();
            proxy.write_all(&[0x05, 0x00]).await.unwrap();
            let mut head = [0u8; 4];
            proxy.read_exact(&mut head).await.unwrap();
            let mut rest = [0u8; 6];
            proxy.read_exact(&mut rest).await.unwrap();
            // host unreachable
            proxy
                .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        assert!(connect_through(&mut client, "10.0.0.9", 80).await.is_err());
        fake_proxy.await.unwrap();
    }
}
