//! Peer-info preamble.
//!
//! Immediately after the carrier TCP connection is established each side
//! sends exactly one 11-byte preamble: protocol version, its cell size,
//! its IPv4 address, and (client only) the L and packet interval it wants
//! the server to adopt. The client writes first; the server answers only
//! after it has read all 11 bytes.

use std::net::Ipv4Addr;

/// Current protocol version. A mismatch closes the carrier on the server
/// and is fatal on the client.
pub const PROTOCOL_VERSION: u8 = 9;

/// version(1) + cell_size(2) + ip(4) + requested_L(2) + requested_interval(2)
pub const PEER_INFO_LEN: usize = 11;

const ALLOWED_L: [u16; 7] = [0, 50, 100, 150, 200, 250, 300];
const ALLOWED_PKT_INTERVALS_MS: [u16; 7] = [0, 5, 20, 50, 75, 100, 125];

pub fn l_is_allowed(l: u16) -> bool {
    ALLOWED_L.contains(&l)
}

pub fn pkt_interval_is_allowed(interval_ms: u16) -> bool {
    ALLOWED_PKT_INTERVALS_MS.contains(&interval_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub version: u8,
    pub cell_size: u16,
    pub addr: Ipv4Addr,
    /// Only the client requests an L; the server always sends zero.
    pub requested_l: u16,
    /// Only the client requests a packet interval; the server sends zero.
    pub requested_pkt_interval_ms: u16,
}

impl PeerInfo {
    pub fn encode(&self) -> [u8; PEER_INFO_LEN] {
        let mut out = [0u8; PEER_INFO_LEN];
        out[0] = self.version;
        out[1..3].copy_from_slice(&self.cell_size.to_be_bytes());
        out[3..7].copy_from_slice(&self.addr.octets());
        out[7..9].copy_from_slice(&self.requested_l.to_be_bytes());
        out[9..11].copy_from_slice(&self.requested_pkt_interval_ms.to_be_bytes());
        out
    }

    pub fn parse(raw: &[u8; PEER_INFO_LEN]) -> PeerInfo {
        PeerInfo {
            version: raw[0],
            cell_size: u16::from_be_bytes([raw[1], raw[2]]),
            addr: Ipv4Addr::new(raw[3], raw[4], raw[5], raw[6]),
            requested_l: u16::from_be_bytes([raw[7], raw[8]]),
            requested_pkt_interval_ms: u16::from_be_bytes([raw[9], raw[10]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_parse_roundtrip() {
        let info = PeerInfo {
            version: PROTOCOL_VERSION,
            cell_size: 750,
            addr: Ipv4Addr::new(10, 0, 0, 3),
            requested_l: 100,
            requested_pkt_interval_ms: 20,
        };
        let raw = info.encode();
        assert_eq!(PeerInfo::parse(&raw), info);
    }

    #[test]
    fn wire_layout() {
        let info = PeerInfo {
            version: 9,
            cell_size: 750,
            addr: Ipv4Addr::new(127, 0, 0, 1),
            requested_l: 0x0102,
            requested_pkt_interval_ms: 0x0304,
        };
        assert_eq!(
            info.encode(),
            [9, 0x02, 0xee, 127, 0, 0, 1, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn allowed_sets() {
        assert!(l_is_allowed(0));
        assert!(l_is_allowed(300));
        assert!(!l_is_allowed(42));
        assert!(pkt_interval_is_allowed(0));
        assert!(pkt_interval_is_allowed(125));
        assert!(!pkt_interval_is_allowed(10));
    }
}
