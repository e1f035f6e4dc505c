//! Fixed-size cell framing for the carrier wire protocol.
//!
//! Every cell is `CELL_SIZE` bytes on the wire: a 3-byte header followed by
//! the body. The header packs the cell type into the top 3 bits of byte 0,
//! the flags into the low 5 bits, and the useful payload length into bytes
//! 1..3 (big-endian). Body bytes past the payload length are padding and
//! carry no meaning for the receiver.

use thiserror::Error;

/// 1 byte type-and-flags plus 2 bytes payload length.
pub const CELL_HEADER_SIZE: usize = 3;

/// The only non-zero cell size the protocol negotiates. Cell size 0 means
/// the carrier is a pass-through and no cells are framed at all.
pub const CELL_SIZE: usize = 750;

/// Body bytes available for payload plus padding in a 750-byte cell.
pub const CELL_BODY_SIZE: usize = CELL_SIZE - CELL_HEADER_SIZE;

// type is 3 bits wide, flags take the remaining 5 bits of byte 0
const CELL_TYPE_SHIFT: u8 = 5;
const CELL_FLAGS_MASK: u8 = (1 << CELL_TYPE_SHIFT) - 1;

/// Cell flag bits. Only the low 5 bits of the type-and-flags byte exist on
/// the wire; bits a peer does not understand must be ignored, not errored.
pub mod flags {
    /// Client asks the server to start its defense session.
    pub const START_DEFENSE: u8 = 1 << 0;
    /// Client asks the server to stop (subject to the L modulus).
    pub const STOP_DEFENSE: u8 = 1 << 1;
    /// Server tells the client it hit its time limit and auto-stopped.
    pub const AUTO_STOPPED: u8 = 1 << 2;
    /// Server tells the client it is done defending the downstream
    /// direction.
    pub const DONE: u8 = 1 << 3;
    /// Set on every cell emitted while the sender's defense session is
    /// active or pending its first socket send.
    pub const DEFENSIVE: u8 = 1 << 4;

    /// Flags that must never be lost to the drop-tail-dummy optimization.
    pub const IMPORTANT: u8 = START_DEFENSE | STOP_DEFENSE | AUTO_STOPPED | DONE;
}

/// Returns true if any flag rides on this cell that a dropped dummy would
/// lose.
pub fn has_important_flags(cell_flags: u8) -> bool {
    cell_flags & flags::IMPORTANT != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    Data,
    Dummy,
    Control,
}

impl CellType {
    fn from_wire(value: u8) -> Option<CellType> {
        match value {
            0 => Some(CellType::Data),
            1 => Some(CellType::Dummy),
            2 => Some(CellType::Control),
            _ => None,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            CellType::Data => 0,
            CellType::Dummy => 1,
            CellType::Control => 2,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CellHeaderError {
    #[error("unknown cell type {0}")]
    UnknownType(u8),
}

/// Builds the 3-byte cell header.
///
/// `cell_flags` must fit in the low 5 bits; the payload length is written
/// big-endian.
pub fn encode_header(ty: CellType, cell_flags: u8, payload_len: u16) -> [u8; CELL_HEADER_SIZE] {
    debug_assert_eq!(cell_flags & !CELL_FLAGS_MASK, 0, "flags overflow the 5-bit field");
    let type_n_flags = (ty.to_wire() << CELL_TYPE_SHIFT) | (cell_flags & CELL_FLAGS_MASK);
    let len = payload_len.to_be_bytes();
    [type_n_flags, len[0], len[1]]
}

/// Parses a 3-byte cell header into `(type, flags, payload_len)`.
///
/// An unknown type value is a protocol error. Flag bits are returned as-is
/// so that bits reserved for future versions pass through unharmed.
pub fn decode_header(
    header: &[u8; CELL_HEADER_SIZE],
) -> Result<(CellType, u8, u16), CellHeaderError> {
    let raw_type = header[0] >> CELL_TYPE_SHIFT;
    let ty = CellType::from_wire(raw_type).ok_or(CellHeaderError::UnknownType(raw_type))?;
    let cell_flags = header[0] & CELL_FLAGS_MASK;
    let payload_len = u16::from_be_bytes([header[1], header[2]]);
    Ok((ty, cell_flags, payload_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let hdr = encode_header(CellType::Data, flags::DEFENSIVE | flags::START_DEFENSE, 747);
        let (ty, f, len) = decode_header(&hdr).unwrap();
        assert_eq!(ty, CellType::Data);
        assert_eq!(f, flags::DEFENSIVE | flags::START_DEFENSE);
        assert_eq!(len, 747);
    }

    #[test]
    fn type_occupies_top_three_bits() {
        // bit patterns checked against the wire layout directly
        assert_eq!(decode_header(&[0b0001_0101, 0, 9]).unwrap(), (CellType::Data, 0b10101, 9));
        assert_eq!(decode_header(&[0b0011_0101, 0, 0]).unwrap(), (CellType::Dummy, 0b10101, 0));
        assert_eq!(decode_header(&[0b0101_0101, 0, 0]).unwrap(), (CellType::Control, 0b10101, 0));
        assert_eq!(decode_header(&[0b0001_1111, 0, 0]).unwrap(), (CellType::Data, 0b11111, 0));
        assert_eq!(decode_header(&[0b0010_0000, 0, 0]).unwrap(), (CellType::Dummy, 0, 0));
    }

    #[test]
    fn unknown_types_rejected() {
        for raw in 3u8..8 {
            let err = decode_header(&[raw << CELL_TYPE_SHIFT, 0, 0]).unwrap_err();
            assert_eq!(err, CellHeaderError::UnknownType(raw));
        }
    }

    #[test]
    fn length_is_big_endian() {
        let hdr = encode_header(CellType::Data, 0, 0x0102);
        assert_eq!(&hdr[1..], &[0x01, 0x02]);
    }

    #[test]
    fn important_flags() {
        assert!(has_important_flags(flags::STOP_DEFENSE));
        assert!(has_important_flags(flags::DONE | flags::DEFENSIVE));
        assert!(!has_important_flags(flags::DEFENSIVE));
        assert!(!has_important_flags(0));
    }
}
