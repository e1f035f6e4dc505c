//! Staged cell output, with per-cell accounting.
//!
//! `CellOutbuf` holds the bytes that are ready to be handed to the socket,
//! always in whole-cell multiples, together with an ordered queue of the
//! useful-byte count of each staged cell and the write progress of the
//! front cell. The invariant maintained here is that the sum of staged
//! cell sizes minus `front_sent_progress` equals the buffer length; this
//! is what keeps the dummy/useful counters exact across partial writes.

use bytes::{Buf, BufMut, BytesMut};
use std::collections::VecDeque;

use super::cell::CELL_HEADER_SIZE;

/// Accounting result of advancing the front of the buffer after a write.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WriteProgress {
    /// Useful payload bytes of cells that fully drained.
    pub useful_bytes: u64,
    /// Whole dummy cells that fully drained.
    pub dummy_cells: u32,
}

pub struct CellOutbuf {
    cell_size: usize,
    buf: BytesMut,
    /// Useful-byte count of every staged cell, front to back.
    cells: VecDeque<u16>,
    /// How much of the front cell has already been written to the socket.
    /// Always strictly less than `cell_size`.
    front_sent_progress: usize,
    /// True when a whole dummy cell with no important flags sits at the
    /// tail and may be replaced by real data.
    droppable_dummy_at_tail: bool,
}

impl CellOutbuf {
    pub fn new(cell_size: usize) -> CellOutbuf {
        CellOutbuf {
            cell_size,
            buf: BytesMut::new(),
            cells: VecDeque::new(),
            front_sent_progress: 0,
            droppable_dummy_at_tail: false,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn has_whole_cell(&self) -> bool {
        self.buf.len() >= self.cell_size
    }

    pub fn has_droppable_tail_dummy(&self) -> bool {
        self.droppable_dummy_at_tail
    }

    /// Bytes that should actually be written outside of a defense session,
    /// i.e. everything except a droppable tail dummy.
    pub fn writable_len(&self) -> usize {
        if self.droppable_dummy_at_tail {
            self.buf.len() - self.cell_size
        } else {
            self.buf.len()
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Stages one data cell: header, `payload`, zero padding up to the cell
    /// size. The caller must have dropped any tail dummy first.
    pub fn push_data_cell(&mut self, header: [u8; CELL_HEADER_SIZE], payload: &[u8]) {
        debug_assert!(!self.droppable_dummy_at_tail);
        debug_assert!(payload.len() <= self.cell_size - CELL_HEADER_SIZE);
        self.buf.put_slice(&header);
        self.buf.put_slice(payload);
        let pad = self.cell_size - CELL_HEADER_SIZE - payload.len();
        self.buf.put_bytes(0, pad);
        self.cells.push_back(payload.len() as u16);
    }

    /// Stages one all-padding dummy cell. A dummy that carries important
    /// flags is not recorded as droppable, so the drop-tail optimization
    /// can never lose it.
    pub fn push_dummy_cell(&mut self, header: [u8; CELL_HEADER_SIZE], important_flags: bool) {
        debug_assert!(!self.droppable_dummy_at_tail);
        self.buf.put_slice(&header);
        self.buf.put_bytes(0, self.cell_size - CELL_HEADER_SIZE);
        self.cells.push_back(0);
        self.droppable_dummy_at_tail = !important_flags;
    }

    /// Removes the droppable dummy cell at the tail, if one is there.
    /// Returns true when a cell was dropped.
    pub fn drop_tail_dummy(&mut self) -> bool {
        if !self.droppable_dummy_at_tail {
            return false;
        }
        assert!(self.buf.len() >= self.cell_size);
        self.buf.truncate(self.buf.len() - self.cell_size);
        let dropped = self.cells.pop_back();
        debug_assert_eq!(dropped, Some(0));
        self.droppable_dummy_at_tail = false;
        true
    }

    /// Consumes `n` bytes from the front after a successful socket write
    /// and advances the per-cell progress, returning the counters for the
    /// cells that fully drained.
    pub fn consume(&mut self, n: usize) -> WriteProgress {
        assert!(n > 0 && n <= self.buf.len());

        let mut remaining = n;
        let mut progress = WriteProgress::default();
        self.buf.advance(n);

        while remaining > 0 {
            let new_front = (self.front_sent_progress + remaining).min(self.cell_size);
            let sent_now = new_front - self.front_sent_progress;
            remaining -= sent_now;
            self.front_sent_progress = new_front;

            if self.front_sent_progress == self.cell_size {
                let useful = self.cells.pop_front().expect("cell queue out of sync");
                if useful > 0 {
                    progress.useful_bytes += u64::from(useful);
                } else {
                    progress.dummy_cells += 1;
                }
                self.front_sent_progress = 0;
            } else {
                debug_assert_eq!(remaining, 0);
            }
        }

        // with less than a whole cell buffered there cannot be a whole
        // dummy at the tail
        if self.buf.len() < self.cell_size {
            self.droppable_dummy_at_tail = false;
        }

        progress
    }
}
