//! Defense session state.
//!
//! A defense session shapes the carrier's send direction: while it is
//! active the channel emits exactly one cell per timer tick, data if any
//! is pending and dummy padding otherwise. The session state machine is
//! NONE -> PENDING_NEXT_SOCKET_SEND -> ACTIVE -> NONE; the pending state
//! exists only on the client, between arming auto-start and the first
//! socket write.
//!
//! All fields live in one struct owned by the channel actor, so every
//! mutation happens on the channel's task.

use tokio::time::Instant;

use super::cell::{flags, CellType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefenseState {
    None,
    /// Client wants to defend but holds off until the next time it can
    /// write to the socket; the timer is not running yet.
    PendingNextSocketSend,
    /// The defense timer is running.
    Active,
}

pub struct DefenseInfo {
    pub state: DefenseState,

    /// Cells added to the staged output while pending or active. This is
    /// not the number used for the stop decision.
    pub num_data_cells_added: u32,

    /// Number of socket write attempts since the defense began. A tick
    /// counts as an attempt even when the kernel rejects the write; this
    /// is the counter the L modulus applies to.
    pub num_write_attempts: u32,

    /// Attempt count preserved across the reset that ends a session, for
    /// the session-done report.
    pub saved_num_write_attempts: u32,

    /// The user asked to stop; we keep going until the attempt count is a
    /// multiple of L.
    pub stop_requested: bool,

    /// Absolute deadline after which the session is forcibly ended.
    pub auto_stop_at: Option<Instant>,

    pub need_start_flag_in_next_cell: bool,
    pub need_stop_flag_in_next_cell: bool,
    pub need_auto_stopped_flag_in_next_cell: bool,
    pub need_done_flag_in_next_cell: bool,

    /// Peer said it is done defending its send direction (our receive).
    pub done_defending_recv: bool,
    /// Cells with the DEFENSIVE flag received from the peer this session.
    pub num_cells_recv: u32,
}

impl DefenseInfo {
    pub fn new() -> DefenseInfo {
        DefenseInfo {
            state: DefenseState::None,
            num_data_cells_added: 0,
            num_write_attempts: 0,
            saved_num_write_attempts: 0,
            stop_requested: false,
            auto_stop_at: None,
            need_start_flag_in_next_cell: false,
            need_stop_flag_in_next_cell: false,
            need_auto_stopped_flag_in_next_cell: false,
            need_done_flag_in_next_cell: false,
            done_defending_recv: false,
            num_cells_recv: 0,
        }
    }

    /// Clears the per-session send state. The receive-direction fields
    /// (`done_defending_recv`, `num_cells_recv`) and the saved attempt
    /// count survive; they are cleared when the session-done notification
    /// fires.
    pub fn reset(&mut self) {
        self.state = DefenseState::None;
        self.num_data_cells_added = 0;
        self.num_write_attempts = 0;
        self.stop_requested = false;
        self.auto_stop_at = None;
        self.need_start_flag_in_next_cell = false;
        self.need_stop_flag_in_next_cell = false;
        self.need_auto_stopped_flag_in_next_cell = false;
    }

    /// The send direction may stop only on a tick where the attempt count
    /// is a multiple of L.
    pub fn is_done_defending_send(&self, l: u32) -> bool {
        debug_assert_eq!(self.state, DefenseState::Active);
        self.stop_requested && (self.num_write_attempts % l == 0)
    }

    pub fn increment_send_attempt(&mut self) {
        debug_assert_eq!(self.state, DefenseState::Active);
        self.num_write_attempts += 1;
    }

    pub fn request_stop(&mut self) {
        debug_assert_eq!(self.state, DefenseState::Active);
        debug_assert!(!self.stop_requested);
        self.stop_requested = true;
        self.need_start_flag_in_next_cell = false;
    }
}

/// Computes the flag bits for the cell being built and clears the
/// corresponding need_* booleans. Returns true when any important flag
/// (START, STOP, AUTO_STOPPED, DONE) was set; the caller uses that to
/// keep such a cell out of the drop-tail-dummy optimization.
pub fn apply_cell_flags(info: &mut DefenseInfo, is_client: bool, cell_type: CellType) -> (u8, bool) {
    let mut cell_flags = 0u8;
    let mut important = false;

    if info.need_start_flag_in_next_cell {
        // START is only meaningful before the first defended write, or
        // while active without a pending stop (asking an auto-stopped
        // server to resume)
        debug_assert!(
            info.state == DefenseState::PendingNextSocketSend
                || (info.state == DefenseState::Active && !info.stop_requested)
        );
        debug_assert!(is_client);
        log::debug!("setting the START flag in a {:?} cell", cell_type);
        cell_flags |= flags::START_DEFENSE;
        info.need_start_flag_in_next_cell = false;
        important = true;
    }

    if info.need_stop_flag_in_next_cell {
        log::debug!("setting the STOP flag in a {:?} cell", cell_type);
        cell_flags |= flags::STOP_DEFENSE;
        info.need_stop_flag_in_next_cell = false;
        important = true;
    }

    if info.need_auto_stopped_flag_in_next_cell {
        debug_assert!(!is_client);
        log::debug!("setting the AUTO_STOPPED flag in a {:?} cell", cell_type);
        cell_flags |= flags::AUTO_STOPPED;
        info.need_auto_stopped_flag_in_next_cell = false;
        important = true;
    }

    if info.need_done_flag_in_next_cell {
        debug_assert!(!is_client);
        log::debug!("setting the DONE flag in a {:?} cell", cell_type);
        cell_flags |= flags::DONE;
        info.need_done_flag_in_next_cell = false;
        important = true;
    }

    if info.state == DefenseState::Active || info.state == DefenseState::PendingNextSocketSend {
        cell_flags |= flags::DEFENSIVE;
    }

    (cell_flags, important)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_only_on_l_multiple() {
        let mut info = DefenseInfo::new();
        info.state = DefenseState::Active;
        info.request_stop();
        assert!(info.is_done_defending_send(100)); // 0 % 100 == 0

        info.num_write_attempts = 37;
        assert!(!info.is_done_defending_send(100));
        info.num_write_attempts = 200;
        assert!(info.is_done_defending_send(100));
    }

    #[test]
    fn not_done_without_stop_request() {
        let mut info = DefenseInfo::new();
        info.state = DefenseState::Active;
        info.num_write_attempts = 100;
        assert!(!info.is_done_defending_send(100));
    }

    #[test]
    fn request_stop_clears_pending_start() {
        let mut info = DefenseInfo::new();
        info.state = DefenseState::Active;
        info.need_start_flag_in_next_cell = true;
        // the START-on-resume request is stale once the user wants out
        info.stop_requested = false;
        info.request_stop();
        assert!(!info.need_start_flag_in_next_cell);
    }

    #[test]
    fn flags_are_cleared_once_carried() {
        let mut info = DefenseInfo::new();
        info.state = DefenseState::Active;
        info.stop_requested = true;
        info.need_stop_flag_in_next_cell = true;

        let (f, important) = apply_cell_flags(&mut info, true, CellType::Data);
        assert_eq!(f, flags::STOP_DEFENSE | flags::DEFENSIVE);
        assert!(important);
        assert!(!info.need_stop_flag_in_next_cell);

        // the next cell carries only the defensive marker
        let (f, important) = apply_cell_flags(&mut info, true, CellType::Dummy);
        assert_eq!(f, flags::DEFENSIVE);
        assert!(!important);
    }

    #[test]
    fn server_done_flag() {
        let mut info = DefenseInfo::new();
        info.need_done_flag_in_next_cell = true;

        let (f, important) = apply_cell_flags(&mut info, false, CellType::Dummy);
        assert_eq!(f, flags::DONE);
        assert!(important);
        assert!(!info.need_done_flag_in_next_cell);
    }

    #[test]
    fn reset_preserves_recv_side() {
        let mut info = DefenseInfo::new();
        info.state = DefenseState::Active;
        info.num_write_attempts = 42;
        info.done_defending_recv = true;
        info.num_cells_recv = 7;
        info.reset();
        assert_eq!(info.state, DefenseState::None);
        assert_eq!(info.num_write_attempts, 0);
        assert!(info.done_defending_recv);
        assert_eq!(info.num_cells_recv, 7);
    }
}
