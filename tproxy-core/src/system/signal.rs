//! Operator signals, surfaced as events on the main loop.
//!
//! SIGUSR1 closes all browser-facing streams, SIGUSR2 requests a graceful
//! defense stop, SIGTERM and SIGINT shut the process down. Handlers never
//! touch proxy state directly; the runtime turns each delivery into an
//! event the owning loop consumes at its leisure.

use std::io;
use tokio::signal::unix::{signal, Signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorSignal {
    /// SIGUSR1: close all browser-facing streams.
    CloseAllStreams,
    /// SIGUSR2: request a graceful stop of the active defense session.
    StopDefense,
    /// SIGTERM or SIGINT: log the counters and exit.
    Shutdown,
}

pub struct OperatorSignals {
    usr1: Signal,
    usr2: Signal,
    term: Signal,
    int: Signal,
}

impl OperatorSignals {
    pub fn new() -> io::Result<OperatorSignals> {
        Ok(OperatorSignals {
            usr1: signal(SignalKind::user_defined1())?,
            usr2: signal(SignalKind::user_defined2())?,
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }

    /// Waits for the next operator signal.
    pub async fn recv(&mut self) -> OperatorSignal {
        tokio::select! {
            _ = self.usr1.recv() => OperatorSignal::CloseAllStreams,
            _ = self.usr2.recv() => OperatorSignal::StopDefense,
            _ = self.term.recv() => OperatorSignal::Shutdown,
            _ = self.int.recv() => OperatorSignal::Shutdown,
        }
    }
}
