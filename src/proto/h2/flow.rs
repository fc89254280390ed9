//! Flow-control window accounting.
//!
//! Each stream carries one window per direction, and the connection
//! carries another pair on stream zero. Send windows gate outbound DATA;
//! receive windows police the peer and drive the lazy WINDOW_UPDATE
//! policy: credit is returned only once the application has consumed
//! more than a quarter of the nominal window.

use super::frame::{Reason, MAX_WINDOW_SIZE};

/// Outbound flow-control window. Grown by peer WINDOW_UPDATEs, shrunk
/// by the DATA we send.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendFlow {
    window: i32,
}

impl SendFlow {
    pub(crate) fn new(initial: u32) -> SendFlow {
        SendFlow {
            window: initial as i32,
        }
    }

    /// Octets that may be sent right now. Negative after a mid-life
    /// INITIAL_WINDOW_SIZE reduction.
    pub(crate) fn available(&self) -> i32 {
        self.window
    }

    /// Account for `n` octets of DATA put on the wire.
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(self.window >= n as i32);
        self.window -= n as i32;
    }

    /// Apply a WINDOW_UPDATE increment. An increment pushing the window
    /// past 2^31-1 is a protocol violation.
    pub(crate) fn expand(&mut self, increment: u32) -> Result<(), Reason> {
        let next = self.window as i64 + increment as i64;
        if next > MAX_WINDOW_SIZE as i64 {
            return Err(Reason::PROTOCOL_ERROR);
        }
        self.window = next as i32;
        Ok(())
    }

    /// Apply the delta of a changed INITIAL_WINDOW_SIZE setting. The
    /// result may be negative but must stay within i32.
    pub(crate) fn adjust(&mut self, delta: i64) -> Result<(), Reason> {
        let next = self.window as i64 + delta;
        if next > MAX_WINDOW_SIZE as i64 || next < i32::MIN as i64 {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.window = next as i32;
        Ok(())
    }
}

/// Inbound flow-control window plus the unacknowledged-consumption
/// counter feeding the WINDOW_UPDATE policy.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecvFlow {
    window: i32,
    nominal: u32,
    unacked: u32,
}

impl RecvFlow {
    pub(crate) fn new(initial: u32) -> RecvFlow {
        RecvFlow {
            window: initial as i32,
            nominal: initial,
            unacked: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn window(&self) -> i32 {
        self.window
    }

    /// Account for `n` flow-controlled octets of received DATA. A window
    /// going negative means the peer overshot its credit.
    pub(crate) fn receive(&mut self, n: usize) -> Result<(), Reason> {
        let next = self.window as i64 - n as i64;
        if next < 0 {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.window = next as i32;
        Ok(())
    }

    /// The application consumed `n` octets out of the receive buffer.
    /// Returns the WINDOW_UPDATE increment to send once enough credit
    /// has accumulated.
    pub(crate) fn release(&mut self, n: usize) -> Option<u32> {
        self.unacked = self.unacked.saturating_add(n as u32);
        if self.unacked > self.nominal / 4 {
            self.take_pending()
        } else {
            None
        }
    }

    /// Drain whatever credit is pending regardless of the threshold.
    /// Used when unpausing a stream.
    pub(crate) fn take_pending(&mut self) -> Option<u32> {
        if self.unacked == 0 {
            return None;
        }
        let increment = self.unacked;
        self.unacked = 0;
        self.window += increment as i32;
        Some(increment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_consume_and_expand() {
        let mut flow = SendFlow::new(100);
        flow.consume(60);
        assert_eq!(flow.available(), 40);
        flow.expand(60).unwrap();
        assert_eq!(flow.available(), 100);
    }

    #[test]
    fn send_expand_overflow_is_flagged() {
        let mut flow = SendFlow::new(MAX_WINDOW_SIZE);
        assert_eq!(flow.expand(1), Err(Reason::PROTOCOL_ERROR));
    }

    #[test]
    fn send_adjust_may_go_negative() {
        let mut flow = SendFlow::new(1000);
        flow.consume(1000);
        flow.adjust(-500).unwrap();
        assert_eq!(flow.available(), -500);
        flow.adjust(2000).unwrap();
        assert_eq!(flow.available(), 1500);
    }

    #[test]
    fn recv_overshoot_is_flagged() {
        let mut flow = RecvFlow::new(10);
        flow.receive(10).unwrap();
        assert_eq!(flow.receive(1), Err(Reason::FLOW_CONTROL_ERROR));
    }

    #[test]
    fn release_updates_lazily() {
        let mut flow = RecvFlow::new(1024);
        flow.receive(1024).unwrap();
        // under a quarter of the nominal window: no update yet
        assert_eq!(flow.release(200), None);
        assert_eq!(flow.release(56), None);
        // crossing the threshold flushes everything accumulated
        assert_eq!(flow.release(1), Some(257));
        assert_eq!(flow.window(), 257);
        // and the counter restarts
        assert_eq!(flow.release(100), None);
        assert_eq!(flow.take_pending(), Some(100));
    }
}
