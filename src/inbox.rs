//! Single-producer/single-consumer event flags between the radio ISR and
//! the main loop.
//!
//! Each flag is a small state machine: 0 = idle, 1 = new event posted by the
//! ISR, 2 = accepted by the main loop and waiting for its counterpart. The
//! engine only advances a protocol step once *both* the TX-done and RX-good
//! flags have reached level 2, which makes it immune to the two events
//! arriving in either order. RX errors never post here; the ISR restarts the
//! receiver on its own and the round times out if the reply stays lost.
//!
//! Stores from the ISR use release ordering and loads from the main loop use
//! acquire ordering, so the received-frame length is published before the
//! flag that makes it valid.

use core::sync::atomic::{AtomicU16, AtomicU8, Ordering};

const IDLE: u8 = 0;
const POSTED: u8 = 1;
const ACCEPTED: u8 = 2;

pub struct EventInbox {
    tx_done: AtomicU8,
    rx_done: AtomicU8,
    /// On-air length of the received frame, valid while `rx_done` is nonzero.
    rx_len: AtomicU16,
}

impl EventInbox {
    pub const fn new() -> Self {
        Self {
            tx_done: AtomicU8::new(IDLE),
            rx_done: AtomicU8::new(IDLE),
            rx_len: AtomicU16::new(0),
        }
    }

    /// ISR: transmission finished.
    pub fn post_tx_done(&self) {
        self.tx_done.store(POSTED, Ordering::Release);
    }

    /// ISR: a frame with a good FCS arrived, `len` bytes on air.
    pub fn post_rx_ok(&self, len: u16) {
        self.rx_len.store(len, Ordering::Relaxed);
        self.rx_done.store(POSTED, Ordering::Release);
    }

    /// Main loop: promote a newly posted TX-done to accepted. Returns true
    /// exactly once per posted event.
    pub fn accept_tx_done(&self) -> bool {
        if self.tx_done.load(Ordering::Acquire) == POSTED {
            self.tx_done.store(ACCEPTED, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Main loop: begin processing a newly received frame. Clears the flag
    /// so a frame arriving during validation is not lost; the caller
    /// re-arms it with [`accept_rx`](Self::accept_rx) once the frame checks
    /// out.
    pub fn take_rx_frame(&self) -> Option<u16> {
        if self.rx_done.load(Ordering::Acquire) == POSTED {
            self.rx_done.store(IDLE, Ordering::Relaxed);
            Some(self.rx_len.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    /// Main loop: the frame taken with [`take_rx_frame`](Self::take_rx_frame)
    /// was valid; hold it at level 2 until the paired TX-done arrives.
    pub fn accept_rx(&self) {
        self.rx_done.store(ACCEPTED, Ordering::Relaxed);
    }

    pub fn tx_accepted(&self) -> bool {
        self.tx_done.load(Ordering::Acquire) == ACCEPTED
    }

    pub fn rx_accepted(&self) -> bool {
        self.rx_done.load(Ordering::Acquire) == ACCEPTED
    }

    /// Both halves of the current step are in; reset for the next one.
    pub fn pair_complete(&self) -> bool {
        self.tx_accepted() && self.rx_accepted()
    }

    /// Drop everything, e.g. on a round timeout or validation failure.
    pub fn clear(&self) {
        self.tx_done.store(IDLE, Ordering::Relaxed);
        self.rx_done.store(IDLE, Ordering::Relaxed);
    }
}

impl Default for EventInbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_done_two_level_protocol() {
        let inbox = EventInbox::new();
        assert!(!inbox.accept_tx_done());

        inbox.post_tx_done();
        assert!(inbox.accept_tx_done());
        assert!(inbox.tx_accepted());
        // Accepting is one-shot.
        assert!(!inbox.accept_tx_done());
    }

    #[test]
    fn rx_frame_carries_length() {
        let inbox = EventInbox::new();
        assert_eq!(inbox.take_rx_frame(), None);

        inbox.post_rx_ok(22);
        assert_eq!(inbox.take_rx_frame(), Some(22));
        // Taken: the flag is back to idle until re-armed.
        assert_eq!(inbox.take_rx_frame(), None);
        assert!(!inbox.rx_accepted());

        inbox.accept_rx();
        assert!(inbox.rx_accepted());
    }

    #[test]
    fn pairing_requires_both_events_in_any_order() {
        let inbox = EventInbox::new();

        // RX first, then TX.
        inbox.post_rx_ok(12);
        assert_eq!(inbox.take_rx_frame(), Some(12));
        inbox.accept_rx();
        assert!(!inbox.pair_complete());
        inbox.post_tx_done();
        assert!(inbox.accept_tx_done());
        assert!(inbox.pair_complete());

        inbox.clear();
        assert!(!inbox.pair_complete());

        // TX first, then RX.
        inbox.post_tx_done();
        assert!(inbox.accept_tx_done());
        assert!(!inbox.pair_complete());
        inbox.post_rx_ok(12);
        assert_eq!(inbox.take_rx_frame(), Some(12));
        inbox.accept_rx();
        assert!(inbox.pair_complete());
    }

    #[test]
    fn new_event_overwrites_stale_acceptance() {
        // At most one un-consumed event per kind: a fresh post brings the
        // flag back to level 1 no matter what.
        let inbox = EventInbox::new();
        inbox.post_rx_ok(12);
        assert_eq!(inbox.take_rx_frame(), Some(12));
        inbox.accept_rx();

        inbox.post_rx_ok(22);
        assert_eq!(inbox.take_rx_frame(), Some(22));
    }
}
