//! Per-connection state: the sliding windows, the lazy transmit queue, and the small bits of
//! bookkeeping the state machine in [`super::Tcp`] drives.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::time::TimerId;

/// Identifies one connection. Listening sockets aren't keyed this way; only established and
/// closing connections are.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub remote_addr: crate::wire::ipv4::Address,
    pub remote_port: u16,
    pub local_port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    Closing,
    TimeWait,
}

/// How long a connection lingers in TIME-WAIT before its TCB is finally dropped.
pub const TIME_WAIT: crate::time::Tick = 60;
/// Initial retransmission timeout; doubles on every unacknowledged retry.
pub const INITIAL_RTO: crate::time::Tick = 1;
/// Give up retransmitting after this many attempts and reset the connection locally.
pub const MAX_RETRIES: u32 = 7;
/// Used as the peer's segment size when a SYN carries no MSS option (RFC 879).
pub const DEFAULT_MSS: u16 = 536;

pub struct RxWindow {
    pub size: u32,
    pub next: u32,
}

pub struct TxWindow {
    pub size: u32,
    pub unack: u32,
    pub next: u32,
}

/// One outstanding (or not yet sent) chunk of the send queue.
///
/// `writer` is purely a function of the byte offset within the chunk, so retransmitting it is
/// just calling it again; nothing here remembers whether a previous call already ran. `acked_cb`
/// runs exactly once, when `ack_up_to` finally pops this entry off the front of the queue.
pub struct TxEntry {
    pub seq: u32,
    pub size: usize,
    pub writer: Rc<dyn Fn(usize, &mut [u8])>,
    pub acked_cb: Box<dyn FnOnce()>,
}

/// Callbacks the application registered for this connection, grounded on the echo server's
/// `conn_handlers_t { new_data, remote_close, close, reset }`.
pub struct ConnHandlers {
    pub new_data: Box<dyn FnMut(&[u8])>,
    pub remote_close: Box<dyn FnMut()>,
    pub closed: Box<dyn FnMut()>,
    pub reset: Box<dyn FnMut()>,
}

pub struct Tcb {
    pub four_tuple: FourTuple,
    pub state: State,
    pub rx: RxWindow,
    pub tx: TxWindow,
    pub tx_queue: VecDeque<TxEntry>,
    pub rto: crate::time::Tick,
    pub retransmit_timer: Option<TimerId>,
    pub time_wait_timer: Option<TimerId>,
    pub retries: u32,
    /// The largest segment payload this connection may send: the peer's advertised MSS (or
    /// [`DEFAULT_MSS`] if it sent none), clamped to what the local adapter can frame.
    pub tx_mss: u16,
    pub handlers: ConnHandlers,
}

impl Tcb {
    pub fn unacked_bytes(&self) -> u32 {
        self.tx.next.wrapping_sub(self.tx.unack)
    }

    /// Whether the application may call `send` on this connection right now.
    pub fn can_send(&self) -> bool {
        matches!(self.state, State::Established | State::CloseWait)
    }

    /// Advance `tx.unack` past everything up to (but not including) `ack`, dropping fully-acked
    /// entries from the transmit queue and firing each one's `acked_cb`. Returns whether this ack
    /// advanced anything.
    pub fn ack_up_to(&mut self, ack: u32) -> bool {
        if !seq_in_window_inclusive(self.tx.unack, ack, self.tx.next) {
            return false;
        }
        if ack == self.tx.unack {
            return false;
        }
        self.tx.unack = ack;
        while let Some(front) = self.tx_queue.front() {
            let end = front.seq.wrapping_add(front.size as u32);
            if seq_lt(end, ack.wrapping_add(1)) || end == ack {
                let entry = self.tx_queue.pop_front().expect("front just matched");
                (entry.acked_cb)();
            } else {
                break;
            }
        }
        true
    }
}

/// RFC 793 sequence-number comparison: `a < b` accounting for wraparound.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_in_window_inclusive(start: u32, value: u32, end: u32) -> bool {
    !seq_lt(value, start) && !seq_lt(end, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn seq_lt_handles_wraparound() {
        assert!(seq_lt(0xffff_fffe, 2));
        assert!(!seq_lt(2, 0xffff_fffe));
        assert!(seq_lt(1, 2));
    }

    fn handlers() -> ConnHandlers {
        ConnHandlers {
            new_data: Box::new(|_| {}),
            remote_close: Box::new(|| {}),
            closed: Box::new(|| {}),
            reset: Box::new(|| {}),
        }
    }

    fn tcb() -> Tcb {
        Tcb {
            four_tuple: FourTuple { remote_addr: crate::wire::ipv4::Address([0; 4]), remote_port: 0, local_port: 0 },
            state: State::Established,
            rx: RxWindow { size: 4096, next: 0 },
            tx: TxWindow { size: 4096, unack: 100, next: 110 },
            tx_queue: VecDeque::new(),
            rto: INITIAL_RTO,
            retransmit_timer: None,
            time_wait_timer: None,
            retries: 0,
            tx_mss: DEFAULT_MSS,
            handlers: handlers(),
        }
    }

    #[test]
    fn ack_up_to_drains_fully_acked_entries() {
        let mut tcb = tcb();
        tcb.tx_queue.push_back(TxEntry { seq: 100, size: 5, writer: Rc::new(|_, _| {}), acked_cb: Box::new(|| {}) });
        tcb.tx_queue.push_back(TxEntry { seq: 105, size: 5, writer: Rc::new(|_, _| {}), acked_cb: Box::new(|| {}) });

        assert!(tcb.ack_up_to(105));
        assert_eq!(tcb.tx_queue.len(), 1);
        assert_eq!(tcb.tx.unack, 105);

        assert!(tcb.ack_up_to(110));
        assert!(tcb.tx_queue.is_empty());
    }

    #[test]
    fn acked_cb_fires_exactly_once_and_only_once_fully_acked() {
        let mut tcb = tcb();
        let fired = Rc::new(RefCell::new(0));
        let fired_cb = fired.clone();
        tcb.tx_queue.push_back(TxEntry {
            seq: 100,
            size: 10,
            writer: Rc::new(|_, _| {}),
            acked_cb: Box::new(move || *fired_cb.borrow_mut() += 1),
        });

        tcb.ack_up_to(105);
        assert_eq!(*fired.borrow(), 0, "partial ack must not fire the callback yet");

        tcb.ack_up_to(110);
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn can_send_only_in_established_or_close_wait() {
        let mut tcb = tcb();
        assert!(tcb.can_send());
        tcb.state = State::FinWait1;
        assert!(!tcb.can_send());
        tcb.state = State::CloseWait;
        assert!(tcb.can_send());
    }
}
