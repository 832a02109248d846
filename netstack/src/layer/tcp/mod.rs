//! TCP connection management: a passive-open-only state machine (this stack accepts connections,
//! it does not originate them), a lazy transmit queue, and a listen table feeding an application's
//! `accept()` loop.

mod tcb;

pub use tcb::{ConnHandlers, FourTuple, State};

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use log::{debug, trace, warn};

use crate::layer::eth::Eth;
use crate::layer::ip::Ip;
use crate::layer::Result;
use crate::time::{Tick, TimerWheel};
use crate::wire::ipv4::Address as Ipv4Address;
use crate::wire::tcp::{Flags, Packet, HEADER_LEN};

use tcb::{RxWindow, Tcb, TxEntry, TxWindow, DEFAULT_MSS, INITIAL_RTO, MAX_RETRIES, TIME_WAIT};

struct Listener {
    backlog: usize,
    pending: VecDeque<FourTuple>,
    accept_queue: VecDeque<FourTuple>,
    make_handlers: Rc<dyn Fn(FourTuple) -> ConnHandlers>,
}

impl Listener {
    fn len(&self) -> usize {
        self.pending.len() + self.accept_queue.len()
    }
}

/// What [`Tcp::tick`] schedules against its [`TimerWheel`]: a per-connection deadline identified
/// by which concern owns it, since a connection can have both outstanding at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TcpTimerEvent {
    Retransmit(FourTuple),
    TimeWait(FourTuple),
}

pub struct Tcp {
    addr: Ipv4Address,
    listeners: HashMap<u16, Listener>,
    connections: HashMap<FourTuple, Tcb>,
    wheel: TimerWheel<TcpTimerEvent>,
    /// The largest TCP payload this stack will ever put on the wire, derived from the adapter's
    /// `max_packet_size` once at construction (`max_packet_size - ethernet - ipv4 - tcp headers`).
    max_segment_size: u16,
}

impl Tcp {
    pub fn new(addr: Ipv4Address, max_segment_size: u16) -> Self {
        Tcp { addr, listeners: HashMap::new(), connections: HashMap::new(), wheel: TimerWheel::new(), max_segment_size }
    }

    /// Start passively accepting connections on `local_port`. `make_handlers` is called once per
    /// accepted connection to build its application callbacks.
    pub fn listen(&mut self, local_port: u16, backlog: usize, make_handlers: impl Fn(FourTuple) -> ConnHandlers + 'static) {
        self.listeners.insert(
            local_port,
            Listener { backlog, pending: VecDeque::new(), accept_queue: VecDeque::new(), make_handlers: Rc::new(make_handlers) },
        );
    }

    /// Pop the next fully-established connection waiting on `local_port`'s accept queue.
    pub fn accept(&mut self, local_port: u16) -> Option<FourTuple> {
        self.listeners.get_mut(&local_port).and_then(|listener| listener.accept_queue.pop_front())
    }

    pub fn is_established(&self, conn: FourTuple) -> bool {
        matches!(self.connections.get(&conn).map(|tcb| tcb.state), Some(State::Established) | Some(State::CloseWait))
    }

    /// Whether the application may call [`Tcp::send`] on `conn` right now.
    pub fn can_send(&self, conn: FourTuple) -> bool {
        self.connections.get(&conn).map(Tcb::can_send).unwrap_or(false)
    }

    /// Enqueue `data` for sending, splitting it into `tx_mss`-sized segments and transmitting
    /// whichever of them the current window admits. `acked_cb` fires exactly once, when the last
    /// byte of `data` has been acknowledged.
    pub fn send(&mut self, conn: FourTuple, eth: &mut Eth, ip: &Ip, now: Tick, data: Vec<u8>, acked_cb: impl FnOnce() + 'static) -> Result<()> {
        let tcb = self.connections.get_mut(&conn).ok_or(crate::error::Error::Illegal)?;
        if !tcb.can_send() {
            return Err(crate::error::Error::Illegal);
        }

        let mss = tcb.tx_mss.max(1) as usize;
        let mut bounds = Vec::new();
        if data.is_empty() {
            bounds.push((0, 0));
        } else {
            let mut start = 0;
            while start < data.len() {
                let end = (start + mss).min(data.len());
                bounds.push((start, end));
                start = end;
            }
        }
        let last = bounds.len() - 1;
        let data = Rc::new(data);
        let mut acked_cb = Some(Box::new(acked_cb) as Box<dyn FnOnce()>);

        for (i, (start, end)) in bounds.into_iter().enumerate() {
            let seq = tcb.tx.next;
            let size = end - start;
            tcb.tx.next = tcb.tx.next.wrapping_add(size as u32);

            let chunk_data = data.clone();
            let writer: Rc<dyn Fn(usize, &mut [u8])> =
                Rc::new(move |offset, buf: &mut [u8]| buf.copy_from_slice(&chunk_data[start + offset..start + offset + buf.len()]));
            let cb: Box<dyn FnOnce()> = if i == last { acked_cb.take().expect("only the last chunk claims it") } else { Box::new(|| {}) };

            if tcb.retransmit_timer.is_none() {
                tcb.retransmit_timer = Some(self.wheel.schedule(now, tcb.rto, TcpTimerEvent::Retransmit(conn)));
            }

            let send_writer = writer.clone();
            Self::transmit(self.addr, eth, ip, now, conn, seq, Flags::ACK, size, move |buf| send_writer(0, buf), tcb.rx.next, tcb.rx.size);

            tcb.tx_queue.push_back(TxEntry { seq, size, writer, acked_cb: cb });
        }

        Ok(())
    }

    /// Begin an active close: send our FIN and move past ESTABLISHED/CLOSE-WAIT.
    pub fn close(&mut self, conn: FourTuple, eth: &mut Eth, ip: &Ip, now: Tick) -> Result<()> {
        let tcb = self.connections.get_mut(&conn).ok_or(crate::error::Error::Illegal)?;
        let fin_seq = tcb.tx.next;
        tcb.tx.next = tcb.tx.next.wrapping_add(1);
        tcb.state = match tcb.state {
            State::Established => State::FinWait1,
            State::CloseWait => State::LastAck,
            _ => return Err(crate::error::Error::Illegal),
        };
        Self::transmit(self.addr, eth, ip, now, conn, fin_seq, Flags::FIN | Flags::ACK, 0, |_| {}, tcb.rx.next, tcb.rx.size);
        Ok(())
    }

    /// Process one inbound segment, already stripped of its IPv4 header. `iss` is the initial
    /// sequence number to use if this segment opens a new connection, sampled from the adapter's
    /// free-running counter.
    pub fn receive_segment(&mut self, eth: &mut Eth, ip: &Ip, now: Tick, source: Ipv4Address, payload: &[u8], iss: u32) -> Result<()> {
        let packet = Packet::new_checked(payload)?;
        if !packet.verify_checksum(source, self.addr) {
            trace!("dropping tcp segment with bad checksum from {}", source);
            return Ok(());
        }

        let conn = FourTuple { remote_addr: source, remote_port: packet.source_port(), local_port: packet.destination_port() };

        if self.connections.contains_key(&conn) {
            self.handle_established(eth, ip, now, conn, &packet);
            return Ok(());
        }

        let flags = packet.flags();
        if flags.contains(Flags::SYN) && !flags.contains(Flags::ACK) {
            let listener_has_room = self.listeners.get(&conn.local_port).map(|listener| listener.len() < listener.backlog);
            match listener_has_room {
                Some(true) => {
                    self.handle_syn(eth, ip, now, conn, &packet, iss);
                    return Ok(());
                }
                Some(false) => {
                    debug!("refusing connection from {}: listen backlog full", source);
                    return Ok(());
                }
                None => {}
            }
        }

        if !flags.contains(Flags::RST) {
            warn!("no connection for segment from {}:{}, sending rst", source, packet.source_port());
            Self::send_rst_for(self.addr, eth, ip, now, conn, &packet);
        }
        Ok(())
    }

    fn handle_syn(&mut self, eth: &mut Eth, ip: &Ip, now: Tick, conn: FourTuple, packet: &Packet<&[u8]>, iss: u32) {
        let handlers = {
            let listener = self.listeners.get(&conn.local_port).expect("checked by caller");
            (listener.make_handlers)(conn)
        };

        let peer_mss = packet.mss_option().unwrap_or(DEFAULT_MSS);
        let tx_mss = peer_mss.min(self.max_segment_size);
        let retransmit_timer = self.wheel.schedule(now, INITIAL_RTO, TcpTimerEvent::Retransmit(conn));

        let tcb = Tcb {
            four_tuple: conn,
            state: State::SynRcvd,
            rx: RxWindow { size: 65535, next: packet.seq_number().wrapping_add(1) },
            tx: TxWindow { size: packet.window_size() as u32, unack: iss, next: iss.wrapping_add(1) },
            tx_queue: VecDeque::new(),
            rto: INITIAL_RTO,
            retransmit_timer: Some(retransmit_timer),
            time_wait_timer: None,
            retries: 0,
            tx_mss,
            handlers,
        };
        self.connections.insert(conn, tcb);
        self.listeners.get_mut(&conn.local_port).unwrap().pending.push_back(conn);

        Self::transmit(self.addr, eth, ip, now, conn, iss, Flags::SYN | Flags::ACK, 0, |_| {}, packet.seq_number().wrapping_add(1), 65535);
    }

    fn handle_established(&mut self, eth: &mut Eth, ip: &Ip, now: Tick, conn: FourTuple, packet: &Packet<&[u8]>) {
        let flags = packet.flags();

        if flags.contains(Flags::RST) {
            if let Some(mut tcb) = self.connections.remove(&conn) {
                if let Some(timer) = tcb.retransmit_timer.take() {
                    self.wheel.remove(timer);
                }
                (tcb.handlers.reset)();
            }
            return;
        }

        let tcb = self.connections.get_mut(&conn).expect("looked up by caller");

        if flags.contains(Flags::ACK) {
            tcb.ack_up_to(packet.ack_number());
            if tcb.tx_queue.is_empty() {
                if let Some(timer) = tcb.retransmit_timer.take() {
                    self.wheel.remove(timer);
                }
                tcb.retries = 0;
            }
        }

        match tcb.state {
            State::SynRcvd => {
                if flags.contains(Flags::ACK) && packet.ack_number() == tcb.tx.next {
                    tcb.state = State::Established;
                    if let Some(listener) = self.listeners.get_mut(&conn.local_port) {
                        listener.pending.retain(|c| *c != conn);
                        listener.accept_queue.push_back(conn);
                    }
                }
                return;
            }
            State::TimeWait => {
                Self::transmit(self.addr, eth, ip, now, conn, tcb.tx.next, Flags::ACK, 0, |_| {}, tcb.rx.next, tcb.rx.size);
                return;
            }
            _ => {}
        }

        let mut should_ack = false;
        if !packet.payload().is_empty() && packet.seq_number() == tcb.rx.next {
            (tcb.handlers.new_data)(packet.payload());
            tcb.rx.next = tcb.rx.next.wrapping_add(packet.payload().len() as u32);
            should_ack = true;
        }

        if flags.contains(Flags::FIN) && packet.seq_number().wrapping_add(packet.payload().len() as u32) == tcb.rx.next {
            tcb.rx.next = tcb.rx.next.wrapping_add(1);
            should_ack = true;
            match tcb.state {
                State::Established => {
                    (tcb.handlers.remote_close)();
                    tcb.state = State::CloseWait;
                }
                State::FinWait1 | State::FinWait2 => {
                    tcb.state = State::TimeWait;
                    let timer = self.wheel.schedule(now, TIME_WAIT, TcpTimerEvent::TimeWait(conn));
                    self.connections.get_mut(&conn).unwrap().time_wait_timer = Some(timer);
                }
                _ => {}
            }
        }

        let mut fully_closed = false;
        let tcb = self.connections.get_mut(&conn).expect("not removed above");
        match tcb.state {
            State::FinWait1 if !flags.contains(Flags::FIN) && packet.ack_number() == tcb.tx.next => {
                tcb.state = State::FinWait2;
            }
            State::LastAck if packet.ack_number() == tcb.tx.next => {
                fully_closed = true;
            }
            State::Closing if packet.ack_number() == tcb.tx.next => {
                tcb.state = State::TimeWait;
                let timer = self.wheel.schedule(now, TIME_WAIT, TcpTimerEvent::TimeWait(conn));
                self.connections.get_mut(&conn).unwrap().time_wait_timer = Some(timer);
            }
            _ => {}
        }

        if fully_closed {
            let mut tcb = self.connections.remove(&conn).unwrap();
            if let Some(timer) = tcb.retransmit_timer.take() {
                self.wheel.remove(timer);
            }
            (tcb.handlers.closed)();
            return;
        }

        if should_ack {
            let tcb = self.connections.get(&conn).expect("not removed above");
            Self::transmit(self.addr, eth, ip, now, conn, tcb.tx.next, Flags::ACK, 0, |_| {}, tcb.rx.next, tcb.rx.size);
        }
    }

    /// Retransmit timed-out segments and reap connections whose TIME-WAIT has elapsed. Call once
    /// per worker tick.
    pub fn tick(&mut self, eth: &mut Eth, ip: &Ip, now: Tick) {
        for (_, event) in self.wheel.tick(now) {
            match event {
                TcpTimerEvent::TimeWait(conn) => {
                    self.connections.remove(&conn);
                }
                TcpTimerEvent::Retransmit(conn) => self.retransmit_or_give_up(eth, ip, now, conn),
            }
        }
    }

    fn retransmit_or_give_up(&mut self, eth: &mut Eth, ip: &Ip, now: Tick, conn: FourTuple) {
        let give_up = match self.connections.get(&conn) {
            Some(tcb) => tcb.retries >= MAX_RETRIES,
            None => return,
        };
        if give_up {
            if let Some(mut tcb) = self.connections.remove(&conn) {
                warn!("giving up on {:?} after {} retries", conn, MAX_RETRIES);
                (tcb.handlers.reset)();
            }
            return;
        }

        let retransmission = {
            let tcb = self.connections.get_mut(&conn).expect("checked above");
            tcb.retries += 1;
            tcb.rto *= 2;
            tcb.retransmit_timer = Some(self.wheel.schedule(now, tcb.rto, TcpTimerEvent::Retransmit(conn)));
            tcb.tx_queue.front().map(|entry| (entry.seq, entry.size, entry.writer.clone(), tcb.rx.next, tcb.rx.size))
        };

        if let Some((seq, size, writer, rx_next, rx_size)) = retransmission {
            debug!("retransmitting seq {} for {:?}", seq, conn);
            Self::transmit(self.addr, eth, ip, now, conn, seq, Flags::ACK, size, move |buf| writer(0, buf), rx_next, rx_size);
        }
    }

    /// Build and send one TCP segment: `write_payload` fills its `payload_len` bytes of payload
    /// directly into the segment buffer `ip` ultimately allocates, so nothing here holds its own
    /// copy of the data being sent.
    #[allow(clippy::too_many_arguments)]
    fn transmit(
        local: Ipv4Address,
        eth: &mut Eth,
        ip: &Ip,
        now: Tick,
        conn: FourTuple,
        seq: u32,
        flags: Flags,
        payload_len: usize,
        write_payload: impl FnOnce(&mut [u8]) + 'static,
        ack: u32,
        window: u32,
    ) {
        let window = window.min(u16::MAX as u32) as u16;
        let remote = conn.remote_addr;
        let _ = ip.send_payload(eth, now, remote, crate::wire::ipv4::PROTOCOL_TCP, HEADER_LEN + payload_len, move |mut buf: &mut [u8]| {
            Packet::build(&mut buf, conn.local_port, conn.remote_port, seq, ack, flags, window);
            write_payload(&mut buf[HEADER_LEN..]);
            Packet::fill_checksum(&mut buf, local, remote);
        });
    }

    /// Reset a segment with no matching connection. The ack acknowledges exactly what the peer's
    /// segment claimed to carry, following the `seg.seq + seg.len + SYN?1 + FIN?1` formula (RFC
    /// 793 §3.4): a bare empty ACK acks only `seg.seq` itself, but SYN and FIN each occupy one
    /// sequence number of their own.
    fn send_rst_for(local: Ipv4Address, eth: &mut Eth, ip: &Ip, now: Tick, conn: FourTuple, packet: &Packet<&[u8]>) {
        let flags = packet.flags();
        let mut ack = packet.seq_number().wrapping_add(packet.payload().len() as u32);
        if flags.contains(Flags::SYN) {
            ack = ack.wrapping_add(1);
        }
        if flags.contains(Flags::FIN) {
            ack = ack.wrapping_add(1);
        }
        Self::transmit(local, eth, ip, now, conn, packet.ack_number(), Flags::RST | Flags::ACK, 0, |_| {}, ack, 0);
    }
}
