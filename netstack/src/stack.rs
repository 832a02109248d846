//! Per-worker composition root: owns one `Eth`/`Ip`/`Tcp` stack and drives the cooperative loop
//! contract of spec.md §5 against a caller-supplied [`PhysicalAdapter`].
//!
//! Nothing here is required to use the layers directly; `Stack` is a convenience that a worker
//! thread can own outright, matching the shape of the original's per-core `mpipe_t` instance.

use log::{debug, warn};

use crate::adapter::PhysicalAdapter;
use crate::buffer::Cursor;
use crate::layer::eth::{Eth, Received};
use crate::layer::ip::Ip;
use crate::layer::tcp::{ConnHandlers, FourTuple, Tcp};
use crate::layer::Result;
use crate::time::Tick;
use crate::wire::ethernet::{Address as EthernetAddress, HEADER_LEN as ETH_HEADER_LEN};
use crate::wire::ipv4::{Address as Ipv4Address, HEADER_LEN as IPV4_HEADER_LEN};
use crate::wire::tcp::HEADER_LEN as TCP_HEADER_LEN;

pub struct Stack {
    eth: Eth,
    ip: Ip,
    tcp: Tcp,
    now: Tick,
}

impl Stack {
    /// `max_packet_size` is the adapter's own frame size cap; it bounds both the outbound frames
    /// this stack will ever hand back to the adapter and the peer MSS TCP will honor, so a single
    /// `send` can never produce a segment the adapter would have to drop.
    pub fn new(hw_addr: EthernetAddress, ip_addr: Ipv4Address, max_packet_size: usize) -> Self {
        let eth = Eth::new(hw_addr);
        eth.set_our_proto_addr(ip_addr);
        let ip = Ip::new(ip_addr);
        let max_segment_size = max_packet_size.saturating_sub(ETH_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN).min(u16::MAX as usize) as u16;
        let tcp = Tcp::new(ip_addr, max_segment_size);
        Stack { eth, ip, tcp, now: 0 }
    }

    /// Pre-seed a binding with no expiry, as the original's instance construction does for its
    /// configured peers.
    pub fn add_static_arp_entry(&mut self, proto_addr: Ipv4Address, hw_addr: EthernetAddress) {
        self.eth.add_static_entry(proto_addr, hw_addr);
    }

    pub fn listen(&mut self, local_port: u16, backlog: usize, make_handlers: impl Fn(FourTuple) -> ConnHandlers + 'static) {
        self.tcp.listen(local_port, backlog, make_handlers);
    }

    pub fn accept(&mut self, local_port: u16) -> Option<FourTuple> {
        self.tcp.accept(local_port)
    }

    /// Whether the application may call [`Stack::send`] on `conn` right now.
    pub fn can_send(&self, conn: FourTuple) -> bool {
        self.tcp.can_send(conn)
    }

    /// Enqueue `data` for sending. `acked_cb` fires exactly once, when every byte of `data` has
    /// been acknowledged by the peer.
    pub fn send(&mut self, conn: FourTuple, data: Vec<u8>, acked_cb: impl FnOnce() + 'static) -> Result<()> {
        self.tcp.send(conn, &mut self.eth, &self.ip, self.now, data, acked_cb)
    }

    pub fn close(&mut self, conn: FourTuple) -> Result<()> {
        self.tcp.close(conn, &mut self.eth, &self.ip, self.now)
    }

    /// One iteration of the loop spec.md §5 mandates: age timers, process everything the adapter
    /// has waiting, then flush whatever became ready to send. Call this in a tight loop from the
    /// worker thread that owns `adapter`; it never blocks.
    pub fn run_once(&mut self, adapter: &mut dyn PhysicalAdapter) {
        self.now += 1;
        let now = self.now;
        self.eth.tick(now);
        self.tcp.tick(&mut self.eth, &self.ip, now);

        // Sampled once per call rather than once per frame: `adapter.receive` already holds the
        // only `&mut` borrow of `adapter` this loop needs, and every frame in one batch is close
        // enough in time that reusing one sample does not change which ISS a connection gets.
        let iss = adapter.get_current_tcp_seq();
        let eth = &mut self.eth;
        let ip = &self.ip;
        let tcp = &mut self.tcp;
        adapter.receive(&mut |cursor: Cursor| {
            Self::process_frame(eth, ip, tcp, now, cursor.as_slice(), iss);
        });

        while let Some(frame) = self.eth.poll_outbox() {
            if frame.len() > adapter.max_packet_size() {
                warn!("dropping outbound frame of {} bytes, adapter caps at {}", frame.len(), adapter.max_packet_size());
                continue;
            }
            adapter.send_packet(frame.len(), &mut move |mut buf| buf.write(&frame));
        }
    }

    fn process_frame(eth: &mut Eth, ip: &Ip, tcp: &mut Tcp, now: Tick, frame: &[u8], iss: u32) {
        let datagram = match eth.receive_frame(frame, now) {
            Ok(Received::Ipv4(datagram)) => datagram,
            Ok(_) => return,
            Err(err) => {
                warn!("dropping malformed ethernet frame: {}", err);
                return;
            }
        };

        let datagram = match ip.receive_datagram(datagram) {
            Ok(Some(datagram)) => datagram,
            Ok(None) => return,
            Err(err) => {
                warn!("dropping malformed ipv4 datagram: {}", err);
                return;
            }
        };

        if let Err(err) = tcp.receive_segment(eth, ip, now, datagram.source, datagram.payload, iss) {
            debug!("dropping tcp segment from {}: {}", datagram.source, err);
        }
    }
}

/// Derive an initial sequence number from a free-running cycle counter, following the classical
/// ISS generation style: the counter advances roughly every 4 microseconds, so dividing by
/// `cycles_per_tick` yields a value that wraps through the full 32-bit space over hours, not
/// seconds.
pub fn iss_from_cycles(cycles: u64, cycles_per_tick: u64) -> u32 {
    (cycles / cycles_per_tick.max(1)) as u32
}
