//! Ethernet framing and ARP resolution for outgoing IPv4 traffic.
//!
//! `Eth` owns the [`arp::Resolver`] the way the original driver's ethernet layer owns its ARP
//! sub-object; IPv4 sits above it and never touches ARP directly, it just asks `Eth` to resolve a
//! destination and hand it a payload-writing closure to frame for sending.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use log::{debug, trace};

use crate::layer::arp as arp_layer;
use crate::layer::Result;
use crate::time::Tick;
use crate::wire::arp as arp_wire;
use crate::wire::ethernet::{Address, EtherType, Packet as EthPacket, HEADER_LEN};
use crate::wire::ipv4::Address as Ipv4Address;

/// What a received frame turned out to contain, once `Eth` has stripped its own header and
/// handled anything (ARP) it owns end to end.
///
/// `Ipv4` borrows straight into the frame the caller passed to [`Eth::receive_frame`] rather than
/// copying the payload out; it must be consumed before that frame goes away.
pub enum Received<'a> {
    /// An IPv4 datagram for a layer above to parse.
    Ipv4(&'a [u8]),
    /// Handled internally (an ARP request we replied to, or a reply that updated the cache).
    Handled,
    /// Not addressed to us, or a frame type we don't speak.
    Ignored,
}

pub struct Eth {
    addr: Address,
    arp: arp_layer::Resolver<Address, Ipv4Address>,
    /// The IP layer's configured address, needed only to answer ARP requests for "who has this
    /// address"; threaded in from whoever configures the IP layer rather than duplicated there.
    our_proto_addr: Cell<Ipv4Address>,
    /// Fully-framed outgoing Ethernet frames, ready for the worker loop to hand to the adapter.
    outbox: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

impl Eth {
    pub fn new(addr: Address) -> Self {
        Eth {
            addr,
            arp: arp_layer::Resolver::new(),
            our_proto_addr: Cell::new(Ipv4Address::UNSPECIFIED),
            outbox: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn set_our_proto_addr(&self, addr: Ipv4Address) {
        self.our_proto_addr.set(addr);
    }

    /// Pre-seed an ARP binding configured at startup rather than learned from the wire.
    pub fn add_static_entry(&mut self, proto_addr: Ipv4Address, hw_addr: Address) {
        self.arp.insert_static(proto_addr, hw_addr);
    }

    /// Age out ARP cache entries and time out unanswered requests. Call once per worker tick.
    pub fn tick(&mut self, now: Tick) {
        self.arp.tick(now);
    }

    /// Pop the next fully-framed outgoing frame, if any.
    pub fn poll_outbox(&mut self) -> Option<Vec<u8>> {
        self.outbox.borrow_mut().pop_front()
    }

    pub fn receive_frame<'a>(&mut self, frame: &'a [u8], now: Tick) -> Result<Received<'a>> {
        let packet = EthPacket::new_checked(frame)?;
        if packet.destination() != self.addr && !packet.destination().is_broadcast() {
            return Ok(Received::Ignored);
        }

        match packet.ethertype() {
            EtherType::Arp => {
                self.receive_arp(packet.payload(), now)?;
                Ok(Received::Handled)
            }
            // `packet.payload()` would tie the slice's lifetime to this function's local
            // borrow of `packet` rather than to `frame` itself; slicing `frame` directly keeps
            // it valid for as long as the caller's own copy does.
            EtherType::Ipv4 => Ok(Received::Ipv4(&frame[HEADER_LEN..])),
            EtherType::Unknown(other) => {
                trace!("ignoring frame with unknown ethertype {:#06x}", other);
                Ok(Received::Ignored)
            }
        }
    }

    fn receive_arp(&mut self, payload: &[u8], now: Tick) -> Result<()> {
        let packet = arp_wire::Packet::new_checked(payload)?;
        let message = arp_layer::Message {
            operation: match packet.operation()? {
                arp_wire::Operation::Request => arp_layer::Operation::Request,
                arp_wire::Operation::Reply => arp_layer::Operation::Reply,
            },
            source_hw_addr: packet.source_hw_addr(),
            source_proto_addr: packet.source_proto_addr(),
            target_hw_addr: packet.target_hw_addr(),
            target_proto_addr: packet.target_proto_addr(),
        };

        if let Some((requester_hw, requester_proto)) = self.arp.receive_message(&message, self.our_proto_addr(), now) {
            debug!("answering arp request from {}", requester_proto);
            self.queue_arp_reply(requester_hw, requester_proto);
        }
        Ok(())
    }

    fn our_proto_addr(&self) -> Ipv4Address {
        self.our_proto_addr.get()
    }

    fn queue_arp_reply(&self, target_hw: Address, target_proto: Ipv4Address) {
        let mut frame = vec![0u8; HEADER_LEN + arp_wire::HEADER_LEN];
        {
            let mut eth_header = EthPacket::new_checked(&mut frame[..]).expect("buffer sized for the header");
            eth_header.set_destination(target_hw);
            eth_header.set_source(self.addr);
            eth_header.set_ethertype(EtherType::Arp);
        }
        let mut arp_packet = &mut frame[HEADER_LEN..];
        arp_wire::Packet::build(
            &mut arp_packet,
            arp_wire::Operation::Reply,
            self.addr,
            self.our_proto_addr(),
            target_hw,
            target_proto,
        );
        self.outbox.borrow_mut().push_back(frame);
    }

    /// Resolve `dest` and, once a hardware address is known, frame a datagram of `datagram_len`
    /// bytes for sending, handing `write_datagram` the frame's payload region to fill in place.
    /// If resolution fails, the datagram is dropped and `write_datagram` never runs.
    pub fn send_ip_payload(&mut self, dest: Ipv4Address, now: Tick, datagram_len: usize, write_datagram: impl FnOnce(&mut [u8]) + 'static) {
        if let Some(hw) = self.arp.cached(dest) {
            self.frame_and_queue(hw, datagram_len, write_datagram);
            return;
        }

        let outbox = self.outbox.clone();
        let addr = self.addr;
        let on_resolved = move |hw: Option<Address>| match hw {
            Some(hw) => {
                let mut frame = vec![0u8; HEADER_LEN + datagram_len];
                {
                    let mut header = EthPacket::new_checked(&mut frame[..]).expect("buffer sized for the header");
                    header.set_destination(hw);
                    header.set_source(addr);
                    header.set_ethertype(EtherType::Ipv4);
                }
                write_datagram(&mut frame[HEADER_LEN..]);
                outbox.borrow_mut().push_back(frame);
            }
            None => debug!("dropping datagram, arp resolution failed"),
        };

        let request_outbox = self.outbox.clone();
        let our_addr = self.addr;
        let our_proto = self.our_proto_addr();
        self.arp.resolve(dest, now, on_resolved, move || {
            let mut frame = vec![0u8; HEADER_LEN + arp_wire::HEADER_LEN];
            {
                let mut header = EthPacket::new_checked(&mut frame[..]).expect("buffer sized for the header");
                header.set_destination(Address::BROADCAST);
                header.set_source(our_addr);
                header.set_ethertype(EtherType::Arp);
            }
            let mut arp_packet = &mut frame[HEADER_LEN..];
            arp_wire::Packet::build(&mut arp_packet, arp_wire::Operation::Request, our_addr, our_proto, Address::BROADCAST, dest);
            request_outbox.borrow_mut().push_back(frame);
        });
    }

    fn frame_and_queue(&mut self, hw: Address, datagram_len: usize, write_datagram: impl FnOnce(&mut [u8])) {
        let mut frame = vec![0u8; HEADER_LEN + datagram_len];
        {
            let mut header = EthPacket::new_checked(&mut frame[..]).expect("buffer sized for the header");
            header.set_destination(hw);
            header.set_source(self.addr);
            header.set_ethertype(EtherType::Ipv4);
        }
        write_datagram(&mut frame[HEADER_LEN..]);
        self.outbox.borrow_mut().push_back(frame);
    }
}
