//! IPv4 datagram reception and construction.
//!
//! This layer has no sub-layers of its own to own; it hands resolved datagrams down to
//! [`crate::layer::eth::Eth`] for framing and ARP resolution, and decoded payloads up to
//! [`crate::layer::tcp`] for segment processing. Only TCP is dispatched on receive, matching the
//! scope of the transport this stack carries.

use std::cell::Cell;

use log::trace;

use crate::layer::eth::Eth;
use crate::layer::{Error, Result};
use crate::time::Tick;
use crate::wire::ipv4::{Address, Packet, HEADER_LEN, PROTOCOL_TCP};

/// A received datagram that passed validation and was addressed to us.
///
/// `payload` borrows straight into the buffer [`Ip::receive_datagram`] was given rather than
/// copying it out.
pub struct Datagram<'a> {
    pub source: Address,
    pub destination: Address,
    pub protocol: u8,
    pub payload: &'a [u8],
}

pub struct Ip {
    addr: Address,
    next_id: Cell<u16>,
}

impl Ip {
    pub fn new(addr: Address) -> Self {
        Ip { addr, next_id: Cell::new(1) }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    /// Parse and validate a datagram. Returns `Ok(None)` for a well-formed datagram not addressed
    /// to us or not carrying TCP, which the caller should silently drop rather than treat as an
    /// error.
    pub fn receive_datagram<'a>(&self, data: &'a [u8]) -> Result<Option<Datagram<'a>>> {
        let packet = Packet::new_checked(data)?;

        if packet.destination() != self.addr {
            trace!("ignoring datagram addressed to {}", packet.destination());
            return Ok(None);
        }
        if packet.protocol() != PROTOCOL_TCP {
            return Ok(None);
        }

        Ok(Some(Datagram {
            source: packet.source(),
            destination: packet.destination(),
            protocol: packet.protocol(),
            // Sliced from `data` itself rather than `packet.payload()`, which would tie the
            // lifetime to this function's local borrow of `packet` instead of to `data`.
            payload: &data[HEADER_LEN..],
        }))
    }

    /// Build a datagram carrying `payload_len` bytes and hand it to `eth` for ARP resolution and
    /// framing. `write_payload` fills the datagram's payload region in place, directly inside the
    /// frame buffer `eth` ultimately allocates, so the payload is written exactly once.
    pub fn send_payload(
        &self,
        eth: &mut Eth,
        now: Tick,
        destination: Address,
        protocol: u8,
        payload_len: usize,
        write_payload: impl FnOnce(&mut [u8]) + 'static,
    ) -> Result<()> {
        let total_len = HEADER_LEN + payload_len;
        if total_len > u16::MAX as usize {
            return Err(Error::BadSize);
        }

        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));
        let source = self.addr;

        eth.send_ip_payload(destination, now, total_len, move |mut datagram: &mut [u8]| {
            Packet::build(&mut datagram, id, 64, protocol, source, destination, total_len as u16);
            write_payload(&mut datagram[HEADER_LEN..]);
            Packet::fill_checksum(&mut datagram);
        });
        Ok(())
    }
}
