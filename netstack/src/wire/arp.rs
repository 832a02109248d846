//! ARP messages for the Ethernet/IPv4 pairing this stack actually speaks.
//!
//! The resolver in [`crate::layer::arp`] is generic over data-link and protocol layers, but the
//! wire format only needs to exist concretely for the one pairing a NIC driver hands us, so this
//! module hard-codes Ethernet hardware addresses and IPv4 protocol addresses rather than
//! generalizing the header layout itself.

use crate::error::{Error, Result};
use crate::wire::endian::NetOrder;
use crate::wire::{ethernet, ipv4};

pub const HEADER_LEN: usize = 28;

const HARDWARE_TYPE_ETHERNET: u16 = 1;
const PROTOCOL_TYPE_IPV4: u16 = 0x0800;

mod field {
    pub const HTYPE: core::ops::Range<usize> = 0..2;
    pub const PTYPE: core::ops::Range<usize> = 2..4;
    pub const HLEN: usize = 4;
    pub const PLEN: usize = 5;
    pub const OPER: core::ops::Range<usize> = 6..8;
    pub const SHA: core::ops::Range<usize> = 8..14;
    pub const SPA: core::ops::Range<usize> = 14..18;
    pub const THA: core::ops::Range<usize> = 18..24;
    pub const TPA: core::ops::Range<usize> = 24..28;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Request,
    Reply,
}

impl Operation {
    fn from_host(raw: u16) -> Result<Self> {
        match raw {
            1 => Ok(Operation::Request),
            2 => Ok(Operation::Reply),
            _ => Err(Error::BadSize),
        }
    }

    fn to_host(self) -> u16 {
        match self {
            Operation::Request => 1,
            Operation::Reply => 2,
        }
    }
}

#[derive(Debug)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    pub fn new_checked(buffer: T) -> Result<Self> {
        if buffer.as_ref().len() < HEADER_LEN {
            return Err(Error::BadSize);
        }
        let packet = Packet { buffer };

        let htype = NetOrder::<u16>::from_net_bytes(&packet.buffer.as_ref()[field::HTYPE]).host();
        let ptype = NetOrder::<u16>::from_net_bytes(&packet.buffer.as_ref()[field::PTYPE]).host();
        if htype != HARDWARE_TYPE_ETHERNET || ptype != PROTOCOL_TYPE_IPV4 {
            return Err(Error::Unreachable);
        }
        if packet.buffer.as_ref()[field::HLEN] as usize != ethernet::ADDR_LEN
            || packet.buffer.as_ref()[field::PLEN] as usize != ipv4::ADDR_LEN
        {
            return Err(Error::BadSize);
        }
        packet.operation()?;

        Ok(packet)
    }

    pub fn operation(&self) -> Result<Operation> {
        let raw = NetOrder::<u16>::from_net_bytes(&self.buffer.as_ref()[field::OPER]).host();
        Operation::from_host(raw)
    }

    pub fn source_hw_addr(&self) -> ethernet::Address {
        let mut addr = [0u8; ethernet::ADDR_LEN];
        addr.copy_from_slice(&self.buffer.as_ref()[field::SHA]);
        ethernet::Address(addr)
    }

    pub fn source_proto_addr(&self) -> ipv4::Address {
        let mut addr = [0u8; ipv4::ADDR_LEN];
        addr.copy_from_slice(&self.buffer.as_ref()[field::SPA]);
        ipv4::Address(addr)
    }

    pub fn target_hw_addr(&self) -> ethernet::Address {
        let mut addr = [0u8; ethernet::ADDR_LEN];
        addr.copy_from_slice(&self.buffer.as_ref()[field::THA]);
        ethernet::Address(addr)
    }

    pub fn target_proto_addr(&self) -> ipv4::Address {
        let mut addr = [0u8; ipv4::ADDR_LEN];
        addr.copy_from_slice(&self.buffer.as_ref()[field::TPA]);
        ipv4::Address(addr)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn build(
        buffer: &mut T,
        operation: Operation,
        source_hw: ethernet::Address,
        source_proto: ipv4::Address,
        target_hw: ethernet::Address,
        target_proto: ipv4::Address,
    ) {
        let bytes = buffer.as_mut();
        NetOrder::from_host(HARDWARE_TYPE_ETHERNET).write_to(&mut bytes[field::HTYPE]);
        NetOrder::from_host(PROTOCOL_TYPE_IPV4).write_to(&mut bytes[field::PTYPE]);
        bytes[field::HLEN] = ethernet::ADDR_LEN as u8;
        bytes[field::PLEN] = ipv4::ADDR_LEN as u8;
        NetOrder::from_host(operation.to_host()).write_to(&mut bytes[field::OPER]);
        bytes[field::SHA].copy_from_slice(&source_hw.0);
        bytes[field::SPA].copy_from_slice(&source_proto.0);
        bytes[field::THA].copy_from_slice(&target_hw.0);
        bytes[field::TPA].copy_from_slice(&target_proto.0);
    }
}
