//! IPv4 header parsing and construction.
//!
//! This stack never fragments or reassembles; [`Packet::new_checked`] rejects anything that
//! needs it (see the `Unreachable` case below), matching the scope of the transport this runs
//! on top of.

use core::fmt;

use crate::error::{Error, Result};
use crate::wire::checksum::Checksum;
use crate::wire::endian::NetOrder;

pub const ADDR_LEN: usize = 4;
pub const HEADER_LEN: usize = 20;

/// TCP's protocol number in the IPv4 header.
pub const PROTOCOL_TCP: u8 = 6;

const VERSION_IHL: usize = 0;
const TOTAL_LEN: core::ops::Range<usize> = 2..4;
const IDENTIFICATION: core::ops::Range<usize> = 4..6;
const FLAGS_FRAGMENT: core::ops::Range<usize> = 6..8;
const TTL: usize = 8;
const PROTOCOL: usize = 9;
const CHECKSUM: core::ops::Range<usize> = 10..12;
const SOURCE: core::ops::Range<usize> = 12..16;
const DESTINATION: core::ops::Range<usize> = 16..20;

const FLAG_DONT_FRAGMENT: u16 = 0x4000;
const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;

/// A 4-byte IPv4 address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; ADDR_LEN]);

impl Address {
    pub const UNSPECIFIED: Address = Address([0, 0, 0, 0]);
    pub const BROADCAST: Address = Address([255, 255, 255, 255]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Returned when parsing a dotted-quad string fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressParseError;

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid ipv4 address, expected a.b.c.d")
    }
}

impl std::error::Error for AddressParseError {}

impl core::str::FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let mut octets = [0u8; ADDR_LEN];
        let mut parts = s.split('.');
        for octet in octets.iter_mut() {
            *octet = parts.next().ok_or(AddressParseError)?.parse().map_err(|_| AddressParseError)?;
        }
        if parts.next().is_some() {
            return Err(AddressParseError);
        }
        Ok(Address(octets))
    }
}

/// A view over an IPv4 header, backed by `buffer`.
#[derive(Debug)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Validate version, header length, absence of options and fragmentation, and the checksum.
    /// `total_len` in the header must equal the whole buffer, since this stack has no notion of
    /// trailing padding.
    pub fn new_checked(buffer: T) -> Result<Self> {
        if buffer.as_ref().len() < HEADER_LEN {
            return Err(Error::BadSize);
        }
        let packet = Packet { buffer };

        let version_ihl = packet.buffer.as_ref()[VERSION_IHL];
        if version_ihl >> 4 != 4 {
            return Err(Error::BadSize);
        }
        if version_ihl & 0x0f != 5 {
            // Options are out of scope; a non-minimal IHL would desync every fixed field offset.
            return Err(Error::Unreachable);
        }
        if packet.total_len() as usize != packet.buffer.as_ref().len() {
            return Err(Error::BadSize);
        }

        let flags_fragment = NetOrder::<u16>::from_net_bytes(&packet.buffer.as_ref()[FLAGS_FRAGMENT]).host();
        if flags_fragment & FLAG_MORE_FRAGMENTS != 0 || flags_fragment & FRAGMENT_OFFSET_MASK != 0 {
            return Err(Error::Unreachable);
        }

        if !Checksum::is_valid(&packet.buffer.as_ref()[..HEADER_LEN]) {
            return Err(Error::BadSize);
        }

        Ok(packet)
    }

    pub fn total_len(&self) -> u16 {
        NetOrder::<u16>::from_net_bytes(&self.buffer.as_ref()[TOTAL_LEN]).host()
    }

    pub fn identification(&self) -> u16 {
        NetOrder::<u16>::from_net_bytes(&self.buffer.as_ref()[IDENTIFICATION]).host()
    }

    pub fn ttl(&self) -> u8 {
        self.buffer.as_ref()[TTL]
    }

    pub fn protocol(&self) -> u8 {
        self.buffer.as_ref()[PROTOCOL]
    }

    pub fn source(&self) -> Address {
        let mut addr = [0u8; ADDR_LEN];
        addr.copy_from_slice(&self.buffer.as_ref()[SOURCE]);
        Address(addr)
    }

    pub fn destination(&self) -> Address {
        let mut addr = [0u8; ADDR_LEN];
        addr.copy_from_slice(&self.buffer.as_ref()[DESTINATION]);
        Address(addr)
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[HEADER_LEN..]
    }

    /// The pseudo-header sum TCP folds into its own checksum (RFC 793 §3.1).
    pub fn pseudo_header_sum(&self, protocol: u8, tcp_len: u16) -> crate::wire::PartialSum {
        let mut pseudo = [0u8; 12];
        pseudo[0..4].copy_from_slice(&self.source().0);
        pseudo[4..8].copy_from_slice(&self.destination().0);
        pseudo[9] = protocol;
        NetOrder::from_host(tcp_len).write_to(&mut pseudo[10..12]);
        crate::wire::PartialSum::of(&pseudo)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Fill in every field except the checksum, which [`Packet::fill_checksum`] computes once
    /// the rest of the header (and any options, were they supported) is in place.
    pub fn build(
        buffer: &mut T,
        identification: u16,
        ttl: u8,
        protocol: u8,
        source: Address,
        destination: Address,
        total_len: u16,
    ) {
        let bytes = buffer.as_mut();
        bytes[VERSION_IHL] = (4 << 4) | 5;
        bytes[1] = 0; // DSCP/ECN: unused.
        NetOrder::from_host(total_len).write_to(&mut bytes[TOTAL_LEN]);
        NetOrder::from_host(identification).write_to(&mut bytes[IDENTIFICATION]);
        // This stack never fragments outgoing datagrams, so every one it builds asserts DF
        // itself rather than leaving fragmentation up to whatever sits downstream on the wire.
        NetOrder::from_host(FLAG_DONT_FRAGMENT).write_to(&mut bytes[FLAGS_FRAGMENT]);
        bytes[TTL] = ttl;
        bytes[PROTOCOL] = protocol;
        NetOrder::from_host(0u16).write_to(&mut bytes[CHECKSUM]);
        bytes[SOURCE].copy_from_slice(&source.0);
        bytes[DESTINATION].copy_from_slice(&destination.0);
    }

    pub fn fill_checksum(buffer: &mut T) {
        NetOrder::from_host(0u16).write_to(&mut buffer.as_mut()[CHECKSUM]);
        let checksum = Checksum::of(&buffer.as_ref()[..HEADER_LEN]);
        checksum.write_to(&mut buffer.as_mut()[CHECKSUM]);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut()[HEADER_LEN..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::str::FromStr;

    #[test]
    fn parses_a_dotted_quad() {
        assert_eq!(Address::from_str("10.0.0.1").unwrap(), Address([10, 0, 0, 1]));
        assert!(Address::from_str("10.0.0").is_err());
        assert!(Address::from_str("10.0.0.1.2").is_err());
        assert!(Address::from_str("10.0.0.256").is_err());
    }

    #[test]
    fn builds_and_validates_a_header() {
        let mut raw = [0u8; HEADER_LEN + 4];
        let total_len = raw.len() as u16;
        Packet::build(
            &mut raw,
            0x1234,
            64,
            PROTOCOL_TCP,
            Address([10, 0, 0, 1]),
            Address([10, 0, 0, 2]),
            total_len,
        );
        Packet::fill_checksum(&mut raw);

        let packet = Packet::new_checked(&raw[..]).unwrap();
        assert_eq!(packet.protocol(), PROTOCOL_TCP);
        assert_eq!(packet.source(), Address([10, 0, 0, 1]));
        assert_eq!(packet.destination(), Address([10, 0, 0, 2]));
    }

    #[test]
    fn protocol_field_actually_lands_in_the_header() {
        // Regression guard: an earlier draft of this header writer used a no-op expression
        // (`hdr - protocol = protocol` instead of `hdr->protocol = protocol`) and left this byte
        // zeroed. Every datagram this stack builds must carry the real protocol number.
        let mut raw = [0u8; HEADER_LEN];
        Packet::build(&mut raw, 1, 64, PROTOCOL_TCP, Address::UNSPECIFIED, Address::UNSPECIFIED, HEADER_LEN as u16);
        assert_eq!(raw[PROTOCOL], PROTOCOL_TCP);
    }

    #[test]
    fn built_datagrams_carry_the_df_flag() {
        let mut raw = [0u8; HEADER_LEN];
        Packet::build(&mut raw, 1, 64, PROTOCOL_TCP, Address::UNSPECIFIED, Address::UNSPECIFIED, HEADER_LEN as u16);
        let flags_fragment = NetOrder::<u16>::from_net_bytes(&raw[FLAGS_FRAGMENT]).host();
        assert_eq!(flags_fragment, FLAG_DONT_FRAGMENT);
        Packet::fill_checksum(&mut raw);
        assert!(Packet::new_checked(&raw[..]).is_ok(), "DF alone, with no MF or offset, is not a fragmented datagram");
    }

    #[test]
    fn rejects_fragmented_datagrams() {
        let mut raw = [0u8; HEADER_LEN];
        Packet::build(&mut raw, 1, 64, PROTOCOL_TCP, Address::UNSPECIFIED, Address::UNSPECIFIED, HEADER_LEN as u16);
        NetOrder::from_host(FLAG_MORE_FRAGMENTS).write_to(&mut raw[FLAGS_FRAGMENT]);
        Packet::fill_checksum(&mut raw);
        assert_eq!(Packet::new_checked(&raw[..]).unwrap_err(), Error::Unreachable);
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut raw = [0u8; HEADER_LEN];
        Packet::build(&mut raw, 1, 64, PROTOCOL_TCP, Address::UNSPECIFIED, Address::UNSPECIFIED, HEADER_LEN as u16);
        // Deliberately leave the checksum at zero rather than filling it in.
        assert_eq!(Packet::new_checked(&raw[..]).unwrap_err(), Error::BadSize);
    }
}
