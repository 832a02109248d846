//! TCP segment header parsing and construction.

use core::fmt;

use crate::error::{Error, Result};
use crate::wire::checksum::PartialSum;
use crate::wire::endian::NetOrder;
use crate::wire::ipv4;

pub const HEADER_LEN: usize = 20;

mod field {
    pub const SRC_PORT: core::ops::Range<usize> = 0..2;
    pub const DST_PORT: core::ops::Range<usize> = 2..4;
    pub const SEQ_NUM: core::ops::Range<usize> = 4..8;
    pub const ACK_NUM: core::ops::Range<usize> = 8..12;
    pub const DATA_OFFSET: usize = 12;
    pub const FLAGS: usize = 13;
    pub const WINDOW: core::ops::Range<usize> = 14..16;
    pub const CHECKSUM: core::ops::Range<usize> = 16..18;
    pub const URGENT: core::ops::Range<usize> = 18..20;
}

/// The six control bits of a TCP header, packed the same way the wire does.
///
/// Hand-rolled rather than pulling in the `bitflags` crate for one six-bit field.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const EMPTY: Flags = Flags(0);
    pub const FIN: Flags = Flags(0b0000_0001);
    pub const SYN: Flags = Flags(0b0000_0010);
    pub const RST: Flags = Flags(0b0000_0100);
    pub const PSH: Flags = Flags(0b0000_1000);
    pub const ACK: Flags = Flags(0b0001_0000);
    pub const URG: Flags = Flags(0b0010_0000);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Flags {
        Flags(bits)
    }
}

impl core::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMED: [(Flags, &str); 6] = [
            (Flags::FIN, "FIN"),
            (Flags::SYN, "SYN"),
            (Flags::RST, "RST"),
            (Flags::PSH, "PSH"),
            (Flags::ACK, "ACK"),
            (Flags::URG, "URG"),
        ];
        let mut first = true;
        for (flag, name) in NAMED {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("(none)")?;
        }
        Ok(())
    }
}

/// A TCP segment header view, backed by `buffer`.
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    pub fn new_checked(buffer: T) -> Result<Self> {
        if buffer.as_ref().len() < HEADER_LEN {
            return Err(Error::BadSize);
        }
        let packet = Packet { buffer };
        let header_len = packet.header_len();
        if header_len < HEADER_LEN || header_len > packet.buffer.as_ref().len() {
            return Err(Error::BadSize);
        }
        Ok(packet)
    }

    fn header_len(&self) -> usize {
        ((self.buffer.as_ref()[field::DATA_OFFSET] >> 4) as usize) * 4
    }

    pub fn source_port(&self) -> u16 {
        NetOrder::<u16>::from_net_bytes(&self.buffer.as_ref()[field::SRC_PORT]).host()
    }

    pub fn destination_port(&self) -> u16 {
        NetOrder::<u16>::from_net_bytes(&self.buffer.as_ref()[field::DST_PORT]).host()
    }

    pub fn seq_number(&self) -> u32 {
        NetOrder::<u32>::from_net_bytes(&self.buffer.as_ref()[field::SEQ_NUM]).host()
    }

    pub fn ack_number(&self) -> u32 {
        NetOrder::<u32>::from_net_bytes(&self.buffer.as_ref()[field::ACK_NUM]).host()
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits(self.buffer.as_ref()[field::FLAGS] & 0b0011_1111)
    }

    pub fn window_size(&self) -> u16 {
        NetOrder::<u16>::from_net_bytes(&self.buffer.as_ref()[field::WINDOW]).host()
    }

    pub fn checksum(&self) -> u16 {
        NetOrder::<u16>::from_net_bytes(&self.buffer.as_ref()[field::CHECKSUM]).host()
    }

    /// The MSS option, if the segment carries one (only meaningful on a SYN).
    pub fn mss_option(&self) -> Option<u16> {
        let bytes = self.buffer.as_ref();
        let mut options = &bytes[HEADER_LEN..self.header_len()];
        while !options.is_empty() {
            match options[0] {
                0 => break,
                1 => options = &options[1..],
                2 if options.len() >= 4 => {
                    let mss = NetOrder::<u16>::from_net_bytes(&options[2..4]).host();
                    return Some(mss);
                }
                _ if options.len() >= 2 => {
                    let len = options[1].max(2) as usize;
                    if len > options.len() {
                        break;
                    }
                    options = &options[len..];
                }
                _ => break,
            }
        }
        None
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[self.header_len()..]
    }

    /// Validate the checksum against the IPv4 pseudo-header it arrived with.
    pub fn verify_checksum(&self, source: ipv4::Address, destination: ipv4::Address) -> bool {
        let bytes = self.buffer.as_ref();
        let pseudo = pseudo_header_sum(source, destination, bytes.len() as u16);
        pseudo.append(PartialSum::of(bytes)).finish().host() == 0
    }
}

pub fn pseudo_header_sum(source: ipv4::Address, destination: ipv4::Address, tcp_len: u16) -> PartialSum {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&source.0);
    pseudo[4..8].copy_from_slice(&destination.0);
    pseudo[9] = ipv4::PROTOCOL_TCP;
    NetOrder::from_host(tcp_len).write_to(&mut pseudo[10..12]);
    PartialSum::of(&pseudo)
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        buffer: &mut T,
        source_port: u16,
        destination_port: u16,
        seq_number: u32,
        ack_number: u32,
        flags: Flags,
        window_size: u16,
    ) {
        let bytes = buffer.as_mut();
        NetOrder::from_host(source_port).write_to(&mut bytes[field::SRC_PORT]);
        NetOrder::from_host(destination_port).write_to(&mut bytes[field::DST_PORT]);
        NetOrder::from_host(seq_number).write_to(&mut bytes[field::SEQ_NUM]);
        NetOrder::from_host(ack_number).write_to(&mut bytes[field::ACK_NUM]);
        bytes[field::DATA_OFFSET] = ((HEADER_LEN / 4) as u8) << 4;
        bytes[field::FLAGS] = flags.bits();
        NetOrder::from_host(window_size).write_to(&mut bytes[field::WINDOW]);
        NetOrder::from_host(0u16).write_to(&mut bytes[field::CHECKSUM]);
        NetOrder::from_host(0u16).write_to(&mut bytes[field::URGENT]);
    }

    pub fn fill_checksum(buffer: &mut T, source: ipv4::Address, destination: ipv4::Address) {
        NetOrder::from_host(0u16).write_to(&mut buffer.as_mut()[field::CHECKSUM]);
        let bytes = buffer.as_ref();
        let pseudo = pseudo_header_sum(source, destination, bytes.len() as u16);
        let checksum = pseudo.append(PartialSum::of(bytes)).finish();
        checksum.write_to(&mut buffer.as_mut()[field::CHECKSUM]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_checksums_a_segment() {
        let mut raw = [0u8; HEADER_LEN + 5];
        Packet::build(&mut raw, 1234, 80, 100, 0, Flags::SYN, 4096);
        raw[HEADER_LEN..].copy_from_slice(b"hello");
        let source = ipv4::Address([10, 0, 0, 1]);
        let destination = ipv4::Address([10, 0, 0, 2]);
        Packet::fill_checksum(&mut raw, source, destination);

        let packet = Packet::new_checked(&raw[..]).unwrap();
        assert_eq!(packet.source_port(), 1234);
        assert_eq!(packet.destination_port(), 80);
        assert_eq!(packet.flags(), Flags::SYN);
        assert_eq!(packet.payload(), b"hello");
        assert!(packet.verify_checksum(source, destination));
        assert!(!packet.verify_checksum(destination, source));
    }

    #[test]
    fn flags_combine_with_bitor() {
        let both = Flags::SYN | Flags::ACK;
        assert!(both.contains(Flags::SYN));
        assert!(both.contains(Flags::ACK));
        assert!(!both.contains(Flags::FIN));
    }

    #[test]
    fn parses_mss_option() {
        let mut raw = [0u8; HEADER_LEN + 4];
        Packet::build(&mut raw, 1, 2, 0, 0, Flags::SYN, 0);
        raw[field::DATA_OFFSET] = (((HEADER_LEN + 4) / 4) as u8) << 4;
        raw[HEADER_LEN] = 2;
        raw[HEADER_LEN + 1] = 4;
        NetOrder::from_host(1460u16).write_to(&mut raw[HEADER_LEN + 2..HEADER_LEN + 4]);

        let packet = Packet::new_checked(&raw[..]).unwrap();
        assert_eq!(packet.mss_option(), Some(1460));
    }
}
