//! Wire formats: byte-slice-backed packet views for every header this stack parses or builds.
//!
//! Each `*Packet<T>` wraps an underlying buffer (`T: AsRef<[u8]>`, plus `AsMut<[u8]>` for the
//! setters) and exposes typed accessors over the header fields at their fixed byte offsets. None
//! of these types copy; they're views over whatever byte slice or `Vec<u8>` the caller already
//! owns.

pub mod arp;
pub mod checksum;
pub mod endian;
pub mod ethernet;
pub mod ipv4;
pub mod tcp;

pub use checksum::{Checksum, PartialSum};
pub use endian::NetOrder;
