//! Command-line configuration for the echo server, parsed the way `ethox-iperf`'s own
//! `config.rs` parses its arguments: a `StructOpt`-derived struct, no hand-rolled `getopt` loop.

use std::fmt;

use structopt::StructOpt;

use netstack::wire::ethernet::Address as EthernetAddress;
use netstack::wire::ipv4::Address as Ipv4Address;

/// One statically configured ARP binding, pre-seeded at startup with no expiry.
#[derive(Clone, Copy, Debug)]
pub struct ArpEntry {
    pub proto_addr: Ipv4Address,
    pub hw_addr: EthernetAddress,
}

#[derive(Debug)]
pub struct ArpEntryParseError(String);

impl fmt::Display for ArpEntryParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid static arp entry {:?}, expected addr=mac", self.0)
    }
}

impl std::error::Error for ArpEntryParseError {}

fn parse_arp_entry(s: &str) -> Result<ArpEntry, ArpEntryParseError> {
    let (addr, mac) = s.split_once('=').ok_or_else(|| ArpEntryParseError(s.to_owned()))?;
    let proto_addr = addr.parse().map_err(|_| ArpEntryParseError(s.to_owned()))?;
    let hw_addr = mac.parse().map_err(|_| ArpEntryParseError(s.to_owned()))?;
    Ok(ArpEntry { proto_addr, hw_addr })
}

#[derive(StructOpt)]
#[structopt(name = "netstack-echo", about = "Echo server over a Linux TAP device")]
pub struct Config {
    /// Name of the TAP device to open (created if it does not already exist).
    pub tap: String,

    /// IPv4 address this worker answers on.
    pub addr: Ipv4Address,

    /// TCP port the echo service listens on.
    #[structopt(short, long, default_value = "7")]
    pub port: u16,

    /// Number of worker threads, one ingress queue each.
    #[structopt(short, long, default_value = "1")]
    pub workers: usize,

    /// Index of the first dataplane core workers are pinned to; worker `i` is pinned to
    /// `start_core + i`.
    #[structopt(long, default_value = "0")]
    pub start_core: usize,

    /// Static ARP entries, `addr=mac`, repeatable. Seeded with no expiry timer.
    #[structopt(long = "static-arp", number_of_values = 1, parse(try_from_str = parse_arp_entry))]
    pub static_arp: Vec<ArpEntry>,
}

impl Config {
    pub fn from_args() -> Self {
        StructOpt::from_args()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_valid_static_arp_entry() {
        let entry = parse_arp_entry("10.0.0.1=aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(entry.proto_addr, Ipv4Address([10, 0, 0, 1]));
        assert_eq!(entry.hw_addr, EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]));
    }

    #[test]
    fn rejects_an_entry_missing_the_separator() {
        assert!(parse_arp_entry("10.0.0.1aabbccddeeff").is_err());
    }
}
