//! The protocol layers: Ethernet, ARP, IPv4 and TCP.
//!
//! A received frame flows downward through `receive_*` calls, each layer stripping its own
//! header and handing the remainder to the next; an outgoing payload flows the other way through
//! `send_*`, each layer reserving space for its own header before delegating further down. Both
//! directions bottom out at the [`crate::adapter::PhysicalAdapter`] the stack was configured
//! with.

pub mod arp;
pub mod eth;
pub mod ip;
pub mod tcp;

pub use crate::error::{Error, Result};
