//! The error type shared by every layer.
//!
//! Kept as a small, explicit enum rather than a boxed trait object: every variant is something a
//! caller is expected to branch on (retry later vs. drop the packet vs. a programmer mistake),
//! and the wire layers live on data paths where allocating an error is not an option.

use core::fmt;

/// Something went wrong while parsing, building or routing a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The caller asked for something the protocol forbids, independent of any wire data
    /// (for example, sending on a connection that is not in a state that permits it).
    Illegal,
    /// A header or payload had an inconsistent or out-of-range length field.
    BadSize,
    /// The destination is valid wire data but this stack has no route or handler for it.
    Unreachable,
    /// A buffer operation asked for more bytes than are available.
    Exhausted,
    /// The packet was recognized but intentionally not acted on (e.g. not addressed to us).
    Dropped,
    /// The remote peer reset the connection.
    Reset,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Error::Illegal => "operation not permitted in the current state",
            Error::BadSize => "inconsistent length field",
            Error::Unreachable => "no route or handler for this destination",
            Error::Exhausted => "buffer does not hold enough bytes",
            Error::Dropped => "packet intentionally not processed",
            Error::Reset => "connection reset by peer",
        };
        f.write_str(message)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
