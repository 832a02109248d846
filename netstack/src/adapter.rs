//! The boundary between this stack and a physical (or virtual) NIC.
//!
//! Nothing in `netstack` talks to hardware, a TAP device, or `libpcap` directly; everything that
//! needs bytes on or off the wire goes through a [`PhysicalAdapter`] supplied by the caller. This
//! keeps driver code (and its `unsafe`, ioctls, and OS-specific plumbing) entirely outside the
//! stack, in whatever binary embeds it.
//!
//! Frames cross this boundary as [`Cursor`]/[`CursorMut`], not owned `Vec<u8>`: an adapter backed
//! by a ring buffer or a `recvmmsg` batch can hand over a view of its own memory without copying
//! it into a throwaway allocation first, and a caller that only needs to parse a header never
//! pays for one either.

use crate::buffer::{Cursor, CursorMut};
use crate::wire::ethernet::Address;

/// A source and sink of raw Ethernet frames for one worker.
///
/// Implementations are expected to be cheap to poll: [`PhysicalAdapter::receive`] is called once
/// per iteration of the worker's run loop and must not block.
pub trait PhysicalAdapter {
    /// This adapter's own hardware address.
    fn addr(&self) -> Address;

    /// The largest frame, header included, this adapter can send or receive.
    fn max_packet_size(&self) -> usize;

    /// Deliver every frame currently available, oldest first, to `handler`, as a cursor over
    /// whatever buffer the adapter is holding the frame in.
    fn receive(&mut self, handler: &mut dyn FnMut(Cursor));

    /// Send one frame of exactly `size` bytes. `writer` fills the frame in place through a
    /// cursor over the adapter's own destination buffer; it may be called zero or one times
    /// depending on whether the adapter had room to send immediately.
    fn send_packet(&mut self, size: usize, writer: &mut dyn FnMut(CursorMut));

    /// A free-running counter this adapter's driver advances independently of the stack,
    /// sampled once per new outbound connection to seed its initial sequence number so that two
    /// connections opened back to back never reuse one (RFC 793 §3.3).
    fn get_current_tcp_seq(&self) -> u32;
}
