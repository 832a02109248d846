//! A zero-copy view over the one buffer a [`crate::adapter::PhysicalAdapter`] hands across its
//! boundary.
//!
//! [`Cursor`] and [`CursorMut`] exist so that nothing between the adapter and the layer that
//! finally consumes or produces bytes needs to own a second copy of a frame just to pass it
//! along. A cursor is logically immutable: every navigation method returns a new cursor rather
//! than mutating the receiver, so a caller can hand out `take`/`drop` slices of the same
//! underlying buffer to several readers without any of them racing the others' position.

/// A read-only cursor over a borrowed buffer.
#[derive(Clone, Copy)]
pub struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf }
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// The first `n` bytes, or everything if `n` exceeds what remains.
    pub fn take(&self, n: usize) -> Cursor<'a> {
        Cursor { buf: &self.buf[..n.min(self.buf.len())] }
    }

    /// Everything after the first `n` bytes.
    pub fn drop(&self, n: usize) -> Cursor<'a> {
        Cursor { buf: &self.buf[n.min(self.buf.len())..] }
    }

    /// Copy as many bytes as fit into `out`, returning a cursor over what's left.
    pub fn read(&self, out: &mut [u8]) -> Cursor<'a> {
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.drop(n)
    }

    /// Borrow the remaining bytes directly, for callers that need a plain slice (parsing a wire
    /// header, handing payload to an application callback, ...).
    pub fn as_slice(&self) -> &'a [u8] {
        self.buf
    }
}

/// A write-only cursor over a borrowed, mutable buffer.
pub struct CursorMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> CursorMut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        CursorMut { buf }
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Copy `data` in starting at the current position, truncating silently if `data` is larger
    /// than what's left (callers size the cursor to fit before writing).
    pub fn write(&mut self, data: &[u8]) {
        let n = data.len().min(self.buf.len());
        self.buf[..n].copy_from_slice(&data[..n]);
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf
    }
}
