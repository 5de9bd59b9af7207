//! Buffer segments referenced by I/O requests.
//!
//! An [`IoVec`] is a raw `(address, length)` pair, laid out like POSIX
//! `struct iovec`. A segment on its own is inert. Requests never own the
//! memory they point at, so the `unsafe` request constructors in
//! [`crate::request`] carry the contract that the caller keeps the buffer
//! alive and unaliased until the request resolves.

use std::fmt;

/// One contiguous buffer segment.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct IoVec {
    base: *mut u8,
    len: usize,
}

impl IoVec {
    /// Creates a segment from a raw address and length.
    #[inline]
    pub fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    /// Creates a segment covering a buffer the backend will read from.
    ///
    /// Only valid as the source of a write request: a read request built
    /// over it would have the backend store into shared memory.
    #[inline]
    pub fn from_slice(buf: &[u8]) -> Self {
        Self::new(buf.as_ptr() as *mut u8, buf.len())
    }

    /// Creates a segment covering a buffer the backend may fill.
    #[inline]
    pub fn from_mut_slice(buf: &mut [u8]) -> Self {
        Self::new(buf.as_mut_ptr(), buf.len())
    }

    /// Start address of the segment.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Start address as an integer, for arithmetic and diagnostics.
    #[inline]
    pub fn addr(&self) -> usize {
        self.base as usize
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the segment covers no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drops the first `n` bytes of the segment.
    #[inline]
    pub fn advance(&self, n: usize) -> Self {
        assert!(n <= self.len, "advance {} past segment of {} bytes", n, self.len);
        Self::new(self.base.wrapping_add(n), self.len - n)
    }

    /// Keeps only the first `n` bytes of the segment.
    #[inline]
    pub fn truncate(&self, n: usize) -> Self {
        assert!(n <= self.len, "truncate to {} beyond segment of {} bytes", n, self.len);
        Self::new(self.base, n)
    }

    /// Views the segment as a byte slice.
    ///
    /// # Safety
    ///
    /// The memory must be live, initialized and not mutated for `'a`.
    #[inline]
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.base, self.len)
    }

    /// Views the segment as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The memory must be live, writable and not aliased for `'a`.
    #[inline]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.base, self.len)
    }
}

impl fmt::Debug for IoVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoVec")
            .field("base", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

impl From<IoVec> for libc::iovec {
    fn from(iov: IoVec) -> Self {
        libc::iovec {
            iov_base: iov.base as *mut libc::c_void,
            iov_len: iov.len,
        }
    }
}

/// Total number of bytes covered by a segment list.
#[inline]
pub fn iovec_len(iovecs: &[IoVec]) -> usize {
    iovecs.iter().map(IoVec::len).sum()
}

/// Converts a segment list for `preadv`/`pwritev` style calls.
pub fn to_libc_iovecs(iovecs: &[IoVec]) -> Vec<libc::iovec> {
    iovecs.iter().copied().map(libc::iovec::from).collect()
}
