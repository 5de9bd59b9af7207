//! I/O request descriptors and length-bounded splitting.
//!
//! An [`IoRequest`] describes one read or write against a raw file descriptor,
//! either over a single flat buffer or over an ordered list of [`IoVec`]
//! segments. Descriptors are immutable; [`IoRequest::split`] produces new
//! descriptors covering contiguous byte sub-ranges of the original.

use std::fmt;
use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};

use crate::iovec::{iovec_len, IoVec};

/// Direction of an I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoOp {
    /// Transfer from the device into the caller's buffer.
    Read,
    /// Transfer from the caller's buffer to the device.
    Write,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOp::Read => write!(f, "read"),
            IoOp::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum IoBuffer {
    Flat(IoVec),
    Vectored(Vec<IoVec>),
}

/// Immutable description of a single I/O operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequest {
    op: IoOp,
    fd: RawFd,
    pos: u64,
    buf: IoBuffer,
    nowait_works: bool,
}

/// One length-bounded piece of a split request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequestPart {
    /// Descriptor covering this part's byte range.
    pub req: IoRequest,
    /// Number of bytes in this part.
    pub size: usize,
}

impl IoRequest {
    fn flat(op: IoOp, fd: RawFd, pos: u64, buf: IoVec, nowait_works: bool) -> Self {
        assert!(!buf.is_empty(), "I/O request must cover at least one byte");
        Self {
            op,
            fd,
            pos,
            buf: IoBuffer::Flat(buf),
            nowait_works,
        }
    }

    fn vectored(op: IoOp, fd: RawFd, pos: u64, iovecs: Vec<IoVec>, nowait_works: bool) -> Self {
        assert!(!iovecs.is_empty(), "vectored I/O request needs at least one segment");
        assert!(
            iovecs.iter().all(|iov| !iov.is_empty()),
            "vectored I/O request has a zero-length segment"
        );
        Self {
            op,
            fd,
            pos,
            buf: IoBuffer::Vectored(iovecs),
            nowait_works,
        }
    }

    /// Builds a single-buffer read.
    ///
    /// # Safety
    ///
    /// `buf` must point at memory that is valid for writes of `buf.len()`
    /// bytes and not accessed through any other path until the request is
    /// resolved: completed, failed, cancelled, or abandoned when its queue or
    /// sink is dropped. Dropping the [`IoHandle`](crate::IoHandle) does not
    /// end that period.
    pub unsafe fn make_read(fd: RawFd, pos: u64, buf: IoVec, nowait_works: bool) -> Self {
        Self::flat(IoOp::Read, fd, pos, buf, nowait_works)
    }

    /// Builds a single-buffer write.
    ///
    /// Building a request is `unsafe` because the backend dereferences the
    /// segment long after this call returns:
    ///
    /// ```compile_fail
    /// use shardio_queue::{IoRequest, IoVec};
    ///
    /// let buf = [0u8; 4];
    /// let req = IoRequest::make_write(0, 0, IoVec::from_slice(&buf), false);
    /// ```
    ///
    /// # Safety
    ///
    /// `buf` must point at memory that is valid for reads of `buf.len()`
    /// bytes and not mutated until the request is resolved: completed,
    /// failed, cancelled, or abandoned when its queue or sink is dropped.
    /// Dropping the [`IoHandle`](crate::IoHandle) does not end that period.
    pub unsafe fn make_write(fd: RawFd, pos: u64, buf: IoVec, nowait_works: bool) -> Self {
        Self::flat(IoOp::Write, fd, pos, buf, nowait_works)
    }

    /// Builds a scatter read over `iovecs`.
    ///
    /// # Safety
    ///
    /// Same contract as [`make_read`](Self::make_read), for every segment.
    /// Segments must not overlap.
    pub unsafe fn make_readv(fd: RawFd, pos: u64, iovecs: Vec<IoVec>, nowait_works: bool) -> Self {
        Self::vectored(IoOp::Read, fd, pos, iovecs, nowait_works)
    }

    /// Builds a gather write over `iovecs`.
    ///
    /// # Safety
    ///
    /// Same contract as [`make_write`](Self::make_write), for every segment.
    pub unsafe fn make_writev(fd: RawFd, pos: u64, iovecs: Vec<IoVec>, nowait_works: bool) -> Self {
        Self::vectored(IoOp::Write, fd, pos, iovecs, nowait_works)
    }

    /// Operation direction.
    #[inline]
    pub fn op(&self) -> IoOp {
        self.op
    }

    /// Target file descriptor.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// File position of the first byte.
    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Total length in bytes.
    pub fn size(&self) -> usize {
        match &self.buf {
            IoBuffer::Flat(iov) => iov.len(),
            IoBuffer::Vectored(iovecs) => iovec_len(iovecs),
        }
    }

    /// True for requests built with `make_readv`/`make_writev`.
    #[inline]
    pub fn is_vectored(&self) -> bool {
        matches!(self.buf, IoBuffer::Vectored(_))
    }

    /// Buffer address of a single-buffer request.
    pub fn address(&self) -> Option<*mut u8> {
        match &self.buf {
            IoBuffer::Flat(iov) => Some(iov.base()),
            IoBuffer::Vectored(_) => None,
        }
    }

    /// The buffer as a segment list; a single-buffer request yields one segment.
    pub fn iovecs(&self) -> &[IoVec] {
        match &self.buf {
            IoBuffer::Flat(iov) => std::slice::from_ref(iov),
            IoBuffer::Vectored(iovecs) => iovecs,
        }
    }

    /// Backend hint: a non-blocking submission attempt is safe.
    #[inline]
    pub fn nowait_works(&self) -> bool {
        self.nowait_works
    }

    /// Splits the request into parts of at most `max_len` bytes.
    ///
    /// Every part but the last is exactly `max_len` bytes. Parts cover the
    /// original byte range in order with no gaps; a segment straddling a part
    /// boundary is cut in two.
    pub fn split(&self, max_len: usize) -> Vec<IoRequestPart> {
        assert!(max_len > 0, "split threshold must be positive");

        let size = self.size();
        if size <= max_len {
            return vec![IoRequestPart {
                req: self.clone(),
                size,
            }];
        }

        match &self.buf {
            IoBuffer::Flat(iov) => self.split_flat(*iov, max_len),
            IoBuffer::Vectored(iovecs) => self.split_iovecs(iovecs, max_len),
        }
    }

    fn split_flat(&self, iov: IoVec, max_len: usize) -> Vec<IoRequestPart> {
        let mut parts = Vec::with_capacity(iov.len().div_ceil(max_len));
        let mut off = 0;
        while off < iov.len() {
            let len = max_len.min(iov.len() - off);
            let piece = iov.advance(off).truncate(len);
            parts.push(IoRequestPart {
                req: Self::flat(self.op, self.fd, self.pos + off as u64, piece, self.nowait_works),
                size: len,
            });
            off += len;
        }
        parts
    }

    fn split_iovecs(&self, iovecs: &[IoVec], max_len: usize) -> Vec<IoRequestPart> {
        let mut parts = Vec::with_capacity(iovec_len(iovecs).div_ceil(max_len));
        let mut pos = self.pos;
        let mut cur: Vec<IoVec> = Vec::new();
        let mut cur_len = 0;

        for iov in iovecs {
            let mut rest = *iov;
            while !rest.is_empty() {
                let room = max_len - cur_len;
                if rest.len() <= room {
                    cur_len += rest.len();
                    cur.push(rest);
                    rest = rest.advance(rest.len());
                } else {
                    cur.push(rest.truncate(room));
                    cur_len += room;
                    rest = rest.advance(room);
                }

                if cur_len == max_len {
                    parts.push(self.vectored_part(pos, std::mem::take(&mut cur), cur_len));
                    pos += cur_len as u64;
                    cur_len = 0;
                }
            }
        }

        if cur_len > 0 {
            parts.push(self.vectored_part(pos, cur, cur_len));
        }
        parts
    }

    fn vectored_part(&self, pos: u64, iovecs: Vec<IoVec>, size: usize) -> IoRequestPart {
        IoRequestPart {
            req: Self::vectored(self.op, self.fd, pos, iovecs, self.nowait_works),
            size,
        }
    }
}
