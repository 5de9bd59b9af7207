//! Execution backends that drain the sink.
//!
//! The admission layer does not perform I/O itself. An [`IoBackend`] executes
//! a drained request and reports the bytes transferred; [`IoSink::drain_into`]
//! wires one to a sink. Two implementations are provided: an in-memory device
//! for tests and simulation, and a positional file backend over `libc`.
//!
//! [`IoSink::drain_into`]: crate::sink::IoSink::drain_into

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::iovec::to_libc_iovecs;
use crate::request::{IoOp, IoRequest};

/// Backend statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoStats {
    /// Total read operations completed
    pub reads_completed: u64,
    /// Total write operations completed
    pub writes_completed: u64,
    /// Total bytes read
    pub bytes_read: u64,
    /// Total bytes written
    pub bytes_written: u64,
    /// Total errors encountered
    pub errors: u64,
}

impl IoStats {
    fn record(&mut self, op: IoOp, result: &io::Result<usize>) {
        match (op, result) {
            (IoOp::Read, Ok(n)) => {
                self.reads_completed += 1;
                self.bytes_read += *n as u64;
            }
            (IoOp::Write, Ok(n)) => {
                self.writes_completed += 1;
                self.bytes_written += *n as u64;
            }
            (_, Err(_)) => self.errors += 1,
        }
    }
}

/// Executes drained requests against a device.
pub trait IoBackend {
    /// Performs the transfer described by `req`, returning bytes transferred.
    ///
    /// The request's buffers are valid for the transfer: whoever built it
    /// through an `unsafe` `IoRequest::make_*` constructor vouched for them
    /// until the request resolves.
    fn execute(&self, req: &IoRequest) -> io::Result<usize>;

    /// Current backend statistics.
    fn stats(&self) -> IoStats;
}

/// In-memory backend: one growable byte device per file descriptor.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    devices: Mutex<HashMap<RawFd, Vec<u8>>>,
    failing: Mutex<HashMap<RawFd, i32>>,
    stats: Mutex<IoStats>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a device for `fd` pre-filled with `size` zero bytes.
    pub fn with_device(fd: RawFd, size: usize) -> Self {
        let backend = Self::new();
        backend.devices.lock().insert(fd, vec![0; size]);
        backend
    }

    /// Makes every request on `fd` fail with `errno` until cleared.
    pub fn inject_error(&self, fd: RawFd, errno: i32) {
        self.failing.lock().insert(fd, errno);
    }

    /// Stops failing requests on `fd`.
    pub fn clear_error(&self, fd: RawFd) {
        self.failing.lock().remove(&fd);
    }

    /// Copies `len` bytes of device `fd` starting at `pos`; unwritten bytes read as zero.
    pub fn read_at(&self, fd: RawFd, pos: u64, len: usize) -> Vec<u8> {
        let devices = self.devices.lock();
        let mut out = vec![0; len];
        if let Some(dev) = devices.get(&fd) {
            let start = (pos as usize).min(dev.len());
            let end = (pos as usize).saturating_add(len).min(dev.len());
            out[..end - start].copy_from_slice(&dev[start..end]);
        }
        out
    }

    /// Size of device `fd` in bytes.
    pub fn device_len(&self, fd: RawFd) -> usize {
        self.devices.lock().get(&fd).map_or(0, Vec::len)
    }
}

impl IoBackend for MemoryBackend {
    fn execute(&self, req: &IoRequest) -> io::Result<usize> {
        if let Some(&errno) = self.failing.lock().get(&req.fd()) {
            let result = Err(io::Error::from_raw_os_error(errno));
            self.stats.lock().record(req.op(), &result);
            return result;
        }

        let mut devices = self.devices.lock();
        let dev = devices.entry(req.fd()).or_default();
        let mut pos = req.pos() as usize;

        for iov in req.iovecs() {
            match req.op() {
                IoOp::Write => {
                    let end = pos + iov.len();
                    if dev.len() < end {
                        dev.resize(end, 0);
                    }
                    // SAFETY: `IoRequest::make_write`/`make_writev` require the segment to stay readable until resolution
                    dev[pos..end].copy_from_slice(unsafe { iov.as_slice() });
                }
                IoOp::Read => {
                    // SAFETY: `IoRequest::make_read`/`make_readv` require the segment to stay writable and unaliased until resolution
                    let out = unsafe { iov.as_mut_slice() };
                    out.fill(0);
                    if pos < dev.len() {
                        let n = (dev.len() - pos).min(out.len());
                        out[..n].copy_from_slice(&dev[pos..pos + n]);
                    }
                }
            }
            pos += iov.len();
        }
        drop(devices);

        debug!(
            "Memory {}: fd={}, pos={}, size={}",
            req.op(),
            req.fd(),
            req.pos(),
            req.size()
        );
        let result = Ok(req.size());
        self.stats.lock().record(req.op(), &result);
        result
    }

    fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }
}

/// Positional file backend issuing `pread`/`pwrite`/`preadv`/`pwritev`.
#[derive(Debug, Default)]
pub struct FileBackend {
    stats: Mutex<IoStats>,
}

impl FileBackend {
    /// Creates a backend with zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    fn syscall(req: &IoRequest) -> io::Result<usize> {
        let fd = req.fd();
        let off = req.pos() as libc::off_t;
        let raw = to_libc_iovecs(req.iovecs());

        // SAFETY: the `unsafe` request constructors guarantee every segment
        // stays valid until the request resolves; `raw` outlives the call.
        let ret = unsafe {
            match (req.op(), raw.as_slice()) {
                (IoOp::Read, [one]) => libc::pread(fd, one.iov_base, one.iov_len, off),
                (IoOp::Write, [one]) => libc::pwrite(fd, one.iov_base, one.iov_len, off),
                (IoOp::Read, many) => {
                    libc::preadv(fd, many.as_ptr(), many.len() as libc::c_int, off)
                }
                (IoOp::Write, many) => {
                    libc::pwritev(fd, many.as_ptr(), many.len() as libc::c_int, off)
                }
            }
        };

        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

impl IoBackend for FileBackend {
    fn execute(&self, req: &IoRequest) -> io::Result<usize> {
        let result = Self::syscall(req);
        if let Err(e) = &result {
            debug!("File {} failed: fd={}, pos={}: {}", req.op(), req.fd(), req.pos(), e);
        }
        self.stats.lock().record(req.op(), &result);
        result
    }

    fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }
}
