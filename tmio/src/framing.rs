//! Termination-character framing over byte streams.
//!
//! The serial and socket backends share the same read discipline: bytes are
//! accumulated in a fixed-size per-session buffer, every arrival is scanned
//! for the termination character, and a read returns the bytes up to and
//! including the terminator. Data past the terminator stays buffered for the
//! next call.

use std::os::fd::BorrowedFd;

use nix::sys::select::{FdSet, select};
use nix::sys::time::TimeVal;

use crate::error::{Result, TmError};

/// Readiness direction for [`wait_ready`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    Read,
    Write,
}

/// Bounded readiness wait on a file descriptor.
///
/// `timeout_secs` of zero waits forever; otherwise an elapsed wait fails
/// with `Timeout`.
pub(crate) fn wait_ready(fd: BorrowedFd<'_>, wait: Wait, timeout_secs: u32) -> Result<()> {
    let mut fds = FdSet::new();
    fds.insert(fd);

    let (mut readfds, mut writefds) = match wait {
        Wait::Read => (Some(fds), None),
        Wait::Write => (None, Some(fds)),
    };

    let ready = if timeout_secs == 0 {
        select(None, readfds.as_mut(), writefds.as_mut(), None, None)?
    } else {
        let mut timeout = TimeVal::new(i64::from(timeout_secs), 0);
        select(
            None,
            readfds.as_mut(),
            writefds.as_mut(),
            None,
            Some(&mut timeout),
        )?
    };

    if ready != 1 {
        return Err(TmError::Timeout);
    }
    Ok(())
}

/// Fixed-capacity accumulation buffer for terminated reads
pub(crate) struct TermBuffer {
    data: Vec<u8>,
    len: usize,
}

impl TermBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            len: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Position of `term` in the buffered bytes starting at `from`.
    fn find(&self, term: u8, from: usize) -> Option<usize> {
        self.data[from..self.len].iter().position(|&b| b == term).map(|i| from + i)
    }

    /// Copy the bytes up to and including index `index` into `dest` and
    /// compact the remainder to the front of the buffer.
    fn split_to(&mut self, dest: &mut [u8], index: usize) -> usize {
        let count = index + 1;
        dest[..count].copy_from_slice(&self.data[..count]);
        self.data.copy_within(count..self.len, 0);
        self.len -= count;
        count
    }

    fn reset(&mut self) {
        self.len = 0;
    }
}

/// One terminated read against the accumulation buffer.
///
/// `wait_readable` performs the backend's bounded readiness wait and
/// `read_some` moves available bytes into the given slice. `too_much` is the
/// backend's error for a request larger than the buffer. Fails with
/// `BufferOverflow` when `dest` fills up without a terminator.
pub(crate) fn read_terminated(
    buf: &mut TermBuffer,
    term: u8,
    dest: &mut [u8],
    too_much: TmError,
    mut wait_readable: impl FnMut() -> Result<()>,
    mut read_some: impl FnMut(&mut [u8]) -> Result<usize>,
) -> Result<usize> {
    if dest.len() > buf.capacity() {
        return Err(too_much);
    }

    // A terminator may already be buffered from a previous read.
    if let Some(index) = buf.find(term, 0) {
        if index >= dest.len() {
            buf.reset();
            return Err(TmError::BufferOverflow);
        }
        return Ok(buf.split_to(dest, index));
    }
    if buf.len >= dest.len() {
        buf.reset();
        return Err(TmError::BufferOverflow);
    }

    loop {
        wait_readable()?;

        let start = buf.len;
        let count = read_some(&mut buf.data[start..dest.len()])?;
        if count == 0 {
            // Peer closed the stream before sending a terminator.
            return Err(TmError::IoIssue);
        }
        buf.len = start + count;

        if let Some(index) = buf.find(term, start) {
            return Ok(buf.split_to(dest, index));
        }
        if buf.len >= dest.len() {
            buf.reset();
            return Err(TmError::BufferOverflow);
        }
    }
}
