//! Growable byte buffer backing connection I/O.
//!
//! Layout is a contiguous array with two indices and a fixed prepend headroom:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=         reader    <=       writer    <=       size
//! ```
//!
//! The 8-byte headroom lets a protocol layer prepend a length field after the
//! payload has been appended, without copying the payload.

use std::os::fd::RawFd;

use crate::config::EXTRA_READ_BUF;

/// Fixed prepend headroom in front of the readable span.
pub const PREPEND_SIZE: usize = 8;

/// Initial readable+writable capacity.
pub const INITIAL_SIZE: usize = 1024;

/// A growable read/write buffer with prepend headroom.
pub struct Buffer {
    data: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Create a buffer with `initial` bytes of writable space.
    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            data: vec![0u8; PREPEND_SIZE + initial],
            reader: PREPEND_SIZE,
            writer: PREPEND_SIZE,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.writer
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.reader == self.writer
    }

    /// The readable span.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.reader..self.writer]
    }

    /// Offset of the first `\r\n` in the readable span.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Offset of the first `\n` in the readable span.
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Mark `n` bytes as consumed.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        assert!(
            n <= self.readable_bytes(),
            "retrieve({}) exceeds readable bytes ({})",
            n,
            self.readable_bytes()
        );
        if n < self.readable_bytes() {
            self.reader += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = PREPEND_SIZE;
        self.writer = PREPEND_SIZE;
    }

    /// Consume the readable span up to `end`, an offset from `peek()` as
    /// returned by `find_crlf`/`find_eol`. Pass the delimiter offset plus the
    /// delimiter length to consume a full line.
    pub fn retrieve_until(&mut self, end: usize) {
        assert!(
            end <= self.readable_bytes(),
            "retrieve_until({}) exceeds readable bytes ({})",
            end,
            self.readable_bytes()
        );
        self.retrieve(end);
    }

    /// Consume and return `n` bytes as an owned string (lossy on invalid UTF-8).
    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        assert!(n <= self.readable_bytes());
        let s = String::from_utf8_lossy(&self.peek()[..n]).into_owned();
        self.retrieve(n);
        s
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Grow or compact until at least `len` bytes are writable.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    /// Advance the writer after external code filled the writable span.
    pub fn has_written(&mut self, n: usize) {
        assert!(n <= self.writable_bytes());
        self.writer += n;
    }

    /// Prepend `data` into the headroom.
    ///
    /// # Panics
    ///
    /// Panics if the prependable span is smaller than `data`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend({}) exceeds headroom ({})",
            data.len(),
            self.prependable_bytes()
        );
        self.reader -= data.len();
        self.data[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    // Network-byte-order integer helpers.

    pub fn append_u8(&mut self, x: u8) {
        self.append(&[x]);
    }

    pub fn append_u16(&mut self, x: u16) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_u32(&mut self, x: u32) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_u64(&mut self, x: u64) {
        self.append(&x.to_be_bytes());
    }

    pub fn peek_u8(&self) -> u8 {
        assert!(self.readable_bytes() >= 1);
        self.peek()[0]
    }

    pub fn peek_u16(&self) -> u16 {
        assert!(self.readable_bytes() >= 2);
        u16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        u32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn peek_u64(&self) -> u64 {
        assert!(self.readable_bytes() >= 8);
        u64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    pub fn read_u8(&mut self) -> u8 {
        let x = self.peek_u8();
        self.retrieve(1);
        x
    }

    pub fn read_u16(&mut self) -> u16 {
        let x = self.peek_u16();
        self.retrieve(2);
        x
    }

    pub fn read_u32(&mut self) -> u32 {
        let x = self.peek_u32();
        self.retrieve(4);
        x
    }

    pub fn read_u64(&mut self) -> u64 {
        let x = self.peek_u64();
        self.retrieve(8);
        x
    }

    pub fn prepend_u16(&mut self, x: u16) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_u32(&mut self, x: u32) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_u64(&mut self, x: u64) {
        self.prepend(&x.to_be_bytes());
    }

    /// Shed excess capacity, keeping `reserve` writable bytes.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut other = Buffer::with_capacity(readable + reserve);
        other.append(self.peek());
        *self = other;
    }

    /// Total backing capacity, including the headroom.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + PREPEND_SIZE {
            self.data.resize(self.writer + len, 0);
        } else {
            // Compact: move readable bytes to the front, behind the headroom.
            let readable = self.readable_bytes();
            self.data.copy_within(self.reader..self.writer, PREPEND_SIZE);
            self.reader = PREPEND_SIZE;
            self.writer = self.reader + readable;
        }
    }

    /// Scatter-read from `fd` into the writable span plus a stack overflow
    /// area, so a large burst lands in one syscall without pre-growing the
    /// buffer. Bytes that land in the overflow area are appended afterwards.
    pub fn read_fd(&mut self, fd: RawFd) -> std::io::Result<usize> {
        let mut extra = [0u8; EXTRA_READ_BUF];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.data[self.writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        // Skip the overflow area when the buffer alone can hold it.
        let iovcnt = if writable < extra.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.data.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("prependable", &self.prependable_bytes())
            .finish()
    }
}
