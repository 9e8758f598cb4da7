// src/buffer.rs
use std::io;
use std::os::fd::RawFd;

use crate::syscalls;

/// Size of the on-stack overflow area used by [`Buffer::read_fd`].
const SCRATCH_SIZE: usize = 65535;

pub const INITIAL_BUFFER_SIZE: usize = 1024;

/// Growable byte buffer with independent read and write cursors.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=      read_pos     <=     write_pos     <=     capacity
/// ```
#[derive(Debug)]
pub struct Buffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The unread region, without copying.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Advance the read cursor by `len` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`readable_bytes`](Self::readable_bytes).
    pub fn retrieve(&mut self, len: usize) {
        assert!(
            len <= self.readable_bytes(),
            "retrieve({}) past {} readable bytes",
            len,
            self.readable_bytes()
        );
        self.read_pos += len;
    }

    /// Reset both cursors and zero the storage.
    pub fn retrieve_all(&mut self) {
        self.storage.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    // Compaction wins whenever it frees enough room; otherwise grow to
    // exactly `write_pos + len + 1`.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.storage.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.storage.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    /// Scatter-read from `fd` into the writable region plus a stack scratch
    /// area, so one call can take in more than currently fits.
    ///
    /// Returns the number of bytes read; `Ok(0)` means the peer closed.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let writable = self.writable_bytes();
        let n = {
            let (_, tail) = self.storage.split_at_mut(self.write_pos);
            syscalls::readv(fd, &mut [tail, &mut scratch[..]])?
        };
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.storage.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd`, advancing the read cursor by what
    /// the kernel accepted.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = syscalls::write(fd, self.peek())?;
        self.read_pos += n;
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_accounting() {
        let mut buf = Buffer::with_capacity(16);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), 16);
        assert_eq!(buf.prependable_bytes(), 0);

        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        assert_eq!(buf.prependable_bytes(), 6);

        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), buf.capacity());
        assert_eq!(buf.prependable_bytes(), 0);
    }

    #[test]
    fn test_compaction_preserves_unread_bytes() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789ab");
        buf.retrieve(8);
        // 4 writable + 8 prependable is enough for 10 bytes: compact, no growth.
        buf.append(b"ABCDEFGHIJ");
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.prependable_bytes(), 0);
        assert_eq!(buf.peek(), b"89abABCDEFGHIJ");
    }

    #[test]
    fn test_growth_preserves_unread_bytes() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"abcdef");
        buf.retrieve(2);
        buf.append(b"0123456789");
        assert_eq!(buf.capacity(), 6 + 10 + 1);
        assert_eq!(buf.peek(), b"cdef0123456789");
    }

    #[test]
    fn test_mixed_sequence_never_loses_bytes() {
        let mut buf = Buffer::with_capacity(4);
        let mut model: Vec<u8> = Vec::new();
        let mut next = 0u8;
        for round in 0..200usize {
            let chunk: Vec<u8> = (0..(round % 13))
                .map(|_| {
                    next = next.wrapping_add(1);
                    next
                })
                .collect();
            buf.append(&chunk);
            model.extend_from_slice(&chunk);

            let take = (round * 7) % (model.len() + 1);
            buf.retrieve(take);
            model.drain(..take);

            assert_eq!(buf.readable_bytes(), model.len());
            assert_eq!(buf.peek(), &model[..]);
        }
    }

    #[test]
    #[should_panic(expected = "retrieve")]
    fn test_retrieve_past_readable_panics() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"abc");
        buf.retrieve(4);
    }

    #[test]
    fn test_retrieve_all_to_string_drains() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"xyz");
        assert_eq!(buf.retrieve_all_to_string(), "xyz");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_read_fd_overflows_into_scratch() {
        let (rd, wr) = syscalls::create_pipe().unwrap();
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(syscalls::write(wr, &payload).unwrap(), payload.len());

        let mut buf = Buffer::with_capacity(64);
        buf.append(b"head");
        let n = buf.read_fd(rd).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(&buf.peek()[..4], b"head");
        assert_eq!(&buf.peek()[4..], &payload[..]);

        syscalls::close(rd);
        syscalls::close(wr);
    }

    #[test]
    fn test_write_fd_advances_read_cursor() {
        let (rd, wr) = syscalls::create_pipe().unwrap();
        let mut buf = Buffer::new();
        buf.append(b"ping");
        assert_eq!(buf.write_fd(wr).unwrap(), 4);
        assert_eq!(buf.readable_bytes(), 0);

        let mut out = Buffer::new();
        assert_eq!(out.read_fd(rd).unwrap(), 4);
        assert_eq!(out.peek(), b"ping");

        syscalls::close(rd);
        syscalls::close(wr);
    }
}
