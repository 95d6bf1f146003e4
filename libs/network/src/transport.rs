//! Transactional Byte-Channel Seam
//!
//! The real stream transport (sockets, buffering, reconnection) lives
//! outside this crate. The bus consumes it through [`ByteChannel`]: a
//! duplex byte stream with transactional semantics on both sides.
//!
//! Reads are peek-then-consume: the channel state machine inspects buffered
//! bytes without consuming them and commits only once a whole packet is
//! available, so a short read leaves the stream untouched. Writes are
//! all-or-nothing units; the state machine issues the packet header and the
//! body as two independent writes, header first.
//!
//! [`MemoryChannel`] is the in-process implementation used by tests.

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A duplex byte stream with transactional reads and writes.
pub trait ByteChannel: Send {
    /// Number of inbound bytes currently buffered.
    fn readable(&self) -> usize;

    /// Copy up to `buf.len()` buffered bytes without consuming them.
    /// Returns how many bytes were copied.
    fn peek(&self, buf: &mut [u8]) -> usize;

    /// Consume `n` previously peeked bytes, committing the read.
    fn consume(&mut self, n: usize);

    /// Write one unit to the peer, all-or-nothing.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
}

#[derive(Default)]
struct Direction {
    buf: Mutex<BytesMut>,
    broken: AtomicBool,
}

/// In-memory byte channel; `pair()` yields two connected ends.
pub struct MemoryChannel {
    inbound: Arc<Direction>,
    outbound: Arc<Direction>,
}

impl MemoryChannel {
    /// Create two connected channel ends.
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let a_to_b = Arc::new(Direction::default());
        let b_to_a = Arc::new(Direction::default());
        (
            MemoryChannel {
                inbound: b_to_a.clone(),
                outbound: a_to_b.clone(),
            },
            MemoryChannel {
                inbound: a_to_b,
                outbound: b_to_a,
            },
        )
    }

    /// Make subsequent writes from this end fail, simulating a dead link.
    pub fn fail_writes(&self, fail: bool) {
        self.outbound.broken.store(fail, Ordering::SeqCst);
    }
}

impl ByteChannel for MemoryChannel {
    fn readable(&self) -> usize {
        self.inbound.buf.lock().len()
    }

    fn peek(&self, buf: &mut [u8]) -> usize {
        let data = self.inbound.buf.lock();
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        n
    }

    fn consume(&mut self, n: usize) {
        let mut data = self.inbound.buf.lock();
        let n = n.min(data.len());
        data.advance(n);
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.outbound.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link severed"));
        }
        self.outbound.buf.lock().extend_from_slice(bytes);
        Ok(())
    }
}
