use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

/// Byte-oriented, non-blocking transport under the protocol stack.
///
/// Implementations wrap whatever carries the RS-485 bytes (a serial port, a
/// socket, a pty). All operations must return immediately:
/// `recv` yields `Ok(0)` when nothing is buffered — that is "no data yet",
/// not end-of-stream. Frame delimitation is entirely the phy layer's job.
///
/// Methods take `&self` so a single `Arc<dyn Channel>` can be shared by all
/// PD sessions that sit on the same multidrop bus; implementations use
/// interior mutability for their buffers.
pub trait Channel: Send + Sync {
    /// Write up to `buf.len()` bytes, returning how many were accepted.
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Read up to `buf.len()` bytes, returning how many were read.
    /// `Ok(0)` means no data available right now.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Discard any buffered inbound bytes. Optional.
    fn flush(&self) {}
}

/// Paired in-memory channel: bytes sent on one end become readable on the
/// other. Used by the test suite and the poll-cycle benchmark to run a CP
/// and a PD in the same process without any I/O.
pub struct MemoryChannel {
    tx: Arc<Mutex<VecDeque<u8>>>,
    rx: Arc<Mutex<VecDeque<u8>>>,
}

fn lock(q: &Mutex<VecDeque<u8>>) -> MutexGuard<'_, VecDeque<u8>> {
    q.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryChannel {
    /// Create both ends of a loopback link.
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let a = Arc::new(Mutex::new(VecDeque::new()));
        let b = Arc::new(Mutex::new(VecDeque::new()));
        (
            MemoryChannel {
                tx: a.clone(),
                rx: b.clone(),
            },
            MemoryChannel { tx: b, rx: a },
        )
    }

    /// Inject raw bytes into this end's receive queue, as if the peer had
    /// sent them.
    pub fn inject(&self, bytes: &[u8]) {
        lock(&self.rx).extend(bytes.iter().copied());
    }
}

impl Channel for MemoryChannel {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.tx).extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut q = lock(&self.rx);
        let n = buf.len().min(q.len());
        for slot in buf.iter_mut().take(n) {
            *slot = match q.pop_front() {
                Some(b) => b,
                None => break,
            };
        }
        Ok(n)
    }

    fn flush(&self) {
        lock(&self.rx).clear();
    }
}
