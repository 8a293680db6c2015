//! Blocking transport abstraction. Each connection owns one `Transport`,
//! split into a read half (driven by the reader thread) and a write half
//! (driven by the file manager's send worker) via [`Transport::try_clone`],
//! the same pattern used for the standard library's socket types.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn shutdown(&mut self) -> io::Result<()>;
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;
}

pub struct TcpTransport(TcpStream);

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self(stream)
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        self.0.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.0.write_all(buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.0.shutdown(std::net::Shutdown::Both)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(TcpTransport(self.0.try_clone()?)))
    }
}

pub struct UnixTransport(UnixStream);

impl UnixTransport {
    pub fn new(stream: UnixStream) -> Self {
        Self(stream)
    }
}

impl Transport for UnixTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        self.0.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.0.write_all(buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.0.shutdown(std::net::Shutdown::Both)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(UnixTransport(self.0.try_clone()?)))
    }
}

struct Pipe {
    queue: Mutex<VecDeque<u8>>,
    condvar: Condvar,
    closed: AtomicBool,
}

impl Pipe {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }
}

/// An in-memory, full-duplex byte stream used to drive the server from
/// tests without opening a real socket.
pub struct LoopbackTransport {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
}

impl LoopbackTransport {
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Pipe::new());
        let b = Arc::new(Pipe::new());
        (
            LoopbackTransport { inbound: a.clone(), outbound: b.clone() },
            LoopbackTransport { inbound: b, outbound: a },
        )
    }
}

impl Transport for LoopbackTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut q = self.inbound.queue.lock();
        loop {
            if !q.is_empty() {
                let n = buf.len().min(q.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = q.pop_front().unwrap();
                }
                return Ok(n);
            }
            if self.inbound.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            self.inbound.condvar.wait(&mut q);
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut q = self.outbound.queue.lock();
        q.extend(buf.iter().copied());
        self.outbound.condvar.notify_all();
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        // Mirrors a real socket's shutdown(Both): unblocks a pending read on
        // this side and, since the pipes are shared with the peer's
        // LoopbackTransport, lets its blocked read see EOF too.
        self.inbound.closed.store(true, Ordering::Release);
        self.inbound.condvar.notify_all();
        self.outbound.closed.store(true, Ordering::Release);
        self.outbound.condvar.notify_all();
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(LoopbackTransport {
            inbound: self.inbound.clone(),
            outbound: self.outbound.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_pair_carries_bytes_in_both_directions() {
        let (mut a, mut b) = LoopbackTransport::pair();
        a.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        b.write_all(b"world").unwrap();
        let n = a.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn shutdown_unblocks_a_pending_read_with_eof() {
        let (mut a, b) = LoopbackTransport::pair();
        drop(b);
        a.shutdown().unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(a.read(&mut buf).unwrap(), 0);
    }
}
