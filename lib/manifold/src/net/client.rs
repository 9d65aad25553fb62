use crate::net::support::{ErrorType, NetError, NetResult};
use crate::{MAX_MSG_SIZE, RECV_BUF_SIZE};
use mio::net::TcpStream;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Strong handle to a client record. Holding one keeps the record (and its
/// socket) alive; the table recycles a record only once the dead list owns
/// the last handle.
pub type ClientRef = Arc<Client>;

/// One connected TCP peer. `id`, `server`, `address` and `stream` are written
/// only while the handle is exclusive (populate/reset); `invalid` and
/// `passthrough` flip under the table lock and the control loop respectively
/// and are read unlocked. Stale reads of `invalid` are tolerated downstream.
pub struct Client {
    pub(crate) id: u64,
    pub(crate) server: usize,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) address_name: String,
    pub(crate) stream: Option<TcpStream>,
    pub(crate) invalid: AtomicBool,
    pub(crate) passthrough: AtomicBool,
    pub(crate) recv: Mutex<RecvBuffer>,
}

impl Client {
    pub fn new() -> Client {
        Client {
            id: 0,
            server: 0,
            address: None,
            address_name: String::new(),
            stream: None,
            invalid: AtomicBool::new(false),
            passthrough: AtomicBool::new(false),
            recv: Mutex::new(RecvBuffer::new()),
        }
    }

    /// Fills in the connection details on a recruited record. The handle must
    /// still be exclusive; the id is assigned later by the table.
    pub(crate) fn populate(&mut self, stream: TcpStream, address: SocketAddr, server: usize) {
        self.address_name = address.ip().to_string();
        self.address = Some(address);
        self.server = server;
        self.stream = Some(stream);
    }

    /// Returns the record to its zeroed state, closing the socket. Linger is
    /// disabled first so the close does not left-hook a reused fd number.
    pub(crate) fn reset(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.set_linger(Some(Duration::from_secs(0)));
        }
        self.id = 0;
        self.server = 0;
        self.address = None;
        self.address_name.clear();
        self.invalid = AtomicBool::new(false);
        self.passthrough = AtomicBool::new(false);
        self.recv = Mutex::new(RecvBuffer::new());
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_passthrough(&self) -> bool {
        self.passthrough.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_passthrough(&self) {
        self.passthrough.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }
}

/// Fixed-size receive buffer slid in place: small memory per idle connection
/// at the cost of a copy per extracted frame. Only the receiver thread
/// touches it while the record is live.
pub struct RecvBuffer {
    buf: Box<[u8; RECV_BUF_SIZE]>,
    ofs: usize,
}

impl RecvBuffer {
    pub fn new() -> RecvBuffer {
        RecvBuffer {
            buf: Box::new([0; RECV_BUF_SIZE]),
            ofs: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ofs
    }

    /// True once more than a full message worth of bytes sits in the buffer
    /// with no newline in sight. Such a client is beyond saving.
    #[inline]
    pub fn overflowed(&self) -> bool {
        self.ofs > MAX_MSG_SIZE
    }

    /// One non-blocking read into the free tail of the buffer. Returns the
    /// byte count; zero and `WouldBlock` both mean "try again on the next
    /// readiness" and are left to the caller.
    pub fn fill<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let ofs = self.ofs;
        let count = reader.read(&mut self.buf[ofs..])?;
        self.ofs += count;
        Ok(count)
    }

    /// Extracts the first newline-terminated record, sliding the tail down
    /// over it. `Ok(None)` when no full record is buffered yet.
    pub fn take_frame(&mut self) -> NetResult<Option<Vec<u8>>> {
        let eol = match self.buf[..self.ofs].iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let len = eol + 1;
        if len > MAX_MSG_SIZE {
            return Err(NetError::Fatal(ErrorType::OversizedFrame));
        }

        let frame = self.buf[..len].to_vec();
        self.buf.copy_within(len..self.ofs, 0);
        self.ofs -= len;

        Ok(Some(frame))
    }

    #[cfg(test)]
    pub(crate) fn load(&mut self, bytes: &[u8]) {
        self.buf[self.ofs..self.ofs + bytes.len()].copy_from_slice(bytes);
        self.ofs += bytes.len();
    }
}
