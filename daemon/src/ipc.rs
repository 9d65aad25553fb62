//! Unix-domain control transport. One textual command per connection,
//! terminated by a newline or by the peer shutting down its write half;
//! replies go back on the same connection. `getxfd` answers with an
//! `SCM_RIGHTS` fd transfer.

use manifold::net::control::{CommandSource, ControlMessage, Responder};
use std::io::{self, Read, Write};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_COMMAND: usize = 65536;
const PEER_TIMEOUT: Duration = Duration::from_secs(5);

pub struct UnixCommandSource {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixCommandSource {
    pub fn bind<P: AsRef<Path>>(path: P) -> io::Result<UnixCommandSource> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        Ok(UnixCommandSource { listener, path })
    }
}

impl Drop for UnixCommandSource {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl CommandSource for UnixCommandSource {
    fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Option<ControlMessage>> {
        let mut pollfd = libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout.as_millis() as libc::c_int) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(err);
        }
        if ready == 0 {
            return Ok(None);
        }

        let (mut stream, _) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(err),
        };

        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(PEER_TIMEOUT))?;
        stream.set_write_timeout(Some(PEER_TIMEOUT))?;

        // A misbehaving control peer must not take the loop down.
        match read_command(&mut stream) {
            Ok(text) => Ok(Some(ControlMessage {
                text,
                port: Box::new(UnixResponder { stream }),
            })),
            Err(_) => Ok(None),
        }
    }
}

fn read_command(stream: &mut UnixStream) -> io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let count = stream.read(&mut chunk)?;
        if count == 0 {
            break;
        }
        buf.extend(&chunk[..count]);
        if buf.last() == Some(&b'\n') || buf.len() >= MAX_COMMAND {
            break;
        }
    }

    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "command is not utf-8"))
}

struct UnixResponder {
    stream: UnixStream,
}

impl Responder for UnixResponder {
    fn reply(&mut self, msg: &str) -> io::Result<()> {
        self.stream.write_all(msg.as_bytes())?;
        self.stream.write_all(b"\n")
    }

    fn pass_fd(&mut self, fd: RawFd) -> io::Result<()> {
        send_fd(&self.stream, fd)
    }
}

/// Sends `fd` across the stream with a one-byte payload.
fn send_fd(stream: &UnixStream, fd: RawFd) -> io::Result<()> {
    // Control buffer aligned for cmsghdr.
    let mut cmsg_space = [0u64; 8];
    let mut payload = [b'*'; 1];

    unsafe {
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);

        if libc::sendmsg(stream.as_raw_fd(), &msg, 0) < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::os::unix::net::UnixStream;

    fn socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("manifold-ipc-{}-{}.sock", tag, std::process::id()))
    }

    /// Receives one fd sent by `send_fd`.
    fn recv_fd(stream: &UnixStream) -> io::Result<RawFd> {
        let mut cmsg_space = [0u64; 8];
        let mut payload = [0u8; 1];

        unsafe {
            let mut iov = libc::iovec {
                iov_base: payload.as_mut_ptr() as *mut libc::c_void,
                iov_len: payload.len(),
            };

            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize;

            if libc::recvmsg(stream.as_raw_fd(), &mut msg, 0) < 0 {
                return Err(io::Error::last_os_error());
            }

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null()
                || (*cmsg).cmsg_level != libc::SOL_SOCKET
                || (*cmsg).cmsg_type != libc::SCM_RIGHTS
            {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "no fd received"));
            }

            Ok(std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd))
        }
    }

    #[test]
    fn test_command_round_trip() {
        let path = socket_path("roundtrip");
        let mut source = UnixCommandSource::bind(&path).unwrap();

        let mut peer = UnixStream::connect(&path).unwrap();
        peer.write_all(b"ping\n").unwrap();

        let mut msg = source
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .expect("command expected");
        assert_eq!(msg.text, "ping\n");

        msg.port.reply("pong").unwrap();

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut line = String::new();
        std::io::BufReader::new(&mut peer).read_line(&mut line).unwrap();
        assert_eq!(line, "pong\n");
    }

    #[test]
    fn test_command_terminated_by_shutdown() {
        let path = socket_path("shutdown");
        let mut source = UnixCommandSource::bind(&path).unwrap();

        let mut peer = UnixStream::connect(&path).unwrap();
        peer.write_all(b"stats").unwrap();
        peer.shutdown(std::net::Shutdown::Write).unwrap();

        let msg = source
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .expect("command expected");
        assert_eq!(msg.text, "stats");
    }

    #[test]
    fn test_quiet_interval_returns_none() {
        let path = socket_path("quiet");
        let mut source = UnixCommandSource::bind(&path).unwrap();

        let msg = source.recv_timeout(Duration::from_millis(50)).unwrap();
        assert!(msg.is_none());
    }

    #[test]
    fn test_fd_passing() {
        let path = socket_path("fdpass");
        let mut source = UnixCommandSource::bind(&path).unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let expected_addr = listener.local_addr().unwrap();

        let peer = UnixStream::connect(&path).unwrap();
        peer.shutdown(std::net::Shutdown::Write).unwrap();

        let mut msg = source
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .expect("command expected");
        msg.port.pass_fd(listener.as_raw_fd()).unwrap();

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let fd = recv_fd(&peer).unwrap();
        assert!(fd >= 0);

        // The duplicated descriptor refers to the same listening socket.
        let received = unsafe {
            use std::os::unix::io::FromRawFd;
            std::net::TcpListener::from_raw_fd(fd)
        };
        assert_eq!(received.local_addr().unwrap(), expected_addr);
    }
}
