use crate::logging::{self, Logger};
use crate::{DEFAULT_PORT, DEFAULT_PROXY_PORT};
use mio::net::TcpListener;
use net2::TcpBuilder;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::thread;
use std::time::Duration;

/// Larger than SOMAXCONN; honoured where the system configuration allows.
pub const LISTEN_BACKLOG: i32 = 8192;

const BIND_ATTEMPTS: usize = 25;
const BIND_RETRY_PAUSE: Duration = Duration::from_secs(5);

fn resolve(url: &str) -> io::Result<SocketAddr> {
    url.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address for {}", url),
        )
    })
}

fn bind(addr: &SocketAddr) -> io::Result<std::net::TcpListener> {
    let builder = match addr {
        SocketAddr::V4(_) => TcpBuilder::new_v4()?,
        SocketAddr::V6(_) => TcpBuilder::new_v6()?,
    };
    builder.reuse_address(true)?;
    builder.bind(addr)?;
    builder.listen(LISTEN_BACKLOG)
}

/// A busy port usually belongs to an instance on its way out, so keep
/// trying for a couple of minutes before giving up.
fn bind_retry(addr: &SocketAddr, log: &Logger) -> io::Result<std::net::TcpListener> {
    let mut attempts = 0;
    loop {
        match bind(addr) {
            Ok(listener) => {
                if attempts > 0 {
                    logging::warn!(log, "successfully bound to socket"; "address" => %addr);
                }
                return Ok(listener);
            }
            Err(err) => {
                attempts += 1;
                if attempts >= BIND_ATTEMPTS {
                    logging::error!(log, "failed to bind to socket, giving up";
                                    "address" => %addr,
                                    "error" => %err);
                    return Err(err);
                }
                logging::warn!(log, "failed to bind to socket, retrying in 5s";
                               "address" => %addr);
                thread::sleep(BIND_RETRY_PAUSE);
            }
        }
    }
}

fn into_poll_listener(listener: std::net::TcpListener) -> io::Result<TcpListener> {
    listener.set_nonblocking(true)?;
    Ok(unsafe { TcpListener::from_raw_fd(listener.into_raw_fd()) })
}

/// Opens the configured listening sockets. With no server URLs a single
/// wildcard socket is bound on the default (or proxy) port. Listener sockets
/// inherited from a previous instance are reused only when their bound
/// address still matches the configuration.
pub fn open_listeners(
    urls: &[String],
    inherited: Vec<Option<std::net::TcpListener>>,
    proxy: bool,
    log: &Logger,
) -> io::Result<Vec<TcpListener>> {
    if urls.is_empty() {
        let port = if proxy { DEFAULT_PROXY_PORT } else { DEFAULT_PORT };
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = bind_retry(&addr, log)?;
        return Ok(vec![into_poll_listener(listener)?]);
    }

    let mut handed = inherited;
    handed.resize_with(urls.len(), || None);

    let mut listeners = Vec::with_capacity(urls.len());
    for (index, url) in urls.iter().enumerate() {
        let addr = resolve(url)?;

        let listener = match handed[index].take() {
            Some(old) => match old.local_addr() {
                Ok(old_addr) if old_addr == addr => {
                    logging::info!(log, "reusing inherited listener"; "address" => %addr);
                    old
                }
                old_addr => {
                    logging::warn!(log, "inherited socket does not match config, creating new socket";
                                   "inherited" => ?old_addr,
                                   "configured" => %addr);
                    bind_retry(&addr, log)?
                }
            },
            None => bind_retry(&addr, log)?,
        };

        listeners.push(into_poll_listener(listener)?);
    }

    Ok(listeners)
}
