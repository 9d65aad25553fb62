use std::fmt;
use std::io;

pub type NetResult<T> = Result<T, NetError>;

/// Reason a transfer or a client went down for good.
#[derive(Debug)]
pub enum ErrorType {
    /// Hard socket error.
    Io(io::Error),
    /// Buffer filled past the message limit with no terminating newline.
    Overflow,
    /// A single framed record exceeded the message limit.
    OversizedFrame,
    /// The record was not parseable JSON.
    InvalidJson,
    /// The poller itself failed; escalates to process shutdown.
    Poller(io::Error),
}

/// Transfer outcome plumbing. `Wait` means the operation could not make
/// progress and should be retried on the next readiness; `Fatal` takes the
/// client (or the process, for poller errors) down.
#[derive(Debug)]
pub enum NetError {
    Wait,
    Fatal(ErrorType),
}

impl NetError {
    #[inline]
    pub fn is_wait(&self) -> bool {
        matches!(self, NetError::Wait)
    }
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(err: io::Error) -> NetError {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            _ => NetError::Fatal(ErrorType::Io(err)),
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetError::Wait => write!(f, "would block"),
            NetError::Fatal(ErrorType::Io(err)) => write!(f, "io error: {}", err),
            NetError::Fatal(ErrorType::Overflow) => write!(f, "receive buffer overflow"),
            NetError::Fatal(ErrorType::OversizedFrame) => write!(f, "oversized frame"),
            NetError::Fatal(ErrorType::InvalidJson) => write!(f, "invalid json"),
            NetError::Fatal(ErrorType::Poller(err)) => write!(f, "poller failure: {}", err),
        }
    }
}

impl std::error::Error for NetError {}
