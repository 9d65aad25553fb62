use manifold::logging::{self, Logger};
use manifold::net::sink::Sink;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;

/// Forwards frames to a consumer process over a unix datagram socket.
/// Delivery is fire-and-forget; a missing consumer only costs a log line.
pub struct UnixSink {
    path: PathBuf,
    socket: UnixDatagram,
    log: Logger,
}

impl UnixSink {
    pub fn new(path: &str, name: &'static str, log: &Logger) -> std::io::Result<UnixSink> {
        Ok(UnixSink {
            path: PathBuf::from(path),
            socket: UnixDatagram::unbound()?,
            log: log.new(logging::o!("sink" => name)),
        })
    }
}

impl Sink for UnixSink {
    fn deliver(&self, msg: &str) {
        if let Err(err) = self.socket.send_to(msg.as_bytes(), &self.path) {
            logging::warn!(self.log, "failed to deliver frame"; "error" => %err);
        }
    }
}

/// Stand-in consumer for setups running without one; frames surface in the
/// log at debug level.
pub struct LogSink {
    log: Logger,
}

impl LogSink {
    pub fn new(name: &'static str, log: &Logger) -> LogSink {
        LogSink {
            log: log.new(logging::o!("sink" => name)),
        }
    }
}

impl Sink for LogSink {
    fn deliver(&self, msg: &str) {
        logging::debug!(self.log, "frame"; "msg" => msg);
    }
}
