use crate::identity::ClientId;
use crate::logging::{self, Logger};
use crate::net::client::{ClientRef, RecvBuffer};
use crate::net::hub::Hub;
use crate::net::support::{ErrorType, NetError, NetResult};
use mio::event::Event;
use mio::net::TcpListener;
use mio::unix::UnixReady;
use mio::{Events, PollOpt, Ready, Token};
use serde_json::{json, Value};
use std::io;
use std::sync::{Arc, PoisonError};
use std::thread;
use std::time::Duration;

/// Receiver thread: owns the accept and inbound-read side of the poller.
/// Listeners occupy tokens `0..N`; everything above is a client id.
pub struct Receiver {
    hub: Arc<Hub>,
    listeners: Vec<TcpListener>,
    events: Events,
    log: Logger,
}

impl Receiver {
    const POLL_TIMEOUT: Duration = Duration::from_secs(1);
    const PRESTART_PAUSE: Duration = Duration::from_millis(1);
    const REJECT_PAUSE: Duration = Duration::from_millis(10);
    const EVENT_CAPACITY: usize = 8192;
    const KEEPALIVE: Duration = Duration::from_secs(60);

    pub fn new(hub: Arc<Hub>, listeners: Vec<TcpListener>) -> io::Result<Receiver> {
        let log = hub.log.new(logging::o!("thread" => "receiver"));

        for (index, listener) in listeners.iter().enumerate() {
            hub.poll
                .register(listener, Token(index), Ready::readable(), PollOpt::level())?;
        }

        Ok(Receiver {
            hub,
            listeners,
            events: Events::with_capacity(Self::EVENT_CAPACITY),
            log,
        })
    }

    /// Event loop. Returns an error only for poller-level catastrophes,
    /// which the caller escalates to process shutdown.
    pub fn run(mut self) -> NetResult<()> {
        while self.hub.is_running() && !self.hub.accepting() {
            thread::sleep(Self::PRESTART_PAUSE);
        }

        while self.hub.is_running() {
            while self.hub.is_running() && !self.hub.accepting() {
                thread::sleep(Self::REJECT_PAUSE);
            }

            let count = self
                .hub
                .poll
                .poll(&mut self.events, Some(Self::POLL_TIMEOUT))
                .map_err(|err| NetError::Fatal(ErrorType::Poller(err)))?;
            if count == 0 {
                continue;
            }

            for event in &self.events {
                self.dispatch(event)?;
            }
        }

        Ok(())
    }

    fn dispatch(&self, event: Event) -> NetResult<()> {
        let token = event.token();

        if token.0 < self.listeners.len() {
            return self.accept_client(token.0);
        }

        let id = token.0 as u64;
        let client = match self.hub.table.ref_by_id(id) {
            Some(client) => client,
            None => {
                logging::warn!(self.log, "event for unknown client"; "client_id" => id);
                return Ok(());
            }
        };

        let readiness = UnixReady::from(event.readiness());

        if client.is_invalid() {
            return Ok(());
        }

        // A readable event can arrive together with a hang-up; drain the
        // message bytes first.
        if readiness.is_readable() {
            self.parse_client(&client);
        }
        if client.is_invalid() {
            return Ok(());
        }

        if readiness.is_error() {
            let error = client
                .stream
                .as_ref()
                .and_then(|stream| stream.take_error().ok())
                .and_then(|err| err);

            // Connection resets are routine; anything else deserves noise.
            match error {
                Some(ref err) if err.kind() == io::ErrorKind::ConnectionReset => {
                    logging::info!(self.log, "client connection reset";
                                   "client_id" => client.id());
                }
                error => {
                    logging::warn!(self.log, "client socket error";
                                   "client_id" => client.id(),
                                   "error" => ?error);
                }
            }
            self.hub.invalidate_client(&client);
        } else if readiness.is_hup() {
            logging::info!(self.log, "client hung up"; "client_id" => client.id());
            self.hub.invalidate_client(&client);
        }

        Ok(())
    }

    /// Accept path. When the fleet is at capacity the connection is left in
    /// the kernel queue; the level-triggered listener event retries it.
    fn accept_client(&self, index: usize) -> NetResult<()> {
        let live = self.hub.table.live_count();
        if self.hub.max_clients > 0 && live >= self.hub.max_clients {
            logging::warn!(self.log, "server full"; "clients" => live);
            return Ok(());
        }

        let (stream, address) = match self.listeners[index].accept() {
            Ok(accepted) => accepted,
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::ConnectionAborted =>
            {
                return Ok(());
            }
            Err(err) => {
                logging::error!(self.log, "accept failed"; "server" => index, "error" => %err);
                return Err(NetError::Fatal(ErrorType::Io(err)));
            }
        };

        if let Err(err) = stream.set_keepalive(Some(Self::KEEPALIVE)) {
            logging::warn!(self.log, "failed to enable keepalive"; "error" => %err);
        }

        let mut client = self.hub.table.recruit();
        Arc::get_mut(&mut client)
            .expect("recruited record must be unshared")
            .populate(stream, address, index);

        let id = self.hub.table.insert(&mut client);

        let interest = Ready::readable() | Ready::from(UnixReady::hup());
        if let Some(stream) = client.stream.as_ref() {
            if let Err(err) =
                self.hub
                    .poll
                    .register(stream, Token(id as usize), interest, PollOpt::level())
            {
                logging::error!(self.log, "failed to register client socket";
                                "client_id" => id,
                                "error" => %err);
                self.hub.invalidate_client(&client);
                return Ok(());
            }
        }

        logging::info!(self.log, "connected new client";
                       "client_id" => id,
                       "fd" => client.fd(),
                       "active" => live,
                       "address" => %client.address_name,
                       "server" => index);

        Ok(())
    }

    /// Inbound path: drain the socket, extract newline-framed records, tag
    /// and forward each one. A would-block leaves buffered state in place;
    /// any fatal reason drops the client here.
    fn parse_client(&self, client: &ClientRef) {
        let mut rx = client
            .recv
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Err(err) = self.drain_frames(client, &mut *rx) {
            if !err.is_wait() {
                logging::info!(self.log, "dropping client";
                               "client_id" => client.id(),
                               "reason" => %err);
                self.hub.invalidate_client(client);
            }
        }
    }

    fn drain_frames(&self, client: &ClientRef, rx: &mut RecvBuffer) -> NetResult<()> {
        loop {
            if client.is_invalid() {
                return Ok(());
            }

            if rx.overflowed() {
                return Err(NetError::Fatal(ErrorType::Overflow));
            }

            let count = {
                let stream = match client.stream.as_ref() {
                    Some(stream) => stream,
                    None => return Ok(()),
                };
                rx.fill(&mut &*stream)?
            };
            if count == 0 {
                return Err(NetError::Wait);
            }

            while let Some(frame) = rx.take_frame()? {
                self.handle_frame(client, &frame)?;
            }
        }
    }

    /// Parses, tags and forwards one record.
    fn handle_frame(&self, client: &ClientRef, frame: &[u8]) -> NetResult<()> {
        let mut val = match serde_json::from_slice::<Value>(frame) {
            Ok(val) => val,
            Err(_) => {
                // Queue the final notice before the tombstone; the sender
                // discards it if the drop wins the race.
                self.hub
                    .send_client(client.id(), "Invalid JSON, disconnecting\n".to_string());
                return Err(NetError::Fatal(ErrorType::InvalidJson));
            }
        };

        decorate(&mut val, client);

        // Frames of clients dropped in the meantime are not forwarded. The
        // unlocked check can race a fresh tombstone; the consumer filters
        // the occasional leftover.
        if !client.is_invalid() {
            let text = val.to_string();
            if self.hub.passthrough {
                self.hub.generator.deliver(&text);
            } else {
                self.hub.stratifier.deliver(&text);
            }
        }

        Ok(())
    }
}

/// Identity tagging. A passthrough's embedded sub-id is folded into the
/// connection id; direct clients get their id and printable address. The
/// originating listener index always rides along. Non-object frames pass
/// through untagged.
fn decorate(val: &mut Value, client: &ClientRef) {
    let map = match val.as_object_mut() {
        Some(map) => map,
        None => return,
    };

    if client.is_passthrough() {
        let sub = map
            .remove("client_id")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        map.insert(
            "client_id".to_string(),
            json!(ClientId::wrap(client.id(), sub).0),
        );
    } else {
        map.insert("client_id".to_string(), json!(client.id()));
        map.insert("address".to_string(), json!(client.address_name));
    }
    map.insert("server".to_string(), json!(client.server));
}
