use crate::identity::ClientId;
use crate::logging::{self, LevelHandle, Logger};
use crate::net::client::ClientRef;
use crate::net::sender::{PendingSend, SenderShared};
use crate::net::sink::{generator_term, stratifier_drop, Sink};
use crate::net::table::ClientTable;
use mio::Poll;
use serde_json::{json, Value};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub struct HubConfig {
    /// Number of listening sockets. Client ids start here so poller tokens
    /// below it unambiguously denote listeners.
    pub listeners: usize,
    /// Raw fds of the listening sockets, for `getxfd` handover.
    pub server_fds: Vec<RawFd>,
    /// Refuse new connections beyond this count. Zero means unbounded.
    pub max_clients: usize,
    /// Whole-process passthrough: all inbound frames go to the generator.
    pub passthrough: bool,
}

/// State shared by the receiver, sender and control threads.
pub struct Hub {
    pub(crate) poll: Arc<Poll>,
    pub(crate) table: ClientTable,
    pub(crate) sender: SenderShared,
    pub(crate) stratifier: Arc<dyn Sink>,
    pub(crate) generator: Arc<dyn Sink>,
    pub(crate) accept: AtomicBool,
    pub(crate) running: AtomicBool,
    pub(crate) passthrough: bool,
    pub(crate) max_clients: usize,
    pub(crate) listeners: usize,
    pub(crate) server_fds: Vec<RawFd>,
    pub(crate) start: Instant,
    pub(crate) level: LevelHandle,
    pub(crate) log: Logger,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        poll: Arc<Poll>,
        stratifier: Arc<dyn Sink>,
        generator: Arc<dyn Sink>,
        level: LevelHandle,
        log: Logger,
    ) -> Arc<Hub> {
        let table = ClientTable::new(Arc::clone(&poll), config.listeners as u64).with_logger(&log);

        Arc::new(Hub {
            poll,
            table,
            sender: SenderShared::new(),
            stratifier,
            generator,
            accept: AtomicBool::new(false),
            running: AtomicBool::new(true),
            passthrough: config.passthrough,
            max_clients: config.max_clients,
            listeners: config.listeners,
            server_fds: config.server_fds,
            start: Instant::now(),
            level,
            log,
        })
    }

    #[inline]
    pub fn accepting(&self) -> bool {
        self.accept.load(Ordering::Relaxed)
    }

    pub fn set_accepting(&self, accept: bool) {
        self.accept.store(accept, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops the worker loops. The sender is woken so it notices promptly.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.sender.wake();
    }

    pub fn table(&self) -> &ClientTable {
        &self.table
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    /// Tombstones the client and tells the consumer that owned it. Direct
    /// clients are reported to the stratifier; in whole-process passthrough
    /// mode the upstream pool gets a termination notice instead. A
    /// passthrough parent dropped in normal mode needs no notice: its
    /// sub-clients are torn down upstream. Only the first invalidation
    /// notifies; dead records whose references are gone are culled here.
    pub fn invalidate_client(&self, client: &ClientRef) -> Option<RawFd> {
        let fd = self.table.invalidate(client);

        if fd.is_some() {
            logging::info!(self.log, "dropped client";
                           "client_id" => client.id(),
                           "fd" => fd);

            if self.passthrough {
                self.generator.deliver(&generator_term(
                    client.id(),
                    &client.address_name,
                    client.server,
                ));
            } else if !client.is_passthrough() {
                self.stratifier.deliver(&stratifier_drop(client.id()));
            }
        }

        self.table.sweep_dead();
        fd
    }

    /// Queues an outbound frame. Sub-client ids route to their passthrough
    /// parent; unresolvable ids bounce back to the stratifier as a drop so
    /// it stops submitting for them.
    pub fn send_client(&self, id: u64, buf: String) {
        if buf.is_empty() {
            logging::warn!(self.log, "discarding empty outbound buffer"; "client_id" => id);
            return;
        }

        let cid = ClientId(id);
        let client = if cid.is_sub() {
            let (parent, sub) = cid.split();
            match self.table.ref_by_id(parent) {
                Some(parent) => parent,
                None => {
                    logging::info!(self.log, "no passthrough for sub-client send";
                                   "passthrough_id" => parent,
                                   "client_id" => sub);
                    // The parent is gone. If the low half names a live direct
                    // client it is stale state worth dropping; otherwise the
                    // stratifier is told to forget the whole encoded id.
                    match self.table.ref_by_id(sub) {
                        Some(direct) => {
                            self.invalidate_client(&direct);
                        }
                        None => self.stratifier.deliver(&stratifier_drop(id)),
                    }
                    return;
                }
            }
        } else {
            match self.table.ref_by_id(id) {
                Some(client) => client,
                None => {
                    logging::info!(self.log, "no client for send"; "client_id" => id);
                    self.stratifier.deliver(&stratifier_drop(id));
                    return;
                }
            }
        };

        self.sender.submit(PendingSend::new(client, buf.into_bytes()));
    }

    /// Stats document: `clients`, `dead`, `sends`, `delays`, each
    /// `{count, memory, generated}`; `runtime` leads in periodic reports.
    pub fn stats(&self, runtime: Option<u64>) -> Value {
        let mut doc = serde_json::Map::new();

        if let Some(secs) = runtime {
            doc.insert("runtime".to_string(), json!(secs));
        }

        let table = self.table.stats();
        doc.insert(
            "clients".to_string(),
            json!({
                "count": table.live,
                "memory": table.live_memory(),
                "generated": table.generated
            }),
        );
        doc.insert(
            "dead".to_string(),
            json!({
                "count": table.dead,
                "memory": table.dead_memory(),
                "generated": table.dead_generated
            }),
        );

        let sends = self.sender.stats();
        doc.insert(
            "sends".to_string(),
            json!({
                "count": sends.submitted,
                "memory": sends.submitted_bytes,
                "generated": sends.generated
            }),
        );
        doc.insert(
            "delays".to_string(),
            json!({
                "count": sends.queued,
                "memory": sends.queued_bytes,
                "generated": sends.delayed
            }),
        );

        Value::Object(doc)
    }
}
