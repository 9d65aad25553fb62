use crate::logging::{self, Logger};
use crate::net::client::{Client, ClientRef};
use indexmap::IndexMap;
use mio::Poll;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Concurrent store of client records. Live records are reachable by id;
/// tombstoned records sit on the dead list until the last handle drops, then
/// their allocation moves to the recycled list. Memory is never freed for
/// the lifetime of the table.
///
/// The single write lock also covers poller registration transitions, so no
/// reader can ever resolve a record whose fd is being reclaimed.
pub struct ClientTable {
    poll: Arc<Poll>,
    inner: RwLock<TableInner>,
    log: Logger,
}

struct TableInner {
    live: IndexMap<u64, ClientRef>,
    dead: Vec<ClientRef>,
    recycled: Vec<ClientRef>,
    next_id: u64,
    accepted: u64,
    generated: u64,
    dead_generated: u64,
}

/// Point-in-time counters for the stats document.
pub struct TableStats {
    pub live: usize,
    pub live_capacity: usize,
    pub dead: usize,
    pub accepted: u64,
    pub generated: u64,
    pub dead_generated: u64,
}

impl TableStats {
    /// Hash overhead plus the record allocations behind the live map.
    pub fn live_memory(&self) -> usize {
        self.live_capacity * mem::size_of::<(u64, ClientRef)>()
            + self.live * mem::size_of::<Client>()
    }

    pub fn dead_memory(&self) -> usize {
        self.dead * mem::size_of::<Client>()
    }
}

impl ClientTable {
    /// `first_id` is the listener count: poller tokens below it denote
    /// listeners, so client ids must start there.
    pub fn new(poll: Arc<Poll>, first_id: u64) -> ClientTable {
        ClientTable {
            poll,
            inner: RwLock::new(TableInner {
                live: IndexMap::new(),
                dead: Vec::new(),
                recycled: Vec::new(),
                next_id: first_id,
                accepted: 0,
                generated: 0,
                dead_generated: 0,
            }),
            log: logging::discard(),
        }
    }

    pub fn with_logger(mut self, log: &Logger) -> ClientTable {
        self.log = log.new(logging::o!("unit" => "table"));
        self
    }

    fn read(&self) -> RwLockReadGuard<TableInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<TableInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a zeroed record off the recycled list, allocating a fresh one
    /// only when none is available for reuse.
    pub fn recruit(&self) -> ClientRef {
        let recycled = {
            let mut inner = self.write();
            match inner.recycled.pop() {
                Some(client) => Some(client),
                None => {
                    inner.generated += 1;
                    None
                }
            }
        };

        match recycled {
            Some(client) => {
                logging::debug!(self.log, "recycled client record");
                client
            }
            None => {
                logging::debug!(self.log, "created new client record");
                Arc::new(Client::new())
            }
        }
    }

    /// Assigns the next id and makes the record reachable. The returned id is
    /// also the poller token the caller registers the socket under; the live
    /// map's own handle stands for that registration.
    pub fn insert(&self, client: &mut ClientRef) -> u64 {
        let mut inner = self.write();
        let id = inner.next_id;
        inner.next_id += 1;

        Arc::get_mut(client)
            .expect("client record must be unshared at insert")
            .id = id;

        inner.live.insert(id, Arc::clone(client));
        inner.accepted += 1;

        id
    }

    pub fn live_count(&self) -> usize {
        self.read().live.len()
    }

    /// Resolves a live record into a new strong handle. Invalid records are
    /// unreachable from the moment they are tombstoned.
    pub fn ref_by_id(&self, id: u64) -> Option<ClientRef> {
        self.read()
            .live
            .get(&id)
            .filter(|client| !client.is_invalid())
            .cloned()
    }

    /// Tombstones a record: removes it from the live map, deregisters the
    /// socket and parks the record on the dead list, all in one critical
    /// section. Returns the snapshot fd, or `None` when already invalid.
    pub fn invalidate(&self, client: &ClientRef) -> Option<RawFd> {
        let mut inner = self.write();

        if client.invalid.load(Ordering::Relaxed) {
            return None;
        }
        client.invalid.store(true, Ordering::Relaxed);

        let fd = client.fd();
        if let Some(stream) = client.stream.as_ref() {
            // Deregistration of a never-registered stream is harmless.
            let _ = self.poll.deregister(stream);
        }

        if let Some(live_handle) = inner.live.shift_remove(&client.id) {
            inner.dead.push(live_handle);
            inner.dead_generated += 1;
        }

        fd
    }

    /// Culls dead records whose last handle is the dead list itself: the
    /// socket is closed (linger off) and the zeroed allocation is pushed to
    /// the recycled list. Records with outstanding handles stay put so their
    /// fd number cannot be reused under a live reference.
    pub fn sweep_dead(&self) {
        let mut inner = self.write();
        let mut i = 0;

        while i < inner.dead.len() {
            if Arc::strong_count(&inner.dead[i]) > 1 {
                i += 1;
                continue;
            }

            let mut handle = inner.dead.swap_remove(i);
            match Arc::get_mut(&mut handle) {
                Some(client) => {
                    logging::info!(self.log, "recycling client"; "client_id" => client.id);
                    client.reset();
                    inner.recycled.push(handle);
                }
                None => {
                    // Raced with a clone we cannot see; keep it dead.
                    inner.dead.push(handle);
                    i += 1;
                }
            }
        }
    }

    pub fn stats(&self) -> TableStats {
        let inner = self.read();
        TableStats {
            live: inner.live.len(),
            live_capacity: inner.live.capacity(),
            dead: inner.dead.len(),
            accepted: inner.accepted,
            generated: inner.generated,
            dead_generated: inner.dead_generated,
        }
    }
}
