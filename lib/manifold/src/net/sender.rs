use crate::logging::{self, Logger};
use crate::net::client::ClientRef;
use crate::net::hub::Hub;
use std::io::{self, Write};
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Outbound buffer in flight: the bytes, the write cursor and a handle
/// pinning the target record until the send completes or the target dies.
pub struct PendingSend {
    client: ClientRef,
    buf: Vec<u8>,
    ofs: usize,
}

pub(crate) enum PushOutcome {
    /// Everything written.
    Complete,
    /// Out of socket buffer; retry on the next tick.
    Blocked,
    /// Hard socket error.
    Failed(io::Error),
}

impl PendingSend {
    pub fn new(client: ClientRef, buf: Vec<u8>) -> PendingSend {
        PendingSend { client, buf, ofs: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.ofs
    }

    /// Writes as much of the remaining buffer as the writer takes, advancing
    /// the cursor. A zero-length write counts as blocked, not progress.
    pub(crate) fn push_bytes<W: Write>(&mut self, writer: &mut W) -> PushOutcome {
        while self.ofs < self.buf.len() {
            match writer.write(&self.buf[self.ofs..]) {
                Ok(0) => return PushOutcome::Blocked,
                Ok(count) => self.ofs += count,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return PushOutcome::Blocked
                }
                Err(err) => return PushOutcome::Failed(err),
            }
        }
        PushOutcome::Complete
    }
}

/// Submission side of the sender: any thread may queue a pending send; the
/// sender thread splices the queue onto its private working list. The
/// condition variable bounds wake-up latency; the periodic timeout keeps
/// partial-write retries moving with no new submissions.
pub struct SenderShared {
    queue: Mutex<SendQueue>,
    cond: Condvar,
}

struct SendQueue {
    pending: Vec<PendingSend>,
    generated: u64,
    delayed: u64,
    queued: u64,
    queued_bytes: u64,
}

/// Counters for the stats document.
pub struct SenderStats {
    pub submitted: usize,
    pub submitted_bytes: usize,
    pub generated: u64,
    pub queued: u64,
    pub queued_bytes: u64,
    pub delayed: u64,
}

impl SenderShared {
    pub fn new() -> SenderShared {
        SenderShared {
            queue: Mutex::new(SendQueue {
                pending: Vec::new(),
                generated: 0,
                delayed: 0,
                queued: 0,
                queued_bytes: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<SendQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn submit(&self, send: PendingSend) {
        let mut queue = self.lock();
        queue.generated += 1;
        queue.pending.push(send);
        self.cond.notify_one();
    }

    pub(crate) fn wake(&self) {
        self.cond.notify_one();
    }

    pub(crate) fn stats(&self) -> SenderStats {
        let queue = self.lock();
        let submitted_bytes = queue
            .pending
            .iter()
            .map(|send| mem::size_of::<PendingSend>() + send.remaining())
            .sum();

        SenderStats {
            submitted: queue.pending.len(),
            submitted_bytes,
            generated: queue.generated,
            queued: queue.queued,
            queued_bytes: queue.queued_bytes,
            delayed: queue.delayed,
        }
    }
}

/// Attempts one pending send. True means the entry is finished with, either
/// written out in full or abandoned because the target died.
fn send_one(hub: &Hub, log: &Logger, send: &mut PendingSend) -> bool {
    let client = Arc::clone(&send.client);

    if client.is_invalid() {
        return true;
    }

    let stream = match client.stream.as_ref() {
        Some(stream) => stream,
        None => return true,
    };

    match send.push_bytes(&mut &*stream) {
        PushOutcome::Complete => true,
        PushOutcome::Blocked => false,
        PushOutcome::Failed(err) => {
            logging::info!(log, "client disconnected on write";
                           "client_id" => client.id(),
                           "error" => %err);
            hub.invalidate_client(&client);
            true
        }
    }
}

/// Sender thread body: drain the working list with non-blocking writes so a
/// stalled client never holds up the fleet, then pick up new submissions.
pub fn run(hub: Arc<Hub>) {
    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    let log = hub.log.new(logging::o!("thread" => "sender"));
    let mut sends: Vec<PendingSend> = Vec::new();

    loop {
        let mut queued = 0u64;
        let mut queued_bytes = 0u64;

        // Finished or dead entries unlink in place; order within the list is
        // per-client submission order and must be preserved.
        let mut i = 0;
        while i < sends.len() {
            if send_one(&hub, &log, &mut sends[i]) {
                sends.remove(i);
            } else {
                queued += 1;
                queued_bytes +=
                    (mem::size_of::<PendingSend>() + sends[i].remaining()) as u64;
                i += 1;
            }
        }

        let mut queue = hub.sender.lock();
        queue.delayed += queued;
        queue.queued = queued;
        queue.queued_bytes = queued_bytes;

        if queue.pending.is_empty() {
            if !hub.is_running() && sends.is_empty() {
                // Orderly exit: nothing queued, nothing in flight.
                return;
            }
            let (guard, _timeout) = hub
                .sender
                .cond
                .wait_timeout(queue, POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }

        sends.append(&mut queue.pending);
    }
}
