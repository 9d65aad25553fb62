use crate::logging::{self, LevelHandle, Level};
use crate::net::client::ClientRef;
use crate::net::hub::{Hub, HubConfig};
use crate::net::sink::testing::RecordingSink;
use mio::net::TcpStream;
use mio::Poll;
use std::net;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connected localhost pair: the server end wrapped for the poller, the peer
/// end left blocking for test writes.
pub(crate) fn tcp_pair() -> (TcpStream, net::TcpStream) {
    let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = net::TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();

    (TcpStream::from_stream(server).unwrap(), peer)
}

/// Hub wired to recording sinks, ids starting at `listeners`.
pub(crate) fn test_hub(
    listeners: usize,
    passthrough: bool,
) -> (Arc<Hub>, Arc<RecordingSink>, Arc<RecordingSink>) {
    let stratifier = RecordingSink::new();
    let generator = RecordingSink::new();

    let strat_dyn: Arc<dyn crate::net::sink::Sink> = stratifier.clone();
    let gener_dyn: Arc<dyn crate::net::sink::Sink> = generator.clone();

    let hub = Hub::new(
        HubConfig {
            listeners,
            server_fds: Vec::new(),
            max_clients: 0,
            passthrough,
        },
        Arc::new(Poll::new().unwrap()),
        strat_dyn,
        gener_dyn,
        LevelHandle::new(Level::Info),
        logging::discard(),
    );

    (hub, stratifier, generator)
}

/// Connects a localhost socket and inserts it as a live client, bypassing
/// the receiver. Returns the record and the peer end.
pub(crate) fn attach_client(hub: &Hub) -> (ClientRef, net::TcpStream) {
    let (server, peer) = tcp_pair();
    let addr = peer.local_addr().unwrap();
    let mut client = hub.table().recruit();

    Arc::get_mut(&mut client)
        .unwrap()
        .populate(server, addr, 0);
    hub.table().insert(&mut client);

    (client, peer)
}

/// Polls `cond` until it holds or the timeout expires.
pub(crate) fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
