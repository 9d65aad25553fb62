use crate::identity::ClientId;
use crate::logging::{self, Logger};
use crate::net::hub::Hub;
use serde_json::{json, Value};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reply side of a single control exchange.
pub trait Responder: Send {
    fn reply(&mut self, msg: &str) -> io::Result<()>;
    /// Hands a file descriptor across the channel.
    fn pass_fd(&mut self, fd: RawFd) -> io::Result<()>;
}

pub struct ControlMessage {
    pub text: String,
    pub port: Box<dyn Responder>,
}

/// Command transport. The engine never sees the socket underneath, only the
/// textual commands and a way to answer them.
pub trait CommandSource {
    /// Waits up to `timeout` for the next command. `Ok(None)` on a quiet
    /// interval so the caller can run its periodic work.
    fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Option<ControlMessage>>;
}

const RECV_TIMEOUT: Duration = Duration::from_secs(1);
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Control loop: routes outbound frames and administrative commands until
/// `shutdown` arrives or the transport dies. In whole-process passthrough
/// mode a stats document is logged once a minute.
pub fn run<S: CommandSource>(hub: &Arc<Hub>, source: &mut S) {
    let log = hub.log.new(logging::o!("thread" => "control"));
    let mut last_stats = Instant::now();

    logging::info!(log, "control loop ready");

    while hub.is_running() {
        if hub.passthrough && last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            let doc = hub.stats(Some(hub.uptime_secs()));
            logging::info!(log, "passthrough stats"; "stats" => %doc);
        }

        let msg = match source.recv_timeout(RECV_TIMEOUT) {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(err) => {
                logging::error!(log, "control transport failed"; "error" => %err);
                break;
            }
        };

        logging::debug!(log, "received control message"; "text" => %msg.text);

        if !dispatch(hub, &log, msg) {
            break;
        }
    }
}

/// Handles one command. False ends the loop.
fn dispatch(hub: &Arc<Hub>, log: &Logger, mut msg: ControlMessage) -> bool {
    let text = msg.text.trim();

    if text.starts_with('{') {
        process_outbound(hub, log, text);
    } else if let Some(rest) = text.strip_prefix("dropclient=") {
        drop_client(hub, log, rest);
    } else if let Some(rest) = text.strip_prefix("passthrough=") {
        mark_passthrough(hub, log, rest);
    } else if text == "ping" {
        if let Err(err) = msg.port.reply("pong") {
            logging::warn!(log, "failed to answer ping"; "error" => %err);
        }
    } else if text == "accept" {
        logging::debug!(log, "received accept signal");
        hub.set_accepting(true);
    } else if text == "reject" {
        logging::debug!(log, "received reject signal");
        hub.set_accepting(false);
    } else if text == "stats" {
        let doc = hub.stats(None);
        logging::info!(log, "stats requested"; "stats" => %doc);
        if let Err(err) = msg.port.reply(&doc.to_string()) {
            logging::warn!(log, "failed to answer stats"; "error" => %err);
        }
    } else if let Some(rest) = text.strip_prefix("loglevel=") {
        match rest.trim().parse::<u32>() {
            Ok(level) => hub.level.set_syslog(level),
            Err(_) => logging::debug!(log, "failed to parse loglevel command"; "text" => text),
        }
    } else if let Some(rest) = text.strip_prefix("getxfd") {
        if let Ok(index) = rest.trim().parse::<usize>() {
            if let Some(&fd) = hub.server_fds.get(index) {
                if let Err(err) = msg.port.pass_fd(fd) {
                    logging::warn!(log, "failed to pass listener fd"; "error" => %err);
                }
            }
        }
    } else if text == "shutdown" {
        logging::info!(log, "shutting down");
        hub.shutdown();
        return false;
    } else {
        logging::warn!(log, "unhandled control message"; "text" => text);
    }

    true
}

/// Consumer-originated frame on its way to a client. The sub-id of a
/// passthrough client is narrowed to its low half so the downstream pool
/// sees only its own ids; routing still uses the full encoded id.
fn process_outbound(hub: &Arc<Hub>, log: &Logger, text: &str) {
    let mut val: Value = match serde_json::from_str(text) {
        Ok(val) => val,
        Err(_) => {
            logging::warn!(log, "invalid json control message"; "text" => text);
            return;
        }
    };

    let id = val.get("client_id").and_then(Value::as_u64).unwrap_or(0);

    if let Some(map) = val.as_object_mut() {
        map.remove("client_id");
        let cid = ClientId(id);
        if cid.is_sub() {
            map.insert("client_id".to_string(), json!(cid.sub()));
        }
    }

    let mut out = val.to_string();
    out.push('\n');
    hub.send_client(id, out);
}

fn drop_client(hub: &Arc<Hub>, log: &Logger, rest: &str) {
    let id = match rest.trim().parse::<u64>() {
        Ok(id) => id,
        Err(_) => {
            logging::debug!(log, "failed to parse dropclient command"; "text" => rest);
            return;
        }
    };

    // Sub-clients are managed by their passthrough, not from here.
    if ClientId(id).is_sub() {
        return;
    }

    match hub.table().ref_by_id(id) {
        Some(client) => {
            if hub.invalidate_client(&client).is_some() {
                logging::info!(log, "dropped client by command"; "client_id" => id);
            }
        }
        None => {
            logging::info!(log, "no client to drop"; "client_id" => id);
        }
    }
}

fn mark_passthrough(hub: &Arc<Hub>, log: &Logger, rest: &str) {
    let id = match rest.trim().parse::<u64>() {
        Ok(id) => id,
        Err(_) => {
            logging::debug!(log, "failed to parse passthrough command"; "text" => rest);
            return;
        }
    };

    match hub.table().ref_by_id(id) {
        Some(client) => {
            logging::info!(log, "adding passthrough client"; "client_id" => id);
            client.set_passthrough();
            hub.send_client(id, "{\"result\": true}\n".to_string());
        }
        None => {
            logging::info!(log, "no client to pass through"; "client_id" => id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::sender;
    use crate::testutil::{attach_client, test_hub};
    use std::collections::VecDeque;
    use std::io::{BufRead, BufReader};
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[derive(Clone, Default)]
    struct Recorder {
        replies: Arc<Mutex<Vec<String>>>,
        fds: Arc<Mutex<Vec<RawFd>>>,
    }

    impl Responder for Recorder {
        fn reply(&mut self, msg: &str) -> io::Result<()> {
            self.replies.lock().unwrap().push(msg.to_string());
            Ok(())
        }

        fn pass_fd(&mut self, fd: RawFd) -> io::Result<()> {
            self.fds.lock().unwrap().push(fd);
            Ok(())
        }
    }

    struct Script {
        commands: VecDeque<String>,
        recorder: Recorder,
    }

    impl Script {
        /// Scripted transport; a trailing `shutdown` ends the loop.
        fn new(commands: &[&str]) -> Script {
            let mut commands: VecDeque<String> =
                commands.iter().map(|c| c.to_string()).collect();
            commands.push_back("shutdown".to_string());

            Script {
                commands,
                recorder: Recorder::default(),
            }
        }

        fn replies(&self) -> Vec<String> {
            self.recorder.replies.lock().unwrap().clone()
        }

        fn fds(&self) -> Vec<RawFd> {
            self.recorder.fds.lock().unwrap().clone()
        }
    }

    impl CommandSource for Script {
        fn recv_timeout(&mut self, _: Duration) -> io::Result<Option<ControlMessage>> {
            Ok(self.commands.pop_front().map(|text| ControlMessage {
                text,
                port: Box::new(self.recorder.clone()),
            }))
        }
    }

    #[test]
    fn test_ping_pong() {
        let (hub, _strat, _gener) = test_hub(1, false);
        let mut script = Script::new(&["ping"]);

        run(&hub, &mut script);

        assert_eq!(script.replies(), vec!["pong".to_string()]);
        assert!(!hub.is_running());
    }

    #[test]
    fn test_accept_reject_gate() {
        let (hub, _strat, _gener) = test_hub(1, false);

        let mut script = Script::new(&["accept"]);
        run(&hub, &mut script);
        assert!(hub.accepting());

        hub.running.store(true, std::sync::atomic::Ordering::Relaxed);
        let mut script = Script::new(&["reject"]);
        run(&hub, &mut script);
        assert!(!hub.accepting());
    }

    #[test]
    fn test_stats_reply_shape() {
        let (hub, _strat, _gener) = test_hub(1, false);
        let mut script = Script::new(&["stats"]);

        run(&hub, &mut script);

        let replies = script.replies();
        assert_eq!(replies.len(), 1);
        let doc: Value = serde_json::from_str(&replies[0]).unwrap();
        for key in ["clients", "dead", "sends", "delays"].iter() {
            let section = &doc[*key];
            assert!(section.get("count").is_some());
            assert!(section.get("memory").is_some());
            assert!(section.get("generated").is_some());
        }
    }

    #[test]
    fn test_loglevel_command() {
        let (hub, _strat, _gener) = test_hub(1, false);
        let mut script = Script::new(&["loglevel=7"]);

        run(&hub, &mut script);

        assert_eq!(hub.level.get(), crate::logging::Level::Debug);
    }

    #[test]
    fn test_dropclient_command() {
        let (hub, strat, _gener) = test_hub(1, false);
        let (client, _peer) = attach_client(&hub);
        let id = client.id();
        drop(client);

        let mut script = Script::new(&[&format!("dropclient={}", id)]);
        run(&hub, &mut script);

        assert!(hub.table().ref_by_id(id).is_none());
        assert_eq!(strat.messages(), vec![format!("dropclient={}", id)]);
    }

    #[test]
    fn test_dropclient_refuses_sub_ids() {
        let (hub, _strat, _gener) = test_hub(1, false);
        let (client, _peer) = attach_client(&hub);
        let id = client.id();

        let encoded = ClientId::wrap(9, id).0;
        let mut script = Script::new(&[&format!("dropclient={}", encoded)]);
        run(&hub, &mut script);

        assert!(hub.table().ref_by_id(id).is_some());
    }

    #[test]
    fn test_passthrough_command_marks_and_acknowledges() {
        let (hub, _strat, _gener) = test_hub(1, false);
        let (client, mut peer) = attach_client(&hub);
        let id = client.id();

        let worker = {
            let hub = Arc::clone(&hub);
            thread::spawn(move || sender::run(hub))
        };

        let mut script = Script::new(&[&format!("passthrough={}", id)]);
        run(&hub, &mut script);
        worker.join().unwrap();

        assert!(client.is_passthrough());

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reply = String::new();
        BufReader::new(&mut peer).read_line(&mut reply).unwrap();
        assert_eq!(reply, "{\"result\": true}\n");
    }

    #[test]
    fn test_outbound_unwraps_sub_id() {
        let (hub, _strat, _gener) = test_hub(1, false);
        let (client, mut peer) = attach_client(&hub);
        client.set_passthrough();
        let encoded = ClientId::wrap(client.id(), 7).0;
        drop(client);

        let worker = {
            let hub = Arc::clone(&hub);
            thread::spawn(move || sender::run(hub))
        };

        let frame = format!("{{\"client_id\":{},\"p\":1}}", encoded);
        let mut script = Script::new(&[&frame]);
        run(&hub, &mut script);
        worker.join().unwrap();

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut written = String::new();
        BufReader::new(&mut peer).read_line(&mut written).unwrap();

        assert!(written.ends_with('\n'));
        let val: Value = serde_json::from_str(written.trim_end()).unwrap();
        assert_eq!(val["client_id"], 7);
        assert_eq!(val["p"], 1);
    }

    #[test]
    fn test_outbound_direct_keeps_id_out() {
        let (hub, _strat, _gener) = test_hub(1, false);
        let (client, mut peer) = attach_client(&hub);
        let id = client.id();
        drop(client);

        let worker = {
            let hub = Arc::clone(&hub);
            thread::spawn(move || sender::run(hub))
        };

        let frame = format!("{{\"client_id\":{},\"result\":\"ok\"}}", id);
        let mut script = Script::new(&[&frame]);
        run(&hub, &mut script);
        worker.join().unwrap();

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut written = String::new();
        BufReader::new(&mut peer).read_line(&mut written).unwrap();

        let val: Value = serde_json::from_str(written.trim_end()).unwrap();
        assert!(val.get("client_id").is_none());
        assert_eq!(val["result"], "ok");
    }

    #[test]
    fn test_getxfd_passes_listed_fd() {
        let (hub, _strat, _gener) = test_hub(1, false);
        let mut hub = match Arc::try_unwrap(hub) {
            Ok(hub) => hub,
            Err(_) => panic!("hub must be unshared"),
        };
        hub.server_fds = vec![42, 43];
        let hub = Arc::new(hub);

        let mut script = Script::new(&["getxfd 1", "getxfd 5"]);
        run(&hub, &mut script);

        assert_eq!(script.fds(), vec![43]);
    }

    #[test]
    fn test_unknown_command_is_ignored() {
        let (hub, _strat, _gener) = test_hub(1, false);
        let mut script = Script::new(&["frobnicate"]);

        run(&hub, &mut script);

        assert!(script.replies().is_empty());
    }
}
