//! Process bootstrap: configuration, logging, listener sockets, worker
//! threads and the control loop on the main thread.

mod config;
mod ipc;
mod sinks;

use clap::{App, Arg};
use manifold::logging::{self, Logger};
use manifold::net::hub::{Hub, HubConfig};
use manifold::net::sink::Sink;
use manifold::net::{control, listener, receiver::Receiver, sender};
use mio::Poll;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::process;
use std::sync::Arc;
use std::thread;

use crate::config::Config;

fn main() {
    let matches = App::new("manifoldd")
        .version("0.1.0")
        .about("TCP connection multiplexer for line-delimited JSON clients")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("TOML configuration file"),
        )
        .arg(
            Arg::with_name("listen")
                .short("l")
                .long("listen")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Listener URL (host:port), repeatable"),
        )
        .arg(
            Arg::with_name("socket")
                .short("s")
                .long("socket")
                .takes_value(true)
                .help("Unix control socket path"),
        )
        .arg(
            Arg::with_name("maxclients")
                .long("max-clients")
                .takes_value(true)
                .help("Refuse connections beyond this count"),
        )
        .arg(
            Arg::with_name("loglevel")
                .long("loglevel")
                .takes_value(true)
                .help("Log level, syslog-style 0-7"),
        )
        .arg(
            Arg::with_name("inherit-fd")
                .long("inherit-fd")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Listener fd handed over by a previous instance, one per listener URL"),
        )
        .arg(
            Arg::with_name("proxy")
                .long("proxy")
                .help("Bind the proxy default port"),
        )
        .arg(
            Arg::with_name("passthrough")
                .long("passthrough")
                .help("Forward all inbound frames to the generator"),
        )
        .get_matches();

    let mut config: Config = match matches.value_of("config") {
        Some(path) => match serdeconv::from_toml_file(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to load config {}: {}", path, err);
                process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Some(urls) = matches.values_of("listen") {
        config.serverurls = urls.map(String::from).collect();
    }
    if let Some(socket) = matches.value_of("socket") {
        config.socket = socket.to_string();
    }
    if let Some(max) = matches.value_of("maxclients") {
        config.maxclients = parse_or_exit(max, "max-clients");
    }
    if let Some(level) = matches.value_of("loglevel") {
        config.loglevel = parse_or_exit(level, "loglevel");
    }
    if matches.is_present("proxy") {
        config.proxy = true;
    }
    if matches.is_present("passthrough") {
        config.passthrough = true;
    }

    let (log, level) = logging::terminal(logging::Level::Info);
    level.set_syslog(config.loglevel);

    logging::info!(log, "connector starting");

    // Sockets handed over by a previous instance; reused only when their
    // bound address still matches the configuration.
    let inherited: Vec<Option<std::net::TcpListener>> = matches
        .values_of("inherit-fd")
        .map(|fds| {
            fds.map(|fd| {
                let fd: RawFd = parse_or_exit(fd, "inherit-fd");
                Some(unsafe { std::net::TcpListener::from_raw_fd(fd) })
            })
            .collect()
        })
        .unwrap_or_default();

    let listeners =
        match listener::open_listeners(&config.serverurls, inherited, config.proxy, &log) {
            Ok(listeners) => listeners,
            Err(err) => {
                logging::crit!(log, "failed to open listener sockets"; "error" => %err);
                process::exit(1);
            }
        };
    let server_fds = listeners.iter().map(|l| l.as_raw_fd()).collect();

    let poll = match Poll::new() {
        Ok(poll) => Arc::new(poll),
        Err(err) => {
            logging::crit!(log, "failed to create poller"; "error" => %err);
            process::exit(1);
        }
    };

    let stratifier = open_sink(&config.stratifier_socket, "stratifier", &log);
    let generator = open_sink(&config.generator_socket, "generator", &log);

    let hub = Hub::new(
        HubConfig {
            listeners: listeners.len(),
            server_fds,
            max_clients: config.maxclients,
            passthrough: config.passthrough,
        },
        poll,
        stratifier,
        generator,
        level,
        log.clone(),
    );

    let receiver = match Receiver::new(Arc::clone(&hub), listeners) {
        Ok(receiver) => receiver,
        Err(err) => {
            logging::crit!(log, "failed to register listener sockets"; "error" => %err);
            process::exit(1);
        }
    };

    spawn_thread("receiver", {
        let log = log.clone();
        move || {
            if let Err(err) = receiver.run() {
                logging::crit!(log, "receiver failed"; "error" => %err);
                process::exit(1);
            }
        }
    });
    spawn_thread("sender", {
        let hub = Arc::clone(&hub);
        move || sender::run(hub)
    });

    let mut source = match ipc::UnixCommandSource::bind(&config.socket) {
        Ok(source) => source,
        Err(err) => {
            logging::crit!(log, "failed to bind control socket";
                           "path" => %config.socket,
                           "error" => %err);
            process::exit(1);
        }
    };

    hub.set_accepting(true);
    logging::info!(log, "connector ready"; "socket" => %config.socket);

    control::run(&hub, &mut source);

    logging::info!(log, "connector exiting");
}

fn open_sink(path: &str, name: &'static str, log: &Logger) -> Arc<dyn Sink> {
    if path.is_empty() {
        return Arc::new(sinks::LogSink::new(name, log));
    }
    match sinks::UnixSink::new(path, name, log) {
        Ok(sink) => Arc::new(sink),
        Err(err) => {
            logging::crit!(log, "failed to open consumer socket";
                           "sink" => name,
                           "error" => %err);
            process::exit(1);
        }
    }
}

fn parse_or_exit<T: std::str::FromStr>(value: &str, what: &str) -> T {
    match value.parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            eprintln!("invalid value for {}: {}", what, value);
            process::exit(1);
        }
    }
}

fn spawn_thread<F: FnOnce() + Send + 'static>(name: &str, body: F) {
    if let Err(err) = thread::Builder::new().name(name.to_string()).spawn(body) {
        eprintln!("failed to spawn {} thread: {}", name, err);
        process::exit(1);
    }
}
