use serde_derive::Deserialize;

/// Daemon configuration, loadable from TOML and overridable from the
/// command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Explicit listener URLs (`host:port`). Empty means one wildcard
    /// socket on the default port.
    pub serverurls: Vec<String>,
    /// Path of the unix control socket.
    pub socket: String,
    /// Refuse connections beyond this count. Zero means unbounded.
    pub maxclients: usize,
    /// Bind the proxy default port when no URLs are given.
    pub proxy: bool,
    /// Whole-process passthrough: inbound frames go to the generator.
    pub passthrough: bool,
    /// Initial log level, syslog-style 0-7.
    pub loglevel: u32,
    /// Unix datagram path of the stratifier. Empty logs frames instead.
    pub stratifier_socket: String,
    /// Unix datagram path of the generator. Empty logs frames instead.
    pub generator_socket: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            serverurls: Vec::new(),
            socket: "manifoldd.sock".to_string(),
            maxclients: 0,
            proxy: false,
            passthrough: false,
            loglevel: 6,
            stratifier_socket: String::new(),
            generator_socket: String::new(),
        }
    }
}
