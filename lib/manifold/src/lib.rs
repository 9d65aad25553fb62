//! Multiplexing engine sitting between a fleet of line-delimited-JSON TCP
//! clients and the in-process consumers (stratifier and generator). Accepts
//! connections, tags inbound frames with identity metadata and routes
//! outbound frames back to the right socket without blocking the rest of the
//! fleet.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Largest accepted message, terminating newline included.
pub const MAX_MSG_SIZE: usize = 1024;

/// Per-client receive buffer. One page per idle connection.
pub const RECV_BUF_SIZE: usize = 4096;

pub const DEFAULT_PORT: u16 = 3333;
pub const DEFAULT_PROXY_PORT: u16 = 3334;

pub mod identity;
pub mod logging;
pub mod net;

pub use crate::identity::ClientId;
pub use crate::net::hub::{Hub, HubConfig};

#[cfg(test)]
pub(crate) mod testutil;
