//! Small JACK helpers shared across clients: connecting ports while treating
//! "already connected" as success, and translating registration/connection
//! failures into [`EngineError`].

use jack::Client;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Connect `from` -> `to`, tolerating the case where something (often a
/// session restore, or a previous run of this same process) already made the
/// connection.
pub fn connect_ports(client: &Client, from: &str, to: &str) -> EngineResult<()> {
    match client.connect_ports_by_name(from, to) {
        Ok(()) => Ok(()),
        Err(jack::Error::PortConnectionError(_, _)) => {
            debug!(from, to, "connect_ports: already connected");
            Ok(())
        }
        Err(source) => Err(EngineError::JackConnect {
            from: from.to_string(),
            to: to.to_string(),
            source,
        }),
    }
}

/// The JACK-native bar/beat/tick position, published by whichever client is
/// currently the transport's timebase master.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransportBbt {
    pub bar: i32,
    pub beat: i32,
    pub tick: i32,
    pub beats_per_minute: f64,
}
