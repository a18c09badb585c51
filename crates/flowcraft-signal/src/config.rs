//! Server settings from the environment.

use std::net::SocketAddr;

pub const ADDR_VAR: &str = "FLOWCRAFT_SIGNAL_ADDR";
pub const MAX_PEERS_VAR: &str = "FLOWCRAFT_MAX_ROOM_PEERS";

const DEFAULT_ADDR: &str = "0.0.0.0:4444";
const DEFAULT_MAX_ROOM_PEERS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalConfig {
    pub addr: SocketAddr,
    /// Hard cap on connections per room, whatever clients ask for.
    pub max_room_peers: usize,
}

impl SignalConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source. Unset variables take defaults;
    /// set but unparsable ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let addr = lookup(ADDR_VAR).unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr = addr
            .parse()
            .map_err(|e| format!("{} must be a socket address ({}): {}", ADDR_VAR, addr, e))?;

        let max_room_peers = match lookup(MAX_PEERS_VAR) {
            Some(value) => value
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| format!("{} must be a positive integer, got {:?}", MAX_PEERS_VAR, value))?,
            None => DEFAULT_MAX_ROOM_PEERS,
        };

        Ok(Self {
            addr,
            max_room_peers,
        })
    }
}
