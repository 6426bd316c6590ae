pub mod protocol;
pub mod time;

/// Default HTTP/WebSocket listen address of the relay.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7001";
