pub mod auth;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod fanout;
pub mod friends;
pub mod registry;
pub mod relay;
pub mod server;
pub mod store;

pub use error::RelayError;
pub use relay::Relay;
