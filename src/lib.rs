pub mod backoff;
pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod rtc;
pub mod server;
pub mod session;
pub mod signaling;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
