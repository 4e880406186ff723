pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod progress;
pub mod service;
pub mod session;
pub mod signaling;
pub mod transport;
