//! guestlink: host/guest bridge over vsock.
//!
//! A guest runs four services: a CONNECT tunnel to guest-local TCP ports,
//! a heartbeat line, an NDJSON event push stream and a one-shot HTTP
//! request server. Each sits behind a [`listener::ConnectionListener`] and
//! talks through the [`channel::Channel`] contract.

pub mod agent;
pub mod channel;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod http;
pub mod listener;
pub mod observer;
pub mod protocol;
pub mod relay;
pub mod slot;
mod sys;
pub mod tunnel;

pub use agent::Agent;
pub use channel::{AnyChannel, Channel, Strategy};
pub use config::{Config, Service};
pub use error::{ChannelError, ErrorClass};
