//! Multi-client message relay over TCP.
//!
//! Clients send typed frames (UTF-8 text or raw image bytes) and the relay
//! fans each one out to every other connected client. Nothing is persisted
//! and delivery is best-effort while a connection is open.
//!
//! - [`message`] defines the closed set of relayed message kinds.
//! - [`codec`] encodes and decodes the length-prefixed wire frames.
//! - [`registry`] tracks connected clients and performs the broadcast.
//! - [`connection`] owns one accepted socket for its whole lifetime.
//! - [`relay`] accepts connections and hands each one to a handler task.
//! - [`client`] is the connect/send interface used by front ends, plus a
//!   small terminal client.
//! - [`config`] and [`cli`] describe how the binary is configured.

pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod message;
pub mod registry;
pub mod relay;

pub use codec::{FrameCodec, FrameError};
pub use config::RelayConfig;
pub use message::{Message, MessageKind};
pub use registry::Registry;
pub use relay::Relay;
