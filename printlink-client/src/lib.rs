//! # printlink-client
//!
//! Async client for the printer's text protocol.
//!
//! This crate provides:
//! - A TCP connection that reconnects behind the caller on transient failures
//! - Demultiplexing of incoming frames to pending requests and subscriptions
//! - A push-to-pull bridge with explicit buffering policies
//! - A high-level API for every printer command

pub mod bridge;
pub mod client;
pub mod connection;
pub mod demux;
pub mod error;

#[cfg(test)]
mod testing;

pub use bridge::{Bridge, Buffering, Cancelled};
pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use demux::{Demultiplexer, Dispatcher, PendingRequest, Subscription};
pub use error::ClientError;
pub use tokio_util::sync::CancellationToken;
