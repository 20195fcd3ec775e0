//! Chat relay that fans every received line out to all connected clients.
//!
//! Clients exchange typed messages (text, files, images) as single lines of
//! six `|||`-separated fields. The relay does not rewrite or filter anything:
//! each line read from one connection is written to every connection,
//! the sender's included. Each module focuses on a concrete responsibility:
//!
//! - [`codec`] encodes and decodes the line format and its base64 payloads.
//! - [`registry`] keeps the set of live sessions and performs the broadcast.
//! - [`session`] owns one connection: a read loop plus a writer task.
//! - [`relay`] accepts TCP connections and starts a session for each.
//! - [`profile`], [`compose`] and [`client`] make up the terminal client.
//! - [`cli`] parses the command-line interface for relay and client modes.
//!
//! Integration tests use this crate directly to exercise the relay over real
//! sockets.

pub mod cli;
pub mod client;
pub mod codec;
pub mod compose;
pub mod profile;
pub mod registry;
pub mod relay;
pub mod session;
