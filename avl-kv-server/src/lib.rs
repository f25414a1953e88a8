//! In-memory key-value server backed by an AVL tree.
//!
//! Clients talk to the server over TCP using either `VERB key [value]` lines
//! or single JSON objects; the format is fixed per server instance. Each
//! module owns one concern:
//!
//! - [`store`] is the AVL tree, the only storage engine.
//! - [`value`] is the payload type kept in the tree.
//! - [`protocol`] decodes and validates requests, runs them against the
//!   store, and encodes replies.
//! - [`server`] binds the listening socket and serves one connection at a
//!   time until shutdown.
//! - [`logging`] routes `tracing` events to stderr or, through a ring
//!   buffer, to the system log.
//! - [`cli`] parses command-line flags into server and log settings.

pub mod cli;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod store;
pub mod value;

/// The store as used by the server: byte-string keys, [`value::Value`] payloads.
pub type Store = store::AvlTree<value::Value>;
