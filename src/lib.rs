//! Distributed Crawler Core Library
//!
//! Node-to-node messaging and task distribution for a crawler cluster in which
//! one master hands crawl Tasks to many slave processes over plain TCP.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//!
//! - **`transport`**: Framed JSON messaging over long-lived TCP sessions. Handles the
//!   first-frame handshake, heartbeats, client reconnection and operation dispatch.
//! - **`distribute`**: The task-distribution protocol on top of the transport. Bounded
//!   task queues, producer/consumer role handlers and the `Node` facade.
//! - **`config`**: Transport tunables and the layered node configuration.
//! - **`error`**: Typed transport errors.

pub mod config;
pub mod distribute;
pub mod error;
pub mod transport;
