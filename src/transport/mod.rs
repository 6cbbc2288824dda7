//! Message Transport Module
//!
//! Long-lived TCP sessions between a server node and its clients, carrying
//! JSON-encoded `Message` envelopes inside length-prefixed frames.
//!
//! ## Core Mechanisms
//! - **Framing**: header + little-endian length + body, resynchronizing on garbage.
//! - **Sessions**: one reader and one writer task per socket; long sessions heartbeat,
//!   short sessions carry a single exchange.
//! - **Registry**: node id to session map with tombstones for client reconnects.
//! - **Dispatch**: operation-keyed handlers drained by a fixed worker pool.
//!
//! ## Submodules
//! - **`types`**: wire envelope, node ids, status codes and reserved operations.
//! - **`framer`**: frame packing and stream unpacking.
//! - **`session`**: per-connection state and socket halves.
//! - **`registry`**: session lookup, random selection and readiness waits.
//! - **`dispatch`**: handler table and routing of handler responses.
//! - **`service`**: the `Transport` itself (accept loop, dial loop, request, close).

pub mod dispatch;
pub mod framer;
pub mod registry;
pub mod service;
pub mod session;
pub mod types;

pub use dispatch::HandlerTable;
pub use service::Transport;
pub use types::{Message, Mode, NodeId, Status};
