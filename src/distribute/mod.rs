//! Task Distribution Module
//!
//! Hands crawl Tasks from a producer node to consumer nodes over the transport.
//!
//! ## Architecture Overview
//! The distribution follows a **Pull-based** model:
//! 1. **Submission**: the producer batches spiders into Tasks and pushes them onto its
//!    bounded local `TaskQueue`, which stamps each with a sequential Id.
//! 2. **Pull**: a consumer with nothing to do sends an empty `task` request.
//! 3. **Push**: the producer's `task` handler dequeues one Task and returns it as the reply;
//!    the consumer's own `task` handler receives it and queues it locally.
//! 4. **Reporting**: status lines flow the other way as `log` messages.
//!
//! Delivery is at most once: a Task handed to a consumer that disconnects is not requeued.
//!
//! ## Submodules
//! - **`types`**: Task, spider specs, crawl defaults and batching.
//! - **`queue`**: the bounded FIFO.
//! - **`payload`**: typed decoding of message bodies by operation.
//! - **`roles`**: the shared `TaskStore` capability and the producer/consumer handlers.
//! - **`node`**: the facade tying transport, queue and roles together.

pub mod node;
pub mod payload;
pub mod queue;
pub mod roles;
pub mod types;

pub use node::Node;
pub use queue::TaskQueue;
pub use roles::{Role, TaskStore};
pub use types::{CrawlDefaults, SpiderSpec, Task, batch_tasks};

#[cfg(test)]
mod tests;
