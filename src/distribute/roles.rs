//! Distribution Role Adapters
//!
//! Producers and consumers share one capability, [`TaskStore`], and differ
//! only in which `task` / `log` handlers they install on the node's
//! [`HandlerTable`].
//!
//! Pull protocol: a consumer sends an empty-bodied `task` request; the
//! producer's `task` handler dequeues one Task and returns it as the reply.
//! That reply reaches the consumer's own `task` handler as an ordinary inbound
//! message, which queues it locally.
//!
//! When the producer's queue is empty the handler returns at once and a
//! spawned waiter pushes the next Task to the requester's session, so parked
//! pulls never hold a dispatch worker. A waiter stops when that session
//! closes; a Task it dequeued but could not deliver goes back on the queue.

use super::payload::{Payload, PayloadRegistry};
use super::queue::TaskQueue;
use super::types::{OP_LOG, OP_TASK, Task};
use crate::transport::registry::SessionRegistry;
use crate::transport::session::Session;
use crate::transport::types::{Message, Mode, NodeId, Status};
use crate::transport::HandlerTable;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Queues a Task, returning its Id.
    async fn enqueue(&self, task: Task) -> crate::error::Result<usize>;

    /// Takes the next Task, waiting until one exists.
    async fn dequeue(&self) -> Task;

    fn try_dequeue(&self) -> Option<Task>;

    /// Live session of a peer, used to deliver Tasks outside a reply.
    fn session(&self, id: &NodeId) -> Option<Arc<Session>>;

    /// Peers currently reachable.
    fn active_node_count(&self) -> usize;
}

/// [`TaskStore`] over a node's local queue and session registry.
///
/// `enqueue` is the consumer path, so received Tasks keep their producer Id.
pub struct LocalStore {
    queue: Arc<TaskQueue>,
    registry: Arc<SessionRegistry>,
}

impl LocalStore {
    pub fn new(queue: Arc<TaskQueue>, registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self { queue, registry })
    }
}

#[async_trait]
impl TaskStore for LocalStore {
    async fn enqueue(&self, task: Task) -> crate::error::Result<usize> {
        self.queue.accept(task).await
    }

    async fn dequeue(&self) -> Task {
        self.queue.pull().await
    }

    fn try_dequeue(&self) -> Option<Task> {
        self.queue.try_pull()
    }

    fn session(&self, id: &NodeId) -> Option<Arc<Session>> {
        self.registry.get(id)
    }

    fn active_node_count(&self) -> usize {
        self.registry.count_usable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
    /// Producer without the crawler labels.
    Server,
    /// Consumer without the crawler labels.
    Client,
}

impl Role {
    pub fn is_producer(self) -> bool {
        matches!(self, Role::Master | Role::Server)
    }

    /// Socket side this role runs on.
    pub fn mode(self) -> Mode {
        if self.is_producer() {
            Mode::Server
        } else {
            Mode::Client
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Slave => "slave",
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

/// Registers the `task` and `log` handlers for `role`.
pub fn install(
    role: Role,
    handlers: &HandlerTable,
    store: Arc<dyn TaskStore>,
    payloads: Arc<PayloadRegistry>,
) -> crate::error::Result<()> {
    if role.is_producer() {
        install_producer(handlers, store)?;
    } else {
        install_consumer(handlers, store, payloads.clone())?;
    }
    install_log(role, handlers, payloads)?;

    tracing::info!("Installed {} role handlers", role.label());
    Ok(())
}

fn install_producer(handlers: &HandlerTable, store: Arc<dyn TaskStore>) -> crate::error::Result<()> {
    handlers.register(OP_TASK, move |msg: Message| serve_task(store.clone(), msg))
}

fn install_consumer(
    handlers: &HandlerTable,
    store: Arc<dyn TaskStore>,
    payloads: Arc<PayloadRegistry>,
) -> crate::error::Result<()> {
    handlers.register(OP_TASK, move |msg: Message| {
        receive_task(store.clone(), payloads.clone(), msg)
    })
}

fn install_log(
    role: Role,
    handlers: &HandlerTable,
    payloads: Arc<PayloadRegistry>,
) -> crate::error::Result<()> {
    handlers.register(OP_LOG, move |msg: Message| {
        print_log(role, payloads.clone(), msg)
    })
}

/// Producer side: any `task` request takes the next Task off the queue.
async fn serve_task(store: Arc<dyn TaskStore>, msg: Message) -> Result<Option<Message>> {
    if msg.status != Status::Success {
        tracing::warn!("Ignoring {:?} task message from {}", msg.status, msg.from);
        return Ok(None);
    }

    tracing::debug!(
        "Node {} asked for a task ({} nodes online)",
        msg.from,
        store.active_node_count()
    );

    if let Some(task) = store.try_dequeue() {
        tracing::info!("Handing task {} to {}", task.id, msg.from);
        return Ok(Some(Message::reply(Payload::Task(task).into_body()?)));
    }

    let Some(session) = store.session(&msg.from) else {
        tracing::debug!("Node {} left before its task request was served", msg.from);
        return Ok(None);
    };
    tracing::debug!("Queue empty, {} waits for the next task", msg.from);
    tokio::spawn(deliver_next_task(store, session, msg));
    Ok(None)
}

async fn deliver_next_task(store: Arc<dyn TaskStore>, session: Arc<Session>, request: Message) {
    let task = tokio::select! {
        task = store.dequeue() => task,
        () = session.closed() => {
            tracing::debug!("Node {} left while waiting for a task", request.from);
            return;
        }
    };

    let id = task.id;
    let delivered = match Payload::Task(task.clone()).into_body() {
        Ok(body) => {
            let mut reply = Message::reply(body);
            reply.to = request.from.clone();
            reply.operation = request.operation.clone();
            reply.flag = request.flag.clone();
            session.enqueue(reply).await
        }
        Err(e) => {
            tracing::warn!("Failed to encode task {}: {}", id, e);
            false
        }
    };

    if delivered {
        tracing::info!("Handing task {} to {}", id, request.from);
        return;
    }

    tracing::debug!("Task {} undeliverable to {}, requeueing", id, request.from);
    if let Err(e) = store.enqueue(task).await {
        tracing::warn!("Lost task {}: {}", id, e);
    }
}

/// Consumer side: a pushed Task goes onto the local queue.
async fn receive_task(
    store: Arc<dyn TaskStore>,
    payloads: Arc<PayloadRegistry>,
    msg: Message,
) -> Result<Option<Message>> {
    if msg.status != Status::Success {
        tracing::warn!("Producer {} could not serve a task: {}", msg.from, msg.body);
        return Ok(None);
    }

    match payloads.decode(&msg)? {
        Payload::Task(task) => {
            let spiders = task.spiders.len();
            let id = store.enqueue(task).await?;
            tracing::info!("Received task {} ({} spiders) from {}", id, spiders, msg.from);
        }
        other => tracing::debug!("Ignoring {:?} on '{}' from {}", other, OP_TASK, msg.from),
    }
    Ok(None)
}

async fn print_log(role: Role, payloads: Arc<PayloadRegistry>, msg: Message) -> Result<Option<Message>> {
    if let Payload::LogLine(line) = payloads.decode(&msg)? {
        tracing::info!(role = role.label(), from = %msg.from, "{}", line);
    }
    Ok(None)
}
