//! Operation Dispatch
//!
//! Maps operation names (e.g. `"task"`, `"log"`) to async handlers and drains
//! the shared inbound queue with a fixed pool of workers.
//!
//! ## Routing rules
//! - Unknown operation: the sender gets an `Illegal` reply naming it.
//! - Handler returns `None`: nothing is sent; a short-mode sender is closed.
//! - Handler returns a message: blank `To`/`Operation`/`From`/`Flag` are filled
//!   from the request and it is queued on the destination session. If that
//!   session does not exist the sender gets a `Failure` reply instead.
//!
//! A handler runs on the worker that took its message. Handlers that wait on
//! outside events hand the wait to their own task and return.

use super::service::Transport;
use super::types::*;

use crate::error::TransportError;

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type-erased async operation handler.
pub type HandlerFn = Arc<
    dyn Fn(Message) -> Pin<Box<dyn Future<Output = Result<Option<Message>>> + Send>> + Send + Sync,
>;

/// Operation name to handler table. Identity and heartbeat are pre-installed.
pub struct HandlerTable {
    handlers: DashMap<String, HandlerFn>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        let table = Self {
            handlers: DashMap::new(),
        };
        for operation in RESERVED_OPERATIONS {
            table.insert(operation, |_msg: Message| async { Ok(None) });
        }
        table
    }
}

impl HandlerTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `handler` under `operation`, replacing any previous one.
    ///
    /// Reserved operations are refused.
    pub fn register<F, Fut>(&self, operation: &str, handler: F) -> crate::error::Result<()>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
    {
        if RESERVED_OPERATIONS.contains(&operation) {
            tracing::warn!("Refusing to override reserved operation '{}'", operation);
            return Err(TransportError::ReservedOperation(operation.to_string()));
        }

        self.insert(operation, handler);
        tracing::info!("Registered handler for operation '{}'", operation);
        Ok(())
    }

    fn insert<F, Fut>(&self, operation: &str, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
    {
        let handler_fn: HandlerFn = Arc::new(move |msg: Message| {
            Box::pin(handler(msg)) as Pin<Box<dyn Future<Output = Result<Option<Message>>> + Send>>
        });
        self.handlers.insert(operation.to_string(), handler_fn);
    }

    pub fn get(&self, operation: &str) -> Option<HandlerFn> {
        self.handlers.get(operation).map(|entry| entry.value().clone())
    }

    pub fn has_handler(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    pub fn operations(&self) -> Vec<String> {
        let mut operations: Vec<String> =
            self.handlers.iter().map(|entry| entry.key().clone()).collect();
        operations.sort();
        operations
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Transport {
    /// Spawns the dispatch workers for the current run.
    pub(crate) fn spawn_dispatch_workers(self: &Arc<Self>) {
        let workers = self.config().dispatch_workers.max(1);
        let shutdown = self.shutdown_token();

        for worker_id in 0..workers {
            let transport = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                transport.dispatch_loop(worker_id, shutdown).await;
            });
        }

        tracing::debug!("Started {} dispatch workers", workers);
    }

    async fn dispatch_loop(&self, worker_id: usize, shutdown: tokio_util::sync::CancellationToken) {
        loop {
            let next = {
                let mut inbound = self.inbound().lock().await;
                tokio::select! {
                    msg = inbound.recv() => msg,
                    () = shutdown.cancelled() => None,
                }
            };

            let Some(msg) = next else {
                tracing::trace!("Dispatch worker {} stopped", worker_id);
                return;
            };

            self.dispatch(msg).await;
        }
    }

    /// Runs the handler for one inbound message and routes its response.
    pub(crate) async fn dispatch(&self, request: Message) {
        let sender = request.from.clone();

        let Some(handler) = self.handlers().get(&request.operation) else {
            // Error replies are never answered with another error.
            if request.status != Status::Success {
                tracing::debug!(
                    "Dropping {:?} reply for unknown operation '{}' from {}",
                    request.status,
                    request.operation,
                    sender
                );
                return;
            }
            tracing::warn!(
                "Node {} requested unknown operation '{}'",
                sender,
                request.operation
            );
            let text = format!(
                "node {} has no handler for operation '{}'",
                self.uid(),
                request.operation
            );
            self.send_error(request, Status::Illegal, &text).await;
            return;
        };

        let response = match handler(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    "Handler for '{}' failed on message from {}: {}",
                    request.operation,
                    sender,
                    e
                );
                return;
            }
        };

        let Some(mut response) = response else {
            if let Some(session) = self.registry().get(&sender).filter(|s| s.is_short()) {
                session.close();
            }
            return;
        };

        if response.to.is_empty() {
            response.to = sender.clone();
        }
        if response.operation.is_empty() {
            response.operation = request.operation.clone();
        }
        if response.from.is_empty() {
            response.from = self.uid();
        }
        if response.flag.is_empty() {
            response.flag = request.flag.clone();
        }

        match self.registry().get(&response.to) {
            Some(session) => {
                if !session.enqueue(response).await {
                    tracing::debug!("Session {} closed before the response was queued", sender);
                }
            }
            None => {
                tracing::warn!(
                    "Destination {} is not connected, answering {} with failure",
                    response.to,
                    sender
                );
                let text = format!("node {} is not connected", response.to);
                self.send_error(request, Status::Failure, &text).await;
            }
        }
    }

    async fn send_error(&self, request: Message, status: Status, text: &str) {
        let sender = request.from.clone();
        let mut reply = Message::error(request, status, text);
        reply.from = self.uid();
        reply.to = sender.clone();

        match self.registry().get(&sender) {
            Some(session) => {
                session.enqueue(reply).await;
            }
            None => tracing::debug!("Sender {} left before its error reply", sender),
        }
    }
}
