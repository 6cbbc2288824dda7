//! Crawler Node Facade
//!
//! Bundles a [`Transport`], a local [`TaskQueue`] and the role handlers into
//! the object a crawl process drives:
//! - producers `add_tasks` and `serve`;
//! - consumers `connect` and loop on `next_task`;
//! - both `report` status lines, which a background forwarder sends out as `log`.

use super::payload::PayloadRegistry;
use super::queue::TaskQueue;
use super::roles::{self, LocalStore, Role};
use super::types::{CrawlDefaults, OP_LOG, OP_TASK, SpiderSpec, Task, batch_tasks};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::transport::Transport;

use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

pub const REPORT_CAPACITY: usize = 1024;

pub struct Node {
    role: Role,
    transport: Arc<Transport>,
    queue: Arc<TaskQueue>,
    reports: mpsc::Sender<String>,
    /// Taken by the forwarder when the node goes online.
    pending_reports: Mutex<Option<mpsc::Receiver<String>>>,
}

impl Node {
    pub fn new(role: Role, config: TransportConfig) -> Result<Arc<Self>> {
        let transport = Transport::new(config);
        let queue = Arc::new(TaskQueue::default());

        let store = LocalStore::new(queue.clone(), transport.registry().clone());
        roles::install(
            role,
            transport.handlers(),
            store,
            Arc::new(PayloadRegistry::default()),
        )?;

        let (reports, pending) = mpsc::channel(REPORT_CAPACITY);
        Ok(Arc::new(Self {
            role,
            transport,
            queue,
            reports,
            pending_reports: Mutex::new(Some(pending)),
        }))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn count_nodes(&self) -> usize {
        self.transport.count_nodes()
    }

    /// Starts listening for consumers. Producer roles only.
    pub async fn serve(&self, addr: &str) -> Result<SocketAddr> {
        if !self.role.is_producer() {
            return Err(TransportError::InvalidMode(self.role.mode()));
        }
        let local = self.transport.start_server(addr).await?;
        self.spawn_forwarder();
        Ok(local)
    }

    /// Starts dialling a producer. Consumer roles only.
    pub fn connect(&self, addr: &str, short: bool) -> Result<()> {
        if self.role.is_producer() {
            return Err(TransportError::InvalidMode(self.role.mode()));
        }
        self.transport.start_client(addr, short)?;
        self.spawn_forwarder();
        Ok(())
    }

    pub async fn add_task(&self, task: Task) -> Result<usize> {
        self.queue.push(task).await
    }

    /// Batches `spiders` into Tasks and queues them. Returns the assigned Ids.
    pub async fn add_spiders(&self, spiders: &[SpiderSpec], defaults: &CrawlDefaults) -> Result<Vec<usize>> {
        let mut ids = Vec::new();
        for task in batch_tasks(spiders, defaults) {
            ids.push(self.add_task(task).await?);
        }
        Ok(ids)
    }

    /// Next Task to run.
    ///
    /// Consumers with an empty local queue wait for the producer, ask it for
    /// one Task and wait for the push. A producer that disconnects before
    /// answering is asked again once it is back.
    pub async fn next_task(&self) -> Task {
        loop {
            if let Some(task) = self.queue.try_pull() {
                return task;
            }
            if self.role.is_producer() || self.transport.mode().is_none() {
                return self.queue.pull().await;
            }

            let registry = self.transport.registry();
            let producer = self.transport.server_uid();
            registry.wait_for(&producer).await;
            self.transport.request(Value::Null, OP_TASK, "", Some(&producer)).await;

            tokio::select! {
                task = self.queue.pull() => return task,
                () = registry.wait_until_empty() => {
                    tracing::debug!("Producer {} left before answering, asking again", producer);
                }
            }
        }
    }

    /// Queues a status line for the peer. Offline nodes just log it.
    pub fn report(&self, line: impl Into<String>) {
        let line = line.into();
        if self.transport.mode().is_none() {
            tracing::info!(role = self.role.label(), "{}", line);
            return;
        }
        if let Err(e) = self.reports.try_send(line) {
            tracing::warn!("Report queue full, keeping line local: {}", e.into_inner());
        }
    }

    pub fn close(&self) {
        self.transport.close(&[]);
    }

    fn spawn_forwarder(&self) {
        let taken = self
            .pending_reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut pending) = taken else {
            return;
        };

        let transport = self.transport.clone();
        tokio::spawn(async move {
            while let Some(line) = pending.recv().await {
                transport.request(Value::String(line), OP_LOG, "", None).await;
            }
        });
    }
}
