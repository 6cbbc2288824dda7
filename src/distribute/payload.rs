//! Typed Message Payloads
//!
//! `Message::body` is an untyped JSON value on the wire. Handlers decode it
//! through a [`PayloadRegistry`], which knows which payload shape each
//! operation carries, instead of probing the value themselves.

use super::types::{OP_LOG, OP_TASK, Task};
use crate::transport::types::{HEARTBEAT, IDENTITY, Message};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Identity,
    Heartbeat,
    Task,
    LogLine,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Identity,
    Heartbeat,
    /// A Task pushed to a consumer.
    Task(Task),
    /// An empty-bodied `task` message: a consumer asking for work.
    TaskRequest,
    LogLine(String),
}

impl Payload {
    pub fn into_body(self) -> Result<Value> {
        Ok(match self {
            Payload::Identity | Payload::Heartbeat | Payload::TaskRequest => Value::Null,
            Payload::Task(task) => serde_json::to_value(task)?,
            Payload::LogLine(line) => Value::String(line),
        })
    }
}

pub struct PayloadRegistry {
    kinds: HashMap<String, PayloadKind>,
}

impl Default for PayloadRegistry {
    fn default() -> Self {
        let mut registry = Self {
            kinds: HashMap::new(),
        };
        registry.register(IDENTITY, PayloadKind::Identity);
        registry.register(HEARTBEAT, PayloadKind::Heartbeat);
        registry.register(OP_TASK, PayloadKind::Task);
        registry.register(OP_LOG, PayloadKind::LogLine);
        registry
    }
}

impl PayloadRegistry {
    pub fn register(&mut self, operation: &str, kind: PayloadKind) {
        self.kinds.insert(operation.to_string(), kind);
    }

    pub fn kind_of(&self, operation: &str) -> Option<PayloadKind> {
        self.kinds.get(operation).copied()
    }

    pub fn decode(&self, msg: &Message) -> Result<Payload> {
        let kind = self
            .kind_of(&msg.operation)
            .ok_or_else(|| anyhow!("no payload type for operation '{}'", msg.operation))?;

        Ok(match kind {
            PayloadKind::Identity => Payload::Identity,
            PayloadKind::Heartbeat => Payload::Heartbeat,
            PayloadKind::LogLine => match &msg.body {
                Value::String(line) => Payload::LogLine(line.clone()),
                Value::Null => Payload::LogLine(String::new()),
                other => Payload::LogLine(other.to_string()),
            },
            PayloadKind::Task => decode_task(&msg.body)?,
        })
    }
}

/// Tasks arrive as a JSON object, or as a string holding the object.
fn decode_task(body: &Value) -> Result<Payload> {
    match body {
        Value::Null => Ok(Payload::TaskRequest),
        Value::String(s) if s.is_empty() => Ok(Payload::TaskRequest),
        Value::String(s) => {
            let task = serde_json::from_str(s).context("decoding task from string body")?;
            Ok(Payload::Task(task))
        }
        Value::Object(_) => {
            let task = serde_json::from_value(body.clone()).context("decoding task body")?;
            Ok(Payload::Task(task))
        }
        other => Err(anyhow!("unexpected task body: {}", other)),
    }
}
