use serde::{Deserialize, Serialize};
use std::fmt;

/// Handshake marker sent by a long-mode client as its first frame.
pub const IDENTITY: &str = "+identity+";

/// Keep-alive marker emitted by idle long-mode writers.
pub const HEARTBEAT: &str = "+heartbeat+";

/// Operations every node answers itself; role adapters may not override them.
pub const RESERVED_OPERATIONS: [&str; 2] = [IDENTITY, HEARTBEAT];

/// Identifier a node announces in `From`/`To`, and the key of the session registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Which side of the socket this node started on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

/// Outcome carried by every message. Encoded on the wire as `0`, `-1`, `-2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Status {
    #[default]
    Success,
    Failure,
    /// The receiver has no handler for the requested operation.
    Illegal,
}

impl From<Status> for i32 {
    fn from(status: Status) -> Self {
        match status {
            Status::Success => 0,
            Status::Failure => -1,
            Status::Illegal => -2,
        }
    }
}

impl TryFrom<i32> for Status {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Success),
            -1 => Ok(Status::Failure),
            -2 => Ok(Status::Illegal),
            other => Err(format!("unknown status code {}", other)),
        }
    }
}

/// The wire envelope.
///
/// Serialized as a JSON object with `Body`, `Operation`, `From`, `To`,
/// `Status` and `Flag` keys. Any missing key decodes to its default, which
/// lets the dispatch engine fill in routing fields a handler left blank.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Message {
    pub body: serde_json::Value,
    pub operation: String,
    pub from: NodeId,
    pub to: NodeId,
    pub status: Status,
    pub flag: String,
}

impl Message {
    pub fn new(
        from: NodeId,
        to: NodeId,
        operation: &str,
        flag: &str,
        body: serde_json::Value,
    ) -> Self {
        Self {
            body,
            operation: operation.to_string(),
            from,
            to,
            status: Status::Success,
            flag: flag.to_string(),
        }
    }

    /// A successful response. Routing fields stay empty so dispatch can
    /// address it back to the requester with the request's operation and flag.
    pub fn reply(body: serde_json::Value) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    /// Turns a received message into an error reply carrying `text` as its body.
    pub fn error(mut received: Message, status: Status, text: &str) -> Self {
        received.status = status;
        received.body = serde_json::Value::String(text.to_string());
        received.from = NodeId::default();
        received.to = NodeId::default();
        received
    }
}
