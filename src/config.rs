//! Configuration
//!
//! Two layers:
//! - [`TransportConfig`]: knobs of the socket layer (ids, pack header, channel
//!   capacities, timeouts). Every field has a working default.
//! - [`NodeConfig`]: what the `crawler-node` binary runs. Built from defaults,
//!   then an optional JSON file, then `CRAWLER_*` environment variables and
//!   command-line flags (the last two are resolved by clap in `main.rs`).

use crate::distribute::types::{CrawlDefaults, SpiderSpec};
use crate::transport::framer::DEFAULT_PACK_HEADER;
use crate::transport::types::Mode;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SERVER_UID: &str = "server";
pub const DEFAULT_PORT: u16 = 8080;

pub const SERVER_TIMEOUT: Duration = Duration::from_secs(20);
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(15);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Own node id. Empty means `server_uid` in server mode and the local
    /// socket address in client mode.
    pub uid: String,
    /// Id a client registers its server connection under.
    pub server_uid: String,
    pub pack_header: String,
    /// Shared queue of decoded messages awaiting dispatch.
    pub inbound_capacity: usize,
    /// Per-session queue of messages awaiting the writer.
    pub outbound_capacity: usize,
    pub read_buffer_len: usize,
    /// Read deadline and heartbeat interval. Unset picks the mode default.
    pub timeout_ms: Option<u64>,
    pub retry_interval_ms: u64,
    pub dispatch_workers: usize,
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            uid: String::new(),
            server_uid: DEFAULT_SERVER_UID.to_string(),
            pack_header: DEFAULT_PACK_HEADER.to_string(),
            inbound_capacity: 4096,
            outbound_capacity: 2048,
            read_buffer_len: 1024,
            timeout_ms: None,
            retry_interval_ms: RETRY_INTERVAL.as_millis() as u64,
            dispatch_workers: 64,
            max_frame_len: i32::MAX as usize,
        }
    }
}

impl TransportConfig {
    /// Sets own uid and, optionally, the uid the server is known by.
    pub fn set_uid(mut self, mine: &str, server: Option<&str>) -> Self {
        self.uid = mine.to_string();
        if let Some(server) = server {
            self.server_uid = server.to_string();
        }
        self
    }

    pub fn set_pack_header(mut self, header: &str) -> Self {
        self.pack_header = header.to_string();
        self
    }

    pub fn set_api_rchan(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity;
        self
    }

    pub fn set_conn_wchan(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn set_conn_buffer(mut self, len: usize) -> Self {
        self.read_buffer_len = len;
        self
    }

    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn set_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn set_dispatch_workers(mut self, workers: usize) -> Self {
        self.dispatch_workers = workers;
        self
    }

    pub fn timeout(&self, mode: Mode) -> Duration {
        match self.timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => match mode {
                Mode::Server => SERVER_TIMEOUT,
                Mode::Client => CLIENT_TIMEOUT,
            },
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }
}

/// How the binary participates in a crawl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Holds the task queue and serves it to slaves.
    Master,
    /// Pulls tasks from a master.
    Slave,
    /// Single process, no network.
    #[default]
    Offline,
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "master" | "server" => Ok(RunMode::Master),
            "slave" | "client" => Ok(RunMode::Slave),
            "offline" => Ok(RunMode::Offline),
            other => bail!("unknown mode '{}', expected master, slave or offline", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub mode: RunMode,
    /// Master host (slave mode).
    pub master: String,
    pub port: u16,
    pub transport: TransportConfig,
    pub crawl: CrawlDefaults,
    pub spiders: Vec<SpiderSpec>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            master: String::new(),
            port: DEFAULT_PORT,
            transport: TransportConfig::default(),
            crawl: CrawlDefaults::default(),
            spiders: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Defaults overlaid with the JSON file at `path`, if any.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_json::from_str::<NodeConfig>(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => NodeConfig::default(),
        };
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode != RunMode::Offline && self.port == 0 {
            bail!("port must be non-zero in {:?} mode", self.mode);
        }
        if self.mode == RunMode::Slave && self.master.trim().is_empty() {
            bail!("slave mode needs a master address");
        }
        if self.crawl.thread_num == 0 {
            bail!("thread_num must be at least 1");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// `master` with `port` appended unless it already names one.
    pub fn master_addr(&self) -> String {
        if self.master.contains(':') {
            self.master.clone()
        } else {
            format!("{}:{}", self.master, self.port)
        }
    }
}
