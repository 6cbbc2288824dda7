use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operation a consumer uses to pull, and a producer to push, one [`Task`].
pub const OP_TASK: &str = "task";

/// Operation carrying free-text status lines between nodes.
pub const OP_LOG: &str = "log";

/// Most spiders a single producer-built Task carries.
pub const MAX_SPIDERS_PER_TASK: usize = 10;

/// One spider to run, optionally scoped to a keyword.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiderSpec {
    pub name: String,
    pub keyword: String,
}

impl SpiderSpec {
    pub fn new(name: impl Into<String>, keyword: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keyword: keyword.into(),
        }
    }
}

/// `name` or `name:keyword`.
impl FromStr for SpiderSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (name, keyword) = s.split_once(':').unwrap_or((s, ""));
        if name.trim().is_empty() {
            bail!("spider name is empty in '{}'", s);
        }
        Ok(Self::new(name.trim(), keyword.trim()))
    }
}

impl fmt::Display for SpiderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.keyword.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}:{}", self.name, self.keyword)
        }
    }
}

/// A unit of crawl work handed from a producer to exactly one consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Task {
    /// Queue position at enqueue time.
    pub id: usize,
    pub spiders: Vec<SpiderSpec>,
    pub thread_num: u32,
    /// Base and random pause between requests, in milliseconds.
    pub pausetime: [u64; 2],
    pub out_type: String,
    pub docker_cap: u32,
    pub docker_queue_cap: u32,
    pub success_inherit: bool,
    pub failure_inherit: bool,
    pub max_page: i64,
    pub keywords: String,
}

/// Run parameters copied into every Task a producer builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlDefaults {
    pub thread_num: u32,
    pub pausetime: [u64; 2],
    pub out_type: String,
    pub docker_cap: u32,
    /// Zero derives it from `docker_cap`.
    pub docker_queue_cap: u32,
    pub success_inherit: bool,
    pub failure_inherit: bool,
    pub max_page: i64,
    pub keywords: String,
}

impl Default for CrawlDefaults {
    fn default() -> Self {
        Self {
            thread_num: 20,
            pausetime: [1000, 3000],
            out_type: "csv".to_string(),
            docker_cap: 10_000,
            docker_queue_cap: 0,
            success_inherit: true,
            failure_inherit: true,
            max_page: 100,
            keywords: String::new(),
        }
    }
}

impl CrawlDefaults {
    /// Output pool size: smaller batches get a deeper pool.
    pub fn effective_docker_queue_cap(&self) -> u32 {
        if self.docker_queue_cap > 0 {
            return self.docker_queue_cap;
        }
        match self.docker_cap {
            0..=10 => 500,
            11..=500 => 200,
            501..=1000 => 100,
            1001..=10_000 => 50,
            10_001..=100_000 => 10,
            _ => 4,
        }
    }

    /// A Task for `spiders` carrying these parameters. `Id` is assigned on push.
    pub fn task_for(&self, spiders: Vec<SpiderSpec>) -> Task {
        Task {
            id: 0,
            spiders,
            thread_num: self.thread_num,
            pausetime: self.pausetime,
            out_type: self.out_type.clone(),
            docker_cap: self.docker_cap,
            docker_queue_cap: self.effective_docker_queue_cap(),
            success_inherit: self.success_inherit,
            failure_inherit: self.failure_inherit,
            max_page: self.max_page,
            keywords: self.keywords.clone(),
        }
    }
}

/// Splits `spiders` into Tasks of at most [`MAX_SPIDERS_PER_TASK`] each.
pub fn batch_tasks(spiders: &[SpiderSpec], defaults: &CrawlDefaults) -> Vec<Task> {
    spiders
        .chunks(MAX_SPIDERS_PER_TASK)
        .map(|chunk| defaults.task_for(chunk.to_vec()))
        .collect()
}
