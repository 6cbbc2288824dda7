use clap::Parser;
use distributed_crawler::config::{NodeConfig, RunMode};
use distributed_crawler::distribute::{Node, Role, SpiderSpec, Task, batch_tasks};
use distributed_crawler::error::TransportError;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Distributed crawler node.
#[derive(Debug, Parser)]
#[command(name = "crawler-node", version)]
struct Cli {
    /// JSON configuration file.
    #[arg(long, env = "CRAWLER_CONFIG")]
    config: Option<PathBuf>,

    /// master, slave or offline.
    #[arg(long, env = "CRAWLER_MODE")]
    mode: Option<RunMode>,

    /// Master host, for slaves.
    #[arg(long, env = "CRAWLER_MASTER")]
    master: Option<String>,

    #[arg(long, env = "CRAWLER_PORT")]
    port: Option<u16>,

    /// Node id announced to peers.
    #[arg(long, env = "CRAWLER_UID")]
    uid: Option<String>,

    #[arg(long, env = "CRAWLER_PACK_HEADER")]
    pack_header: Option<String>,

    /// Spider to schedule, repeatable.
    #[arg(long = "spider", value_name = "NAME[:KEYWORD]")]
    spiders: Vec<SpiderSpec>,

    #[arg(long, env = "CRAWLER_THREADS")]
    threads: Option<u32>,

    #[arg(long, env = "CRAWLER_MAX_PAGE")]
    max_page: Option<i64>,
}

impl Cli {
    fn apply(self, config: &mut NodeConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(master) = self.master {
            config.master = master;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(uid) = self.uid {
            config.transport.uid = uid;
        }
        if let Some(header) = self.pack_header {
            config.transport.pack_header = header;
        }
        if !self.spiders.is_empty() {
            config.spiders = self.spiders;
        }
        if let Some(threads) = self.threads {
            config.crawl.thread_num = threads;
        }
        if let Some(max_page) = self.max_page {
            config.crawl.max_page = max_page;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = NodeConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {:#}", e);
        return Err(e);
    }

    tracing::info!("Starting crawler node in {:?} mode", config.mode);

    match config.mode {
        RunMode::Master => run_master(config).await,
        RunMode::Slave => run_slave(config).await,
        RunMode::Offline => run_offline(config).await,
    }
}

async fn run_master(config: NodeConfig) -> anyhow::Result<()> {
    let node = Node::new(Role::Master, config.transport.clone())?;
    let addr = node.serve(&config.listen_addr()).await?;
    tracing::info!("Master {} listening on {}", node.transport().uid(), addr);

    // Pushing may wait on a full queue, so it runs beside the server.
    let producer = node.clone();
    tokio::spawn(async move {
        match producer.add_spiders(&config.spiders, &config.crawl).await {
            Ok(ids) => tracing::info!("Queued {} tasks", ids.len()),
            Err(e) => tracing::error!("Failed to queue tasks: {}", e),
        }
    });

    let stats = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            tracing::info!(
                "Cluster stats: {} slaves online, {} tasks waiting",
                stats.count_nodes(),
                stats.queue().len()
            );
        }
    });

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    node.close();
    tracing::info!("Master stopped");
    Ok(())
}

async fn run_slave(config: NodeConfig) -> anyhow::Result<()> {
    let node = Node::new(Role::Slave, config.transport.clone())?;
    node.connect(&config.master_addr(), false)?;

    loop {
        tokio::select! {
            task = node.next_task() => {
                log_task(&task);
                node.report(format!(
                    "task {} accepted by {} ({} spiders)",
                    task.id,
                    node.transport().uid(),
                    task.spiders.len()
                ));
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    node.close();
    tracing::info!("Slave stopped");
    Ok(())
}

async fn run_offline(config: NodeConfig) -> anyhow::Result<()> {
    let node = Node::new(Role::Master, config.transport.clone())?;
    let tasks = batch_tasks(&config.spiders, &config.crawl);
    let total = tasks.len();

    let producer = {
        let node = node.clone();
        tokio::spawn(async move {
            for task in tasks {
                node.add_task(task).await?;
            }
            Ok::<_, TransportError>(())
        })
    };

    for _ in 0..total {
        let task = node.next_task().await;
        log_task(&task);
        node.report(format!("task {} done offline", task.id));
    }
    producer.await??;

    tracing::info!("Offline run finished: {} tasks", total);
    Ok(())
}

fn log_task(task: &Task) {
    let spiders: Vec<String> = task.spiders.iter().map(ToString::to_string).collect();
    tracing::info!(
        "Task {}: {} threads, max {} pages, output {}, spiders [{}]",
        task.id,
        task.thread_num,
        task.max_page,
        task.out_type,
        spiders.join(", ")
    );
}
