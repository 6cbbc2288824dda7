//! Distribution Module Tests
//!
//! ## Test Scopes
//! - **Data Structures**: Task wire names, spider parsing, batching.
//! - **Queue**: FIFO order, Id stamping, blocking on full/empty.
//! - **Payloads**: typed decoding of `task` and `log` bodies.
//! - **Roles**: the producer/consumer pull exchange, in-process and over loopback TCP.

#[cfg(test)]
mod tests {
    use crate::config::TransportConfig;
    use crate::distribute::payload::{Payload, PayloadRegistry};
    use crate::distribute::roles::{self, LocalStore, Role};
    use crate::distribute::types::*;
    use crate::distribute::{Node, TaskQueue};
    use crate::error::TransportError;
    use crate::transport::registry::SessionRegistry;
    use crate::transport::types::{Message, Mode, NodeId, Status};
    use crate::transport::{HandlerTable, Transport};

    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn spider(name: &str) -> SpiderSpec {
        SpiderSpec::new(name, "")
    }

    fn task_named(name: &str) -> Task {
        CrawlDefaults::default().task_for(vec![spider(name)])
    }

    // ============================================================
    // TASK TYPE TESTS
    // ============================================================

    #[test]
    fn test_task_wire_field_names() {
        let task = CrawlDefaults::default().task_for(vec![SpiderSpec::new("news", "rust")]);

        let value = serde_json::to_value(&task).unwrap();

        for key in [
            "Id",
            "Spiders",
            "ThreadNum",
            "Pausetime",
            "OutType",
            "DockerCap",
            "DockerQueueCap",
            "SuccessInherit",
            "FailureInherit",
            "MaxPage",
            "Keywords",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(value["Spiders"][0], json!({"name": "news", "keyword": "rust"}));
        assert_eq!(value["Pausetime"], json!([1000, 3000]));
    }

    #[test]
    fn test_task_decodes_with_missing_fields() {
        let task: Task = serde_json::from_value(json!({"Id": 4, "Spiders": [{"name": "wiki"}]})).unwrap();

        assert_eq!(task.id, 4);
        assert_eq!(task.spiders, vec![spider("wiki")]);
        assert_eq!(task.max_page, 0);
    }

    #[test]
    fn test_spider_spec_parsing() {
        assert_eq!("news".parse::<SpiderSpec>().unwrap(), spider("news"));
        assert_eq!(
            "news:rust lang".parse::<SpiderSpec>().unwrap(),
            SpiderSpec::new("news", "rust lang")
        );
        assert!(":orphan".parse::<SpiderSpec>().is_err());
        assert_eq!(SpiderSpec::new("a", "b").to_string(), "a:b");
    }

    #[test]
    fn test_batch_tasks_caps_spiders_per_task() {
        let spiders: Vec<SpiderSpec> = (0..25).map(|i| spider(&format!("s{}", i))).collect();
        let defaults = CrawlDefaults {
            thread_num: 7,
            max_page: 3,
            ..CrawlDefaults::default()
        };

        let tasks = batch_tasks(&spiders, &defaults);

        let sizes: Vec<usize> = tasks.iter().map(|t| t.spiders.len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(tasks[2].spiders[0], spider("s20"));
        assert!(tasks.iter().all(|t| t.thread_num == 7 && t.max_page == 3));
    }

    #[test]
    fn test_batch_tasks_empty_input() {
        assert!(batch_tasks(&[], &CrawlDefaults::default()).is_empty());
    }

    #[test]
    fn test_docker_queue_cap_follows_docker_cap() {
        let with_cap = |docker_cap| CrawlDefaults {
            docker_cap,
            ..CrawlDefaults::default()
        };

        assert_eq!(with_cap(10).effective_docker_queue_cap(), 500);
        assert_eq!(with_cap(10_000).effective_docker_queue_cap(), 50);
        assert_eq!(with_cap(1_000_000).effective_docker_queue_cap(), 4);

        let explicit = CrawlDefaults {
            docker_queue_cap: 9,
            ..CrawlDefaults::default()
        };
        assert_eq!(explicit.effective_docker_queue_cap(), 9);
    }

    // ============================================================
    // QUEUE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_queue_fifo_with_sequential_ids() {
        // ARRANGE
        let queue = TaskQueue::default();
        let names = ["a", "b", "c", "d"];

        // ACT
        for name in names {
            queue.push(task_named(name)).await.unwrap();
        }

        // ASSERT
        for (expected_id, name) in names.iter().enumerate() {
            let task = queue.pull().await;
            assert_eq!(task.id, expected_id);
            assert_eq!(task.spiders[0].name, *name);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queue_id_is_length_at_push() {
        let queue = TaskQueue::default();
        queue.push(task_named("a")).await.unwrap();
        queue.push(task_named("b")).await.unwrap();
        queue.pull().await;

        // One Task left, so the next one is stamped 1 again.
        let id = queue.push(task_named("c")).await.unwrap();

        assert_eq!(id, 1);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_queue_accept_keeps_id() {
        let queue = TaskQueue::default();
        let mut task = task_named("remote");
        task.id = 42;

        assert_eq!(queue.accept(task).await.unwrap(), 42);
        assert_eq!(queue.pull().await.id, 42);
    }

    #[tokio::test]
    async fn test_queue_push_waits_when_full() {
        let queue = Arc::new(TaskQueue::new(2));
        queue.push(task_named("a")).await.unwrap();
        queue.push(task_named("b")).await.unwrap();

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(task_named("c")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        assert_eq!(queue.pull().await.spiders[0].name, "a");
        let id = tokio::time::timeout(WAIT, blocked).await.unwrap().unwrap().unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn test_queue_pull_waits_when_empty() {
        let queue = Arc::new(TaskQueue::default());
        assert!(queue.try_pull().is_none());

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pull().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        // A parked pull holds the receiver; try_pull must not wait on it.
        assert!(queue.try_pull().is_none());

        queue.push(task_named("late")).await.unwrap();
        let task = tokio::time::timeout(WAIT, waiting).await.unwrap().unwrap();
        assert_eq!(task.spiders[0].name, "late");
    }

    // ============================================================
    // PAYLOAD TESTS
    // ============================================================

    fn task_msg(body: serde_json::Value) -> Message {
        Message::new(NodeId::from("M"), NodeId::from("C"), OP_TASK, "", body)
    }

    #[test]
    fn test_payload_task_object_and_string_bodies() {
        let payloads = PayloadRegistry::default();
        let task = task_named("news");
        let object = serde_json::to_value(&task).unwrap();
        let string = json!(serde_json::to_string(&task).unwrap());

        assert_eq!(payloads.decode(&task_msg(object)).unwrap(), Payload::Task(task.clone()));
        assert_eq!(payloads.decode(&task_msg(string)).unwrap(), Payload::Task(task));
    }

    #[test]
    fn test_payload_empty_task_body_is_request() {
        let payloads = PayloadRegistry::default();

        assert_eq!(payloads.decode(&task_msg(json!(null))).unwrap(), Payload::TaskRequest);
        assert!(payloads.decode(&task_msg(json!(12))).is_err());
        assert!(payloads.decode(&task_msg(json!("{not json"))).is_err());
    }

    #[test]
    fn test_payload_log_and_unknown_operation() {
        let payloads = PayloadRegistry::default();
        let log = Message::new(NodeId::from("C"), NodeId::from("M"), OP_LOG, "", json!("42 pages"));
        let other = Message::new(NodeId::from("C"), NodeId::from("M"), "stats", "", json!(null));

        assert_eq!(payloads.decode(&log).unwrap(), Payload::LogLine("42 pages".to_string()));
        assert!(payloads.decode(&other).is_err());
        assert_eq!(
            Payload::LogLine("x".to_string()).into_body().unwrap(),
            json!("x")
        );
    }

    // ============================================================
    // ROLE TESTS
    // ============================================================

    #[test]
    fn test_role_modes() {
        assert_eq!(Role::Master.mode(), Mode::Server);
        assert_eq!(Role::Server.mode(), Mode::Server);
        assert_eq!(Role::Slave.mode(), Mode::Client);
        assert_eq!(Role::Client.mode(), Mode::Client);
    }

    fn role_table(role: Role) -> (Arc<HandlerTable>, Arc<TaskQueue>) {
        let handlers = HandlerTable::new();
        let queue = Arc::new(TaskQueue::default());
        let store = LocalStore::new(queue.clone(), SessionRegistry::new());
        roles::install(role, &handlers, store, Arc::new(PayloadRegistry::default())).unwrap();
        (handlers, queue)
    }

    #[tokio::test]
    async fn test_producer_consumer_pull_exchange() {
        // ARRANGE: producer M holds Task 0, consumer C has nothing
        let (producer, producer_queue) = role_table(Role::Master);
        let (consumer, consumer_queue) = role_table(Role::Slave);
        producer_queue.push(task_named("news")).await.unwrap();

        // ACT: C asks M for work
        let request = Message::new(NodeId::from("C"), NodeId::from("M"), OP_TASK, "", json!(null));
        let mut reply = producer.get(OP_TASK).unwrap()(request).await.unwrap().unwrap();

        // Routing defaults the dispatcher fills in.
        reply.to = NodeId::from("C");
        reply.from = NodeId::from("M");
        reply.operation = OP_TASK.to_string();

        // ASSERT: the reply carries Task 0 and C's own handler queues it
        assert_eq!(reply.body["Id"], json!(0));
        assert_eq!(reply.status, Status::Success);

        let pushed = consumer.get(OP_TASK).unwrap()(reply).await.unwrap();
        assert!(pushed.is_none());

        let task = consumer_queue.pull().await;
        assert_eq!(task.id, 0);
        assert_eq!(task.spiders, vec![spider("news")]);
        assert!(producer_queue.is_empty());
    }

    #[tokio::test]
    async fn test_consumer_ignores_failure_replies() {
        let (consumer, queue) = role_table(Role::Client);
        let failure = Message::error(task_msg(json!(null)), Status::Failure, "node C is not connected");

        let result = consumer.get(OP_TASK).unwrap()(failure).await.unwrap();

        assert!(result.is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_consumer_rejects_malformed_task() {
        let (consumer, queue) = role_table(Role::Slave);

        let result = consumer.get(OP_TASK).unwrap()(task_msg(json!([1, 2]))).await;

        assert!(result.is_err());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_log_handler_returns_nothing() {
        let (producer, _) = role_table(Role::Server);
        let line = Message::new(NodeId::from("C"), NodeId::from("M"), OP_LOG, "", json!("crawl done"));

        assert!(producer.get(OP_LOG).unwrap()(line).await.unwrap().is_none());
    }

    // ============================================================
    // NODE TESTS
    // ============================================================

    fn fast_config() -> TransportConfig {
        TransportConfig::default()
            .set_retry_interval(Duration::from_millis(50))
            .set_dispatch_workers(4)
    }

    #[tokio::test]
    async fn test_offline_node_drains_local_queue() {
        let node = Node::new(Role::Master, fast_config()).unwrap();
        let ids = node
            .add_spiders(&[spider("a"), spider("b")], &CrawlDefaults::default())
            .await
            .unwrap();

        node.report("offline line");
        let task = tokio::time::timeout(WAIT, node.next_task()).await.unwrap();

        assert_eq!(ids, vec![0]);
        assert_eq!(task.spiders.len(), 2);
        assert_eq!(node.transport().mode(), None);
    }

    #[tokio::test]
    async fn test_node_role_guards() {
        let consumer = Node::new(Role::Slave, fast_config()).unwrap();
        let producer = Node::new(Role::Master, fast_config()).unwrap();

        assert!(matches!(
            consumer.serve("127.0.0.1:0").await,
            Err(TransportError::InvalidMode(Mode::Client))
        ));
        assert!(matches!(
            producer.connect("127.0.0.1:1", false),
            Err(TransportError::InvalidMode(Mode::Server))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slave_pulls_tasks_from_master_over_tcp() {
        // ARRANGE
        let master = Node::new(Role::Master, fast_config()).unwrap();
        let addr = master.serve("127.0.0.1:0").await.unwrap();
        master.add_task(task_named("first")).await.unwrap();
        master.add_task(task_named("second")).await.unwrap();

        let slave = Node::new(Role::Slave, fast_config()).unwrap();
        slave.connect(&addr.to_string(), false).unwrap();

        // ACT
        let first = tokio::time::timeout(WAIT, slave.next_task()).await.unwrap();
        let second = tokio::time::timeout(WAIT, slave.next_task()).await.unwrap();

        // ASSERT
        assert_eq!((first.id, first.spiders[0].name.as_str()), (0, "first"));
        assert_eq!((second.id, second.spiders[0].name.as_str()), (1, "second"));
        assert!(master.queue().is_empty());
        assert_eq!(master.count_nodes(), 1);

        slave.report("finished task 1");
        slave.close();
        master.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slave_waits_for_master_to_have_work() {
        let master = Node::new(Role::Master, fast_config()).unwrap();
        let addr = master.serve("127.0.0.1:0").await.unwrap();

        let slave = Node::new(Role::Slave, fast_config()).unwrap();
        slave.connect(&addr.to_string(), false).unwrap();

        let pulling = {
            let slave = slave.clone();
            tokio::spawn(async move { slave.next_task().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!pulling.is_finished());

        master.add_task(task_named("late")).await.unwrap();

        let task = tokio::time::timeout(WAIT, pulling).await.unwrap().unwrap();
        assert_eq!(task.spiders[0].name, "late");

        slave.close();
        master.close();
    }
    async fn wait_for_nodes(node: &Node, count: usize) {
        tokio::time::timeout(WAIT, async {
            while node.count_nodes() < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parked_pulls_leave_dispatch_workers_free() {
        // ARRANGE: two dispatch workers, three slaves pulling from an empty queue
        let master = Node::new(Role::Master, fast_config().set_dispatch_workers(2)).unwrap();
        let addr = master.serve("127.0.0.1:0").await.unwrap();

        let mut slaves = Vec::new();
        let mut pulling = Vec::new();
        for _ in 0..3 {
            let slave = Node::new(Role::Slave, fast_config()).unwrap();
            slave.connect(&addr.to_string(), false).unwrap();
            pulling.push({
                let slave = slave.clone();
                tokio::spawn(async move { slave.next_task().await })
            });
            slaves.push(slave);
        }
        wait_for_nodes(&master, 3).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let client = Transport::new(fast_config());
        client
            .handlers()
            .register("unknown-op", move |msg: Message| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(msg.status);
                    Ok(None)
                }
            })
            .unwrap();
        client.start_client(&addr.to_string(), false).unwrap();

        // ACT: an operation the master lacks, while every worker would be parked
        client.request(Value::Null, "unknown-op", "", None).await;

        // ASSERT: the master still answers it
        let status = tokio::time::timeout(WAIT, seen_rx.recv()).await.unwrap();
        assert_eq!(status, Some(Status::Illegal));

        // Every parked pull is served once work shows up.
        for name in ["a", "b", "c"] {
            master.add_task(task_named(name)).await.unwrap();
        }
        let mut names = Vec::new();
        for handle in pulling {
            let task = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
            names.push(task.spiders[0].name.clone());
        }
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(master.queue().is_empty());

        client.close(&[]);
        for slave in &slaves {
            slave.close();
        }
        master.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slave_report_reaches_master_log_handler() {
        // ARRANGE: master with an observing log handler
        let master = Node::new(Role::Master, fast_config()).unwrap();
        let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
        master
            .transport()
            .handlers()
            .register(OP_LOG, move |msg: Message| {
                let lines_tx = lines_tx.clone();
                async move {
                    let _ = lines_tx.send((msg.from, msg.body));
                    Ok(None)
                }
            })
            .unwrap();
        let addr = master.serve("127.0.0.1:0").await.unwrap();

        let slave = Node::new(Role::Slave, fast_config()).unwrap();
        slave.connect(&addr.to_string(), false).unwrap();
        wait_for_nodes(&master, 1).await;

        // ACT
        slave.report("x");

        // ASSERT
        let (from, body) = tokio::time::timeout(WAIT, lines_rx.recv()).await.unwrap().unwrap();
        assert_eq!(from, slave.transport().uid());
        assert_eq!(body, json!("x"));

        slave.close();
        master.close();
    }
}
