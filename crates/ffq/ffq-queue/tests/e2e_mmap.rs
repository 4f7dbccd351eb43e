//! Multi-process test for a file-backed queue.
//!
//! The test binary re-runs itself: once as the producer, which creates the
//! region and enqueues, and once per consumer, each of which maps the same
//! file on its own and dequeues until it sees its sentinel.
//!
//! ```text
//! [producer]   --[create]--[enqueue ... close]-----------[exit]
//!                    |          |   |   |
//!                 [file]    (claims via head)
//!                    |          |   |   |
//! [consumer 0] ----[open]---[dequeue ...]---[sentinel]---[exit]
//! [consumer 1] ----[open]---[dequeue ...]---[sentinel]---[exit]
//! ```
//!
//! Afterwards the orchestrator maps the file once more and checks the
//! completion counter.
//!
//! ```bash
//! cargo test -p ffq-queue --test e2e_mmap -- --nocapture
//! ```

use std::env;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use ffq_events::DataItem;
use ffq_queue::{Backoff, FfQueue, QueueConfig, SyncOptions, SyncStrategy};

/// Writes to stderr with an immediate flush, past the test harness capture.
macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const ENV_ROLE: &str = "FFQ_E2E_ROLE";
const ENV_PATH: &str = "FFQ_E2E_PATH";
const ENV_CONSUMER_ID: &str = "FFQ_E2E_CONSUMER";

const ROLE_PRODUCER: &str = "producer";
const ROLE_CONSUMER: &str = "consumer";

const ITEM_COUNT: u64 = 5_000;
const CONSUMERS: usize = 2;
/// Small on purpose, so the producer laps slow consumers and leaves gaps.
const QUEUE_CAPACITY: usize = 16;

fn test_path() -> String {
    let pid = std::process::id();
    format!("/tmp/ffq_e2e_queue_{pid}")
}

/// Across processes there is no doorbell, so waits are kept short.
fn options() -> SyncOptions {
    SyncOptions::new(SyncStrategy::Batched)
        .with_backoff(Backoff::Exponential {
            initial: Duration::from_micros(10),
            max: Duration::from_millis(1),
        })
        .with_max_retries(None)
}

fn run_producer(path: &str) {
    log!("[PRODUCER] Creating queue at {path}, capacity {QUEUE_CAPACITY}");
    let q = FfQueue::<DataItem>::create(path, &QueueConfig::new(QUEUE_CAPACITY).with_options(options()))
        .expect("producer: failed to create queue");
    let mut p = q.producer().expect("producer: role already taken");

    let start = Instant::now();
    for id in 0..ITEM_COUNT {
        p.enqueue(DataItem::new(id, id as f64, id, "e2e"))
            .expect("producer: enqueue failed");
    }
    p.close(CONSUMERS).expect("producer: close failed");

    let elapsed = start.elapsed();
    log!("[PRODUCER] Complete");
    log!("[PRODUCER]   items: {ITEM_COUNT}");
    log!("[PRODUCER]   gaps left: {}", p.gaps());
    log!("[PRODUCER]   elapsed: {elapsed:?}");
    log!(
        "[PRODUCER]   throughput: {:.0} items/sec",
        ITEM_COUNT as f64 / elapsed.as_secs_f64()
    );
}

fn run_consumer(path: &str, id: usize) {
    log!("[CONSUMER {id}] Waiting for queue at {path}");

    // The producer may not have created or initialized the region yet.
    let open_deadline = Instant::now() + Duration::from_secs(5);
    let q = loop {
        match FfQueue::<DataItem>::open(path, options()) {
            Ok(q) => break q,
            Err(_) if Instant::now() < open_deadline => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("[CONSUMER {id}] Failed to open queue: {e}"),
        }
    };

    let mut c = q.consumer(id);
    let mut last: Option<u64> = None;
    let mut received = 0u64;
    while let Some(item) = c.recv().expect("consumer: dequeue failed") {
        // Claims only grow, and so do the sequence numbers items sit under.
        if let Some(prev) = last {
            assert!(item.id > prev, "consumer {id}: {} after {prev}", item.id);
        }
        assert_eq!(item.value, item.id as f64);
        last = Some(item.id);
        received += 1;
    }

    let stats = c.stats();
    log!("[CONSUMER {id}] Complete");
    log!("[CONSUMER {id}]   items: {received}");
    log!("[CONSUMER {id}]   reclaims: {}", stats.reclaims);
    assert_eq!(stats.sentinels, 1);
}

#[test]
fn e2e_multi_process_file_backed_queue() {
    if let Ok(role) = env::var(ENV_ROLE) {
        let path = env::var(ENV_PATH).expect("FFQ_E2E_PATH not set");
        match role.as_str() {
            ROLE_PRODUCER => run_producer(&path),
            ROLE_CONSUMER => {
                let id = env::var(ENV_CONSUMER_ID)
                    .expect("FFQ_E2E_CONSUMER not set")
                    .parse()
                    .expect("consumer id");
                run_consumer(&path, id);
            }
            other => panic!("Unknown role: {other}"),
        }
        return;
    }

    let path = test_path();
    let exe = env::current_exe().expect("Failed to get current executable path");
    let spawn = |role: &str, id: usize| {
        Command::new(&exe)
            .arg("--exact")
            .arg("e2e_multi_process_file_backed_queue")
            .env(ENV_ROLE, role)
            .env(ENV_PATH, &path)
            .env(ENV_CONSUMER_ID, id.to_string())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("Failed to spawn child process")
    };

    log!("");
    log!("{}", "=".repeat(70));
    log!("E2E file-backed queue: 1 producer, {CONSUMERS} consumers, {ITEM_COUNT} items");
    log!("{}", "=".repeat(70));

    let mut producer = spawn(ROLE_PRODUCER, 0);
    std::thread::sleep(Duration::from_millis(5));
    let mut consumers: Vec<_> = (0..CONSUMERS).map(|id| spawn(ROLE_CONSUMER, id)).collect();

    let producer_status = producer.wait().expect("Failed to wait for producer");
    let consumer_statuses: Vec<_> = consumers
        .iter_mut()
        .map(|c| c.wait().expect("Failed to wait for consumer"))
        .collect();

    let completed = FfQueue::<DataItem>::open(&path, options())
        .and_then(|q| q.completed_count())
        .expect("Failed to reopen queue");
    let _ = std::fs::remove_file(&path);

    assert!(producer_status.success(), "Producer failed: {producer_status}");
    for status in consumer_statuses {
        assert!(status.success(), "Consumer failed: {status}");
    }
    assert_eq!(completed, ITEM_COUNT + CONSUMERS as u64);

    log!("[ORCHESTRATOR] Passed, {completed} dequeues completed");
}
