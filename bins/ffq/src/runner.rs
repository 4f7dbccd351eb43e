//! The three run modes: one producer thread feeding `consumers` consumer
//! threads through one queue region.

use crate::report::{ConsumerReport, RunReport, compute_stats, rate};
use anyhow::{Context, Result, anyhow};
use ffq_config::{FfqConfig, RunMode};
use ffq_events::{ParseError, WeatherReading};
use ffq_queue::{ConsumerStats, FfQueue, Producer, QueueConfig, QueueError, Sentinel};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Test-mode consumers check the completion counter between dequeues, so a
/// dequeue has to give up eventually even when none is configured.
const TEST_MODE_RETRIES: u32 = 100;

const PROGRESS_EVERY: u64 = 10_000;

pub fn run(cfg: &FfqConfig) -> Result<RunReport> {
    match cfg.mode {
        RunMode::Test => run_test(cfg),
        RunMode::Benchmark => run_benchmark(cfg),
        RunMode::File => run_file(cfg),
    }
}

#[derive(Debug, Default)]
struct Produced {
    enqueued: u64,
    malformed: u64,
}

struct Consumed {
    report: ConsumerReport,
    latencies_ns: Vec<u64>,
}

impl Consumed {
    fn new(id: usize, stats: ConsumerStats, elapsed: Duration, latencies_ns: Vec<u64>) -> Self {
        let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;
        Self {
            report: ConsumerReport {
                id,
                items: stats.items(),
                reclaims: stats.reclaims,
                timeouts: stats.timeouts,
                elapsed_ms,
                items_per_sec: rate(stats.items(), elapsed_ms),
            },
            latencies_ns,
        }
    }
}

/// The producer's queue handle plus one handle per consumer. In a
/// file-backed run every consumer maps the region on its own.
fn setup<T: Copy + Send>(
    cfg: &FfqConfig,
    qc: &QueueConfig,
) -> Result<(FfQueue<T>, Vec<FfQueue<T>>)> {
    match &cfg.shm_file_path {
        None => {
            let queue = FfQueue::anonymous(qc).context("creating anonymous queue")?;
            let handles = vec![queue.clone(); cfg.consumers];
            Ok((queue, handles))
        }
        Some(path) => {
            let queue =
                FfQueue::create(path, qc).with_context(|| format!("creating queue at {path}"))?;
            let handles = (0..cfg.consumers)
                .map(|_| FfQueue::open(path, qc.options).with_context(|| format!("opening {path}")))
                .collect::<Result<Vec<_>>>()?;
            Ok((queue, handles))
        }
    }
}

/// Raises the cancel flag if a consumer leaves without finishing, whether by
/// error or by panic.
struct CancelOnExit<'a> {
    cancel: &'a AtomicBool,
    finished: bool,
}

impl Drop for CancelOnExit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.store(true, Ordering::Release);
        }
    }
}

fn is_cancelled(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|c| matches!(c.downcast_ref::<QueueError>(), Some(QueueError::Cancelled)))
}

/// The failure that started a shutdown, rather than the cancellations it
/// caused. `failures` is never empty.
fn first_cause(mut failures: Vec<anyhow::Error>) -> anyhow::Error {
    let i = failures.iter().position(|e| !is_cancelled(e)).unwrap_or(0);
    failures.swap_remove(i)
}

/// Runs `produce` on this thread and `consume` on one scoped thread per
/// consumer, all released together. Whichever side fails raises the shared
/// cancel flag, and the other side's waits give up on it.
fn drive<T, P, C>(cfg: &FfqConfig, qc: QueueConfig, produce: P, consume: C) -> Result<RunReport>
where
    T: Copy + Send,
    P: FnOnce(&mut Producer<T>, &AtomicBool) -> Result<Produced>,
    C: Fn(&FfQueue<T>, usize, &AtomicBool) -> Result<Consumed> + Sync,
{
    let (queue, handles) = setup::<T>(cfg, &qc)?;
    let mut producer = queue.producer().context("attaching producer")?;
    let start = Barrier::new(cfg.consumers + 1);
    let cancel = AtomicBool::new(false);

    tracing::info!(
        mode = ?cfg.mode,
        strategy = ?qc.options.strategy,
        capacity = qc.capacity,
        consumers = cfg.consumers,
        file_backed = queue.is_file_backed(),
        "starting run"
    );

    let (produced, consumed, elapsed) = std::thread::scope(|s| -> Result<_> {
        let workers: Vec<_> = handles
            .iter()
            .enumerate()
            .map(|(id, q)| {
                let start = &start;
                let consume = &consume;
                let cancel = &cancel;
                s.spawn(move || {
                    let mut guard = CancelOnExit {
                        cancel,
                        finished: false,
                    };
                    start.wait();
                    let consumed = consume(q, id, cancel);
                    match &consumed {
                        Ok(_) => guard.finished = true,
                        Err(e) if !is_cancelled(e) => {
                            tracing::error!(consumer = id, error = %e, "consumer failed")
                        }
                        Err(_) => {}
                    }
                    consumed
                })
            })
            .collect();

        start.wait();
        let began = Instant::now();
        let produced = produce(&mut producer, &cancel);
        if let Err(e) = &produced {
            if !is_cancelled(e) {
                tracing::error!(error = %e, "producer failed");
            }
            cancel.store(true, Ordering::Release);
        }

        let mut consumed = Vec::with_capacity(workers.len());
        let mut failures = Vec::new();
        for (id, w) in workers.into_iter().enumerate() {
            match w.join() {
                Ok(Ok(c)) => consumed.push(c),
                Ok(Err(e)) => failures.push(e.context(format!("consumer {id}"))),
                Err(_) => failures.push(anyhow!("consumer {id} panicked")),
            }
        }
        let produced = match produced {
            Ok(p) => p,
            Err(e) => {
                failures.insert(0, e.context("producer"));
                return Err(first_cause(failures));
            }
        };
        if !failures.is_empty() {
            return Err(first_cause(failures));
        }
        Ok((produced, consumed, began.elapsed()))
    })?;
    drop(producer);

    let mut latencies: Vec<u64> = consumed
        .iter()
        .flat_map(|c| c.latencies_ns.iter().copied())
        .collect();
    let consumers: Vec<ConsumerReport> = consumed.into_iter().map(|c| c.report).collect();
    let delivered: u64 = consumers.iter().map(|c| c.items).sum();
    let status = queue.status()?;
    let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;

    Ok(RunReport {
        mode: format!("{:?}", cfg.mode).to_lowercase(),
        strategy: format!("{:?}", qc.options.strategy).to_lowercase(),
        capacity: qc.capacity,
        enqueued: produced.enqueued,
        malformed: produced.malformed,
        gaps: status.gaps,
        completed: status.completed,
        elapsed_ms,
        items_per_sec: rate(delivered, elapsed_ms),
        consumers,
        dequeue_latency_ns: compute_stats(&mut latencies),
    })
}

/// Dequeues until this consumer's sentinel arrives. Timeouts are logged by
/// the queue and retried here on the same claim, so an item's latency runs
/// from the end of the previous delivery to its own.
fn consume_until_sentinel<T, F>(
    q: &FfQueue<T>,
    id: usize,
    cancel: &AtomicBool,
    mut on_item: F,
) -> Result<Consumed>
where
    T: Copy + Send + Sentinel,
    F: FnMut(&T),
{
    let mut c = q.consumer(id);
    let mut latencies_ns = Vec::new();
    let began = Instant::now();
    let mut waiting_since = Instant::now();
    loop {
        match c.recv_until(cancel) {
            Ok(Some(item)) => {
                latencies_ns.push(waiting_since.elapsed().as_nanos() as u64);
                on_item(&item);
                let n = c.stats().items();
                if n % PROGRESS_EVERY == 0 {
                    tracing::info!(consumer = id, items = n, "progress");
                }
                waiting_since = Instant::now();
            }
            Ok(None) => break,
            Err(e) if e.is_recoverable() => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Consumed::new(id, c.stats(), began.elapsed(), latencies_ns))
}

/// Generated readings with pauses on both sides; consumers stop once
/// `items` dequeues have completed queue-wide.
fn run_test(cfg: &FfqConfig) -> Result<RunReport> {
    let mut qc = cfg.queue_config();
    if qc.options.max_retries.is_none() {
        qc.options = qc.options.with_max_retries(Some(TEST_MODE_RETRIES));
    }
    let items = cfg.items;
    let producer_delay = cfg.producer_delay();
    let consumer_delay = cfg.consumer_delay();

    drive(
        cfg,
        qc,
        |p: &mut Producer<WeatherReading>, cancel: &AtomicBool| {
            for n in 1..=items {
                let e = p.enqueue_until(WeatherReading::synthetic(n as u32), cancel)?;
                tracing::info!(item = n, seq = e.seq, slot = e.index, skipped = e.skipped, "produced");
                std::thread::sleep(producer_delay);
            }
            Ok(Produced {
                enqueued: items,
                malformed: 0,
            })
        },
        |q, id, cancel| {
            let mut c = q.consumer(id);
            let began = Instant::now();
            while q.completed_count()? < items {
                match c.dequeue_until(cancel) {
                    Ok(d) => {
                        tracing::info!(
                            consumer = id,
                            seq = d.seq,
                            city = %d.item.city,
                            aqi = d.item.aqi,
                            humidity = d.item.humidity,
                            "consumed"
                        );
                        std::thread::sleep(consumer_delay);
                    }
                    Err(e) if e.is_recoverable() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(Consumed::new(id, c.stats(), began.elapsed(), Vec::new()))
        },
    )
}

/// As many readings as fast as possible, closed with sentinels. Readings
/// come from `csv_file` when one is configured.
fn run_benchmark(cfg: &FfqConfig) -> Result<RunReport> {
    let consumers = cfg.consumers;
    let items = cfg.items;
    let csv = cfg.csv_file.clone();

    drive(
        cfg,
        cfg.queue_config(),
        |p: &mut Producer<WeatherReading>, cancel: &AtomicBool| {
            let produced = match &csv {
                Some(path) => enqueue_csv(p, path, cancel, |_| {})?,
                None => {
                    for n in 0..items {
                        p.enqueue_until(WeatherReading::synthetic(n as u32), cancel)?;
                        if (n + 1) % PROGRESS_EVERY == 0 {
                            tracing::info!(items = n + 1, "enqueued");
                        }
                    }
                    Produced {
                        enqueued: items,
                        malformed: 0,
                    }
                }
            };
            p.close_until(consumers, cancel)?;
            tracing::info!(sentinels = consumers, "end of stream enqueued");
            Ok(produced)
        },
        |q, id, cancel| consume_until_sentinel(q, id, cancel, |_| {}),
    )
}

/// Readings from `csv_file`, logged one by one on both sides.
fn run_file(cfg: &FfqConfig) -> Result<RunReport> {
    let consumers = cfg.consumers;
    let csv = cfg
        .csv_file
        .clone()
        .context("file mode needs csv_file")?;
    let producer_delay = cfg.producer_delay();
    let consumer_delay = cfg.consumer_delay();

    drive(
        cfg,
        cfg.queue_config(),
        |p: &mut Producer<WeatherReading>, cancel: &AtomicBool| {
            let produced = enqueue_csv(p, &csv, cancel, |r| {
                tracing::info!(city = %r.city, timestamp = %r.timestamp, "produced");
                std::thread::sleep(producer_delay);
            })?;
            p.close_until(consumers, cancel)?;
            Ok(produced)
        },
        |q, id, cancel| {
            consume_until_sentinel(q, id, cancel, |r: &WeatherReading| {
                tracing::info!(
                    consumer = id,
                    city = %r.city,
                    timestamp = %r.timestamp,
                    aqi = r.aqi,
                    icon = %r.weather_icon,
                    wind_speed = r.wind_speed,
                    humidity = r.humidity,
                    "consumed"
                );
                std::thread::sleep(consumer_delay);
            })
        },
    )
}

/// Enqueues every well-formed reading in `path`. The header and blank lines
/// are skipped silently, malformed lines with a warning.
fn enqueue_csv<F>(
    p: &mut Producer<WeatherReading>,
    path: &str,
    cancel: &AtomicBool,
    mut after: F,
) -> Result<Produced>
where
    F: FnMut(&WeatherReading),
{
    let file = File::open(path).with_context(|| format!("opening {path}"))?;
    let mut produced = Produced::default();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {path}"))?;
        match WeatherReading::parse_csv_line(&line) {
            Ok(r) => {
                p.enqueue_until(r, cancel)?;
                produced.enqueued += 1;
                after(&r);
            }
            Err(ParseError::Empty | ParseError::Header) => {}
            Err(e) => {
                produced.malformed += 1;
                tracing::warn!(line = n + 1, error = %e, "skipping malformed line");
            }
        }
    }
    tracing::info!(
        enqueued = produced.enqueued,
        malformed = produced.malformed,
        "csv exhausted"
    );
    Ok(produced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffq_queue::{Backoff, SyncOptions, SyncStrategy};
    use std::io::Write;
    use std::sync::mpsc;

    fn quick(mode: RunMode) -> FfqConfig {
        FfqConfig {
            mode,
            capacity: 4,
            consumers: 3,
            items: 40,
            producer_delay_ms: 0,
            consumer_delay_ms: 0,
            max_retries: Some(20),
            backoff: Some(ffq_config::BackoffConfig::Fixed { delay_us: 100 }),
            ..FfqConfig::default()
        }
    }

    #[test]
    fn test_mode_stops_at_item_count() {
        let report = run(&quick(RunMode::Test)).unwrap();
        assert_eq!(report.enqueued, 40);
        assert_eq!(report.completed, 40);
        let delivered: u64 = report.consumers.iter().map(|c| c.items).sum();
        assert_eq!(delivered, 40);
    }

    #[test]
    fn benchmark_counts_sentinels_in_completion_only() {
        let report = run(&quick(RunMode::Benchmark)).unwrap();
        assert_eq!(report.completed, 43);
        let delivered: u64 = report.consumers.iter().map(|c| c.items).sum();
        assert_eq!(delivered, 40);
        assert_eq!(report.dequeue_latency_ns.unwrap().count, 40);
    }

    #[test]
    fn file_mode_skips_malformed_lines_over_a_mapped_file() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("weather.csv");
        let mut f = File::create(&csv).unwrap();
        writeln!(f, "timestamp,city,aqi,weather_icon,wind_speed,humidity").unwrap();
        writeln!(f, "2025-05-23T22:01:56+07:00,Hanoi,80,01d,3.5,70").unwrap();
        writeln!(f, "2025-05-23T22:01:57+07:00,Hue,not-a-number,02d,1.0,60").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "2025-05-23T22:01:58+07:00,Da Nang,42,03n,2.25,81").unwrap();
        drop(f);

        let cfg = FfqConfig {
            shm_file_path: Some(dir.path().join("region").display().to_string()),
            csv_file: Some(csv.display().to_string()),
            consumers: 2,
            ..quick(RunMode::File)
        };
        let report = run(&cfg).unwrap();
        assert_eq!(report.enqueued, 2);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.completed, 4);
        assert_eq!(report.consumers.len(), 2);
    }

    /// Runs `f` on its own thread and waits at most ten seconds for it.
    fn within_ten_seconds<F>(f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(f());
        });
        rx.recv_timeout(Duration::from_secs(10))
            .expect("run did not return within ten seconds")
    }

    #[test]
    fn missing_csv_fails_the_run_instead_of_hanging() {
        let cases = [
            (RunMode::Benchmark, Some(5)),
            (RunMode::File, Some(5)),
            (RunMode::File, None),
        ];
        for (mode, max_retries) in cases {
            let cfg = FfqConfig {
                csv_file: Some("/nonexistent/weather.csv".to_string()),
                max_retries,
                strategy: ffq_config::StrategyName::Baseline,
                ..quick(mode)
            };
            let err = within_ten_seconds(move || run(&cfg).map(|_| ())).unwrap_err();
            let msg = format!("{err:#}");
            assert!(msg.contains("opening /nonexistent/weather.csv"), "{msg}");
            assert!(!is_cancelled(&err));
        }
    }

    #[test]
    fn failed_consumer_stops_a_producer_facing_a_full_queue() {
        let cfg = quick(RunMode::Benchmark);
        let err = within_ten_seconds(move || {
            drive(
                &cfg,
                cfg.queue_config(),
                |p: &mut Producer<WeatherReading>, cancel: &AtomicBool| {
                    for n in 0..1_000 {
                        p.enqueue_until(WeatherReading::synthetic(n), cancel)?;
                    }
                    Ok(Produced::default())
                },
                |_q: &FfQueue<WeatherReading>, id: usize, _cancel: &AtomicBool| -> Result<Consumed> {
                    Err(anyhow!("consumer {id} lost its input"))
                },
            )
            .map(|_| ())
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("lost its input"));
    }

    #[test]
    fn latency_spans_timeouts_on_the_same_claim() {
        let opts = SyncOptions::new(SyncStrategy::Batched)
            .with_backoff(Backoff::Fixed(Duration::from_millis(1)))
            .with_max_retries(Some(2));
        let q = FfQueue::<WeatherReading>::anonymous(&QueueConfig::new(4).with_options(opts))
            .unwrap();
        let cancel = AtomicBool::new(false);

        let consumed = std::thread::scope(|s| {
            let worker = s.spawn(|| consume_until_sentinel(&q, 0, &cancel, |_| {}));
            std::thread::sleep(Duration::from_millis(50));
            let mut p = q.producer().unwrap();
            p.enqueue(WeatherReading::synthetic(1)).unwrap();
            p.close(1).unwrap();
            worker.join().unwrap().unwrap()
        });

        assert!(consumed.report.timeouts >= 1);
        assert_eq!(consumed.latencies_ns.len(), 1);
        assert!(consumed.latencies_ns[0] >= Duration::from_millis(40).as_nanos() as u64);
    }
}
