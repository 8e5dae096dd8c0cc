//! Dispatch engine: drains the queues of one batch under their rate limits.
//!
//! Each queue releases one record per interval. A released record is sent on its
//! own task, so waiting for a response never holds up the next release; the
//! queue loop only waits on its next tick or on attempts coming back. Queues of
//! a batch are driven concurrently and independently of each other.
//!
//! Release times are booked per [`QueueKey`] on the dispatcher, not per queue.
//! Batches drained at the same time that produce a queue with the same key
//! share its schedule, so together they stay within the key's budget.
//!
//! Every attempt is settled by the [`RetryPolicy`]: finished records are written
//! to the result sink from the attempt's task, retryable failures come back to
//! the queue loop and rejoin the tail of the queue.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterFailure, AdapterRegistry};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::queue::{PendingRecord, Queue, QueueKey};
use crate::retry::{Decision, RetryPolicy};
use crate::sink::ResultSink;
use crate::types::Attempt;

/// Configuration for the dispatch engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Attempts allowed per record, including the first
    pub max_attempts: u32,

    /// Interval for logging requests in flight. Set to None to disable periodic status logging
    pub status_log_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            status_log_interval: None,
        }
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts,
            status_log_interval: config.status_log_interval,
        }
    }
}

/// Counts for one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Records finished with a response
    pub succeeded: usize,
    /// Records finished with an error
    pub failed: usize,
    /// Records skipped because they already had a result
    pub skipped: usize,
    /// Sends made, including retries
    pub attempts: usize,
}

impl DrainSummary {
    fn merge(&mut self, other: DrainSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.attempts += other.attempts;
    }

    /// Records that received a result during this drain.
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// What came back from one attempt task.
enum Settled {
    Finished { success: bool },
    Requeued(PendingRecord),
}

/// Drains queues against the registered destination adapters.
pub struct Dispatcher {
    registry: AdapterRegistry,
    policy: RetryPolicy,
    config: EngineConfig,
    requests_in_flight: Arc<AtomicUsize>,
    /// Last booked release time per queue key, shared by every drain
    release_schedule: Mutex<HashMap<QueueKey, Instant>>,
}

impl Dispatcher {
    pub fn new(registry: AdapterRegistry, config: EngineConfig) -> Self {
        Self {
            registry,
            policy: RetryPolicy::new(config.max_attempts),
            config,
            requests_in_flight: Arc::new(AtomicUsize::new(0)),
            release_schedule: Mutex::new(HashMap::new()),
        }
    }

    /// Book the next release for `key`, at least `interval` after the previous
    /// booking for the same key and never in the past.
    fn book_release(&self, key: &QueueKey, interval: Duration) -> Instant {
        let now = Instant::now();
        let mut schedule = self.release_schedule.lock();
        let slot = match schedule.get(key) {
            Some(previous) => (*previous + interval).max(now),
            None => now,
        };
        schedule.insert(key.clone(), slot);
        slot
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Number of sends currently awaiting a response, across all drains.
    pub fn requests_in_flight(&self) -> usize {
        self.requests_in_flight.load(Ordering::Relaxed)
    }

    /// Drain every queue of a batch until each record has a result.
    ///
    /// Records the sink already holds a result for are skipped. If the sink fails,
    /// all queues of the batch stop releasing new sends, attempts already in
    /// flight are allowed to finish, and the write error is returned.
    #[tracing::instrument(skip(self, queues, sink), fields(batch = %batch))]
    pub async fn drain<S>(&self, batch: &str, mut queues: Vec<Queue>, sink: Arc<S>) -> Result<DrainSummary>
    where
        S: ResultSink + 'static,
    {
        let finished = sink.finished_ids().await?;
        let mut summary = DrainSummary::default();
        for queue in &mut queues {
            summary.skipped += queue.skip_finished(&finished);
        }
        if summary.skipped > 0 {
            tracing::info!(skipped = summary.skipped, "Resuming batch, skipping records that already have results");
        }

        // Periodic status logging, stopped when the drain ends
        let _status = self.config.status_log_interval.map(|interval| {
            let requests_in_flight = self.requests_in_flight.clone();
            let batch = batch.to_string();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    tracing::debug!(
                        batch = %batch,
                        requests_in_flight = requests_in_flight.load(Ordering::Relaxed),
                        "Dispatcher status"
                    );
                }
            });
            scopeguard::guard(handle, |handle| handle.abort())
        });

        let halt = CancellationToken::new();
        let outcomes = futures::future::join_all(
            queues
                .into_iter()
                .filter(|queue| !queue.is_empty())
                .map(|queue| self.drain_queue(queue, sink.clone(), halt.clone())),
        )
        .await;

        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(queue_summary) => summary.merge(queue_summary),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            attempts = summary.attempts,
            "Batch drained"
        );
        Ok(summary)
    }

    /// Run one queue to completion.
    #[tracing::instrument(skip_all, fields(queue = %queue.key))]
    async fn drain_queue<S>(&self, queue: Queue, sink: Arc<S>, halt: CancellationToken) -> Result<DrainSummary>
    where
        S: ResultSink + 'static,
    {
        let interval = queue.interval();
        let Queue {
            key,
            rate_limit,
            pending,
        } = queue;
        let mut pending: VecDeque<PendingRecord> = pending;

        tracing::info!(
            records = pending.len(),
            rpm = rate_limit.rpm(),
            interval_ms = interval.as_millis() as u64,
            "Draining queue"
        );

        let mut in_flight: JoinSet<Result<Settled>> = JoinSet::new();
        let mut summary = DrainSummary::default();
        let mut failure: Option<Error> = None;
        let mut next_release: Option<Instant> = None;

        loop {
            let halted = halt.is_cancelled();
            if (pending.is_empty() || halted) && in_flight.is_empty() {
                break;
            }
            if next_release.is_none() && !pending.is_empty() && !halted {
                next_release = Some(self.book_release(&key, interval));
            }

            tokio::select! {
                // Collect finished attempts first so retries rejoin the queue promptly
                biased;

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok(Ok(Settled::Finished { success: true })) => summary.succeeded += 1,
                        Ok(Ok(Settled::Finished { success: false })) => summary.failed += 1,
                        Ok(Ok(Settled::Requeued(record))) => pending.push_back(record),
                        Ok(Err(e)) => {
                            tracing::error!(error = %e, "Result write failed, halting batch");
                            halt.cancel();
                            failure.get_or_insert(e);
                        }
                        Err(join_error) => {
                            tracing::error!(error = %join_error, "Attempt task panicked, halting batch");
                            halt.cancel();
                            failure.get_or_insert(Error::Other(anyhow::anyhow!(
                                "attempt task failed: {join_error}"
                            )));
                        }
                    }
                }

                _ = halt.cancelled(), if !halted => {}

                _ = tokio::time::sleep_until(next_release.unwrap_or_else(Instant::now)), if next_release.is_some() && !halted => {
                    next_release = None;
                    if let Some(record) = pending.pop_front() {
                        summary.attempts += 1;
                        self.spawn_attempt(&mut in_flight, &key, record, sink.clone());
                    }
                }

                else => break,
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        if halt.is_cancelled() {
            tracing::warn!(
                unsent = pending.len(),
                "Queue halted because another queue of the batch failed to write results"
            );
        } else {
            tracing::info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                attempts = summary.attempts,
                "Queue drained"
            );
        }

        Ok(summary)
    }

    /// Send one attempt on its own task.
    fn spawn_attempt<S>(
        &self,
        in_flight: &mut JoinSet<Result<Settled>>,
        key: &QueueKey,
        pending: PendingRecord,
        sink: Arc<S>,
    ) where
        S: ResultSink + 'static,
    {
        let adapter = self.registry.get(&pending.record.destination);
        let policy = self.policy;
        let requests_in_flight = self.requests_in_flight.clone();
        let queue = key.to_string();

        requests_in_flight.fetch_add(1, Ordering::Relaxed);

        in_flight.spawn(async move {
            let _guard = scopeguard::guard((), |_| {
                requests_in_flight.fetch_sub(1, Ordering::Relaxed);
            });

            let record = pending.record.clone();
            let mut attempt = Attempt::new(record.id, pending.attempts_made + 1);

            tracing::debug!(
                queue = %queue,
                record_id = %record.id,
                attempt = attempt.attempt_number,
                destination = %record.destination,
                "Sending request"
            );

            let result = match adapter {
                Some(adapter) => {
                    adapter
                        .send(&record.target_model, &record.body, &record.parameters)
                        .await
                }
                None => Err(AdapterFailure::terminal(format!(
                    "no adapter registered for destination '{}'",
                    record.destination
                ))),
            };

            if let Err(failure) = &result {
                tracing::warn!(
                    queue = %queue,
                    record_id = %record.id,
                    attempt = attempt.attempt_number,
                    error = %failure,
                    "Attempt failed"
                );
            }

            match policy.settle(pending, &mut attempt, result) {
                Decision::Finalize(result) => {
                    sink.append(&result).await?;
                    tracing::debug!(
                        queue = %queue,
                        record_id = %record.id,
                        attempts_used = result.attempts_used,
                        outcome = ?attempt.outcome,
                        "Record finished"
                    );
                    Ok(Settled::Finished {
                        success: result.is_success(),
                    })
                }
                Decision::Requeue(next) => {
                    tracing::debug!(
                        queue = %queue,
                        record_id = %record.id,
                        next_attempt = next.attempts_made + 1,
                        "Record re-enqueued for retry"
                    );
                    Ok(Settled::Requeued(next))
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{DestinationAdapter, MockAdapter, SendResult};
    use crate::config::RateLimitConfig;
    use crate::queue::group_records;
    use crate::sink::InMemoryResultSink;
    use crate::types::{RecordId, RequestRecord, ResultOutcome};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    fn record(id: i64, destination: &str, model: &str) -> RequestRecord {
        RequestRecord {
            id: RecordId(id),
            destination: destination.to_string(),
            target_model: model.to_string(),
            body: json!({"id": id}),
            parameters: json!({"temperature": 0.1}),
            group: None,
            extra: Default::default(),
        }
    }

    fn limits(default_rpm: f64) -> RateLimitConfig {
        RateLimitConfig {
            default_rpm: Some(default_rpm),
            ..Default::default()
        }
    }

    fn dispatcher(registry: AdapterRegistry, max_attempts: u32) -> Dispatcher {
        Dispatcher::new(
            registry,
            EngineConfig {
                max_attempts,
                status_log_interval: Some(Duration::from_secs(1)),
            },
        )
    }

    fn assert_spaced(times: &[Instant], interval: Duration) {
        for pair in times.windows(2) {
            assert!(
                pair[1] - pair[0] >= interval,
                "sends {:?} apart, expected at least {:?}",
                pair[1] - pair[0],
                interval
            );
        }
    }

    /// Adapter that takes a long time to answer.
    struct SlowAdapter {
        delay: Duration,
        inner: MockAdapter,
    }

    #[async_trait]
    impl DestinationAdapter for SlowAdapter {
        async fn send(&self, target_model: &str, body: &Value, parameters: &Value) -> SendResult {
            let response = self.inner.send(target_model, body, parameters).await;
            tokio::time::sleep(self.delay).await;
            response
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_retryable_record_exhausts_attempts_while_others_succeed() {
        let mock = MockAdapter::with_handler(|_, body, _| {
            if body["id"] == 1 {
                Err(AdapterFailure::retryable("destination throttled"))
            } else {
                Ok(json!({"echo": body["id"]}))
            }
        });
        let registry = AdapterRegistry::new().with("d", Arc::new(mock.clone()));
        let sink = Arc::new(InMemoryResultSink::new());

        let queues = group_records((0..5).map(|id| record(id, "d", "m")).collect(), &limits(30.0))
            .unwrap();
        let start = Instant::now();
        let summary = dispatcher(registry, 3)
            .drain("example", queues, sink.clone())
            .await
            .unwrap();

        assert_eq!(
            summary,
            DrainSummary {
                succeeded: 4,
                failed: 1,
                skipped: 0,
                attempts: 7,
            }
        );

        let results = sink.results();
        assert_eq!(results.len(), 5);
        for result in &results {
            if result.id() == RecordId(1) {
                assert_eq!(result.attempts_used, 3);
                assert_eq!(
                    result.outcome,
                    ResultOutcome::Error(
                        "destination throttled: retries exhausted after 3 attempts".to_string()
                    )
                );
            } else {
                assert_eq!(result.attempts_used, 1);
                assert!(result.is_success());
            }
        }

        // All seven sends share one queue spaced 2s apart; id 1 rejoins at the tail
        let calls = mock.get_calls();
        let times: Vec<Instant> = calls.iter().map(|c| c.at).collect();
        assert_spaced(&times, Duration::from_secs(2));
        let order: Vec<i64> = calls.iter().map(|c| c.body["id"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 1, 1]);
        assert!(start.elapsed() >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queues_are_spaced_independently() {
        let mock = MockAdapter::echo();
        let registry = AdapterRegistry::new()
            .with("slow", Arc::new(mock.clone()))
            .with("fast", Arc::new(mock.clone()));
        let mut rate_limits = limits(60.0);
        rate_limits.destinations.insert("fast".to_string(), 120.0);

        let mut records = Vec::new();
        for id in 0..4 {
            records.push(record(id, "slow", "a"));
            records.push(record(100 + id, "fast", "b"));
        }
        let queues = group_records(records, &rate_limits).unwrap();

        let start = Instant::now();
        let summary = dispatcher(registry, 3)
            .drain("two-queues", queues, Arc::new(InMemoryResultSink::new()))
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 8);

        let slow: Vec<Instant> = mock
            .calls_matching(|body| body["id"].as_i64().unwrap() < 100)
            .iter()
            .map(|c| c.at)
            .collect();
        let fast: Vec<Instant> = mock
            .calls_matching(|body| body["id"].as_i64().unwrap() >= 100)
            .iter()
            .map(|c| c.at)
            .collect();

        assert_spaced(&slow, Duration::from_secs(1));
        assert_spaced(&fast, Duration::from_millis(500));

        // The fast queue is not held back by the slow one
        assert!(fast[3] - start < Duration::from_secs(2));
        assert!(slow[3] - start >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_responses_do_not_delay_releases() {
        let inner = MockAdapter::echo();
        let adapter = SlowAdapter {
            delay: Duration::from_secs(30),
            inner: inner.clone(),
        };
        let registry = AdapterRegistry::new().with("d", Arc::new(adapter));

        let queues =
            group_records((0..3).map(|id| record(id, "d", "m")).collect(), &limits(60.0)).unwrap();
        let start = Instant::now();
        let summary = dispatcher(registry, 3)
            .drain("slow", queues, Arc::new(InMemoryResultSink::new()))
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 3);

        let offsets: Vec<Duration> = inner.get_calls().iter().map(|c| c.at - start).collect();
        assert!(offsets[2] < Duration::from_secs(3));
        // Responses overlapped: the whole drain took one response time plus two intervals
        assert!(start.elapsed() < Duration::from_secs(33));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_is_not_retried() {
        let mock = MockAdapter::new();
        mock.add_response("m", Err(AdapterFailure::terminal("HTTP 401: invalid key")));
        let registry = AdapterRegistry::new().with("d", Arc::new(mock.clone()));
        let sink = Arc::new(InMemoryResultSink::new());

        let queues = group_records(vec![record(0, "d", "m")], &limits(600.0)).unwrap();
        let summary = dispatcher(registry, 5)
            .drain("terminal", queues, sink.clone())
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.attempts, 1);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(sink.results()[0].attempts_used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let mock = MockAdapter::new();
        mock.add_response("m", Err(AdapterFailure::retryable("HTTP 503")));
        mock.add_response("m", Ok(json!("finally")));
        let registry = AdapterRegistry::new().with("d", Arc::new(mock.clone()));
        let sink = Arc::new(InMemoryResultSink::new());

        let queues = group_records(vec![record(0, "d", "m")], &limits(60.0)).unwrap();
        dispatcher(registry, 3)
            .drain("retry", queues, sink.clone())
            .await
            .unwrap();

        let results = sink.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].attempts_used, 2);
        assert_eq!(results[0].outcome, ResultOutcome::Response(json!("finally")));

        let calls = mock.get_calls();
        assert_spaced(&[calls[0].at, calls[1].at], Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_skips_finished_records() {
        let mock = MockAdapter::echo();
        let registry = AdapterRegistry::new().with("d", Arc::new(mock.clone()));
        let sink = Arc::new(InMemoryResultSink::with_finished([RecordId(0), RecordId(2)]));

        let queues =
            group_records((0..4).map(|id| record(id, "d", "m")).collect(), &limits(600.0)).unwrap();
        let summary = dispatcher(registry, 3)
            .drain("resume", queues, sink.clone())
            .await
            .unwrap();

        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.succeeded, 2);
        let sent: Vec<i64> = mock
            .get_calls()
            .iter()
            .map(|c| c.body["id"].as_i64().unwrap())
            .collect();
        assert_eq!(sent, vec![1, 3]);
        let written: Vec<RecordId> = sink.results().iter().map(|r| r.id()).collect();
        assert_eq!(written, vec![RecordId(1), RecordId(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_halts_batch() {
        let mock = MockAdapter::echo();
        let registry = AdapterRegistry::new()
            .with("a", Arc::new(mock.clone()))
            .with("b", Arc::new(mock.clone()));
        let sink = Arc::new(InMemoryResultSink::failing_after(1));

        let mut records: Vec<RequestRecord> = (0..5).map(|id| record(id, "a", "m")).collect();
        records.extend((10..15).map(|id| record(id, "b", "m")));
        let queues = group_records(records, &limits(60.0)).unwrap();

        let err = dispatcher(registry, 3)
            .drain("broken-disk", queues, sink.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Writer { .. }));
        assert_eq!(sink.len(), 1);
        // Both queues released their first record at t=0; nothing after the failure
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_body_and_parameters_forwarded_verbatim() {
        let mock = MockAdapter::echo();
        let registry = AdapterRegistry::new().with("d", Arc::new(mock.clone()));

        let mut rec = record(0, "d", "gpt-4o");
        rec.body = json!({"messages": [{"role": "user", "content": "hi"}], "nested": {"a": [1, 2]}});
        rec.parameters = json!({"max_tokens": 16, "stop": ["\n"]});
        let queues = group_records(vec![rec.clone()], &limits(60.0)).unwrap();

        let sink = Arc::new(InMemoryResultSink::new());
        dispatcher(registry, 3)
            .drain("verbatim", queues, sink.clone())
            .await
            .unwrap();

        let calls = mock.get_calls();
        assert_eq!(calls[0].target_model, "gpt-4o");
        assert_eq!(calls[0].body, rec.body);
        assert_eq!(calls[0].parameters, rec.parameters);
        assert_eq!(sink.results()[0].request, rec);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_adapter_records_error() {
        let sink = Arc::new(InMemoryResultSink::new());
        let queues = group_records(vec![record(0, "ghost", "m")], &limits(60.0)).unwrap();

        let summary = dispatcher(AdapterRegistry::new(), 3)
            .drain("ghost", queues, sink.clone())
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert!(matches!(
            &sink.results()[0].outcome,
            ResultOutcome::Error(message) if message.contains("no adapter registered")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_drains_share_a_key_budget() {
        let mock = MockAdapter::echo();
        let registry = AdapterRegistry::new().with("d", Arc::new(mock.clone()));
        let dispatcher = dispatcher(registry, 3);

        let first = group_records((0..3).map(|id| record(id, "d", "m")).collect(), &limits(60.0))
            .unwrap();
        let second =
            group_records((10..13).map(|id| record(id, "d", "m")).collect(), &limits(60.0))
                .unwrap();

        let (a, b) = tokio::join!(
            dispatcher.drain("first", first, Arc::new(InMemoryResultSink::new())),
            dispatcher.drain("second", second, Arc::new(InMemoryResultSink::new())),
        );
        assert_eq!(a.unwrap().succeeded, 3);
        assert_eq!(b.unwrap().succeeded, 3);

        // Six sends to d/m at 60 rpm, whichever batch they came from
        let times: Vec<Instant> = mock.get_calls().iter().map(|c| c.at).collect();
        assert_eq!(times.len(), 6);
        assert_spaced(&times, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_do_not_depend_on_cross_queue_order() {
        async fn drain_in_order(records: Vec<RequestRecord>) -> Vec<(RecordId, ResultOutcome, u32)> {
            let mock = MockAdapter::with_handler(|model, body, _| match model {
                "flaky" => Err(AdapterFailure::retryable(format!("busy {}", body["id"]))),
                "denied" => Err(AdapterFailure::terminal("HTTP 403")),
                _ => Ok(json!({"echo": body["id"]})),
            });
            let registry = AdapterRegistry::new()
                .with("a", Arc::new(mock.clone()))
                .with("b", Arc::new(mock));
            let mut rate_limits = limits(60.0);
            rate_limits.destinations.insert("b".to_string(), 20.0);
            let queues = group_records(records, &rate_limits).unwrap();

            let sink = Arc::new(InMemoryResultSink::new());
            dispatcher(registry, 2)
                .drain("order", queues, sink.clone())
                .await
                .unwrap();

            let mut results: Vec<_> = sink
                .results()
                .into_iter()
                .map(|r| (r.id(), r.outcome, r.attempts_used))
                .collect();
            results.sort_by_key(|(id, _, _)| *id);
            results
        }

        let a: Vec<RequestRecord> = vec![
            record(0, "a", "ok"),
            record(1, "a", "flaky"),
            record(2, "a", "ok"),
        ];
        let b: Vec<RequestRecord> = vec![
            record(10, "b", "denied"),
            record(11, "b", "ok"),
            record(12, "b", "flaky"),
        ];

        // Same per-queue order, different interleavings across queues
        let blocks: Vec<RequestRecord> = b.iter().chain(a.iter()).cloned().collect();
        let interleaved: Vec<RequestRecord> = a
            .iter()
            .zip(b.iter())
            .flat_map(|(x, y)| [x.clone(), y.clone()])
            .collect();

        let from_blocks = drain_in_order(blocks).await;
        let from_interleaved = drain_in_order(interleaved).await;

        assert_eq!(from_blocks.len(), 6);
        assert_eq!(from_blocks, from_interleaved);
        assert!(from_blocks
            .iter()
            .filter(|(_, outcome, _)| matches!(outcome, ResultOutcome::Error(m) if m.contains("busy")))
            .all(|(_, _, attempts)| *attempts == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_drain() {
        let summary = dispatcher(AdapterRegistry::new(), 3)
            .drain("empty", Vec::new(), Arc::new(InMemoryResultSink::new()))
            .await
            .unwrap();
        assert_eq!(summary, DrainSummary::default());
    }
}
