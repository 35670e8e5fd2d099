use crate::config::{EngineConfig, RunConfig, ValidationError};
use crate::emitter::DatagramEmitter;
use crate::pattern;
use crate::rate::RateController;
use crate::state::{MetricsSnapshot, RunState, RunTerminated, StatusReport, TelemetryEvent};
use crate::telemetry::{Counters, Subscription, TelemetryAggregator, TelemetryBroadcaster};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ControlError {
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
    #[error("traffic generation already running")]
    AlreadyRunning,
    #[error("cannot update configuration while running")]
    ConfigurationLocked,
}

/// Reasons a run ends without a stop request or duration expiry.
#[derive(Debug, thiserror::Error)]
pub enum RunFault {
    #[error("could not open a socket towards {dest}: {source}")]
    Socket {
        dest: String,
        #[source]
        source: std::io::Error,
    },
    #[error("emission loop aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Stopped,
}

#[derive(Debug)]
struct RunSummary {
    outcome: RunOutcome,
    metrics: MetricsSnapshot,
}

struct Inner {
    state: RunState,
    /// The active run's configuration while running, otherwise the last one
    /// applied. Used as the default by `start_current`.
    config: RunConfig,
    metrics: MetricsSnapshot,
    run: Option<ActiveRun>,
}

impl Inner {
    fn report(&self) -> StatusReport {
        StatusReport {
            config: self.config.clone(),
            is_running: self.state != RunState::Idle,
            state: self.state,
            metrics: self.metrics,
        }
    }
}

struct ActiveRun {
    stop: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

struct Shared {
    inner: Mutex<Inner>,
    broadcaster: TelemetryBroadcaster,
    engine: EngineConfig,
}

/// Owner of the single active run. All state transitions happen under one
/// lock, so concurrent `start` calls cannot both succeed. Counters live in
/// the emission task; control calls only ever see published snapshots.
#[derive(Clone)]
pub struct RunSupervisor {
    shared: Arc<Shared>,
}

impl RunSupervisor {
    pub fn new(defaults: RunConfig, engine: EngineConfig) -> Self {
        let broadcaster = TelemetryBroadcaster::new(engine.subscriber_buffer);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: RunState::Idle,
                    config: defaults,
                    metrics: MetricsSnapshot::default(),
                    run: None,
                }),
                broadcaster,
                engine,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock must not wedge the state machine.
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn state(&self) -> RunState {
        self.lock().state
    }

    pub fn configuration(&self) -> RunConfig {
        self.lock().config.clone()
    }

    pub fn status(&self) -> StatusReport {
        self.lock().report()
    }

    /// Replaces the configuration future starts default to. Only allowed
    /// while idle.
    pub fn set_configuration(&self, config: RunConfig) -> Result<(), ControlError> {
        let mut inner = self.lock();
        if inner.state != RunState::Idle {
            return Err(ControlError::ConfigurationLocked);
        }
        config.validate()?;
        inner.config = config;
        self.shared
            .broadcaster
            .publish(TelemetryEvent::State(inner.report()));
        info!(pattern = ?inner.config.pattern, "Configuration updated");
        Ok(())
    }

    pub fn start_current(&self) -> Result<(), ControlError> {
        let config = self.configuration();
        self.start(config)
    }

    /// Validates `config`, makes it the active configuration and spawns the
    /// emission loop. Must be called from within a tokio runtime.
    pub fn start(&self, config: RunConfig) -> Result<(), ControlError> {
        config.validate()?;

        let mut inner = self.lock();
        if inner.state != RunState::Idle {
            return Err(ControlError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let started_at = Instant::now();

        inner.state = RunState::Running;
        inner.config = config.clone();
        inner.metrics = MetricsSnapshot::default();
        inner.run = Some(ActiveRun {
            stop: stop_tx,
            done: done_rx,
        });
        self.shared
            .broadcaster
            .publish(TelemetryEvent::State(inner.report()));
        drop(inner);

        info!(
            pattern = ?config.pattern,
            duration_secs = config.duration_secs,
            max_mbps = config.max_bandwidth_mbps,
            dest = %format!("{}:{}", config.target_host, config.target_port),
            packet_size = config.packet_size,
            "Starting run"
        );

        let worker = tokio::spawn(emission_loop(self.clone(), config, started_at, stop_rx));
        let supervisor = self.clone();
        tokio::spawn(async move {
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => Err(RunFault::Aborted(e.to_string())),
            };
            supervisor.finish(result, done_tx);
        });
        Ok(())
    }

    /// Requests the active run to stop and waits until the supervisor is
    /// idle again. The batch in progress is cut short at its next chunk
    /// boundary. No-op when idle.
    pub async fn stop(&self) {
        let done = {
            let mut inner = self.lock();
            if self.enter_stopping(&mut inner) {
                if let Some(run) = &inner.run {
                    let _ = run.stop.send(true);
                }
                info!("Stopping run");
            }
            inner.run.as_ref().map(|run| run.done.clone())
        };
        if let Some(done) = done {
            self.await_done(done).await;
        }
    }

    /// Waits for the active run, if any, to finish on its own.
    pub async fn wait_idle(&self) {
        let done = self.lock().run.as_ref().map(|run| run.done.clone());
        if let Some(done) = done {
            self.await_done(done).await;
        }
    }

    async fn await_done(&self, mut done: watch::Receiver<bool>) {
        if done.wait_for(|finished| *finished).await.is_err() {
            // The monitor went away without reporting back.
            self.finish(
                Err(RunFault::Aborted("run monitor vanished".to_string())),
                watch::channel(false).0,
            );
        }
    }

    /// Current state as the first event, then the live stream.
    pub fn subscribe(&self) -> Subscription {
        let inner = self.lock();
        self.shared.broadcaster.subscribe(inner.report())
    }

    /// `Running -> Stopping`. Returns whether the transition happened.
    fn enter_stopping(&self, inner: &mut Inner) -> bool {
        if inner.state != RunState::Running {
            return false;
        }
        inner.state = RunState::Stopping;
        self.shared
            .broadcaster
            .publish(TelemetryEvent::State(inner.report()));
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.broadcaster.subscriber_count()
    }

    fn publish_metrics(&self, snapshot: MetricsSnapshot) {
        let mut inner = self.lock();
        if inner.state == RunState::Idle {
            return;
        }
        inner.metrics = snapshot;
        self.shared
            .broadcaster
            .publish(TelemetryEvent::Snapshot(snapshot));
    }

    /// The only way back to `Idle`.
    fn finish(&self, result: Result<RunSummary, RunFault>, done: watch::Sender<bool>) {
        let mut inner = self.lock();
        if inner.state == RunState::Idle {
            done.send_replace(true);
            return;
        }
        inner.state = RunState::Idle;
        inner.run = None;

        match result {
            Ok(summary) => {
                inner.metrics = summary.metrics;
                info!(
                    outcome = ?summary.outcome,
                    total_bytes = summary.metrics.total_bytes_sent,
                    packets = summary.metrics.packets_sent,
                    send_errors = summary.metrics.send_errors,
                    elapsed_secs = summary.metrics.elapsed_secs,
                    "Run finished"
                );
            }
            Err(fault) => {
                error!(error = %fault, "Run terminated");
                self.shared
                    .broadcaster
                    .publish(TelemetryEvent::Terminated(RunTerminated::new(
                        fault.to_string(),
                        inner.metrics,
                    )));
            }
        }
        self.shared
            .broadcaster
            .publish(TelemetryEvent::State(inner.report()));
        drop(inner);
        done.send_replace(true);
    }
}

/// Runs `fut` unless a stop is requested first. `None` means stopped.
async fn until_stopped<F: std::future::Future>(
    stop: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = stop.changed() => None,
        output = fut => Some(output),
    }
}

/// The timing loop. Owns the counters; stops on request, on duration expiry,
/// or with a fault if the destination socket cannot be opened.
async fn emission_loop(
    supervisor: RunSupervisor,
    config: RunConfig,
    started_at: Instant,
    mut stop: watch::Receiver<bool>,
) -> Result<RunSummary, RunFault> {
    let engine = supervisor.shared.engine.clone();
    let mut counters = Counters::new(started_at);
    let mut aggregator = TelemetryAggregator::new(started_at);

    let connect = DatagramEmitter::connect(&config, engine.degraded_after_failures);
    let Some(connected) = until_stopped(&mut stop, connect).await else {
        info!("Stopped before the destination was resolved");
        return Ok(RunSummary {
            outcome: RunOutcome::Stopped,
            metrics: aggregator.snapshot(&counters, Instant::now()),
        });
    };
    let mut emitter = connected.map_err(|source| RunFault::Socket {
        dest: format!("{}:{}", config.target_host, config.target_port),
        source,
    })?;
    info!(dest = %emitter.target(), "Emitter ready");

    let tick_interval = engine.tick_interval();
    let duration = config.duration();
    let ends_at = started_at + duration;
    let mut rate =
        RateController::new(config.packet_size, tick_interval, engine.max_catch_up_ticks);
    let mut degraded = false;
    let mut last_tick: Option<Instant> = None;

    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let snapshot_every = engine.snapshot_interval();
    let mut telemetry =
        tokio::time::interval_at(tokio::time::Instant::now() + snapshot_every, snapshot_every);
    telemetry.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let outcome = loop {
        tokio::select! {
            biased;
            // Also fires if the supervisor dropped the sender.
            _ = stop.changed() => break RunOutcome::Stopped,
            // Ahead of the ticker: a saturated loop always has a tick ready.
            _ = telemetry.tick() => {
                let snapshot = aggregator.snapshot(&counters, Instant::now());
                supervisor.publish_metrics(snapshot);
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                if now >= ends_at {
                    supervisor.enter_stopping(&mut supervisor.lock());
                    break RunOutcome::Completed;
                }
                let elapsed = now.saturating_duration_since(started_at);
                let since_last =
                    last_tick.map_or(tick_interval, |t| now.saturating_duration_since(t));
                last_tick = Some(now);

                let fraction = elapsed.as_secs_f64() / duration.as_secs_f64();
                let target_mbps = pattern::evaluate(
                    config.pattern,
                    fraction,
                    config.max_bandwidth_mbps,
                    config.bell_peak_ratio,
                );
                let budget = rate.next_tick(target_mbps, since_last);
                // Whatever does not fit before the next tick is dropped.
                let deadline = (now + tick_interval).min(ends_at);
                let interrupted = || stop.has_changed().unwrap_or(true);
                let report = emitter.send_batch(budget.packets, deadline, interrupted).await;

                counters.bytes_sent += report.bytes_sent;
                counters.packets_sent += report.packets_sent;
                counters.send_errors += report.failures;
                if report.unsent > 0 {
                    debug!(unsent = report.unsent, "Batch cut short");
                }

                if report.degraded != degraded {
                    degraded = report.degraded;
                    if degraded {
                        warn!(
                            dest = %emitter.target(),
                            send_errors = counters.send_errors,
                            "Sends are failing consecutively, output degraded"
                        );
                    } else {
                        info!(dest = %emitter.target(), "Sends recovered");
                    }
                }

                if Instant::now() >= ends_at {
                    supervisor.enter_stopping(&mut supervisor.lock());
                    break RunOutcome::Completed;
                }
            }
        }
    };

    Ok(RunSummary {
        outcome,
        metrics: aggregator.snapshot(&counters, Instant::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Pattern;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn engine() -> EngineConfig {
        EngineConfig {
            snapshot_interval_ms: 250,
            ..Default::default()
        }
    }

    async fn sink() -> (UdpSocket, u32) {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sink.local_addr().unwrap().port();
        (sink, u32::from(port))
    }

    fn constant(port: u32, duration_secs: u64) -> RunConfig {
        RunConfig {
            pattern: Pattern::Constant,
            duration_secs,
            max_bandwidth_mbps: 8.0,
            target_host: "127.0.0.1".to_string(),
            target_port: port,
            bell_peak_ratio: 0.5,
            packet_size: 1000,
        }
    }

    async fn wait_idle(sup: &RunSupervisor, limit: Duration) {
        tokio::time::timeout(limit, sup.wait_idle())
            .await
            .expect("run did not finish in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_then_stop_is_idle() {
        let (_sink, port) = sink().await;
        let sup = RunSupervisor::new(RunConfig::default(), engine());

        sup.start(constant(port, 60)).unwrap();
        assert_eq!(sup.state(), RunState::Running);
        sup.stop().await;

        assert_eq!(sup.state(), RunState::Idle);
        let status = sup.status();
        assert!(!status.is_running);
        assert_eq!(
            status.metrics.total_bytes_sent,
            status.metrics.packets_sent * 1000
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_constant_run_expires_on_its_own() {
        let (_sink, port) = sink().await;
        let sup = RunSupervisor::new(RunConfig::default(), engine());
        let mut sub = sup.subscribe();
        assert!(matches!(sub.next().await, Some(TelemetryEvent::State(_))));

        sup.start(constant(port, 2)).unwrap();
        wait_idle(&sup, Duration::from_secs(6)).await;

        assert_eq!(sup.state(), RunState::Idle);
        let metrics = sup.status().metrics;
        // 100 packets per 100 ms tick for 20 ticks.
        assert!(
            (1800..=2200).contains(&metrics.packets_sent),
            "packets = {}",
            metrics.packets_sent
        );
        assert_eq!(metrics.total_bytes_sent, metrics.packets_sent * 1000);
        assert!(metrics.elapsed_secs >= 2.0, "elapsed = {}", metrics.elapsed_secs);
        assert!(metrics.elapsed_secs < 2.5, "elapsed = {}", metrics.elapsed_secs);

        let average_mbps = metrics.total_bytes_sent as f64 * 8.0 / 1e6 / metrics.elapsed_secs;
        assert!((average_mbps - 8.0).abs() / 8.0 < 0.05, "average = {average_mbps}");

        let mut snapshots = Vec::new();
        let mut saw_idle = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), sub.next()).await
        {
            match event {
                TelemetryEvent::Snapshot(s) => snapshots.push(s),
                TelemetryEvent::State(s) if !s.is_running => saw_idle = true,
                _ => {}
            }
        }
        assert!(saw_idle);
        assert!(snapshots.len() >= 4, "snapshots = {}", snapshots.len());
        assert!(snapshots.iter().all(|s| s.current_bandwidth_mbps > 0.0));
        assert!(snapshots
            .windows(2)
            .all(|w| w[0].total_bytes_sent <= w[1].total_bytes_sent));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_one_wins() {
        let (_sink, port) = sink().await;
        let sup = RunSupervisor::new(RunConfig::default(), engine());
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let sup = sup.clone();
                let barrier = barrier.clone();
                let config = constant(port, 60);
                tokio::spawn(async move {
                    barrier.wait().await;
                    sup.start(config)
                })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.contains(&Err(ControlError::AlreadyRunning)));

        sup.stop().await;
        assert_eq!(sup.state(), RunState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_running_rejects_start_and_configure() {
        let (_sink, port) = sink().await;
        let sup = RunSupervisor::new(RunConfig::default(), engine());
        let active = constant(port, 60);
        sup.start(active.clone()).unwrap();

        assert_eq!(
            sup.start(constant(port, 5)),
            Err(ControlError::AlreadyRunning)
        );
        assert_eq!(
            sup.set_configuration(RunConfig::default()),
            Err(ControlError::ConfigurationLocked)
        );
        assert_eq!(sup.state(), RunState::Running);
        assert_eq!(sup.configuration(), active);

        sup.stop().await;
        assert_eq!(sup.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_configure_while_idle() {
        let sup = RunSupervisor::new(RunConfig::default(), engine());

        let bad = RunConfig {
            target_port: 70000,
            ..Default::default()
        };
        match sup.set_configuration(bad) {
            Err(ControlError::Validation(e)) => assert_eq!(e.field, "targetPort"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(sup.configuration(), RunConfig::default());

        let good = RunConfig {
            pattern: Pattern::Random,
            duration_secs: 5,
            ..Default::default()
        };
        sup.set_configuration(good.clone()).unwrap();
        assert_eq!(sup.configuration(), good);
        assert_eq!(sup.status().config, good);
    }

    #[tokio::test]
    async fn test_invalid_start_stays_idle() {
        let sup = RunSupervisor::new(RunConfig::default(), engine());
        let bad = RunConfig {
            packet_size: 10,
            ..Default::default()
        };
        assert!(matches!(sup.start(bad), Err(ControlError::Validation(_))));
        assert_eq!(sup.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let sup = RunSupervisor::new(RunConfig::default(), engine());
        sup.stop().await;
        sup.stop().await;
        assert_eq!(sup.state(), RunState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_current_uses_stored_configuration() {
        let (_sink, port) = sink().await;
        let sup = RunSupervisor::new(constant(port, 60), engine());
        sup.start_current().unwrap();
        assert_eq!(sup.status().config.target_port, port);
        sup.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_socket_fault_returns_to_idle() {
        let sup = RunSupervisor::new(RunConfig::default(), engine());
        let mut sub = sup.subscribe();

        // Connecting a UDP socket to the limited broadcast address without
        // SO_BROADCAST is refused by the kernel.
        let config = RunConfig {
            target_host: "255.255.255.255".to_string(),
            ..constant(9, 60)
        };
        sup.start(config).unwrap();
        wait_idle(&sup, Duration::from_secs(5)).await;
        assert_eq!(sup.state(), RunState::Idle);

        let mut terminated = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), sub.next()).await
        {
            if let TelemetryEvent::Terminated(t) = event {
                assert_eq!(t.event, "runTerminated");
                terminated = true;
            }
        }
        assert!(terminated);

        // The supervisor is usable again afterwards.
        let (_sink, port) = sink().await;
        sup.start(constant(port, 60)).unwrap();
        sup.stop().await;
        assert_eq!(sup.state(), RunState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_saturated_run_keeps_reporting_and_ends_on_time() {
        let (_sink, port) = sink().await;
        let sup = RunSupervisor::new(RunConfig::default(), engine());
        let mut sub = sup.subscribe();

        // Far more per tick than loopback can take in 100 ms.
        let config = RunConfig {
            max_bandwidth_mbps: 10_000.0,
            packet_size: 64,
            ..constant(port, 2)
        };
        let started = Instant::now();
        sup.start(config).unwrap();

        let mut snapshots = 0;
        let mut final_metrics = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), sub.next()).await
        {
            match event {
                TelemetryEvent::Snapshot(_) => snapshots += 1,
                TelemetryEvent::State(s) if !s.is_running && s.metrics.elapsed_secs > 0.0 => {
                    final_metrics = Some(s.metrics);
                    break;
                }
                _ => {}
            }
        }
        let wall = started.elapsed();
        let metrics = final_metrics.expect("run did not end");

        assert!(snapshots >= 4, "snapshots = {snapshots}");
        assert!(metrics.elapsed_secs >= 2.0, "elapsed = {}", metrics.elapsed_secs);
        assert!(metrics.elapsed_secs < 2.5, "elapsed = {}", metrics.elapsed_secs);
        assert!(wall < Duration::from_millis(2500), "wall = {wall:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_saturated_run_stops_promptly() {
        let (_sink, port) = sink().await;
        let sup = RunSupervisor::new(RunConfig::default(), engine());
        let config = RunConfig {
            max_bandwidth_mbps: 10_000.0,
            packet_size: 64,
            ..constant(port, 60)
        };
        sup.start(config).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let asked = Instant::now();
        tokio::time::timeout(Duration::from_secs(1), sup.stop())
            .await
            .expect("stop was not prompt");
        assert!(asked.elapsed() < Duration::from_millis(500));
        assert_eq!(sup.state(), RunState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_sends_do_not_end_the_run() {
        let (closed, port) = sink().await;
        drop(closed);
        let sup = RunSupervisor::new(RunConfig::default(), engine());

        sup.start(constant(port, 60)).unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(sup.state(), RunState::Running);
        let metrics = sup.status().metrics;
        assert!(metrics.send_errors > 0, "metrics = {metrics:?}");

        sup.stop().await;
        assert_eq!(sup.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_until_stopped_races_the_stop_signal() {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        assert_eq!(until_stopped(&mut stop_rx, async { 7 }).await, Some(7));

        // A lookup that never resolves must not hold up a stop.
        let pending = std::future::pending::<()>();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop_tx.send(true).unwrap();
            stop_tx
        });
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            until_stopped(&mut stop_rx, pending),
        )
        .await
        .expect("stop was not observed");
        assert_eq!(result, None);

        // A dropped sender counts as a stop.
        drop(stopper.await.unwrap());
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            until_stopped(&mut stop_rx, std::future::pending::<()>()),
        )
        .await
        .expect("closed channel was not observed");
        assert_eq!(result, None);
    }
}
