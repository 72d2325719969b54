use std::time::{Duration, SystemTime};

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::DeviceStateCache;
use crate::config::ScanConfig;
use crate::distance::DistanceEstimator;
use crate::messages::{PipelineCommand, ScanEvent, ScanSignal, TelemetryBatch};
use crate::mqtt::{BrokerConnectionManager, BrokerTransport};
use crate::scanner::ScanSource;
use crate::scheduler::{FlushDecision, FlushScheduler};
use crate::telemetry::TelemetryPublisher;
use crate::watchdog::{ScanWatchdog, WatchdogAction};
use crate::whitelist::Whitelist;

#[derive(Clone, Copy, Debug)]
pub struct PipelineSettings {
    pub throttle_interval: Duration,
    pub restart_interval: Duration,
    pub settle_delay: Duration,
}

impl From<&ScanConfig> for PipelineSettings {
    fn from(config: &ScanConfig) -> Self {
        PipelineSettings {
            throttle_interval: config.throttle_interval(),
            restart_interval: config.restart_interval(),
            settle_delay: config.settle_delay(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PipelineState {
    Idle,
    Scanning,
}

/// The ingestion pipeline: whitelist, cache, flush scheduling and the scan
/// watchdog, all owned by one actor task.
///
/// Scan signals arrive on an internal channel and commands on another, so
/// cache updates, cache clears and timer changes never interleave. Publishing
/// happens on a separate worker task so broker I/O cannot stall ingestion.
pub struct Pipeline<S> {
    source: S,
    whitelist: Whitelist,
    cache: DeviceStateCache,
    scheduler: FlushScheduler,
    watchdog: ScanWatchdog,
    publisher: TelemetryPublisher,
    // Latest-wins slot read by the publish worker. A flush replaces any batch
    // the worker has not picked up yet.
    outbound: Option<watch::Sender<Option<TelemetryBatch>>>,
    signals_tx: mpsc::UnboundedSender<ScanSignal>,
    signals_rx: mpsc::UnboundedReceiver<ScanSignal>,
    state: PipelineState,
    // False while stopped, settling, or after the source reported a failure.
    source_active: bool,
}

impl<S: ScanSource> Pipeline<S> {
    pub fn new(
        source: S,
        whitelist: Whitelist,
        estimator: DistanceEstimator,
        publisher: TelemetryPublisher,
        settings: PipelineSettings,
    ) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Pipeline {
            source,
            whitelist,
            cache: DeviceStateCache::new(estimator),
            scheduler: FlushScheduler::new(settings.throttle_interval),
            watchdog: ScanWatchdog::new(settings.restart_interval, settings.settle_delay),
            publisher,
            outbound: None,
            signals_tx,
            signals_rx,
            state: PipelineState::Idle,
            source_active: false,
        }
    }

    /// Spawns the actor, plus a publish worker when a broker is given.
    pub fn spawn<T: BrokerTransport>(
        mut self,
        broker: Option<BrokerConnectionManager<T>>,
    ) -> PipelineHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = broker.map(|broker| {
            let (batches_tx, batches_rx) = watch::channel(None);
            self.outbound = Some(batches_tx);
            tokio::spawn(publish_worker(broker, batches_rx, shutdown_rx))
        });
        if worker.is_none() {
            info!("Publishing disabled, flushes will only be logged");
        }

        PipelineHandle {
            commands: commands_tx,
            actor: tokio::spawn(self.run(commands_rx)),
            worker,
            shutdown: shutdown_tx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PipelineCommand>) {
        loop {
            // Deadlines are re-read every iteration, so a cancelled or
            // re-armed timer can never fire with its old deadline.
            let watchdog_at = self.watchdog.deadline();
            let flush_at = self.scheduler.deadline();

            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(PipelineCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(signal) = self.signals_rx.recv() => self.handle_signal(signal),
                () = sleep_until(watchdog_at) => self.on_watchdog().await,
                () = sleep_until(flush_at) => self.on_deferred_flush(),
            }
        }

        self.stop_scanning().await;
        debug!("Pipeline stopped");
    }

    async fn handle_command(&mut self, command: PipelineCommand) {
        match command {
            PipelineCommand::Start(reply) => {
                let started = self.start_scanning().await;
                let _ = reply.send(started);
            }
            PipelineCommand::Stop(reply) => {
                self.stop_scanning().await;
                let _ = reply.send(());
            }
            PipelineCommand::Restart => {
                if self.state == PipelineState::Scanning {
                    info!("Restarting scan on request");
                    self.watchdog.restart_now(Instant::now());
                    self.stop_source().await;
                } else {
                    debug!("Ignoring restart request while idle");
                }
            }
            PipelineCommand::Shutdown => {}
        }
    }

    fn handle_signal(&mut self, signal: ScanSignal) {
        match signal {
            ScanSignal::Sighting(event) => self.on_sighting(event),
            ScanSignal::Failed(code) => {
                error!("Scan failed with code {code}");
                self.source_active = false;
            }
        }
    }

    fn on_sighting(&mut self, event: ScanEvent) {
        if !self.source_active {
            trace!("Discarding sighting of {} while not scanning", event.address);
            return;
        }
        if !self.whitelist.allow(&event.address) {
            return;
        }

        let record = self.cache.upsert(&event);
        debug!(
            "Sighting {} ({}) rssi {} distance {}",
            record.address,
            event.advertised_name.as_deref().unwrap_or("unnamed"),
            record.last_rssi,
            record.cached_distance
        );

        if self.scheduler.on_upsert(Instant::now()) == FlushDecision::Now {
            self.flush();
        }
    }

    fn on_deferred_flush(&mut self) {
        if self.scheduler.fire(Instant::now()) {
            self.flush();
        }
    }

    fn flush(&mut self) {
        let batch = self.publisher.build(self.cache.records(), SystemTime::now());
        if batch.is_empty() {
            return;
        }
        match &self.outbound {
            Some(outbound) => {
                debug!("Flushing {} envelopes", batch.len());
                if outbound.send(Some(batch)).is_err() {
                    warn!("Publish worker has exited, dropping batch");
                }
            }
            None => debug!("Flushed {} envelopes (publishing disabled)", batch.len()),
        }
    }

    async fn on_watchdog(&mut self) {
        match self.watchdog.fire(Instant::now()) {
            Some(WatchdogAction::StopScan) => {
                info!("Watchdog cycling scan");
                self.stop_source().await;
            }
            Some(WatchdogAction::StartScan) => {
                if !self.start_source().await {
                    warn!("Scan restart refused, retrying at the next watchdog interval");
                }
            }
            None => {}
        }
    }

    async fn start_scanning(&mut self) -> bool {
        if self.state == PipelineState::Scanning {
            return true;
        }
        if !self.start_source().await {
            return false;
        }
        self.state = PipelineState::Scanning;
        self.watchdog.arm(Instant::now());
        true
    }

    async fn stop_scanning(&mut self) {
        self.watchdog.disarm();
        self.stop_source().await;
        self.state = PipelineState::Idle;
    }

    /// Starts the scan source on a clean slate: no pending flush, no queued
    /// signals and an empty cache.
    async fn start_source(&mut self) -> bool {
        self.scheduler.cancel();
        while self.signals_rx.try_recv().is_ok() {}
        self.cache.clear();

        match self.source.start(self.signals_tx.clone()).await {
            Ok(()) => {
                self.source_active = true;
                info!("Scanning started");
                true
            }
            Err(err) => {
                warn!("Scanning not started: {err}");
                false
            }
        }
    }

    async fn stop_source(&mut self) {
        self.scheduler.cancel();
        if !self.source_active {
            return;
        }
        self.source_active = false;
        match self.source.stop().await {
            Ok(()) => info!("Scanning stopped"),
            Err(err) => warn!("Error stopping scan: {err}"),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Owns every publish call, so at most one is in flight at a time.
///
/// Batches published while a call is in flight are not queued. Only the most
/// recent one is picked up once the broker call returns.
async fn publish_worker<T: BrokerTransport>(
    mut broker: BrokerConnectionManager<T>,
    mut batches: watch::Receiver<Option<TelemetryBatch>>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Failures are logged by the manager and retried on the next publish.
    let _ = broker.connect().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            changed = batches.changed() => {
                if changed.is_err() {
                    break;
                }
                let batch = batches.borrow_and_update().clone();
                if let Some(batch) = batch {
                    let _ = broker.publish(&batch).await;
                }
            }
        }
    }

    broker.disconnect().await;
}

pub struct PipelineHandle {
    commands: mpsc::UnboundedSender<PipelineCommand>,
    actor: JoinHandle<()>,
    worker: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl PipelineHandle {
    /// Idle -> Scanning. Returns false if the scan source refused to start.
    pub async fn start(&self) -> bool {
        let (reply, response) = oneshot::channel();
        if self.commands.send(PipelineCommand::Start(reply)).is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }

    /// Scanning -> Idle.
    pub async fn stop(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(PipelineCommand::Stop(reply)).is_ok() {
            let _ = response.await;
        }
    }

    pub fn restart(&self) {
        let _ = self.commands.send(PipelineCommand::Restart);
    }

    /// Stops scanning and waits until no timer can fire and the publish
    /// worker has finished its in-flight batch and disconnected.
    pub async fn shutdown(self) {
        let _ = self.commands.send(PipelineCommand::Shutdown);
        if let Err(err) = self.actor.await {
            error!("Pipeline task failed: {err}");
        }
        let _ = self.shutdown.send(true);
        if let Some(worker) = self.worker {
            if let Err(err) = worker.await {
                error!("Publish worker failed: {err}");
            }
        }
    }
}
