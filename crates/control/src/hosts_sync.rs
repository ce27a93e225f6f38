//! Event-driven synchronization of container network aliases into the hosts
//! file.
//!
//! Engine events and the periodic resync all funnel into one updater loop,
//! so no two rewrites ever overlap. Bursts of events collapse through the
//! debouncer; a maximum window keeps sustained event storms from starving
//! updates forever.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use backon::{ExponentialBuilder, Retryable};
use bollard::secret::{EventMessage, EventMessageTypeEnum};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::HostsConfig;
use crate::docker::SaltDocker;
use crate::hosts::HostsFile;

/// Reconnect policy for the engine event stream.
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const RECONNECT_MAX_RETRIES: usize = 5;

/// Collapses bursts of engine events into single update requests.
///
/// Every flush is delivered on the channel handed out by [`Debouncer::new`];
/// the consumer performs the actual work, so firing is cheap and never
/// blocks the event reader.
pub struct Debouncer {
    delay: Duration,
    max_window: Duration,
    tx: mpsc::UnboundedSender<()>,
    state: Mutex<DebounceState>,
}

#[derive(Default)]
struct DebounceState {
    timer: Option<JoinHandle<()>>,
    first_event: Option<Instant>,
}

impl Debouncer {
    pub fn new(
        delay: Duration,
        max_window: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                delay,
                max_window,
                tx,
                state: Mutex::new(DebounceState::default()),
            }),
            rx,
        )
    }

    /// Note one engine event: arm or re-arm the quiet-period timer, or force
    /// a flush when events have been arriving for longer than the max
    /// window.
    pub fn trigger(self: &Arc<Self>) {
        let now = Instant::now();
        let mut state = self.lock();

        if let Some(first) = state.first_event {
            if now.duration_since(first) >= self.max_window {
                tracing::info!(
                    "Forcing update (max debounce window of {}s reached)",
                    self.max_window.as_secs()
                );
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                state.first_event = None;
                self.tx.send(()).ok();
                return;
            }
        } else {
            state.first_event = Some(now);
        }

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let debouncer = Arc::clone(self);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debouncer.delay).await;
            debouncer.fire();
        }));
    }

    /// Request an update immediately, bypassing the quiet period. Used by
    /// the periodic resync.
    pub fn request(&self) {
        self.tx.send(()).ok();
    }

    /// Cancel any armed timer. Used on shutdown.
    pub fn cancel(&self) {
        let mut state = self.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.first_event = None;
    }

    fn fire(&self) {
        let mut state = self.lock();
        state.timer = None;
        state.first_event = None;
        drop(state);
        self.tx.send(()).ok();
    }

    fn lock(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().expect("debounce state lock poisoned")
    }
}

/// The hosts synchronizer daemon.
pub struct HostsSync {
    docker: SaltDocker,
    hosts: HostsFile,
    network: String,
    debounce: Duration,
    max_debounce: Duration,
    resync_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl HostsSync {
    pub fn new(
        docker: SaltDocker,
        config: &HostsConfig,
        resync_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            docker,
            hosts: HostsFile::new(
                config.hosts_path.clone(),
                config.backup_path.clone(),
                config.suffix.clone(),
            ),
            network: config.network.clone(),
            debounce: config.debounce(),
            max_debounce: config.max_debounce(),
            resync_interval,
            shutdown,
        }
    }

    /// Run until the shutdown flag flips or event monitoring gives up.
    pub async fn run(self) -> Result<()> {
        self.hosts.ensure_exists()?;
        self.hosts.fix_non_breaking_spaces()?;
        self.hosts.ensure_managed_region()?;

        let sync = Arc::new(self);
        let (debouncer, mut updates) = Debouncer::new(sync.debounce, sync.max_debounce);

        let updater = {
            let sync = Arc::clone(&sync);
            let mut shutdown = sync.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        request = updates.recv() => match request {
                            Some(()) => {
                                if let Err(err) = sync.update().await {
                                    tracing::error!("Error during hosts file update: {err:#}");
                                }
                            }
                            None => break,
                        },
                    }
                }
            })
        };

        // Periodic resync puts a floor on update latency regardless of
        // events; the first request doubles as the initial sync.
        let periodic = {
            let debouncer = Arc::clone(&debouncer);
            let mut shutdown = sync.shutdown.clone();
            let interval = sync.resync_interval;
            tokio::spawn(async move {
                debouncer.request();
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(interval) => debouncer.request(),
                    }
                }
            })
        };

        let result = sync.watch_events(&debouncer).await;

        // Rewrites are atomic, so aborting a possibly in-flight update
        // leaves the live file intact.
        debouncer.cancel();
        periodic.abort();
        updater.abort();
        result
    }

    /// Follow the engine event stream, triggering the debouncer on each
    /// event. Stream death reconnects with exponential backoff; repeated
    /// failures give up and surface an error.
    async fn watch_events(&self, debouncer: &Arc<Debouncer>) -> Result<()> {
        (|| self.stream_events(debouncer))
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(RECONNECT_BASE_DELAY)
                    .with_max_delay(RECONNECT_MAX_DELAY)
                    .with_max_times(RECONNECT_MAX_RETRIES),
            )
            .when(|_| !*self.shutdown.borrow())
            .notify(|err, delay| {
                tracing::warn!("Docker event stream ended unexpectedly ({err:#}), retrying in {delay:?}");
            })
            .await
            .context("Docker event monitoring failed after repeated retries, giving up")
    }

    async fn stream_events(&self, debouncer: &Arc<Debouncer>) -> Result<()> {
        if *self.shutdown.borrow() {
            return Ok(());
        }
        if !self.docker.ping_ok().await {
            bail!("Docker daemon not accessible");
        }

        tracing::info!("Monitoring for Docker container start and network disconnect events");
        let mut events = self.docker.events();
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Docker event monitoring stopped");
                        return Ok(());
                    }
                }
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        match describe_event(&event) {
                            Some(line) => tracing::info!("Event: {line}"),
                            None => tracing::debug!("Event received: {event:?}"),
                        }
                        debouncer.trigger();
                    }
                    Some(Err(err)) => bail!("Docker event stream error: {err}"),
                    None => bail!("Docker event stream ended"),
                },
            }
        }
    }

    /// One full resync of the managed region against live attachments.
    async fn update(&self) -> Result<()> {
        if *self.shutdown.borrow() {
            return Ok(());
        }
        tracing::info!("Updating hosts file");

        if !self.docker.ping_ok().await {
            tracing::warn!("Docker daemon is not running or not accessible, skipping update");
            return Ok(());
        }

        let attachments = self.docker.network_attachments(&self.network).await?;
        let count = self.hosts.apply(&attachments)?;
        if count > 0 {
            tracing::info!("Hosts file updated successfully ({count} container entries)");
        } else {
            tracing::info!(
                "Hosts file updated successfully (no containers on {} network)",
                self.network
            );
        }
        Ok(())
    }
}

/// A concise description of an engine event for the log.
fn describe_event(event: &EventMessage) -> Option<String> {
    let action = event.action.as_deref()?;
    let actor = event.actor.as_ref();
    let attributes = actor.and_then(|a| a.attributes.as_ref());
    let short_id: String = actor
        .and_then(|a| a.id.as_deref())
        .unwrap_or("")
        .chars()
        .take(12)
        .collect();

    match event.typ {
        Some(EventMessageTypeEnum::CONTAINER) => {
            Some(match attributes.and_then(|a| a.get("name")) {
                Some(name) => format!("container '{name}' ({short_id}) -> {action}"),
                None => format!("container {short_id} -> {action}"),
            })
        }
        Some(EventMessageTypeEnum::NETWORK) => {
            let network = attributes.and_then(|a| a.get("name"));
            let container: Option<String> = attributes
                .and_then(|a| a.get("container"))
                .map(|c| c.chars().take(12).collect());
            match (container, network) {
                (Some(container), Some(network)) => {
                    Some(format!("container {container} -> {action} from '{network}'"))
                }
                (None, Some(network)) => Some(format!("network '{network}' -> {action}")),
                _ => Some(format!("network {short_id} -> {action}")),
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_of_events_collapses_into_one_update() {
        let (debouncer, mut updates) = Debouncer::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
        );

        for _ in 0..3 {
            debouncer.trigger();
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        assert!(updates.try_recv().is_err(), "quiet period still running");

        tokio::time::sleep(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        assert!(updates.try_recv().is_ok(), "one flush after the quiet period");
        assert!(updates.try_recv().is_err(), "exactly one flush");
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_events_flush_within_the_max_window() {
        let (debouncer, mut updates) = Debouncer::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
        );

        // An event every 500 ms keeps resetting the quiet period; the max
        // window must force a flush regardless.
        let mut flushes = 0;
        for _ in 0..14 {
            debouncer.trigger();
            tokio::time::sleep(Duration::from_millis(500)).await;
            while updates.try_recv().is_ok() {
                flushes += 1;
            }
        }
        assert!(flushes >= 1, "a sustained storm must still flush");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_the_pending_flush() {
        let (debouncer, mut updates) = Debouncer::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
        );

        debouncer.trigger();
        debouncer.cancel();

        tokio::time::sleep(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn request_bypasses_the_quiet_period() {
        let (debouncer, mut updates) = Debouncer::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        debouncer.request();
        assert!(updates.try_recv().is_ok());
    }

    #[test]
    fn container_events_are_described_with_their_name() {
        let event = EventMessage {
            typ: Some(EventMessageTypeEnum::CONTAINER),
            action: Some("start".to_string()),
            actor: Some(bollard::secret::EventActor {
                id: Some("abcdef0123456789".to_string()),
                attributes: Some(
                    [("name".to_string(), "plex".to_string())].into_iter().collect(),
                ),
            }),
            ..Default::default()
        };
        assert_eq!(
            describe_event(&event).as_deref(),
            Some("container 'plex' (abcdef012345) -> start")
        );
    }

    #[test]
    fn network_disconnects_name_the_network() {
        let event = EventMessage {
            typ: Some(EventMessageTypeEnum::NETWORK),
            action: Some("disconnect".to_string()),
            actor: Some(bollard::secret::EventActor {
                id: Some("net123".to_string()),
                attributes: Some(
                    [
                        ("name".to_string(), "saltbox".to_string()),
                        ("container".to_string(), "abcdef0123456789".to_string()),
                    ]
                    .into_iter()
                    .collect(),
                ),
            }),
            ..Default::default()
        };
        assert_eq!(
            describe_event(&event).as_deref(),
            Some("container abcdef012345 -> disconnect from 'saltbox'")
        );
    }
}
