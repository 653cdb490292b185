//! Daemon mode
//!
//! Runs the main event loop: key intents and local drift feed the delta
//! aggregator, flushes are applied on the remote speaker in spawned tasks,
//! and the key gate follows target activity and remote reachability.

use color_eyre::eyre::{Context, Result};
use sd_notify::NotifyState;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::aggregator::{Completion, DeltaAggregator, Flush, FlushOutcome};
use crate::config::Config;
use crate::error::RemoteError;
use crate::identity::DeviceIdentity;
use crate::ipc::{IpcServer, StatusSnapshot};
use crate::keys::{self, GateMode, KeyGate, KeyIntent, KeyListener};
use crate::local::LocalVolumeSource;
use crate::logging;
use crate::notification::{notify_if, volume_icon};
use crate::observer::{self, LocalEvent};
use crate::pipewire::PipeWire;
use crate::remote::sonos::SonosConnector;
use crate::remote::{Connector, Playback, RemoteVolumeClient, Speaker, VolumeChange};

/// Run the daemon with the given configuration
///
/// # Errors
/// Returns an error if the key socket cannot be installed or the session
/// cannot be started.
pub async fn run(config: Config) -> Result<()> {
    let _log_guard = logging::init_daemon(&config);

    info!("Starting sonos-volume-sync {}", crate::version());
    info!(
        "Speaker '{}' (fallback address: {}), local device '{}'",
        config.remote.name,
        config.remote.address.as_deref().unwrap_or("none"),
        config.local.device_name
    );

    if let Err(e) = PipeWire::validate_tools() {
        warn!("{}; the target device will be reported inactive", e);
    }

    let server = IpcServer::bind()
        .await
        .context("Failed to install the key hook")?;
    let connector = SonosConnector::new().context("Failed to create the Sonos client")?;

    run_with(config, Arc::new(PipeWire), connector, server).await
}

/// Run a session against any local device and speaker connector
///
/// Returns once shutdown is requested (signal or IPC) and the shutdown
/// sequence has completed.
///
/// # Errors
/// Returns an error if the observer thread or signal handlers cannot be set up.
pub async fn run_with<L, C>(
    config: Config,
    local: Arc<L>,
    connector: C,
    server: IpcServer,
) -> Result<()>
where
    L: LocalVolumeSource,
    C: Connector,
{
    let gate = KeyGate::new(GateMode::Passthrough);
    let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
    let (task_tx, mut task_rx) = mpsc::unbounded_channel();

    info!("IPC server listening on {:?}", server.socket_path());
    let mut listener = keys::spawn_key_listener(server, gate.clone(), status_rx);

    let identity = DeviceIdentity::new(&config.local.device_name, config.local.device_cache);
    let mut local_events =
        observer::spawn_observer_thread(Arc::clone(&local), identity, gate.clone(), &config.local)
            .context("Failed to start the local observer thread")?;

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut reconnect = tokio::time::interval(config.remote.reconnect_interval);
    reconnect.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut playback = tokio::time::interval(config.settings.remote_poll);
    playback.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut controller = Controller::new(config, local, connector, gate, status_tx, task_tx);
    controller.start_reconnect();
    controller.publish();

    let _ = sd_notify::notify(false, &[NotifyState::Ready]);
    controller.notify("Sonos Volume Sync", "Volume sync running".to_string(), None);
    info!("Monitoring volume events...");

    loop {
        let deadline = controller.aggregator.next_deadline();

        tokio::select! {
            Some(intent) = listener.intents.recv() => controller.on_key(intent),

            event = local_events.recv() => {
                let Some(event) = event else {
                    error!("Local observer stopped (event channel closed)");
                    break;
                };
                controller.on_local(event).await;
            }

            Some(event) = task_rx.recv() => controller.on_task(event).await,

            () = sleep_until(deadline) => {}

            _ = reconnect.tick() => controller.start_reconnect(),

            _ = playback.tick() => controller.start_playback_poll(),

            Some(()) = listener.shutdown_requests.recv() => {
                info!("Shutdown requested via IPC");
                break;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }

            _ = sigterm.recv() => {
                info!("Terminated");
                break;
            }
        }

        controller.dispatch(Instant::now());
        controller.publish();
    }

    controller.shutdown(&mut listener, &mut task_rx).await;
    Ok(())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        }
        None => std::future::pending().await,
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Outcome of remote work spawned off the event loop
#[derive(Debug)]
enum TaskEvent {
    Flushed {
        id: u64,
        result: Result<VolumeChange, RemoteError>,
    },
    Connected(Result<(String, u8), RemoteError>),
    /// `None` when there was no handle to poll
    Playback(Option<Result<Playback, RemoteError>>),
}

/// Single owner of the session's mutable state
struct Controller<L: LocalVolumeSource, C: Connector> {
    config: Config,
    local: Arc<L>,
    remote: Arc<RemoteVolumeClient<C>>,
    aggregator: DeltaAggregator,
    gate: KeyGate,
    status: watch::Sender<StatusSnapshot>,
    tasks: mpsc::UnboundedSender<TaskEvent>,
    started: Instant,

    target_active: bool,
    remote_connected: bool,
    remote_name: Option<String>,
    remote_volume: Option<u8>,
    last_error: Option<String>,
    /// Local mute applied by the playback guard
    muted_by_us: bool,
    connecting: bool,
    polling_playback: bool,
    shutting_down: bool,
}

impl<L: LocalVolumeSource, C: Connector> Controller<L, C> {
    fn new(
        config: Config,
        local: Arc<L>,
        connector: C,
        gate: KeyGate,
        status: watch::Sender<StatusSnapshot>,
        tasks: mpsc::UnboundedSender<TaskEvent>,
    ) -> Self {
        let remote = Arc::new(RemoteVolumeClient::new(connector, config.remote.clone()));
        let aggregator = DeltaAggregator::new(config.steps.clone());
        Self {
            config,
            local,
            remote,
            aggregator,
            gate,
            status,
            tasks,
            started: Instant::now(),
            target_active: false,
            remote_connected: false,
            remote_name: None,
            remote_volume: None,
            last_error: None,
            muted_by_us: false,
            connecting: false,
            polling_playback: false,
            shutting_down: false,
        }
    }

    fn on_key(&mut self, intent: KeyIntent) {
        self.aggregator.push_key(intent.direction, intent.at);
    }

    async fn on_local(&mut self, event: LocalEvent) {
        match event {
            LocalEvent::Drift(delta) => self.aggregator.push_observed(delta, Instant::now()),
            LocalEvent::TargetChanged(active) => {
                self.target_active = active;
                if !active {
                    self.aggregator.request_flush();
                    self.set_local_mute(false).await;
                }
                self.update_gate();
            }
        }
    }

    async fn on_task(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Flushed { id, result } => self.on_flushed(id, result).await,
            TaskEvent::Connected(result) => {
                self.connecting = false;
                match result {
                    Ok((name, level)) => {
                        info!("Remote speaker '{}' reachable at {}%", name, level);
                        self.remote_connected = true;
                        self.remote_name = Some(name);
                        self.remote_volume = Some(level);
                        self.last_error = None;
                    }
                    Err(e) => self.mark_unreachable(&e).await,
                }
                self.update_gate();
            }
            TaskEvent::Playback(result) => {
                self.polling_playback = false;
                match result {
                    Some(Ok(playback)) if self.target_active && !self.shutting_down => {
                        self.set_local_mute(playback.should_mute_local()).await;
                    }
                    Some(Err(e)) => {
                        debug!("Failed to read remote transport state: {}", e);
                        self.remote.invalidate().await;
                        self.mark_unreachable(&e).await;
                    }
                    _ => {}
                }
            }
        }
    }

    async fn on_flushed(&mut self, id: u64, result: Result<VolumeChange, RemoteError>) {
        let now = Instant::now();
        match result {
            Ok(change) => {
                self.remote_volume = Some(change.to);
                if !self.remote_connected {
                    self.remote_connected = true;
                    self.last_error = None;
                    self.update_gate();
                }
                if let Completion::Applied(flush) =
                    self.aggregator.complete(id, FlushOutcome::Applied, now)
                {
                    info!(
                        "Remote volume {} -> {} ({:+}%)",
                        change.from,
                        change.to,
                        flush.delta()
                    );
                    self.notify(
                        "Sonos Volume",
                        format!("{}%", change.to),
                        Some(volume_icon(change.to)),
                    );
                }
            }
            Err(e) => {
                warn!("Failed to apply remote volume change: {}", e);
                self.last_error = Some(e.to_string());
                self.remote.invalidate().await;
                if let Completion::Dropped(flush) =
                    self.aggregator.complete(id, FlushOutcome::Failed, now)
                {
                    self.mark_unreachable(&e).await;
                    self.notify(
                        "Sonos Volume",
                        format!("Dropped {:+}% change: speaker unreachable", flush.delta()),
                        Some("dialog-warning"),
                    );
                }
            }
        }
    }

    /// Passthrough until a reconnect succeeds; a mute we applied is lifted so
    /// passthrough keys act on an audible device
    async fn mark_unreachable(&mut self, e: &RemoteError) {
        let message = e.to_string();
        if self.remote_connected || self.last_error.as_deref() != Some(message.as_str()) {
            warn!("Remote speaker unreachable: {}", message);
        } else {
            debug!("Remote speaker still unreachable: {}", message);
        }
        self.remote_connected = false;
        self.last_error = Some(message);
        self.update_gate();
        self.set_local_mute(false).await;
    }

    /// Active iff the target is active, the remote is reachable, and we are not stopping
    fn update_gate(&mut self) {
        let mode = if self.shutting_down {
            GateMode::Closed
        } else if self.target_active && self.remote_connected {
            GateMode::Active
        } else {
            GateMode::Passthrough
        };

        let previous = self.gate.mode();
        if previous != mode {
            info!("Key mode: {} -> {}", previous.as_str(), mode.as_str());
            match mode {
                GateMode::Closed => self.gate.close(),
                _ => self.gate.set(mode),
            }
        }
    }

    /// Hand the next due flush to a remote task
    fn dispatch(&mut self, now: Instant) {
        let Some(flush) = self.aggregator.poll(now) else {
            return;
        };
        debug!(
            "Flush {}: {} steps, rank {}, {:+}% (attempt {})",
            flush.id,
            flush.steps,
            flush.rank,
            flush.delta(),
            flush.attempt
        );

        let remote = Arc::clone(&self.remote);
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            let result = apply_flush(&remote, &flush).await;
            let _ = tasks.send(TaskEvent::Flushed {
                id: flush.id,
                result,
            });
        });
    }

    fn start_reconnect(&mut self) {
        if self.connecting || self.remote_connected || self.shutting_down {
            return;
        }
        self.connecting = true;

        let remote = Arc::clone(&self.remote);
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            let result = connect_remote(&remote).await;
            let _ = tasks.send(TaskEvent::Connected(result));
        });
    }

    fn start_playback_poll(&mut self) {
        if !self.config.settings.mute_during_remote_playback
            || !self.target_active
            || !self.remote_connected
            || self.polling_playback
            || self.shutting_down
        {
            return;
        }
        self.polling_playback = true;

        let remote = Arc::clone(&self.remote);
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            let result = match remote.handle().await {
                Some(handle) => Some(remote.playback(&handle).await),
                None => None,
            };
            let _ = tasks.send(TaskEvent::Playback(result));
        });
    }

    /// Mute or unmute the local device; only a mute we applied is ever lifted
    async fn set_local_mute(&mut self, muted: bool) {
        if muted == self.muted_by_us {
            return;
        }

        let local = Arc::clone(&self.local);
        match tokio::task::spawn_blocking(move || local.set_muted(muted)).await {
            Ok(Ok(())) => {
                self.muted_by_us = muted;
                if muted {
                    info!("Muted local output while the speaker plays another source");
                } else {
                    info!("Unmuted local output");
                }
            }
            Ok(Err(e)) => warn!(
                "Failed to {} local output: {}",
                if muted { "mute" } else { "unmute" },
                e
            ),
            Err(e) => error!("Local mute task failed: {}", e),
        }
    }

    fn notify(&self, summary: &'static str, body: String, icon: Option<&'static str>) {
        if !self.config.settings.notifications_enabled {
            return;
        }
        tokio::task::spawn_blocking(move || notify_if(true, summary, &body, icon));
    }

    fn publish(&self) {
        self.status.send_replace(StatusSnapshot {
            version: crate::version(),
            uptime_secs: self.started.elapsed().as_secs(),
            mode: self.gate.mode().as_str().to_string(),
            target_active: self.target_active,
            remote_connected: self.remote_connected,
            remote_name: self.remote_name.clone(),
            remote_volume: self.remote_volume,
            phase: self.aggregator.phase().as_str().to_string(),
            dropped_deltas: self.aggregator.dropped(),
            last_error: self.last_error.clone(),
        });
    }

    async fn shutdown(
        &mut self,
        listener: &mut KeyListener,
        tasks: &mut mpsc::UnboundedReceiver<TaskEvent>,
    ) {
        info!("Shutting down");
        let _ = sd_notify::notify(false, &[NotifyState::Stopping]);

        self.shutting_down = true;
        self.update_gate();
        listener.stop().await;

        // Intents accepted before the gate closed still count
        while let Ok(intent) = listener.intents.try_recv() {
            self.on_key(intent);
        }
        self.aggregator.request_flush();

        let deadline = Instant::now() + self.config.settings.shutdown_timeout;
        loop {
            let now = Instant::now();
            self.dispatch(now);
            if self.aggregator.is_drained() {
                break;
            }
            if now >= deadline {
                let lost = self.aggregator.abandon();
                warn!("Shutdown timeout reached, abandoned {} pending change(s)", lost);
                break;
            }

            let wake = self
                .aggregator
                .next_deadline()
                .map_or(deadline, |next| next.min(deadline));
            tokio::select! {
                Some(event) = tasks.recv() => self.on_task(event).await,
                () = sleep_until(Some(wake)) => {}
            }
        }

        self.set_local_mute(false).await;
        self.remote.release().await;
        self.publish();
        self.notify("Sonos Volume Sync", "Volume sync stopped".to_string(), None);
        info!("Stopped");
    }
}

async fn apply_flush<C: Connector>(
    remote: &RemoteVolumeClient<C>,
    flush: &Flush,
) -> Result<VolumeChange, RemoteError> {
    let handle = match remote.handle().await {
        Some(handle) => handle,
        None => remote.connect().await?,
    };
    remote.set_relative_volume(&handle, flush.delta()).await
}

/// Connect (or revalidate) and read the current level
async fn connect_remote<C: Connector>(remote: &RemoteVolumeClient<C>) -> Result<(String, u8), RemoteError> {
    let handle = remote.connect().await?;
    let level = remote.get_volume(&handle).await?;
    Ok((handle.name().to_string(), level))
}
