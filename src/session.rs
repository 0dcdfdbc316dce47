//! Bridge session: one connect → register → run → teardown cycle.
//!
//! While running, a single task owns the bus connection and the registry.
//! It answers remote calls and runs the sampler, one thing at a time, so a
//! remote write and a refresh never touch a property concurrently.

use crate::bus::{BusAddress, BusConnection, BusTransport, CallReply, RemoteCall};
use crate::config::BridgeOptions;
use crate::device::DeviceProfile;
use crate::error::{BridgeError, TransportError};
use crate::registry::PropertyRegistry;
use crate::sampler::TelemetrySampler;
use crate::status::StatusSink;
use crate::telemetry::TelemetryProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Registering,
    Running,
    Stopping,
}

/// Connection settings resolved from the plugin options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub address: BusAddress,
    pub interval: Duration,
    pub connect_timeout: Duration,
}

impl From<&BridgeOptions> for SessionSettings {
    fn from(options: &BridgeOptions) -> Self {
        Self {
            address: options.address(),
            interval: options.sample_interval(),
            connect_timeout: options.connect_timeout(),
        }
    }
}

/// What the running task did before it let go of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TeardownReport {
    pub ticks: u64,
    pub calls_answered: u64,
    pub unexported: usize,
    pub connection_closed: bool,
    pub connection_lost: bool,
}

struct RunningHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<TeardownReport>,
}

pub struct BridgeSession<T: BusTransport> {
    transport: T,
    profile: DeviceProfile,
    settings: SessionSettings,
    provider: Arc<dyn TelemetryProvider>,
    sink: Arc<dyn StatusSink>,
    state: SessionState,
    name_claimed: bool,
    spent: bool,
    status: Arc<watch::Sender<String>>,
    running: Option<RunningHandle>,
}

impl<T: BusTransport> BridgeSession<T> {
    pub fn new(
        transport: T,
        profile: DeviceProfile,
        settings: SessionSettings,
        provider: Arc<dyn TelemetryProvider>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        let (status, _) = watch::channel(String::new());
        Self {
            transport,
            profile,
            settings,
            provider,
            sink,
            state: SessionState::Idle,
            name_claimed: false,
            spent: false,
            status: Arc::new(status),
            running: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn name_claimed(&self) -> bool {
        self.name_claimed
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Last status line published to the host.
    pub fn last_status(&self) -> String {
        self.status.borrow().clone()
    }

    /// Follows status lines as the sampler publishes them.
    pub fn subscribe_status(&self) -> watch::Receiver<String> {
        self.status.subscribe()
    }

    /// True once the running task has ended on its own, e.g. because the
    /// bus connection went away.
    pub fn is_finished(&self) -> bool {
        self.running.as_ref().is_some_and(|r| r.task.is_finished())
    }

    fn publish_status(&self, text: &str) {
        self.sink.report_status(text);
        self.status.send_replace(text.to_string());
    }

    /// Connects, claims the service name, exports the device and starts
    /// sampling. Any failure undoes what was done so far, is reported once
    /// to the host and leaves the session `Idle`; a later `start` may retry.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        if self.state != SessionState::Idle {
            return Err(BridgeError::AlreadyRunning);
        }
        if self.spent {
            return Err(BridgeError::SessionSpent);
        }

        self.publish_status(&format!("Connecting to {}", self.settings.address));
        self.state = SessionState::Connecting;
        let mut connection = match self
            .transport
            .connect(&self.settings.address, self.settings.connect_timeout)
            .await
        {
            Ok(connection) => connection,
            Err(e) => return Err(self.abort(e.into(), None, None).await),
        };

        match connection.claim_name(&self.profile.service_name).await {
            Ok(true) => self.name_claimed = true,
            Ok(false) => {
                let refused = TransportError::NameRefused(self.profile.service_name.clone());
                return Err(self.abort(refused.into(), Some(&mut connection), None).await);
            }
            Err(e) => return Err(self.abort(e.into(), Some(&mut connection), None).await),
        }
        info!("Claimed {} on {}", self.profile.service_name, self.settings.address);

        self.state = SessionState::Registering;
        let mut registry = match PropertyRegistry::build(self.profile.table.clone(), &self.profile.labels) {
            Ok(registry) => registry,
            Err(e) => return Err(self.abort(e.into(), Some(&mut connection), None).await),
        };
        if let Err(e) = self.profile.mapping.validate(&registry) {
            return Err(self.abort(e.into(), Some(&mut connection), None).await);
        }
        if let Err(e) = registry.export_all(&mut connection, &self.profile.base_path).await {
            return Err(self.abort(e.into(), Some(&mut connection), Some(&mut registry)).await);
        }

        let (cancel, cancelled) = watch::channel(false);
        let sampling = SamplingLoop {
            connection,
            registry,
            sampler: TelemetrySampler::new(self.profile.mapping.clone(), self.profile.headlines.clone()),
            provider: Arc::clone(&self.provider),
            sink: Arc::clone(&self.sink),
            status: Arc::clone(&self.status),
            cancelled,
            report: TeardownReport::default(),
        };
        let task = tokio::spawn(sampling.run(self.settings.interval));

        self.running = Some(RunningHandle { cancel, task });
        self.state = SessionState::Running;
        self.spent = true;
        info!(
            "Virtual device running, sampling every {} ms",
            self.settings.interval.as_millis()
        );
        self.publish_status(&format!("Running as {}", self.profile.service_name));
        Ok(())
    }

    /// Best-effort rollback of a failed start.
    async fn abort(
        &mut self,
        error: BridgeError,
        connection: Option<&mut T::Connection>,
        registry: Option<&mut PropertyRegistry>,
    ) -> BridgeError {
        if let Some(connection) = connection {
            if let Some(registry) = registry {
                registry.unexport_all(connection).await;
            }
            if let Err(e) = connection.close().await {
                warn!("Closing connection after failed start: {}", e);
            }
        }
        self.name_claimed = false;
        self.state = SessionState::Idle;
        error!("Failed to start virtual device: {}", error);
        self.sink.report_error(&format!("Failed to start: {}", error));
        error
    }

    /// Stops sampling, unexports everything and closes the connection.
    /// Returns `None` when nothing was running.
    pub async fn stop(&mut self) -> Option<TeardownReport> {
        let running = self.running.take()?;
        self.state = SessionState::Stopping;

        // The task may already be gone if the connection was lost.
        let _ = running.cancel.send(true);
        let report = match running.task.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("Sampling task ended abnormally: {}", e);
                None
            }
        };

        self.name_claimed = false;
        self.state = SessionState::Idle;
        self.publish_status("Stopped");
        report
    }
}

/// State owned by the running task.
struct SamplingLoop<C: BusConnection> {
    connection: C,
    registry: PropertyRegistry,
    sampler: TelemetrySampler,
    provider: Arc<dyn TelemetryProvider>,
    sink: Arc<dyn StatusSink>,
    status: Arc<watch::Sender<String>>,
    cancelled: watch::Receiver<bool>,
    report: TeardownReport,
}

impl<C: BusConnection> SamplingLoop<C> {
    fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    async fn run(mut self, interval: Duration) -> TeardownReport {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut calls_open = true;

        loop {
            tokio::select! {
                biased;

                changed = self.cancelled.changed() => {
                    // A dropped sender means the session itself went away.
                    if changed.is_err() || self.is_cancelled() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.is_cancelled() {
                        break;
                    }
                    if !self.connection.is_ready() {
                        self.connection_lost();
                        break;
                    }
                    self.tick();
                }
                call = self.connection.next_call(), if calls_open => {
                    match call {
                        Some(call) => {
                            if self.is_cancelled() {
                                break;
                            }
                            self.answer(call).await;
                        }
                        None => {
                            calls_open = false;
                            debug!("Bus connection delivers no more calls");
                        }
                    }
                }
            }
        }

        self.teardown().await
    }

    fn tick(&mut self) {
        let report = self.sampler.refresh(self.provider.as_ref(), &mut self.registry);
        for miss in &report.misses {
            self.sink.debug_log(&miss.to_string());
        }
        self.sink.report_status(&report.summary);
        self.status.send_replace(report.summary);
        self.report.ticks += 1;
    }

    async fn answer(&mut self, call: RemoteCall) {
        let RemoteCall { call_id, path, method } = call;
        let reply = self.registry.answer(&path, method);
        match reply {
            CallReply::Accepted(false) => {
                self.sink.debug_log(&format!("Ignored remote write with wrong type to {}", path));
            }
            CallReply::UnknownObject => debug!("Call for unknown object {}", path),
            _ => {}
        }
        if let Err(e) = self.connection.reply(call_id, reply).await {
            warn!("Failed to reply to call {} on {}: {}", call_id, path, e);
        }
        self.report.calls_answered += 1;
    }

    fn connection_lost(&mut self) {
        self.report.connection_lost = true;
        error!("Bus connection lost, sampling stopped");
        self.sink.report_error("Bus connection lost");
    }

    /// Each step runs even if the previous one failed.
    async fn teardown(mut self) -> TeardownReport {
        self.report.unexported = self.registry.unexport_all(&mut self.connection).await;
        self.report.connection_closed = match self.connection.close().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Closing bus connection failed: {}", e);
                false
            }
        };
        info!(
            "Virtual device torn down after {} samples, {} objects unexported",
            self.report.ticks, self.report.unexported
        );
        self.report
    }
}
