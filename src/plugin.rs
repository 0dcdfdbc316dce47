//! Host-facing plugin surface: identity, options schema and start/stop.

use crate::bus::BusTransport;
use crate::config::{
    BridgeOptions, DEFAULT_BUS_PORT, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_INTERVAL_MS, DEFAULT_PRODUCT_NAME,
    DEFAULT_VENUS_HOST,
};
use crate::device::DeviceProfile;
use crate::error::BridgeError;
use crate::session::{BridgeSession, SessionSettings, SessionState, TeardownReport};
use crate::status::StatusSink;
use crate::telemetry::TelemetryProvider;
use std::sync::Arc;
use tracing::info;

pub const PLUGIN_ID: &str = "signalk-virtual-bmv";
pub const PLUGIN_NAME: &str = "Virtual Battery Monitor";
pub const PLUGIN_DESCRIPTION: &str =
    "Emulates a VE.Direct BMV 602S device by injecting battery data into the Victron Cerbo GX.";

/// Owns at most one session at a time. Every `start` builds a fresh
/// session from the options it is given.
pub struct VirtualBmvPlugin<T: BusTransport + Clone> {
    transport: T,
    provider: Arc<dyn TelemetryProvider>,
    sink: Arc<dyn StatusSink>,
    session: Option<BridgeSession<T>>,
}

impl<T: BusTransport + Clone> VirtualBmvPlugin<T> {
    pub fn new(transport: T, provider: Arc<dyn TelemetryProvider>, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            transport,
            provider,
            sink,
            session: None,
        }
    }

    /// JSON schema of the options, with the defaults the host should offer.
    pub fn schema() -> serde_json::Value {
        let paths = crate::config::SourcePaths::default();
        serde_json::json!({
            "type": "object",
            "properties": {
                "productName": {
                    "type": "string",
                    "title": "Product Name (shown in Venus/VRM)",
                    "default": DEFAULT_PRODUCT_NAME
                },
                "venusHost": {
                    "type": "string",
                    "title": "Venus OS hostname or IP",
                    "default": DEFAULT_VENUS_HOST
                },
                "port": {
                    "type": "number",
                    "title": "Bus port",
                    "default": DEFAULT_BUS_PORT
                },
                "interval": {
                    "type": "number",
                    "title": "Update interval (ms)",
                    "default": DEFAULT_INTERVAL_MS
                },
                "connectTimeoutMs": {
                    "type": "number",
                    "title": "Connection timeout (ms)",
                    "default": DEFAULT_CONNECT_TIMEOUT_MS
                },
                "paths": {
                    "type": "object",
                    "title": "Signal K paths to use",
                    "properties": {
                        "voltage": { "type": "string", "default": paths.voltage },
                        "current": { "type": "string", "default": paths.current },
                        "soc": { "type": "string", "default": paths.soc },
                        "timeToGo": { "type": "string", "default": paths.time_to_go },
                        "voltageStarter": { "type": "string", "default": paths.voltage_starter }
                    }
                }
            }
        })
    }

    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.state() == SessionState::Running)
    }

    pub fn session(&self) -> Option<&BridgeSession<T>> {
        self.session.as_ref()
    }

    pub async fn start(&mut self, options: &BridgeOptions) -> Result<(), BridgeError> {
        if self.is_running() {
            return Err(BridgeError::AlreadyRunning);
        }
        self.sink.report_status("Starting virtual BMV plugin");
        if let Err(e) = options.validate() {
            self.sink.report_error(&format!("Failed to start: {}", e));
            return Err(e.into());
        }

        let mut session = BridgeSession::new(
            self.transport.clone(),
            DeviceProfile::bmv602s(options),
            SessionSettings::from(options),
            Arc::clone(&self.provider),
            Arc::clone(&self.sink),
        );
        let started = session.start().await;
        if started.is_ok() {
            info!("{} started", PLUGIN_ID);
        }
        // Keep a failed session around so its status stays inspectable.
        self.session = Some(session);
        started
    }

    pub async fn stop(&mut self) -> Option<TeardownReport> {
        let report = match self.session.as_mut() {
            Some(session) => session.stop().await,
            None => None,
        };
        if report.is_some() {
            info!("{} stopped", PLUGIN_ID);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::status::RecordingSink;
    use crate::telemetry::SharedTelemetry;

    #[test]
    fn test_schema_defaults() {
        let schema = VirtualBmvPlugin::<MemoryBus>::schema();
        assert_eq!(schema["properties"]["venusHost"]["default"], "venus.local");
        assert_eq!(schema["properties"]["interval"]["default"], 1000);
        assert_eq!(
            schema["properties"]["paths"]["properties"]["soc"]["default"],
            "electrical.batteries.0.capacity.stateOfCharge"
        );
    }

    #[tokio::test]
    async fn test_invalid_options_never_connect() {
        let bus = MemoryBus::new();
        let sink = RecordingSink::new();
        let mut plugin = VirtualBmvPlugin::new(bus.clone(), Arc::new(SharedTelemetry::new()), Arc::new(sink.clone()));

        let mut options = BridgeOptions::default();
        options.venus_host = String::new();
        assert!(matches!(plugin.start(&options).await, Err(BridgeError::Config(_))));
        assert_eq!(bus.open_connections().await, 0);
        assert_eq!(sink.errors_reported(), 1);
        assert!(plugin.stop().await.is_none());
    }

    #[tokio::test]
    async fn test_restart_uses_fresh_session() {
        let bus = MemoryBus::new();
        let mut plugin = VirtualBmvPlugin::new(
            bus.clone(),
            Arc::new(SharedTelemetry::new()),
            Arc::new(RecordingSink::new()),
        );
        let options = BridgeOptions::default();

        plugin.start(&options).await.unwrap();
        assert!(plugin.is_running());
        assert!(matches!(plugin.start(&options).await, Err(BridgeError::AlreadyRunning)));
        assert!(plugin.stop().await.is_some());
        assert!(!plugin.is_running());

        plugin.start(&options).await.unwrap();
        assert!(plugin.is_running());
        assert_eq!(bus.exported_paths().await.len(), 10);
        plugin.stop().await;
        assert!(bus.exported_paths().await.is_empty());
    }
}
