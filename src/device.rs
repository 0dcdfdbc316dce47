//! BMV-602S device profile: what the GX device expects to find under
//! `com.victronenergy.battery.*`, and which telemetry feeds it.

use crate::config::BridgeOptions;
use crate::registry::{Labels, PathTable};
use crate::sampler::{HeadlinePaths, TelemetryMapping};
use crate::value::Value;

pub const SERVICE_NAME: &str = "com.victronenergy.battery.ttyVirtualBMV";
pub const OBJECT_BASE_PATH: &str = "/com/victronenergy/battery/ttyVirtualBMV";
pub const PROCESS_NAME: &str = "signalk-virtual-bmv";
pub const FIRMWARE_VERSION: &str = "1.0";
pub const FALLBACK_PRODUCT_NAME: &str = "BMV 602-S";

pub const PATH_VOLTAGE: &str = "/Dc/0/Voltage";
pub const PATH_CURRENT: &str = "/Dc/0/Current";
pub const PATH_SOC: &str = "/Soc";
pub const PATH_TIME_TO_GO: &str = "/TimeToGo";
pub const PATH_STARTER_VOLTAGE: &str = "/Dc/1/Voltage";

/// Everything a session needs to know about the device it emulates.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub service_name: String,
    pub base_path: String,
    pub table: PathTable,
    pub labels: Labels,
    pub mapping: TelemetryMapping,
    pub headlines: HeadlinePaths,
}

impl DeviceProfile {
    pub fn bmv602s(options: &BridgeOptions) -> Self {
        let product_name = match options.product_name.trim() {
            "" => FALLBACK_PRODUCT_NAME.to_string(),
            name => name.to_string(),
        };

        let entries: [(&str, Value, &str); 10] = [
            ("/Mgmt/ProcessName", Value::from(PROCESS_NAME), "Process Name"),
            (
                "/Mgmt/Connection",
                Value::Text(format!("tcp://{}", options.venus_host.trim())),
                "Connection Type",
            ),
            ("/Connected", Value::from(true), "Connection Status"),
            ("/FirmwareVersion", Value::from(FIRMWARE_VERSION), "Firmware Version"),
            (PATH_VOLTAGE, Value::Number(0.0), "Battery Voltage"),
            (PATH_CURRENT, Value::Number(0.0), "Battery Current"),
            (PATH_SOC, Value::Number(0.0), "State of Charge"),
            (PATH_TIME_TO_GO, Value::Number(0.0), "Time Remaining"),
            (PATH_STARTER_VOLTAGE, Value::Number(0.0), "Starter Voltage"),
            ("/ProductName", Value::Text(product_name), "Device Name"),
        ];

        let mut table = PathTable::with_capacity(entries.len());
        let mut labels = Labels::with_capacity(entries.len());
        for (path, default, label) in entries {
            table.push((path.to_string(), default));
            labels.insert(path.to_string(), label.to_string());
        }

        let sources = &options.paths;
        let mapping = TelemetryMapping::new()
            .with(PATH_VOLTAGE, sources.voltage.as_str())
            .with(PATH_CURRENT, sources.current.as_str())
            .with(PATH_SOC, sources.soc.as_str())
            .with(PATH_TIME_TO_GO, sources.time_to_go.as_str())
            .with(PATH_STARTER_VOLTAGE, sources.voltage_starter.as_str());

        Self {
            service_name: SERVICE_NAME.to_string(),
            base_path: OBJECT_BASE_PATH.to_string(),
            table,
            labels,
            mapping,
            headlines: HeadlinePaths {
                voltage: PATH_VOLTAGE.to_string(),
                current: PATH_CURRENT.to_string(),
                soc: PATH_SOC.to_string(),
            },
        }
    }
}
