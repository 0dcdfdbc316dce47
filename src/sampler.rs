use crate::error::ConfigError;
use crate::registry::PropertyRegistry;
use crate::telemetry::TelemetryProvider;
use crate::value::ValueTag;
use arrayvec::ArrayString;
use core::fmt::Write;
use std::fmt;
use tracing::debug;

const STATUS_LINE_CAPACITY: usize = 128;

/// Which telemetry source path drives which property. Entries keep the order
/// they were added in; that is also the refresh order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryMapping {
    entries: Vec<(String, String)>,
}

impl TelemetryMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, property_path: impl Into<String>, source_path: impl Into<String>) -> Self {
        self.insert(property_path, source_path);
        self
    }

    /// Adds or replaces the source for `property_path`.
    pub fn insert(&mut self, property_path: impl Into<String>, source_path: impl Into<String>) {
        let property_path = property_path.into();
        let source_path = source_path.into();
        match self.entries.iter_mut().find(|(p, _)| *p == property_path) {
            Some(entry) => entry.1 = source_path,
            None => self.entries.push((property_path, source_path)),
        }
    }

    pub fn source_for(&self, property_path: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(p, _)| p == property_path)
            .map(|(_, s)| s.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, s)| (p.as_str(), s.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every mapped property must exist and every source path must be set.
    pub fn validate(&self, registry: &PropertyRegistry) -> Result<(), ConfigError> {
        for (property_path, source_path) in &self.entries {
            if !registry.contains(property_path) {
                return Err(ConfigError::UnknownMappedPath(property_path.clone()));
            }
            if source_path.trim().is_empty() {
                return Err(ConfigError::EmptySourcePath(property_path.clone()));
            }
        }
        Ok(())
    }
}

/// Properties shown in the one-line status summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlinePaths {
    pub voltage: String,
    pub current: String,
    pub soc: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    Absent,
    TypeMismatch { expected: ValueTag, received: ValueTag },
}

/// One source path that could not feed its property this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryMiss {
    pub property_path: String,
    pub source_path: String,
    pub reason: MissReason,
}

impl fmt::Display for TelemetryMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            MissReason::Absent => write!(f, "Missing telemetry path: {}", self.source_path),
            MissReason::TypeMismatch { expected, received } => write!(
                f,
                "Telemetry path {} has {} value, {} expects {}",
                self.source_path, received, self.property_path, expected
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleOutcome {
    pub property_path: String,
    pub hit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleReport {
    pub outcomes: Vec<SampleOutcome>,
    pub misses: Vec<TelemetryMiss>,
    pub summary: String,
}

impl SampleReport {
    pub fn hits(&self) -> usize {
        self.outcomes.iter().filter(|o| o.hit).count()
    }

    pub fn is_complete(&self) -> bool {
        self.misses.is_empty()
    }
}

/// Copies telemetry into the registry, one pass per call.
#[derive(Debug, Clone)]
pub struct TelemetrySampler {
    mapping: TelemetryMapping,
    headlines: HeadlinePaths,
}

impl TelemetrySampler {
    pub fn new(mapping: TelemetryMapping, headlines: HeadlinePaths) -> Self {
        Self { mapping, headlines }
    }

    pub fn mapping(&self) -> &TelemetryMapping {
        &self.mapping
    }

    /// Reads every mapped source path and stores the result. A missing or
    /// unusable reading stores the tag's zero value and is recorded as a
    /// miss; it never stops the rest of the pass.
    pub fn refresh<P>(&self, provider: &P, registry: &mut PropertyRegistry) -> SampleReport
    where
        P: TelemetryProvider + ?Sized,
    {
        let mut outcomes = Vec::with_capacity(self.mapping.len());
        let mut misses = Vec::new();

        for (property_path, source_path) in self.mapping.entries() {
            let object = match registry.get_mut(property_path) {
                Some(object) => object,
                None => continue,
            };
            let tag = object.tag();

            let reading = provider.read(source_path);
            let (value, reason) = match reading {
                None => (tag.zero(), Some(MissReason::Absent)),
                Some(raw) => {
                    let received = raw.tag();
                    match raw.coerce_to(tag) {
                        Some(value) => (value, None),
                        None => (tag.zero(), Some(MissReason::TypeMismatch { expected: tag, received })),
                    }
                }
            };
            object.set_value(value);

            outcomes.push(SampleOutcome {
                property_path: property_path.to_string(),
                hit: reason.is_none(),
            });
            if let Some(reason) = reason {
                let miss = TelemetryMiss {
                    property_path: property_path.to_string(),
                    source_path: source_path.to_string(),
                    reason,
                };
                debug!("{}", miss);
                misses.push(miss);
            }
        }

        let summary = self.summarize(registry, misses.len());
        SampleReport {
            outcomes,
            misses,
            summary,
        }
    }

    /// `Reporting: 12.60 V, -3.2 A, 87.0 % SoC`. Rounding is for display
    /// only; stored values keep full precision.
    pub fn summarize(&self, registry: &PropertyRegistry, missing: usize) -> String {
        let headline = |path: &str| {
            registry
                .get(path)
                .and_then(|object| object.read().as_f64())
                .unwrap_or(0.0)
        };
        let volts = headline(&self.headlines.voltage);
        let amps = headline(&self.headlines.current);
        let soc = headline(&self.headlines.soc);

        let mut line = ArrayString::<STATUS_LINE_CAPACITY>::new();
        let written = write!(line, "Reporting: {:.2} V, {:.1} A, {:.1} % SoC", volts, amps, soc)
            .and_then(|()| {
                if missing > 0 {
                    write!(line, ", {} missing", missing)
                } else {
                    Ok(())
                }
            });

        match written {
            Ok(()) => line.to_string(),
            // Absurd magnitudes overflow the line buffer.
            Err(_) => {
                let mut long = format!("Reporting: {:.2} V, {:.1} A, {:.1} % SoC", volts, amps, soc);
                if missing > 0 {
                    long.push_str(&format!(", {} missing", missing));
                }
                long
            }
        }
    }
}
