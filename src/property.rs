use crate::value::{Value, ValueTag};
use tracing::debug;

/// One addressable attribute of the emulated device.
///
/// The tag is taken from the default value and stays fixed: remote writes of
/// another type are refused, and the sampler coerces before it stores.
#[derive(Debug, Clone)]
pub struct PropertyObject {
    path: String,
    tag: ValueTag,
    label: String,
    value: Value,
}

/// A remote write that did not match the property's tag.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteWriteRejected {
    pub path: String,
    pub expected: ValueTag,
    pub received: ValueTag,
}

impl PropertyObject {
    pub fn new(path: impl Into<String>, default: Value, label: Option<&str>) -> Self {
        Self {
            path: path.into(),
            tag: default.tag(),
            label: label.unwrap_or_default().to_string(),
            value: default,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tag(&self) -> ValueTag {
        self.tag
    }

    /// `GetValue`
    pub fn read(&self) -> Value {
        self.value.clone()
    }

    /// `GetText`
    pub fn describe(&self) -> &str {
        &self.label
    }

    /// `SetValue` from the bus. Returns `false` and leaves the value alone
    /// when the incoming tag differs from the property's. Integers widen
    /// into number properties.
    pub fn write(&mut self, value: Value) -> bool {
        self.try_write(value).is_ok()
    }

    pub fn try_write(&mut self, value: Value) -> Result<(), RemoteWriteRejected> {
        let received = value.tag();
        // JSON relays send whole doubles as `13`.
        let value = match (value, self.tag) {
            (Value::Integer(i), ValueTag::Number) => Value::Number(i as f64),
            (value, _) => value,
        };
        if value.tag() != self.tag {
            let rejected = RemoteWriteRejected {
                path: self.path.clone(),
                expected: self.tag,
                received,
            };
            debug!(
                "Rejected remote write to {}: expected {}, got {}",
                rejected.path, rejected.expected, rejected.received
            );
            return Err(rejected);
        }
        self.value = value;
        Ok(())
    }

    /// Local overwrite used by the sampler, which is trusted for these paths.
    pub fn set_value(&mut self, value: Value) {
        // Sampler coerces before storing
        debug_assert_eq!(
            value.tag(),
            self.tag,
            "Sampler stored {} into {} property {}",
            value.tag(),
            self.tag,
            self.path
        );
        self.value = value;
    }
}
