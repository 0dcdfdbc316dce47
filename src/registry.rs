use crate::bus::{BusConnection, BusMethod, CallReply, ExportedItem, BUS_ITEM_INTERFACE};
use crate::error::{ConfigError, TransportError};
use crate::property::PropertyObject;
use crate::value::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Ordered `path -> default value` table describing one device.
pub type PathTable = Vec<(String, Value)>;
/// Static `GetText` labels by path.
pub type Labels = HashMap<String, String>;

/// Owns every property object of one emulated device and tracks which of
/// them are currently exported on a connection.
#[derive(Debug, Default)]
pub struct PropertyRegistry {
    objects: Vec<PropertyObject>,
    index: HashMap<String, usize>,
    base_path: String,
    exported: Vec<String>,
}

pub(crate) fn validate_path(path: &str) -> Result<(), ConfigError> {
    let well_formed = path.len() > 1
        && path.starts_with('/')
        && path[1..].split('/').all(|segment| !segment.is_empty())
        && !path.chars().any(char::is_whitespace);
    if well_formed {
        Ok(())
    } else {
        Err(ConfigError::MalformedPath(path.to_string()))
    }
}

impl PropertyRegistry {
    /// Creates one property per table entry, tagged by its default value.
    pub fn build(table: PathTable, labels: &Labels) -> Result<Self, ConfigError> {
        if table.is_empty() {
            return Err(ConfigError::EmptyPathTable);
        }

        let mut registry = Self::default();
        for (path, default) in table {
            validate_path(&path)?;
            if registry.index.contains_key(&path) {
                return Err(ConfigError::DuplicatePath(path));
            }
            let label = labels.get(&path).map(String::as_str);
            registry.index.insert(path.clone(), registry.objects.len());
            registry.objects.push(PropertyObject::new(path, default, label));
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&PropertyObject> {
        self.index.get(path).map(|&i| &self.objects[i])
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut PropertyObject> {
        let i = *self.index.get(path)?;
        self.objects.get_mut(i)
    }

    /// Properties in table order.
    pub fn iter(&self) -> impl Iterator<Item = &PropertyObject> {
        self.objects.iter()
    }

    /// Full object paths currently exported, in export order.
    pub fn exported_paths(&self) -> &[String] {
        &self.exported
    }

    /// Maps a full bus object path back to the property path.
    pub fn resolve<'a>(&self, object_path: &'a str) -> Option<&'a str> {
        let path = object_path.strip_prefix(self.base_path.as_str())?;
        self.contains(path).then_some(path)
    }

    /// Exports every property at `base_path + path`. Paths that made it onto
    /// the bus are tracked even when a later export fails, so that
    /// [`unexport_all`](Self::unexport_all) can undo a partial export.
    pub async fn export_all<C: BusConnection>(
        &mut self,
        connection: &mut C,
        base_path: &str,
    ) -> Result<(), TransportError> {
        if !connection.is_ready() {
            return Err(TransportError::NotReady);
        }
        self.base_path = base_path.trim_end_matches('/').to_string();

        for object in &self.objects {
            let object_path = format!("{}{}", self.base_path, object.path());
            if self.exported.contains(&object_path) {
                continue;
            }
            let item = ExportedItem {
                path: object_path.clone(),
                interface: BUS_ITEM_INTERFACE.to_string(),
                signature: object.tag().signature().to_string(),
                label: object.describe().to_string(),
            };
            if let Err(e) = connection.export(&item).await {
                warn!(
                    "Export of {} failed after {} of {} objects: {}",
                    object_path,
                    self.exported.len(),
                    self.objects.len(),
                    e
                );
                return Err(e);
            }
            self.exported.push(object_path);
        }

        info!("Exported {} objects under {}", self.exported.len(), self.base_path);
        Ok(())
    }

    /// Removes every exported object from the bus. Safe to call repeatedly
    /// and after a partial export; failures are logged and skipped.
    pub async fn unexport_all<C: BusConnection>(&mut self, connection: &mut C) -> usize {
        let mut removed = 0;
        while let Some(object_path) = self.exported.pop() {
            match connection.unexport(&object_path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Unexport of {} failed: {}", object_path, e),
            }
        }
        if removed > 0 {
            debug!("Unexported {} objects", removed);
        }
        removed
    }

    /// Answers one `BusItem` method call for a full object path.
    pub fn answer(&mut self, object_path: &str, method: BusMethod) -> CallReply {
        let path = match self.resolve(object_path) {
            Some(path) => path,
            None => return CallReply::UnknownObject,
        };
        let object = match self.get_mut(path) {
            Some(object) => object,
            None => return CallReply::UnknownObject,
        };
        match method {
            BusMethod::GetValue => CallReply::Value(object.read()),
            BusMethod::GetText => CallReply::Text(object.describe().to_string()),
            BusMethod::SetValue { value } => CallReply::Accepted(object.write(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusAddress, BusTransport, MemoryBus};
    use std::time::Duration;

    const BASE: &str = "/com/victronenergy/battery/ttyTest";

    fn table() -> PathTable {
        vec![
            ("/ProductName".to_string(), Value::from("BMV 602-S")),
            ("/Connected".to_string(), Value::from(true)),
            ("/Dc/0/Voltage".to_string(), Value::Number(0.0)),
        ]
    }

    fn labels() -> Labels {
        let mut labels = Labels::new();
        labels.insert("/Dc/0/Voltage".to_string(), "Battery Voltage".to_string());
        labels
    }

    #[test]
    fn test_build_infers_tags() {
        let registry = PropertyRegistry::build(table(), &labels()).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("/ProductName").unwrap().tag(), crate::value::ValueTag::Text);
        assert_eq!(registry.get("/Connected").unwrap().tag(), crate::value::ValueTag::Integer);
        assert_eq!(registry.get("/Dc/0/Voltage").unwrap().describe(), "Battery Voltage");
        assert_eq!(registry.get("/Connected").unwrap().describe(), "");
        assert!(registry.get("/Soc").is_none());
    }

    #[test]
    fn test_build_rejects_bad_tables() {
        assert_eq!(
            PropertyRegistry::build(Vec::new(), &Labels::new()).unwrap_err(),
            ConfigError::EmptyPathTable
        );

        let mut dup = table();
        dup.push(("/Connected".to_string(), Value::from(false)));
        assert_eq!(
            PropertyRegistry::build(dup, &Labels::new()).unwrap_err(),
            ConfigError::DuplicatePath("/Connected".to_string())
        );

        for bad in ["Soc", "/", "/Dc//Voltage", "/Dc/0/", "/Time To Go"] {
            let table = vec![(bad.to_string(), Value::Number(0.0))];
            assert_eq!(
                PropertyRegistry::build(table, &Labels::new()).unwrap_err(),
                ConfigError::MalformedPath(bad.to_string())
            );
        }
    }

    #[tokio::test]
    async fn test_export_and_unexport_all() {
        let bus = MemoryBus::new();
        let mut conn = bus.connect(&BusAddress::new("test", 78), Duration::from_secs(1)).await.unwrap();
        let mut registry = PropertyRegistry::build(table(), &labels()).unwrap();

        registry.export_all(&mut conn, BASE).await.unwrap();
        assert_eq!(registry.exported_paths().len(), 3);
        assert_eq!(bus.exported_paths().await.len(), 3);
        let item = bus.exported_item(&format!("{}/Dc/0/Voltage", BASE)).await.unwrap();
        assert_eq!(item.signature, "d");
        assert_eq!(item.interface, BUS_ITEM_INTERFACE);

        // Re-running skips what is already there.
        registry.export_all(&mut conn, BASE).await.unwrap();
        assert_eq!(registry.exported_paths().len(), 3);

        assert_eq!(registry.unexport_all(&mut conn).await, 3);
        assert_eq!(registry.unexport_all(&mut conn).await, 0);
        assert!(registry.exported_paths().is_empty());
        assert!(bus.exported_paths().await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_export_is_reversible() {
        let bus = MemoryBus::new();
        bus.fail_export_of(&format!("{}/Dc/0/Voltage", BASE)).await;
        let mut conn = bus.connect(&BusAddress::new("test", 78), Duration::from_secs(1)).await.unwrap();
        let mut registry = PropertyRegistry::build(table(), &labels()).unwrap();

        let err = registry.export_all(&mut conn, BASE).await.unwrap_err();
        assert!(matches!(err, TransportError::ExportRejected(_, _)));
        assert_eq!(registry.exported_paths().len(), 2);

        registry.unexport_all(&mut conn).await;
        assert!(bus.exported_paths().await.is_empty());
    }

    #[tokio::test]
    async fn test_export_requires_ready_connection() {
        let bus = MemoryBus::new();
        let mut conn = bus.connect(&BusAddress::new("test", 78), Duration::from_secs(1)).await.unwrap();
        conn.close().await.unwrap();
        let mut registry = PropertyRegistry::build(table(), &labels()).unwrap();

        let err = registry.export_all(&mut conn, BASE).await.unwrap_err();
        assert_eq!(err, TransportError::NotReady);
        assert!(registry.exported_paths().is_empty());
    }

    #[test]
    fn test_answer_calls() {
        let mut registry = PropertyRegistry::build(table(), &labels()).unwrap();
        registry.base_path = BASE.to_string();
        let voltage = format!("{}/Dc/0/Voltage", BASE);

        assert_eq!(
            registry.answer(&voltage, BusMethod::GetText),
            CallReply::Text("Battery Voltage".to_string())
        );
        assert_eq!(
            registry.answer(&voltage, BusMethod::SetValue { value: Value::Number(13.1) }),
            CallReply::Accepted(true)
        );
        assert_eq!(
            registry.answer(&voltage, BusMethod::SetValue { value: Value::from("high") }),
            CallReply::Accepted(false)
        );
        assert_eq!(
            registry.answer(&voltage, BusMethod::GetValue),
            CallReply::Value(Value::Number(13.1))
        );
        assert_eq!(
            registry.answer("/elsewhere/Soc", BusMethod::GetValue),
            CallReply::UnknownObject
        );
    }

    #[test]
    fn test_whole_json_number_writes_number_property() {
        let mut registry = PropertyRegistry::build(table(), &labels()).unwrap();
        registry.base_path = BASE.to_string();
        let voltage = format!("{}/Dc/0/Voltage", BASE);

        let method: BusMethod = serde_json::from_str(r#"{"SetValue":{"value":13}}"#).unwrap();
        assert_eq!(registry.answer(&voltage, method), CallReply::Accepted(true));
        assert_eq!(
            registry.answer(&voltage, BusMethod::GetValue),
            CallReply::Value(Value::Number(13.0))
        );
    }
}
