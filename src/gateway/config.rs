//! Configuration loading, persistence, id assignment, and hot reload.
//!
//! The controller owns the raw JSON config document. Loading restores the
//! id allocator's watermark, assigns ids to variables that lack one,
//! validates uniqueness, and atomically rebinds adapters and pollers:
//! either the new configuration is fully applied or the previous one stays
//! in place.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::data::VarType;
use crate::core::error::{GatewayError, Result};
use crate::core::ident::IdAllocator;
use crate::gateway::hub::SubscriptionHub;
use crate::gateway::poller::Poller;
use crate::protocols::{create_adapter, ConnectionConfig, ProtocolAdapter, VariableSpec};
use crate::store::DataCache;

/// Config path used when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

fn default_poll_interval() -> u64 {
    1000
}

/// Typed view of one protocol's config section.
#[derive(Debug, Deserialize)]
struct ProtocolSection {
    connection_parameters: ConnectionConfig,

    #[serde(default)]
    variables: BTreeMap<String, VariableEntry>,

    #[serde(default = "default_poll_interval")]
    polling_interval_ms: u64,
}

/// Typed view of one variable entry, parsed after id assignment.
#[derive(Debug, Deserialize)]
struct VariableEntry {
    id: i64,
    name: String,

    #[serde(default)]
    address: JsonValue,

    #[serde(rename = "type")]
    var_type: VarType,

    #[serde(default)]
    polling_interval_ms: Option<u64>,
}

/// Adapters and variables ready to bind, built before any state changes.
struct BindPlan {
    adapter: Box<dyn ProtocolAdapter>,
    variables: Vec<VariableSpec>,
    interval: Duration,
}

#[derive(Default)]
struct PollerSet {
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Owner of the config document and the adapter/poller generation bound
/// to it.
pub struct ConfigController {
    doc: RwLock<JsonValue>,
    path: RwLock<PathBuf>,
    ids: Arc<IdAllocator>,
    cache: Arc<DataCache>,
    hub: Arc<SubscriptionHub>,
    pollers: Mutex<PollerSet>,
}

impl ConfigController {
    /// Create a controller with no configuration bound yet.
    pub fn new(ids: Arc<IdAllocator>, cache: Arc<DataCache>, hub: Arc<SubscriptionHub>) -> Self {
        Self {
            doc: RwLock::new(JsonValue::Null),
            path: RwLock::new(PathBuf::from(DEFAULT_CONFIG_PATH)),
            ids,
            cache,
            hub,
            pollers: Mutex::new(PollerSet::default()),
        }
    }

    /// Load and bind the configuration at `path`.
    pub async fn load(&self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("cannot open config file {}: {e}", path.display()))
        })?;
        let candidate: JsonValue = serde_json::from_str(&text)
            .map_err(|e| GatewayError::config(format!("invalid config JSON: {e}")))?;

        self.apply(candidate, Some(path)).await?;
        info!(path = %path.display(), "configuration loaded");
        Ok(())
    }

    /// Replace the configuration from an in-memory document and persist
    /// it to the current path.
    pub async fn apply_update(&self, new_config: JsonValue) -> Result<()> {
        self.apply(new_config, None).await?;
        self.save(None)?;
        Ok(())
    }

    /// Validate `candidate`, assign missing ids, and rebind adapters and
    /// pollers. On any error the previous configuration stays bound.
    async fn apply(&self, mut candidate: JsonValue, new_path: Option<&Path>) -> Result<()> {
        if !candidate.is_object() {
            return Err(GatewayError::config("config root must be a JSON object"));
        }

        self.ids.restore_high_watermark(max_id(&candidate));
        let assigned = assign_missing_ids(&mut candidate, &self.ids);
        if assigned > 0 {
            info!(assigned, "generated ids for variables");
        }

        if let Some(dup) = find_duplicate_id(&candidate) {
            return Err(GatewayError::config(format!("duplicate variable id: {dup}")));
        }

        // Build every adapter before touching live state.
        let mut plans = Vec::new();
        let protocols = candidate.as_object().expect("checked above");
        for (key, section) in protocols {
            let mut adapter = match create_adapter(
                key,
                Arc::clone(&self.cache),
                Arc::clone(&self.hub),
            ) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(protocol = %key, error = %e, "skipping protocol");
                    continue;
                }
            };

            let section: ProtocolSection = serde_json::from_value(section.clone())
                .map_err(|e| GatewayError::config(format!("invalid section {key}: {e}")))?;

            adapter.configure(&section.connection_parameters);

            let variables: Vec<VariableSpec> = section
                .variables
                .into_values()
                .map(|v| VariableSpec {
                    id: v.id,
                    name: v.name,
                    address: v.address,
                    var_type: v.var_type,
                    polling_interval_ms: v.polling_interval_ms,
                })
                .collect();

            plans.push(BindPlan {
                adapter,
                variables,
                interval: Duration::from_millis(section.polling_interval_ms),
            });
        }

        // Commit: document first, then registrations, then the poller
        // generation swap.
        {
            let mut doc = self.doc.write().expect("config lock poisoned");
            *doc = candidate;
        }
        if let Some(path) = new_path {
            let mut current = self.path.write().expect("path lock poisoned");
            *current = path.to_path_buf();
        }
        for plan in &plans {
            for variable in &plan.variables {
                self.cache.register(variable.id, &variable.name);
            }
        }
        self.rebind(plans).await;

        // Keep the file in sync with ids assigned in memory, otherwise the
        // watcher would see a permanent difference and reassign forever.
        if assigned > 0 {
            if let Err(e) = self.save(None) {
                warn!(error = %e, "could not persist assigned ids");
            }
        }

        Ok(())
    }

    /// Stop the current poller generation and start one per plan.
    async fn rebind(&self, plans: Vec<BindPlan>) {
        let mut pollers = self.pollers.lock().await;

        if let Some(tx) = pollers.shutdown.take() {
            let _ = tx.send(true);
        }
        for task in pollers.tasks.drain(..) {
            let _ = task.await;
        }

        let (tx, rx) = watch::channel(false);
        for plan in plans {
            let poller = Poller::new(plan.adapter, plan.variables, plan.interval);
            pollers.tasks.push(poller.spawn(rx.clone()));
        }
        pollers.shutdown = Some(tx);
    }

    /// Write the current config as pretty JSON (4-space indent) to `path`,
    /// or to the originally loaded path.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let target = match path {
            Some(p) => p.to_path_buf(),
            None => self.path.read().expect("path lock poisoned").clone(),
        };

        let doc = self.doc.read().expect("config lock poisoned").clone();
        let text = to_pretty_json(&doc)?;
        std::fs::write(&target, text).map_err(|e| {
            GatewayError::config(format!("cannot write config file {}: {e}", target.display()))
        })?;

        info!(path = %target.display(), "configuration saved");
        Ok(())
    }

    /// Re-read the config file; if its parsed content differs from the
    /// in-memory copy, run the full load sequence. Returns whether a
    /// reload happened.
    pub async fn check_reload(&self) -> Result<bool> {
        let path = self.path.read().expect("path lock poisoned").clone();
        let text = std::fs::read_to_string(&path).map_err(|e| {
            GatewayError::config(format!("cannot open config file {}: {e}", path.display()))
        })?;
        let candidate: JsonValue = serde_json::from_str(&text)
            .map_err(|e| GatewayError::config(format!("invalid config JSON: {e}")))?;

        let changed = {
            let doc = self.doc.read().expect("config lock poisoned");
            *doc != candidate
        };
        if !changed {
            return Ok(false);
        }

        info!(path = %path.display(), "configuration file changed, reloading");
        self.apply(candidate, None).await?;
        Ok(true)
    }

    /// Current config document.
    pub fn config(&self) -> JsonValue {
        self.doc.read().expect("config lock poisoned").clone()
    }

    /// Current config rendered with 4-space indent, as served by
    /// `GET_CONFIG`.
    pub fn config_pretty(&self) -> Result<String> {
        let doc = self.doc.read().expect("config lock poisoned").clone();
        to_pretty_json(&doc)
    }

    /// `{"<id>": name}` across every variable of every protocol.
    pub fn id_map(&self) -> JsonValue {
        let doc = self.doc.read().expect("config lock poisoned");
        let mut map = serde_json::Map::new();
        if let Some(protocols) = doc.as_object() {
            for section in protocols.values() {
                let Some(vars) = section.get("variables").and_then(|v| v.as_object()) else {
                    continue;
                };
                for var in vars.values() {
                    let (Some(id), Some(name)) = (
                        var.get("id").and_then(|v| v.as_i64()),
                        var.get("name").and_then(|v| v.as_str()),
                    ) else {
                        continue;
                    };
                    map.insert(id.to_string(), JsonValue::String(name.to_string()));
                }
            }
        }
        JsonValue::Object(map)
    }

    /// Stop the bound poller generation.
    pub async fn stop(&self) {
        self.rebind(Vec::new()).await;
    }
}

/// Largest explicit id in the document.
fn max_id(doc: &JsonValue) -> i64 {
    let mut max = 0;
    if let Some(protocols) = doc.as_object() {
        for section in protocols.values() {
            let Some(vars) = section.get("variables").and_then(|v| v.as_object()) else {
                continue;
            };
            for var in vars.values() {
                if let Some(id) = var.get("id").and_then(|v| v.as_i64()) {
                    max = max.max(id);
                }
            }
        }
    }
    max
}

/// Allocate ids for variables without one (or with id 0), rewriting the
/// document in place. Returns the number of ids assigned.
fn assign_missing_ids(doc: &mut JsonValue, ids: &IdAllocator) -> usize {
    let mut assigned = 0;
    let Some(protocols) = doc.as_object_mut() else {
        return 0;
    };

    for section in protocols.values_mut() {
        let Some(vars) = section.get_mut("variables").and_then(|v| v.as_object_mut()) else {
            continue;
        };
        for (key, var) in vars.iter_mut() {
            if !var.is_object() {
                continue;
            }
            let needs_id = match var.get("id") {
                Some(existing) => existing.as_i64().map_or(true, |id| id == 0),
                None => true,
            };
            if needs_id {
                let id = ids.next();
                var["id"] = serde_json::json!(id);
                assigned += 1;
                info!(variable = %key, id, "generated id for variable");
            }
        }
    }
    assigned
}

/// First id that appears more than once, if any.
fn find_duplicate_id(doc: &JsonValue) -> Option<i64> {
    let mut seen = HashSet::new();
    if let Some(protocols) = doc.as_object() {
        for section in protocols.values() {
            let Some(vars) = section.get("variables").and_then(|v| v.as_object()) else {
                continue;
            };
            for var in vars.values() {
                if let Some(id) = var.get("id").and_then(|v| v.as_i64()) {
                    if !seen.insert(id) {
                        return Some(id);
                    }
                }
            }
        }
    }
    None
}

/// Pretty JSON with 4-space indent (the persisted config format).
fn to_pretty_json(value: &JsonValue) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut ser)
        .map_err(|e| GatewayError::config(format!("cannot serialize config: {e}")))?;
    String::from_utf8(buf).map_err(|e| GatewayError::config(format!("non-utf8 config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_config() -> JsonValue {
        serde_json::json!({
            "modbus_tcp": {
                "connection_parameters": {
                    "primary": {"host": "127.0.0.1", "port": 1502},
                    "mode": "simulation"
                },
                "polling_interval_ms": 50,
                "variables": {
                    "temperature": {
                        "id": 1001,
                        "name": "T",
                        "address": 100,
                        "type": "float32"
                    },
                    "pressure": {
                        "name": "P",
                        "address": 101,
                        "type": "uint16"
                    }
                }
            }
        })
    }

    fn controller() -> ConfigController {
        let cache = Arc::new(DataCache::new());
        let hub = Arc::new(SubscriptionHub::new(Arc::clone(&cache)));
        ConfigController::new(Arc::new(IdAllocator::new()), cache, hub)
    }

    fn write_config(value: &JsonValue) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(value).unwrap().as_bytes())
            .unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_load_assigns_missing_ids() {
        let ctrl = controller();
        let file = write_config(&sample_config());
        ctrl.load(file.path()).await.unwrap();

        let doc = ctrl.config();
        let vars = &doc["modbus_tcp"]["variables"];
        assert_eq!(vars["temperature"]["id"], 1001);

        let assigned = vars["pressure"]["id"].as_i64().unwrap();
        assert!(assigned > 1001, "new ids exceed the pre-load maximum");

        ctrl.stop().await;
    }

    #[tokio::test]
    async fn test_load_registers_variables_in_cache() {
        let cache = Arc::new(DataCache::new());
        let hub = Arc::new(SubscriptionHub::new(Arc::clone(&cache)));
        let ctrl = ConfigController::new(Arc::new(IdAllocator::new()), Arc::clone(&cache), hub);

        let file = write_config(&sample_config());
        ctrl.load(file.path()).await.unwrap();

        // Subscriptions can attach before the first poll completes.
        assert!(cache.exists(1001));
        assert_eq!(cache.name_of(1001).as_deref(), Some("T"));

        ctrl.stop().await;
    }

    #[tokio::test]
    async fn test_id_stability_across_load_save_load() {
        let ctrl = controller();
        let file = write_config(&sample_config());
        ctrl.load(file.path()).await.unwrap();

        let first = ctrl.config();
        let assigned = first["modbus_tcp"]["variables"]["pressure"]["id"]
            .as_i64()
            .unwrap();

        ctrl.save(None).unwrap();
        ctrl.stop().await;

        // A fresh controller loading the saved file sees the same ids.
        let ctrl2 = controller();
        ctrl2.load(file.path()).await.unwrap();
        let second = ctrl2.config();
        assert_eq!(
            second["modbus_tcp"]["variables"]["temperature"]["id"],
            1001
        );
        assert_eq!(
            second["modbus_tcp"]["variables"]["pressure"]["id"]
                .as_i64()
                .unwrap(),
            assigned
        );
        ctrl2.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let ctrl = controller();
        let mut config = sample_config();
        config["modbus_tcp"]["variables"]["pressure"]["id"] = serde_json::json!(1001);
        let file = write_config(&config);

        let err = ctrl.load(file.path()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        // Nothing was bound.
        assert!(ctrl.config().is_null());
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let ctrl = controller();
        let err = ctrl.load(Path::new("/nonexistent/config.json")).await;
        assert!(matches!(err, Err(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn test_failed_update_keeps_previous_config() {
        let ctrl = controller();
        let file = write_config(&sample_config());
        ctrl.load(file.path()).await.unwrap();
        let before = ctrl.config();

        let err = ctrl.apply_update(serde_json::json!([1, 2, 3])).await;
        assert!(err.is_err());
        assert_eq!(ctrl.config(), before);

        ctrl.stop().await;
    }

    #[tokio::test]
    async fn test_save_uses_four_space_indent() {
        let ctrl = controller();
        let file = write_config(&sample_config());
        ctrl.load(file.path()).await.unwrap();

        let out = tempfile::NamedTempFile::new().unwrap();
        ctrl.save(Some(out.path())).unwrap();

        let text = std::fs::read_to_string(out.path()).unwrap();
        assert!(text.contains("\n    \"modbus_tcp\""));
        let reparsed: JsonValue = serde_json::from_str(&text).unwrap();
        assert_eq!(reparsed, ctrl.config());

        ctrl.stop().await;
    }

    #[tokio::test]
    async fn test_unsupported_protocols_are_skipped() {
        let ctrl = controller();
        let mut config = sample_config();
        config["iec104"] = serde_json::json!({
            "connection_parameters": {
                "primary": {"host": "10.0.0.9", "port": 2404}
            },
            "polling_interval_ms": 1000,
            "variables": {
                "voltage": {"id": 2001, "name": "U", "address": 7, "type": "float32"}
            }
        });
        let file = write_config(&config);

        ctrl.load(file.path()).await.unwrap();

        // The section survives in the document and in the id map even
        // though no adapter was bound for it.
        assert!(ctrl.config().get("iec104").is_some());
        let id_map = ctrl.id_map();
        assert_eq!(id_map["2001"], "U");
        assert_eq!(id_map["1001"], "T");

        ctrl.stop().await;
    }

    #[tokio::test]
    async fn test_check_reload_detects_changes() {
        let ctrl = controller();
        let file = write_config(&sample_config());
        ctrl.load(file.path()).await.unwrap();

        // Assigned ids were persisted back, so the file matches memory.
        assert!(!ctrl.check_reload().await.unwrap());

        // Add a variable and rewrite the file.
        let mut changed = ctrl.config();
        changed["modbus_tcp"]["variables"]["flow"] = serde_json::json!({
            "id": 3001, "name": "F", "address": 102, "type": "float32"
        });
        std::fs::write(file.path(), serde_json::to_string(&changed).unwrap()).unwrap();

        assert!(ctrl.check_reload().await.unwrap());
        assert_eq!(
            ctrl.config()["modbus_tcp"]["variables"]["flow"]["id"],
            3001
        );

        ctrl.stop().await;
    }

    #[tokio::test]
    async fn test_check_reload_aborts_on_parse_error() {
        let ctrl = controller();
        let file = write_config(&sample_config());
        ctrl.load(file.path()).await.unwrap();
        let before = ctrl.config();

        std::fs::write(file.path(), "{not json").unwrap();
        assert!(ctrl.check_reload().await.is_err());
        assert_eq!(ctrl.config(), before);

        ctrl.stop().await;
    }

    #[test]
    fn test_max_id_and_duplicates() {
        let config = sample_config();
        assert_eq!(max_id(&config), 1001);
        assert!(find_duplicate_id(&config).is_none());

        let mut dup = config;
        dup["modbus_tcp"]["variables"]["pressure"]["id"] = serde_json::json!(1001);
        assert_eq!(find_duplicate_id(&dup), Some(1001));
    }

    #[test]
    fn test_assign_missing_ids_covers_zero_and_absent() {
        let ids = IdAllocator::new();
        let mut doc = serde_json::json!({
            "modbus_tcp": {
                "variables": {
                    "a": {"name": "A", "type": "bool"},
                    "b": {"id": 0, "name": "B", "type": "bool"},
                    "c": {"id": 42, "name": "C", "type": "bool"}
                }
            }
        });

        assert_eq!(assign_missing_ids(&mut doc, &ids), 2);
        let vars = &doc["modbus_tcp"]["variables"];
        assert!(vars["a"]["id"].as_i64().unwrap() > 0);
        assert!(vars["b"]["id"].as_i64().unwrap() > 0);
        assert_eq!(vars["c"]["id"], 42);
    }
}
