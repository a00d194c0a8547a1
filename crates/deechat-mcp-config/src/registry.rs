//! The on-disk configuration registry.
//!
//! Three directories (one per collection) hold one JSON file per config,
//! named `<id>.json`. The registry keeps an authoritative in-memory index
//! guarded by a readers-writer lock; every mutation is written through to
//! disk before the index is updated and a change event is emitted.
//!
//! Files that fail to parse or validate are skipped with a log line - a
//! corrupt config must never take the application down.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};
use crate::model::{ConfigSource, ServerCollection, ServerConfig};
use crate::paths::RegistryPaths;

/// A change emitted after every successful mutation
#[derive(Debug, Clone)]
pub enum ConfigChange {
    /// A config was added
    Added(ServerConfig),
    /// A config was updated
    Updated(ServerConfig),
    /// A config was removed
    Removed(ServerConfig),
}

impl ConfigChange {
    /// Id of the affected config
    pub fn server_id(&self) -> &str {
        match self {
            Self::Added(c) | Self::Updated(c) | Self::Removed(c) => &c.id,
        }
    }
}

/// Listener invoked synchronously inside the mutating call
pub type ChangeListener = Arc<dyn Fn(&ConfigChange) + Send + Sync>;

/// Token returned by [`ConfigRegistry::subscribe`]; pass it to
/// [`ConfigRegistry::unsubscribe`] to detach the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// In-memory index plus on-disk files per collection
pub struct ConfigRegistry {
    paths: RegistryPaths,
    index: RwLock<HashMap<String, ServerConfig>>,
    listeners: RwLock<Vec<(u64, ChangeListener)>>,
    next_listener_id: AtomicU64,
}

impl std::fmt::Debug for ConfigRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigRegistry")
            .field("paths", &self.paths)
            .field("configs", &self.index.read().len())
            .finish()
    }
}

impl ConfigRegistry {
    /// Create a registry over the given storage layout. Nothing is read
    /// until [`initialize`](Self::initialize) runs.
    pub fn new(paths: RegistryPaths) -> Self {
        Self {
            paths,
            index: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Storage layout in use
    pub fn paths(&self) -> &RegistryPaths {
        &self.paths
    }

    /// Ensure directories exist, load every collection, then migrate the
    /// legacy single-file store if one is present.
    pub async fn initialize(&self) -> Result<()> {
        for collection in [
            ServerCollection::System,
            ServerCollection::Project,
            ServerCollection::User,
        ] {
            let Some(dir) = self.paths.dir_for(collection) else {
                continue;
            };
            tokio::fs::create_dir_all(dir).await?;
            self.load_collection(collection, dir.clone()).await?;
        }

        self.migrate_legacy_store().await?;

        info!(configs = self.index.read().len(), "config registry initialized");
        Ok(())
    }

    async fn load_collection(
        &self,
        collection: ServerCollection,
        dir: std::path::PathBuf,
    ) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.load_config_file(&path, collection).await {
                Ok(config) => {
                    let mut index = self.index.write();
                    if index.contains_key(&config.id) {
                        warn!(id = %config.id, path = %path.display(), "duplicate config id, skipping file");
                    } else {
                        index.insert(config.id.clone(), config);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping invalid config file");
                }
            }
        }
        Ok(())
    }

    async fn load_config_file(
        &self,
        path: &Path,
        collection: ServerCollection,
    ) -> Result<ServerConfig> {
        let raw = tokio::fs::read_to_string(path).await?;
        let mut config: ServerConfig = serde_json::from_str(&raw)?;
        // The directory, not the file contents, decides the collection.
        if config.collection != collection {
            debug!(id = %config.id, "overriding collection to match directory");
            config.collection = collection;
        }
        config.validate()?;
        Ok(config)
    }

    /// Import the pre-collection `mcp-servers.json` store into the user
    /// collection, then rename the file out of the way.
    async fn migrate_legacy_store(&self) -> Result<()> {
        let legacy = &self.paths.legacy_file;
        if !tokio::fs::try_exists(legacy).await.unwrap_or(false) {
            return Ok(());
        }

        info!(path = %legacy.display(), "migrating legacy server store");
        let raw = tokio::fs::read_to_string(legacy).await?;
        let entries = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(items)) => items,
            Ok(Value::Object(mut map)) => match map.remove("servers") {
                Some(Value::Array(items)) => items,
                _ => {
                    warn!("legacy store has no 'servers' array, leaving file untouched");
                    return Ok(());
                }
            },
            Ok(_) | Err(_) => {
                warn!("legacy store is not valid JSON, leaving file untouched");
                return Ok(());
            }
        };

        let mut migrated = 0usize;
        for entry in entries {
            match self.migrate_legacy_entry(entry).await {
                Ok(()) => migrated += 1,
                Err(e) => warn!(error = %e, "skipping unmigratable legacy entry"),
            }
        }

        let backup = legacy.with_extension("json.backup");
        tokio::fs::rename(legacy, &backup).await?;
        info!(migrated, backup = %backup.display(), "legacy migration complete");
        Ok(())
    }

    async fn migrate_legacy_entry(&self, entry: Value) -> Result<()> {
        let mut config: ServerConfig = serde_json::from_value(entry)?;
        if config.id.trim().is_empty() {
            config.id = uuid::Uuid::new_v4().to_string();
        }
        // Never drop a migrated entry over an id collision.
        if self.index.read().contains_key(&config.id) {
            config.id = format!("{}-imported", config.id);
        }
        config.collection = ServerCollection::User;
        config.source = ConfigSource::Imported;
        config.validate()?;

        self.persist(&config).await?;
        self.index.write().insert(config.id.clone(), config);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read-only views
    // ------------------------------------------------------------------

    /// All configs, unordered
    pub fn get_all(&self) -> Vec<ServerConfig> {
        self.index.read().values().cloned().collect()
    }

    /// Configs in one collection
    pub fn get_by_collection(&self, collection: ServerCollection) -> Vec<ServerConfig> {
        self.index
            .read()
            .values()
            .filter(|c| c.collection == collection)
            .cloned()
            .collect()
    }

    /// Lookup by id
    pub fn get(&self, id: &str) -> Option<ServerConfig> {
        self.index.read().get(id).cloned()
    }

    /// Case-insensitive substring search over name, description and tags
    pub fn search(&self, query: &str) -> Vec<ServerConfig> {
        self.index
            .read()
            .values()
            .filter(|c| c.matches_query(query))
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Add a config: fill defaults, validate, enforce `(collection, name)`
    /// uniqueness, persist, index, emit `Added`.
    pub async fn add(&self, mut config: ServerConfig) -> Result<ServerConfig> {
        if config.id.trim().is_empty() {
            config.id = uuid::Uuid::new_v4().to_string();
        }
        if config.execution.is_none() {
            config.execution = Some(config.infer_execution());
        }
        let now = chrono::Utc::now();
        config.created_at = now;
        config.updated_at = now;
        config.validate()?;

        {
            let index = self.index.read();
            if index.contains_key(&config.id) {
                return Err(ConfigError::invalid(format!(
                    "config id '{}' already exists",
                    config.id
                )));
            }
            if let Some(conflict) = index
                .values()
                .find(|c| c.collection == config.collection && c.name == config.name)
            {
                return Err(ConfigError::DuplicateName {
                    name: conflict.name.clone(),
                    collection: config.collection.as_str().to_string(),
                });
            }
        }

        self.persist(&config).await?;
        self.index.write().insert(config.id.clone(), config.clone());
        self.emit(&ConfigChange::Added(config.clone()));
        Ok(config)
    }

    /// Merge a JSON patch into a config: shallow merge over the serialized
    /// form, re-validate, persist, emit `Updated`.
    ///
    /// `id` and `runtime` cannot be patched; a `null` patch value resets
    /// the field to its default. `updatedAt` is bumped automatically.
    pub async fn update(&self, id: &str, patch: Value) -> Result<ServerConfig> {
        let current = self
            .get(id)
            .ok_or_else(|| ConfigError::NotFound(id.to_string()))?;

        let Value::Object(patch_map) = patch else {
            return Err(ConfigError::invalid("patch must be a JSON object"));
        };

        let mut merged = match serde_json::to_value(&current)? {
            Value::Object(map) => map,
            _ => unreachable!("ServerConfig serializes to an object"),
        };
        for (key, value) in patch_map {
            if key == "id" || key == "runtime" {
                continue;
            }
            if value.is_null() {
                merged.remove(&key);
            } else {
                merged.insert(key, value);
            }
        }

        let mut updated: ServerConfig = serde_json::from_value(Value::Object(merged))?;
        updated.id = current.id.clone();
        updated.runtime = current.runtime.clone();
        updated.created_at = current.created_at;
        updated.updated_at = chrono::Utc::now();
        updated.validate()?;

        {
            let index = self.index.read();
            if let Some(conflict) = index.values().find(|c| {
                c.id != updated.id
                    && c.collection == updated.collection
                    && c.name == updated.name
            }) {
                return Err(ConfigError::DuplicateName {
                    name: conflict.name.clone(),
                    collection: updated.collection.as_str().to_string(),
                });
            }
        }

        self.persist(&updated).await?;
        if updated.collection != current.collection {
            self.remove_file(&current).await;
        }
        self.index
            .write()
            .insert(updated.id.clone(), updated.clone());
        self.emit(&ConfigChange::Updated(updated.clone()));
        Ok(updated)
    }

    /// Remove a config. System-collection entries are refused.
    pub async fn remove(&self, id: &str) -> Result<ServerConfig> {
        let config = self
            .get(id)
            .ok_or_else(|| ConfigError::NotFound(id.to_string()))?;
        if config.collection == ServerCollection::System {
            return Err(ConfigError::SystemImmutable(id.to_string()));
        }

        self.remove_file(&config).await;
        self.index.write().remove(id);
        self.emit(&ConfigChange::Removed(config.clone()));
        Ok(config)
    }

    /// Import configs from raw bytes. Accepts a single config object, a
    /// bare array, or the legacy `{servers: [...]}` shape. Returns the
    /// number of configs added.
    pub async fn import(&self, data: &[u8], collection: ServerCollection) -> Result<usize> {
        let value: Value = serde_json::from_slice(data)?;
        let entries = match value {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("servers") {
                Some(Value::Array(items)) => items,
                _ => vec![Value::Object(map)],
            },
            other => {
                return Err(ConfigError::invalid(format!(
                    "cannot import a JSON {}",
                    json_type_name(&other)
                )))
            }
        };

        let mut imported = 0usize;
        for entry in entries {
            let mut config: ServerConfig = match serde_json::from_value(entry) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "skipping unimportable entry");
                    continue;
                }
            };
            config.id = uuid::Uuid::new_v4().to_string();
            config.collection = collection;
            config.source = ConfigSource::Imported;
            match self.add(config).await {
                Ok(_) => imported += 1,
                Err(e) => warn!(error = %e, "skipping unimportable entry"),
            }
        }
        Ok(imported)
    }

    /// Export one config as pretty-printed JSON. `runtime` is never
    /// serialized, so the export is durable by construction.
    pub fn export(&self, id: &str) -> Result<String> {
        let config = self
            .get(id)
            .ok_or_else(|| ConfigError::NotFound(id.to_string()))?;
        Ok(serde_json::to_string_pretty(&config)?)
    }

    /// Export every config as a pretty-printed JSON array
    pub fn export_all(&self) -> Result<Vec<u8>> {
        let mut configs = self.get_all();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(serde_json::to_vec_pretty(&configs)?)
    }

    /// Re-validate every entry and drop the invalid ones (system entries
    /// excepted). Returns how many were removed.
    pub async fn cleanup(&self) -> Result<usize> {
        let invalid: Vec<ServerConfig> = self
            .index
            .read()
            .values()
            .filter(|c| c.collection != ServerCollection::System && c.validate().is_err())
            .cloned()
            .collect();

        for config in &invalid {
            warn!(id = %config.id, name = %config.name, "cleanup removing invalid config");
            self.remove_file(config).await;
            self.index.write().remove(&config.id);
            self.emit(&ConfigChange::Removed(config.clone()));
        }
        Ok(invalid.len())
    }

    /// Stamp `lastConnectedAt` without emitting a change event;
    /// connection bookkeeping is not a user-visible mutation.
    pub async fn touch_last_connected(&self, id: &str) -> Result<()> {
        let Some(mut config) = self.get(id) else {
            return Ok(());
        };
        config.last_connected_at = Some(chrono::Utc::now());
        self.persist(&config).await?;
        self.index.write().insert(config.id.clone(), config);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Change notifications
    // ------------------------------------------------------------------

    /// Register a listener; it runs synchronously inside every mutating
    /// call, in mutation order.
    pub fn subscribe(&self, listener: ChangeListener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        ListenerId(id)
    }

    /// Detach a previously registered listener
    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.write().retain(|(lid, _)| *lid != id.0);
    }

    fn emit(&self, change: &ConfigChange) {
        let listeners: Vec<ChangeListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(change);
            }));
            if result.is_err() {
                warn!(server_id = %change.server_id(), "config change listener panicked");
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence helpers
    // ------------------------------------------------------------------

    async fn persist(&self, config: &ServerConfig) -> Result<()> {
        let path = self
            .paths
            .config_file(config.collection, &config.id)
            .ok_or(ConfigError::ProjectUnavailable)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_string_pretty(config)?;
        tokio::fs::write(&path, body).await?;
        debug!(id = %config.id, path = %path.display(), "persisted config");
        Ok(())
    }

    async fn remove_file(&self, config: &ServerConfig) {
        if let Some(path) = self.paths.config_file(config.collection, &config.id) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %e, "could not delete config file");
            }
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
