//! TTL caches for tool catalogs, idempotent call results and server
//! status, with a background sweeper.
//!
//! Three independent maps, each behind its own short mutex. Reads
//! lazy-expire; the sweeper removes what reads never touch. Only
//! successful call responses are cached. Call keys are the base64 of
//! the canonical JSON of `(serverId, toolName, arguments)` - canonical
//! meaning object keys recursively sorted - prefixed with
//! `"<serverId>|"` so one server's entries can be dropped together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::types::{ServerStatus, Tool, ToolCallResponse};

/// Reserved id of the application's bundled in-process server; its tool
/// catalog effectively never changes, so it gets a day-long TTL.
pub const BUILTIN_SERVER_ID: &str = "builtin";

const TOOLS_TTL: Duration = Duration::from_secs(5 * 60);
const BUILTIN_TOOLS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const CALL_TTL: Duration = Duration::from_secs(30);
const STATUS_TTL: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    created: Instant,
    ttl: Duration,
}

impl<T> Entry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            created: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self) -> bool {
        self.created.elapsed() > self.ttl
    }
}

/// TTL caches for tools, call results and server status
pub struct ToolCache {
    tools: Mutex<HashMap<String, Entry<Vec<Tool>>>>,
    calls: Mutex<HashMap<String, Entry<ToolCallResponse>>>,
    status: Mutex<HashMap<String, Entry<ServerStatus>>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for ToolCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCache")
            .field("tools", &self.tools.lock().len())
            .field("calls", &self.calls.lock().len())
            .field("status", &self.status.lock().len())
            .finish()
    }
}

impl Default for ToolCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCache {
    /// An empty cache; call [`start_sweeper`](Self::start_sweeper) to
    /// begin background eviction.
    pub fn new() -> Self {
        Self {
            tools: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            status: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Spawn the 60-second sweeper. Idempotent.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut guard = self.sweeper.lock();
        if guard.is_some() {
            return;
        }
        let cache = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(SWEEP_INTERVAL);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // the immediate first tick sweeps nothing
            loop {
                timer.tick().await;
                cache.sweep();
            }
        }));
    }

    /// One sweep pass over all three maps
    pub fn sweep(&self) {
        let removed = {
            let mut tools = self.tools.lock();
            let before = tools.len();
            tools.retain(|_, e| !e.is_expired());
            before - tools.len()
        } + {
            let mut calls = self.calls.lock();
            let before = calls.len();
            calls.retain(|_, e| !e.is_expired());
            before - calls.len()
        } + {
            let mut status = self.status.lock();
            let before = status.len();
            status.retain(|_, e| !e.is_expired());
            before - status.len()
        };
        if removed > 0 {
            debug!(removed, "cache sweep evicted expired entries");
        }
    }

    // ------------------------------------------------------------------
    // Tool catalogs
    // ------------------------------------------------------------------

    /// Cache a server's tool catalog
    pub fn put_tools(&self, server_id: &str, tools: Vec<Tool>) {
        let ttl = if server_id == BUILTIN_SERVER_ID {
            BUILTIN_TOOLS_TTL
        } else {
            TOOLS_TTL
        };
        self.tools
            .lock()
            .insert(server_id.to_string(), Entry::new(tools, ttl));
    }

    /// Get a server's cached catalog; expired entries read as absent
    pub fn get_tools(&self, server_id: &str) -> Option<Vec<Tool>> {
        let mut tools = self.tools.lock();
        match tools.get(server_id) {
            Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
            Some(_) => {
                tools.remove(server_id);
                None
            }
            None => None,
        }
    }

    /// Bump usage counters on a cached tool after a successful call
    pub fn record_usage(&self, server_id: &str, tool_name: &str) {
        let mut tools = self.tools.lock();
        if let Some(entry) = tools.get_mut(server_id) {
            if let Some(tool) = entry.value.iter_mut().find(|t| t.name == tool_name) {
                tool.usage_count += 1;
                tool.last_used_at = Some(chrono::Utc::now());
            }
        }
    }

    /// Union of all non-expired cached tools
    pub fn all_tools(&self) -> Vec<Tool> {
        let mut tools = self.tools.lock();
        tools.retain(|_, e| !e.is_expired());
        tools.values().flat_map(|e| e.value.iter().cloned()).collect()
    }

    /// Servers with a live tools entry
    pub fn server_ids(&self) -> Vec<String> {
        let mut tools = self.tools.lock();
        tools.retain(|_, e| !e.is_expired());
        tools.keys().cloned().collect()
    }

    /// Drop a server's tool catalog
    pub fn invalidate_tools(&self, server_id: &str) {
        self.tools.lock().remove(server_id);
    }

    // ------------------------------------------------------------------
    // Idempotent call results
    // ------------------------------------------------------------------

    /// Cache key for a call: `"<serverId>|" + base64(canonical JSON)`
    pub fn call_key(server_id: &str, tool_name: &str, arguments: &Value) -> String {
        let canonical = canonical_json(&json!({
            "serverId": server_id,
            "toolName": tool_name,
            "arguments": arguments,
        }));
        format!("{server_id}|{}", BASE64.encode(canonical))
    }

    /// Cache a call response. Failed responses are never cached.
    pub fn put_call(&self, key: String, response: ToolCallResponse) {
        if !response.success {
            return;
        }
        self.calls.lock().insert(key, Entry::new(response, CALL_TTL));
    }

    /// Look up a cached call response
    pub fn get_call(&self, key: &str) -> Option<ToolCallResponse> {
        let mut calls = self.calls.lock();
        match calls.get(key) {
            Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
            Some(_) => {
                calls.remove(key);
                None
            }
            None => None,
        }
    }

    // ------------------------------------------------------------------
    // Server status
    // ------------------------------------------------------------------

    /// Cache a server's status snapshot
    pub fn put_status(&self, server_id: &str, status: ServerStatus) {
        self.status
            .lock()
            .insert(server_id.to_string(), Entry::new(status, STATUS_TTL));
    }

    /// Look up a cached status snapshot
    pub fn get_status(&self, server_id: &str) -> Option<ServerStatus> {
        let mut status = self.status.lock();
        match status.get(server_id) {
            Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
            Some(_) => {
                status.remove(server_id);
                None
            }
            None => None,
        }
    }

    /// Drop a server's status snapshot
    pub fn invalidate_status(&self, server_id: &str) {
        self.status.lock().remove(server_id);
    }

    // ------------------------------------------------------------------
    // Cross-map operations
    // ------------------------------------------------------------------

    /// Drop everything known about one server: its catalog, its status,
    /// and every call-result entry keyed under it.
    pub fn invalidate_server(&self, server_id: &str) {
        self.invalidate_tools(server_id);
        self.invalidate_status(server_id);
        let prefix = format!("{server_id}|");
        self.calls.lock().retain(|key, _| !key.starts_with(&prefix));
    }

    /// Empty all three maps
    pub fn clear_all(&self) {
        self.tools.lock().clear();
        self.calls.lock().clear();
        self.status.lock().clear();
    }

    /// Stop the sweeper and drop everything
    pub fn destroy(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
        self.clear_all();
    }
}

/// Canonical JSON: object keys recursively sorted, arrays in place.
fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut sorted = Map::new();
                for key in keys {
                    sorted.insert(key.clone(), sort(&map[key]));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, server_id: &str) -> Tool {
        Tool::from_def(
            deechat_mcp_protocol::ToolDef {
                name: name.into(),
                description: None,
                input_schema: json!({"type": "object"}),
            },
            server_id,
            server_id,
        )
    }

    fn ok_response() -> ToolCallResponse {
        ToolCallResponse {
            success: true,
            result: Some(json!({"x": 1})),
            error: None,
            call_id: None,
            duration_ms: 3,
        }
    }

    #[test]
    fn call_keys_ignore_argument_order() {
        let a = ToolCache::call_key("s1", "t", &json!({"b": 1, "a": {"d": 2, "c": 3}}));
        let b = ToolCache::call_key("s1", "t", &json!({"a": {"c": 3, "d": 2}, "b": 1}));
        assert_eq!(a, b);
        assert!(a.starts_with("s1|"));

        let different = ToolCache::call_key("s1", "t", &json!({"a": {"c": 3, "d": 99}, "b": 1}));
        assert_ne!(a, different);
    }

    #[test]
    fn failed_responses_are_never_cached() {
        let cache = ToolCache::new();
        let key = ToolCache::call_key("s1", "t", &json!({}));
        cache.put_call(
            key.clone(),
            ToolCallResponse {
                success: false,
                result: None,
                error: Some("boom".into()),
                call_id: None,
                duration_ms: 1,
            },
        );
        assert!(cache.get_call(&key).is_none());

        cache.put_call(key.clone(), ok_response());
        assert!(cache.get_call(&key).is_some());
    }

    #[test]
    fn reads_lazy_expire() {
        let cache = ToolCache::new();
        let key = "s1|abc".to_string();
        cache
            .calls
            .lock()
            .insert(key.clone(), Entry::new(ok_response(), Duration::ZERO));
        std::thread::sleep(Duration::from_millis(2));

        assert!(cache.get_call(&key).is_none());
        assert!(cache.calls.lock().is_empty(), "expired entry was removed");
    }

    #[test]
    fn invalidate_server_drops_only_that_server() {
        let cache = ToolCache::new();
        cache.put_tools("s1", vec![tool("a", "s1")]);
        cache.put_tools("s2", vec![tool("b", "s2")]);
        cache.put_call(ToolCache::call_key("s1", "a", &json!({})), ok_response());
        cache.put_call(ToolCache::call_key("s2", "b", &json!({})), ok_response());
        cache.put_status(
            "s1",
            ServerStatus {
                status: deechat_mcp_config::RuntimeStatus::Connected,
                tool_count: 1,
                version: None,
                last_connected: None,
            },
        );

        cache.invalidate_server("s1");

        assert!(cache.get_tools("s1").is_none());
        assert!(cache.get_status("s1").is_none());
        assert!(cache
            .get_call(&ToolCache::call_key("s1", "a", &json!({})))
            .is_none());
        assert!(cache.get_tools("s2").is_some());
        assert!(cache
            .get_call(&ToolCache::call_key("s2", "b", &json!({})))
            .is_some());
    }

    #[test]
    fn all_tools_unions_live_entries() {
        let cache = ToolCache::new();
        cache.put_tools("s1", vec![tool("a", "s1"), tool("b", "s1")]);
        cache.put_tools("s2", vec![tool("c", "s2")]);

        let mut names: Vec<String> = cache.all_tools().into_iter().map(|t| t.name).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);

        let mut ids = cache.server_ids();
        ids.sort();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[test]
    fn usage_recording_mutates_the_cached_tool() {
        let cache = ToolCache::new();
        cache.put_tools("s1", vec![tool("a", "s1")]);
        cache.record_usage("s1", "a");
        cache.record_usage("s1", "a");

        let tools = cache.get_tools("s1").unwrap();
        assert_eq!(tools[0].usage_count, 2);
        assert!(tools[0].last_used_at.is_some());
    }

    #[test]
    fn sweep_removes_expired_entries_from_all_maps() {
        let cache = ToolCache::new();
        cache
            .tools
            .lock()
            .insert("s1".into(), Entry::new(vec![tool("a", "s1")], Duration::ZERO));
        cache
            .calls
            .lock()
            .insert("s1|k".into(), Entry::new(ok_response(), Duration::ZERO));
        cache.put_tools("s2", vec![tool("b", "s2")]);
        std::thread::sleep(Duration::from_millis(2));

        cache.sweep();

        assert!(cache.tools.lock().contains_key("s2"));
        assert!(!cache.tools.lock().contains_key("s1"));
        assert!(cache.calls.lock().is_empty());
    }

    #[test]
    fn builtin_catalog_gets_the_long_ttl() {
        let cache = ToolCache::new();
        cache.put_tools(BUILTIN_SERVER_ID, vec![tool("a", BUILTIN_SERVER_ID)]);
        let tools = cache.tools.lock();
        assert_eq!(tools[BUILTIN_SERVER_ID].ttl, BUILTIN_TOOLS_TTL);
    }
}
