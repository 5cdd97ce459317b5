//! Config: a text table-of-tables with typed leaves. Readers
//! see an immutable [`ConfigTable`]; writers accumulate into a mutable one
//! and save atomically. On top of the generic table, [`UbaConfig`] is the
//! typed, validated aggregate the rest of the crate actually reads,
//! generalized from the `CommyConfig`/`ConfigBuilder` (config.rs)
//! pattern to this crate's open-schema leaf model.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// A typed leaf value. Unknown/mismatched types at a queried path are
/// silently treated as absent.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Int(i64),
    U32(u32),
    U64(u64),
    Bool(bool),
    Str(String),
}

/// A table of tables: each key is either a leaf value or a nested table.
/// Mirrors the original `ConfigTable`/`Config` split (`AddTable`,
/// `AddValue`, `GetValueAsX`, `LoadFromText`/`SaveToText`).
#[derive(Debug, Clone, Default)]
pub struct ConfigTable {
    values: BTreeMap<String, ConfigValue>,
    tables: BTreeMap<String, ConfigTable>,
}

impl ConfigTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, name: &str) -> &mut ConfigTable {
        self.tables.entry(name.to_string()).or_default()
    }

    pub fn add_value(&mut self, key: &str, value: ConfigValue) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get_table(&self, name: &str) -> Option<&ConfigTable> {
        self.tables.get(name)
    }

    /// Dotted-path lookup: `get("StorageProxy.port")` walks through
    /// nested tables before reading the final leaf.
    fn resolve(&self, path: &str) -> Option<&ConfigValue> {
        let mut segments = path.split('.').peekable();
        let mut table = self;
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                return table.values.get(segment);
            }
            table = table.tables.get(segment)?;
        }
        None
    }

    pub fn get_string(&self, path: &str) -> Option<String> {
        match self.resolve(path) {
            Some(ConfigValue::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn get_u32(&self, path: &str) -> Option<u32> {
        match self.resolve(path) {
            Some(ConfigValue::U32(v)) => Some(*v),
            Some(ConfigValue::Int(v)) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn get_u64(&self, path: &str) -> Option<u64> {
        match self.resolve(path) {
            Some(ConfigValue::U64(v)) => Some(*v),
            Some(ConfigValue::Int(v)) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn get_int(&self, path: &str) -> Option<i64> {
        match self.resolve(path) {
            Some(ConfigValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        match self.resolve(path) {
            Some(ConfigValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// Render as the text table-of-tables format: `[Table.Sub]` headers
    /// followed by `key = value` lines, nested tables depth-first.
    pub fn save_to_text(&self) -> String {
        let mut out = String::new();
        self.write_values(&mut out);
        self.write_tables(&mut out, "");
        out
    }

    fn write_values(&self, out: &mut String) {
        for (key, value) in &self.values {
            out.push_str(&format!("{} = {}\n", key, render_value(value)));
        }
    }

    fn write_tables(&self, out: &mut String, prefix: &str) {
        for (name, table) in &self.tables {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}.{}", prefix, name)
            };
            out.push_str(&format!("[{}]\n", path));
            table.write_values(out);
            table.write_tables(out, &path);
        }
    }

    /// Parse the text format produced by [`ConfigTable::save_to_text`].
    pub fn load_from_text(text: &str) -> Result<ConfigTable> {
        let mut root = ConfigTable::new();
        let mut current_path: Vec<String> = Vec::new();

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(stripped) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current_path = stripped.split('.').map(|s| s.to_string()).collect();
                continue;
            }
            let (key, raw_value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed config line {}: {:?}", lineno + 1, line))?;
            let key = key.trim();
            let value = parse_value(raw_value.trim());

            let mut table = &mut root;
            for segment in &current_path {
                table = table.tables.entry(segment.clone()).or_default();
            }
            table.values.insert(key.to_string(), value);
        }

        Ok(root)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<ConfigTable> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow!("failed to read config file {:?}: {e}", path.as_ref()))?;
        Self::load_from_text(&text)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), self.save_to_text())
            .map_err(|e| anyhow!("failed to write config file {:?}: {e}", path.as_ref()))
    }
}

fn render_value(value: &ConfigValue) -> String {
    match value {
        ConfigValue::Int(v) => v.to_string(),
        ConfigValue::U32(v) => v.to_string(),
        ConfigValue::U64(v) => v.to_string(),
        ConfigValue::Bool(v) => v.to_string(),
        ConfigValue::Str(v) => format!("\"{}\"", v.replace('"', "\\\"")),
    }
}

fn parse_value(raw: &str) -> ConfigValue {
    if let Some(inner) = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return ConfigValue::Str(inner.replace("\\\"", "\""));
    }
    if raw == "true" {
        return ConfigValue::Bool(true);
    }
    if raw == "false" {
        return ConfigValue::Bool(false);
    }
    if let Ok(v) = raw.parse::<i64>() {
        return ConfigValue::Int(v);
    }
    ConfigValue::Str(raw.to_string())
}

/// Default config file name next to the host binary.
pub const DEFAULT_CONFIG_FILE: &str = "UbaHost.toml";

// --- Typed, validated aggregate config -------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub listen_port: u16,
    pub send_max_size: u32,
    pub recv_timeout: Duration,
    pub handshake_timeout: Duration,
    pub desired_connection_count: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            listen_port: 7000,
            send_max_size: uba_proto::SEND_MAX_SIZE,
            recv_timeout: Duration::from_secs(600),
            handshake_timeout: Duration::from_secs(20),
            desired_connection_count: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CryptoConfig {
    pub enabled: bool,
    pub key_hex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub cas_directory: String,
    pub capacity_bytes: u64,
    pub compress: bool,
    pub compression_level: i32,
    pub use_local_storage_for_proxy: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cas_directory: "cas".to_string(),
            capacity_bytes: 20 * 1024 * 1024 * 1024,
            compress: true,
            compression_level: 3,
            use_local_storage_for_proxy: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_local_processors: u32,
    pub mem_wait_load_percent: f32,
    pub mem_kill_load_percent: f32,
    pub race_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_local_processors: num_cpus_fallback(),
            mem_wait_load_percent: 80.0,
            mem_kill_load_percent: 95.0,
            race_after: Duration::from_secs(30),
        }
    }
}

fn num_cpus_fallback() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoordinatorConfig {
    pub zone: Option<String>,
    pub pool_name: Option<String>,
    pub max_core_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UbaConfig {
    pub network: NetworkConfig,
    pub crypto: CryptoConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub coordinator: CoordinatorConfig,
}

#[derive(Default)]
pub struct ConfigBuilder {
    config: UbaConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: UbaConfig::default(),
        }
    }

    pub fn network(mut self, network: NetworkConfig) -> Self {
        self.config.network = network;
        self
    }

    pub fn crypto(mut self, crypto: CryptoConfig) -> Self {
        self.config.crypto = crypto;
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.config.scheduler = scheduler;
        self
    }

    pub fn coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.config.coordinator = coordinator;
        self
    }

    /// Overlay values read from a generic [`ConfigTable`] — the shape
    /// `FetchConfig` delivers over the wire.
    pub fn overlay_table(mut self, table: &ConfigTable) -> Self {
        if let Some(v) = table.get_u32("Network.listen_port") {
            self.config.network.listen_port = v as u16;
        }
        if let Some(v) = table.get_u64("Storage.capacity_bytes") {
            self.config.storage.capacity_bytes = v;
        }
        if let Some(v) = table.get_string("Coordinator.zone") {
            self.config.coordinator.zone = Some(v);
        }
        self
    }

    pub fn build(self) -> Result<UbaConfig> {
        self.validate()?;
        Ok(self.config)
    }

    fn validate(&self) -> Result<()> {
        if self.config.network.listen_port == 0 {
            return Err(anyhow!("network listen port cannot be 0"));
        }
        if self.config.network.send_max_size == 0 {
            return Err(anyhow!("send_max_size cannot be 0"));
        }
        if self.config.network.send_max_size > uba_proto::SEND_MAX_SIZE {
            return Err(anyhow!(
                "send_max_size cannot exceed the protocol maximum of {}",
                uba_proto::SEND_MAX_SIZE
            ));
        }
        if self.config.storage.capacity_bytes == 0 {
            return Err(anyhow!("storage capacity cannot be 0"));
        }
        let sched = &self.config.scheduler;
        if !(0.0..=100.0).contains(&sched.mem_wait_load_percent) {
            return Err(anyhow!("mem_wait_load_percent must be between 0 and 100"));
        }
        if !(0.0..=100.0).contains(&sched.mem_kill_load_percent) {
            return Err(anyhow!("mem_kill_load_percent must be between 0 and 100"));
        }
        if sched.mem_kill_load_percent < sched.mem_wait_load_percent {
            return Err(anyhow!(
                "mem_kill_load_percent must be >= mem_wait_load_percent"
            ));
        }
        if self.config.crypto.enabled && self.config.crypto.key_hex.is_none() {
            return Err(anyhow!("crypto enabled but no key configured"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_round_trips_through_text() {
        let mut table = ConfigTable::new();
        table.add_value("top", ConfigValue::Bool(true));
        {
            let storage = table.add_table("Storage");
            storage.add_value("capacity_bytes", ConfigValue::U64(1024));
            storage.add_value("name", ConfigValue::Str("hi".into()));
        }

        let text = table.save_to_text();
        let reloaded = ConfigTable::load_from_text(&text).unwrap();
        assert_eq!(reloaded.get_bool("top"), Some(true));
        assert_eq!(reloaded.get_u64("Storage.capacity_bytes"), Some(1024));
        assert_eq!(reloaded.get_string("Storage.name"), Some("hi".to_string()));
    }

    #[test]
    fn unknown_path_is_silently_none() {
        let table = ConfigTable::new();
        assert_eq!(table.get_u32("Nope.nothing"), None);
    }

    #[test]
    fn builder_rejects_zero_port() {
        let result = ConfigBuilder::new()
            .network(NetworkConfig {
                listen_port: 0,
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_rejects_inverted_memory_thresholds() {
        let result = ConfigBuilder::new()
            .scheduler(SchedulerConfig {
                mem_wait_load_percent: 90.0,
                mem_kill_load_percent: 50.0,
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_accepts_defaults() {
        assert!(ConfigBuilder::new().build().is_ok());
    }
}
