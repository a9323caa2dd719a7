// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Mesh Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) describing:
// - replication, execution and health tuning
// - an optional declarative topology (nodes + connections)
// - logging and metrics settings for the binary

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::domain::node::{Connection, NodeSpec};

pub const API_VERSION: &str = "codemesh.dev/v1";
pub const KIND: &str = "MeshConfig";

/// Top-level mesh configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfigManifest {
    /// API version (must be "codemesh.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "MeshConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: MeshConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Coordinator name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfigSpec {
    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Nodes registered at startup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeSpec>,

    /// Connections created at startup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<Connection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Total replicas per artifact, primary included
    #[serde(default = "default_replication_factor")]
    pub factor: usize,

    /// Extra attempts for a failed replica push
    #[serde(default = "default_push_retries")]
    pub push_retries: u32,

    /// Base delay between push attempts, doubled on each retry
    #[serde(default = "default_push_retry_delay")]
    pub push_retry_delay_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            factor: default_replication_factor(),
            push_retries: default_push_retries(),
            push_retry_delay_ms: default_push_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Per-node execution timeout
    #[serde(default = "default_execution_timeout")]
    pub timeout_ms: u64,

    /// Outer deadline for the backup leg of a hybrid run
    #[serde(default = "default_hybrid_deadline")]
    pub hybrid_deadline_ms: u64,

    /// Nodes at or above this load are not available
    #[serde(default = "default_max_load")]
    pub max_load: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_execution_timeout(),
            hybrid_deadline_ms: default_hybrid_deadline(),
            max_load: default_max_load(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Probed load at which a node is reported degraded
    #[serde(default = "default_degraded_load")]
    pub degraded_load: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_load: default_degraded_load(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Flattened tuning values consumed by the coordinator services.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshSettings {
    pub replication_factor: usize,
    pub push_retries: u32,
    pub push_retry_delay_ms: u64,
    pub execution_timeout_ms: u64,
    pub hybrid_deadline_ms: u64,
    pub max_load: f64,
    pub degraded_load: f64,
}

impl Default for MeshSettings {
    fn default() -> Self {
        MeshConfigSpec::default().settings()
    }
}

impl MeshConfigSpec {
    pub fn settings(&self) -> MeshSettings {
        MeshSettings {
            replication_factor: self.replication.factor,
            push_retries: self.replication.push_retries,
            push_retry_delay_ms: self.replication.push_retry_delay_ms,
            execution_timeout_ms: self.execution.timeout_ms,
            hybrid_deadline_ms: self.execution.hybrid_deadline_ms,
            max_load: self.execution.max_load,
            degraded_load: self.health.degraded_load,
        }
    }
}

// Default value functions
fn default_replication_factor() -> usize {
    3
}

fn default_push_retries() -> u32 {
    2
}

fn default_push_retry_delay() -> u64 {
    50
}

fn default_execution_timeout() -> u64 {
    30_000
}

fn default_hybrid_deadline() -> u64 {
    60_000
}

fn default_max_load() -> f64 {
    0.9
}

fn default_degraded_load() -> f64 {
    0.75
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9464
}

impl Default for MeshConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "codemesh".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: MeshConfigSpec::default(),
        }
    }
}

impl MeshConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. CODEMESH_CONFIG_PATH environment variable
    /// 2. ./codemesh.yaml (working directory)
    /// 3. ~/.codemesh/config.yaml (user home)
    /// 4. /etc/codemesh/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CODEMESH_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./codemesh.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".codemesh").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/codemesh/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // An explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(config_path) => {
                tracing::info!("Loading configuration from discovered path: {:?}", config_path);
                Self::from_yaml_file(config_path)?
            }
            None => {
                tracing::warn!("No configuration file found in standard locations. Using defaults.");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CODEMESH_REPLICATION_FACTOR") {
            match val.parse::<usize>() {
                Ok(factor) => {
                    tracing::info!("Environment override: CODEMESH_REPLICATION_FACTOR={}", factor);
                    self.spec.replication.factor = factor;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for CODEMESH_REPLICATION_FACTOR: '{}'. Expected a positive integer. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("CODEMESH_EXECUTION_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(timeout_ms) => {
                    tracing::info!("Environment override: CODEMESH_EXECUTION_TIMEOUT_MS={}", timeout_ms);
                    self.spec.execution.timeout_ms = timeout_ms;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for CODEMESH_EXECUTION_TIMEOUT_MS: '{}'. Expected milliseconds. Ignoring.",
                    val
                ),
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.replication.factor == 0 {
            anyhow::bail!("spec.replication.factor must be at least 1");
        }

        if spec.execution.timeout_ms == 0 {
            anyhow::bail!("spec.execution.timeout_ms must be greater than zero");
        }

        if spec.execution.hybrid_deadline_ms < spec.execution.timeout_ms {
            anyhow::bail!(
                "spec.execution.hybrid_deadline_ms ({}) cannot be shorter than timeout_ms ({})",
                spec.execution.hybrid_deadline_ms,
                spec.execution.timeout_ms
            );
        }

        if !(0.0..=1.0).contains(&spec.execution.max_load) || !(0.0..=1.0).contains(&spec.health.degraded_load) {
            anyhow::bail!("load thresholds must be between 0 and 1");
        }

        let mut ids = HashSet::new();
        for node in &spec.nodes {
            if node.id.as_str().is_empty() {
                anyhow::bail!("node id cannot be empty");
            }
            if !ids.insert(&node.id) {
                anyhow::bail!("duplicate node id in spec.nodes: {}", node.id);
            }
        }

        for connection in &spec.connections {
            if connection.a == connection.b {
                anyhow::bail!("connection cannot link node '{}' to itself", connection.a);
            }
            for end in [&connection.a, &connection.b] {
                if !ids.contains(end) {
                    anyhow::bail!("connection references unknown node '{}'", end);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::{NodeId, NodeType};

    const SAMPLE: &str = r#"
apiVersion: codemesh.dev/v1
kind: MeshConfig
metadata:
  name: lab
spec:
  replication:
    factor: 2
  execution:
    timeout_ms: 500
  nodes:
    - id: laptop
      type: local
    - id: edge-1
      type: edge
      location: berlin
    - id: qpu
      type: quantum
  connections:
    - a: laptop
      b: edge-1
      latency_ms: 20
    - a: edge-1
      b: qpu
      latency_ms: 80
"#;

    #[test]
    fn test_default_manifest() {
        let manifest = MeshConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert!(!manifest.metadata.name.is_empty());
        assert_eq!(manifest.spec.replication.factor, 3);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_topology() {
        let manifest = MeshConfigManifest::from_yaml_str(SAMPLE).unwrap();
        assert!(manifest.validate().is_ok());

        let settings = manifest.spec.settings();
        assert_eq!(settings.replication_factor, 2);
        assert_eq!(settings.execution_timeout_ms, 500);
        assert_eq!(settings.max_load, 0.9);

        assert_eq!(manifest.spec.nodes.len(), 3);
        assert_eq!(manifest.spec.nodes[1].location, "berlin");
        assert_eq!(manifest.spec.nodes[2].node_type, NodeType::QuantumBackend);
        assert_eq!(manifest.spec.connections[0].bandwidth_mbps, 100);
    }

    #[test]
    fn test_validation() {
        let mut manifest = MeshConfigManifest::from_yaml_str(SAMPLE).unwrap();

        manifest.kind = "WrongKind".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.replication.factor = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.replication.factor = 2;

        manifest.spec.connections.push(Connection::new("laptop", "ghost", 5, 10));
        assert!(manifest.validate().is_err());
        manifest.spec.connections.pop();

        manifest.spec.nodes.push(NodeSpec::new(NodeId::from("laptop"), NodeType::Cloud));
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codemesh.yaml");

        let manifest = MeshConfigManifest::from_yaml_str(SAMPLE).unwrap();
        manifest.to_yaml_file(&path).unwrap();

        let loaded = MeshConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, "lab");
        assert_eq!(loaded.spec.nodes.len(), 3);

        let missing = dir.path().join("missing.yaml");
        assert!(MeshConfigManifest::load_or_default(Some(missing)).is_err());
    }
}
