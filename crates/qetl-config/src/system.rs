//! System configuration parsing.

use crate::kdl_util::{
    bounded_integer, get_all_string_args, get_first_integer_arg, get_first_string_arg,
    get_string_prop,
};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use qetl_core::ComponentInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Default location of the system configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "qetl.kdl";

/// System-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// How pipelines are executed.
    pub executor: ExecutorConfig,
    /// Default wall-clock limit per job, in seconds.
    pub timeout_secs: u64,
    /// Fallback wake-up interval for waiters, in milliseconds.
    pub poll_interval_ms: u64,
    /// Default cap for job listings.
    pub list_limit: usize,
    /// Components advertised by the executor.
    pub components: Vec<ComponentInfo>,
}

/// Subprocess executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub program: String,
    /// Runner script, relative to `home`.
    pub entrypoint: Option<String>,
    /// QETL installation directory.
    pub home: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            entrypoint: Some("yaml_pipeline_runner/main.py".to_string()),
            home: None,
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            timeout_secs: 300,
            poll_interval_ms: 1000,
            list_limit: 100,
            components: default_components(),
        }
    }
}

impl SystemConfig {
    /// Load configuration from `path`, else `./qetl.kdl` when present, else
    /// defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => {
                info!(path = %path.display(), "loading system configuration");
                parse_system_config(&std::fs::read_to_string(path)?)?
            }
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                info!(path = DEFAULT_CONFIG_FILE, "loading system configuration");
                parse_system_config(&std::fs::read_to_string(DEFAULT_CONFIG_FILE)?)?
            }
            None => {
                debug!("no system configuration file, using defaults");
                SystemConfig::default()
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `QETL_HOME` and `QETL_TIMEOUT` overrides.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(home) = lookup("QETL_HOME").filter(|h| !h.is_empty()) {
            self.executor.home = Some(PathBuf::from(home));
        }
        if let Some(timeout) = lookup("QETL_TIMEOUT") {
            let secs: i128 = timeout.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "QETL_TIMEOUT".to_string(),
                message: format!("'{}' is not a number", timeout),
            })?;
            self.timeout_secs = bounded_integer("QETL_TIMEOUT", secs, 1, i128::from(u32::MAX))?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Resolve the QETL installation directory: the configured home, else a
    /// search of `start` and its ancestors for the entrypoint.
    pub fn detect_home(&self, start: &Path) -> Option<PathBuf> {
        if let Some(home) = &self.executor.home {
            return Some(home.clone());
        }
        let entrypoint = self.executor.entrypoint.as_deref()?;
        start
            .ancestors()
            .find(|dir| dir.join(entrypoint).is_file())
            .map(Path::to_path_buf)
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();
    let mut components = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "executor" => {
                config.executor = parse_executor(node)?;
            }
            "timeout" => {
                let value = required_integer(node, "timeout")?;
                config.timeout_secs = bounded_integer("timeout", value, 1, i128::from(u32::MAX))?;
            }
            "poll-interval-ms" => {
                let value = required_integer(node, "poll-interval-ms")?;
                config.poll_interval_ms = bounded_integer("poll-interval-ms", value, 1, 60_000)?;
            }
            "list-limit" => {
                let value = required_integer(node, "list-limit")?;
                config.list_limit = bounded_integer("list-limit", value, 1, 100_000)? as usize;
            }
            "component" => {
                components.push(parse_component(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if !components.is_empty() {
        let mut names = std::collections::HashSet::new();
        for component in &components {
            if !names.insert(component.name.as_str()) {
                return Err(ConfigError::Duplicate(format!(
                    "component '{}'",
                    component.name
                )));
            }
        }
        config.components = components;
    }

    Ok(config)
}

fn required_integer(node: &KdlNode, field: &str) -> ConfigResult<i128> {
    get_first_integer_arg(node).ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected an integer".to_string(),
    })
}

fn parse_executor(node: &KdlNode) -> ConfigResult<ExecutorConfig> {
    let mut executor = ExecutorConfig::default();

    let Some(children) = node.children() else {
        return Ok(executor);
    };

    for child in children.nodes() {
        match child.name().value() {
            "program" => {
                executor.program = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("executor program".to_string()))?;
            }
            "entrypoint" => {
                executor.entrypoint = get_first_string_arg(child);
            }
            "home" => {
                executor.home = get_first_string_arg(child).map(PathBuf::from);
            }
            "arg" | "args" => {
                executor.args.extend(get_all_string_args(child));
            }
            "env" => {
                if let Some(vars) = child.children() {
                    for var in vars.nodes() {
                        if let Some(value) = get_first_string_arg(var) {
                            executor.env.insert(var.name().value().to_string(), value);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(executor)
}

fn parse_component(node: &KdlNode) -> ConfigResult<ComponentInfo> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("component name".to_string()))?;
    Ok(ComponentInfo {
        description: get_string_prop(node, "description").unwrap_or_default(),
        version: get_string_prop(node, "version").unwrap_or_else(|| "1.0".to_string()),
        component_type: get_string_prop(node, "type")
            .ok_or_else(|| ConfigError::MissingField(format!("type for component '{}'", name)))?,
        name,
    })
}

/// The processing components shipped with QETL.
pub fn default_components() -> Vec<ComponentInfo> {
    [
        ("wave_encoder", "Quantum wave encoding component", "encoder"),
        ("wave_decoder", "Quantum wave decoding component", "decoder"),
        (
            "quantum_homology_analyzer",
            "Quantum homology analysis component",
            "analyzer",
        ),
        (
            "williams_pebbler",
            "Williams pebbling optimization component",
            "optimizer",
        ),
        (
            "holographic_grover",
            "Holographic Grover search component",
            "search",
        ),
    ]
    .into_iter()
    .map(|(name, description, component_type)| ComponentInfo {
        name: name.to_string(),
        description: description.to_string(),
        version: "1.0".to_string(),
        component_type: component_type.to_string(),
    })
    .collect()
}
