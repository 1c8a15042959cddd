//! Cluster manifest types

use crate::error::{EnsembleError, Result};
use crate::lazy::LazySharedValue;
use crate::options::{
    Arguments, ClusterName, ClusterPort, DisplayName, EnvironmentVariables, Executable,
    GracePeriod, Options, WorkingDirectory,
};
use crate::stability::{NamedStrategy, StabilityConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Cluster manifest file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Cluster name, exported to members
    #[serde(default)]
    pub name: Option<String>,
    /// Port shared by every member
    #[serde(default)]
    pub port: Option<PortConfig>,
    /// Stability polling
    #[serde(default)]
    pub stability: Option<StabilitySection>,
    /// Roles, launched in order
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
}

/// Shared cluster port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// A fixed port number
    Fixed(u16),
    /// `auto`: a free local port chosen on first launch
    Auto(String),
}

/// Stability section of a manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StabilitySection {
    /// Timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Maximum pause between polls in milliseconds
    #[serde(default)]
    pub max_poll_ms: Option<u64>,
    /// Retry strategy, e.g. `random.fibonacci`
    #[serde(default)]
    pub strategy: Option<String>,
}

/// One role of the cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Role name
    pub name: String,
    /// Number of members
    #[serde(default = "default_count")]
    pub count: usize,
    /// Member name prefix, defaults to the role name
    #[serde(default)]
    pub display_name: Option<String>,
    /// Command to run
    #[serde(default)]
    pub command: Option<CommandConfig>,
    /// Environment variables
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    /// Working directory
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Seconds to wait after SIGTERM before killing
    #[serde(default)]
    pub grace_period: Option<u64>,
}

fn default_count() -> usize {
    1
}

/// Command configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Run through `sh -c`
    Shell(String),
    /// Program followed by its arguments
    Exec(Vec<String>),
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, Option<String>>),
}

impl EnvironmentConfig {
    /// Key/value pairs; array entries without `=` get an empty value
    pub fn pairs(&self) -> Vec<(String, String)> {
        match self {
            EnvironmentConfig::Array(items) => items
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((key, value)) => (key.to_string(), value.to_string()),
                    None => (item.clone(), String::new()),
                })
                .collect(),
            EnvironmentConfig::Map(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), value.clone().unwrap_or_default()))
                .collect(),
        }
    }
}

impl ManifestConfig {
    /// Options shared by every role
    pub fn cluster_options(&self) -> Result<Options> {
        let mut options = Options::empty();

        if let Some(name) = &self.name {
            options.add(ClusterName::of(name));
        }

        match &self.port {
            Some(PortConfig::Fixed(port)) => {
                options.add(ClusterPort(LazySharedValue::resolved(*port)));
            }
            Some(PortConfig::Auto(value)) if value == "auto" => {
                options.add(ClusterPort(LazySharedValue::available_port()));
            }
            Some(PortConfig::Auto(value)) => {
                return Err(EnsembleError::Manifest(format!(
                    "port must be a number or 'auto', got '{}'",
                    value
                )));
            }
            None => {}
        }

        Ok(options)
    }

    /// Stability configuration with this manifest's values applied over `base`
    pub fn stability_config(&self, base: StabilityConfig) -> Result<StabilityConfig> {
        let mut config = base;

        if let Some(section) = &self.stability {
            if let Some(timeout) = section.timeout {
                config.timeout = Duration::from_secs(timeout);
            }
            if let Some(max_poll) = section.max_poll_ms {
                config.max_poll_interval = Duration::from_millis(max_poll);
            }
            if let Some(strategy) = &section.strategy {
                let named: NamedStrategy = strategy.parse()?;
                config.strategy = named.strategy;
                config.jitter = named.jitter;
            }
        }

        Ok(config)
    }
}

impl RoleConfig {
    /// Launch options for this role
    pub fn options(&self) -> Result<Options> {
        let mut options = Options::empty();

        match &self.command {
            Some(CommandConfig::Shell(script)) => {
                options.add(Executable::named("sh"));
                options.add(Arguments::of(["-c", script.as_str()]));
            }
            Some(CommandConfig::Exec(parts)) => {
                let (program, args) = parts.split_first().ok_or_else(|| {
                    EnsembleError::Manifest(format!("Role '{}' has an empty command", self.name))
                })?;
                options.add(Executable::named(program));
                if !args.is_empty() {
                    options.add(Arguments::of(args.iter().cloned()));
                }
            }
            None => {}
        }

        if let Some(display_name) = &self.display_name {
            options.add(DisplayName::of(display_name));
        }

        if let Some(environment) = &self.environment {
            let variables = environment
                .pairs()
                .into_iter()
                .fold(EnvironmentVariables::empty(), |vars, (key, value)| vars.set(&key, &value));
            options.add(variables);
        }

        if let Some(dir) = &self.working_dir {
            options.add(WorkingDirectory(dir.clone()));
        }

        if let Some(secs) = self.grace_period {
            options.add(GracePeriod(Duration::from_secs(secs)));
        }

        Ok(options)
    }

    /// Member name prefix
    pub fn prefix(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_pairs() {
        let array = EnvironmentConfig::Array(vec!["A=1".to_string(), "B".to_string()]);
        assert_eq!(
            array.pairs(),
            vec![("A".to_string(), "1".to_string()), ("B".to_string(), String::new())]
        );

        let mut map = BTreeMap::new();
        map.insert("C".to_string(), Some("3".to_string()));
        map.insert("D".to_string(), None);
        assert_eq!(
            EnvironmentConfig::Map(map).pairs(),
            vec![("C".to_string(), "3".to_string()), ("D".to_string(), String::new())]
        );
    }

    #[test]
    fn test_role_options_from_shell_command() {
        let role = RoleConfig {
            name: "storage".to_string(),
            count: 2,
            command: Some(CommandConfig::Shell("sleep 30".to_string())),
            grace_period: Some(2),
            ..RoleConfig::default()
        };

        let options = role.options().unwrap();

        assert_eq!(options.get::<Executable>(), Some(Executable::named("sh")));
        assert_eq!(options.get::<Arguments>().unwrap().values(), &["-c", "sleep 30"]);
        assert_eq!(options.get::<GracePeriod>(), Some(GracePeriod(Duration::from_secs(2))));
        assert_eq!(role.prefix(), "storage");
    }

    #[test]
    fn test_fixed_port_is_resolved() {
        let manifest = ManifestConfig {
            port: Some(PortConfig::Fixed(7574)),
            ..ManifestConfig::default()
        };

        let options = manifest.cluster_options().unwrap();
        let ClusterPort(port) = options.get::<ClusterPort>().unwrap();
        assert!(port.is_resolved());
        assert_eq!(port.get().unwrap(), 7574);
    }

    #[test]
    fn test_stability_section_overrides_base() {
        let manifest = ManifestConfig {
            stability: Some(StabilitySection {
                timeout: Some(5),
                max_poll_ms: None,
                strategy: Some("exponential".to_string()),
            }),
            ..ManifestConfig::default()
        };

        let config = manifest.stability_config(StabilityConfig::default()).unwrap();

        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_poll_interval, Duration::from_millis(1000));
        assert!(!config.jitter);
    }
}
