//! Cluster manifest parser

use super::config::{CommandConfig, EnvironmentConfig, ManifestConfig, PortConfig};
use crate::cluster::ClusterBuilder;
use crate::error::{EnsembleError, Result};
use crate::platform::Role;
use crate::stability::NamedStrategy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Default manifest file names
pub const DEFAULT_MANIFEST_FILES: &[&str] = &["ensemble.yaml", "ensemble.yml"];

/// Manifest parser
pub struct ManifestParser;

impl ManifestParser {
    /// Find a manifest file in a directory
    pub fn find_manifest_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_MANIFEST_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse a manifest file
    pub fn parse_file(path: &Path) -> Result<ManifestConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EnsembleError::Manifest(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_str(&content)
    }

    /// Parse a manifest from a string
    pub fn parse_str(content: &str) -> Result<ManifestConfig> {
        serde_yaml::from_str(content).map_err(|e| EnsembleError::Yaml(e.to_string()))
    }

    /// Validate a manifest, returning warnings for suspicious but usable settings
    pub fn validate(config: &ManifestConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if config.roles.is_empty() {
            return Err(EnsembleError::Manifest("At least one role is required".to_string()));
        }

        if let Some(PortConfig::Fixed(0)) = config.port {
            return Err(EnsembleError::Manifest(
                "Port 0 is not usable, use 'auto' for a free port".to_string(),
            ));
        }
        if let Some(PortConfig::Auto(value)) = &config.port {
            if value != "auto" {
                return Err(EnsembleError::Manifest(format!(
                    "Port must be a number or 'auto', got '{}'",
                    value
                )));
            }
        }

        if let Some(strategy) = config.stability.as_ref().and_then(|s| s.strategy.as_ref()) {
            strategy.parse::<NamedStrategy>()?;
        }

        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();

        for role in &config.roles {
            if role.name.trim().is_empty() {
                return Err(EnsembleError::Manifest("Role names must not be empty".to_string()));
            }

            if !names.insert(role.name.as_str()) {
                return Err(EnsembleError::Manifest(format!(
                    "Role '{}' is declared more than once",
                    role.name
                )));
            }

            match &role.command {
                None => {
                    return Err(EnsembleError::Manifest(format!(
                        "Role '{}' must specify a command",
                        role.name
                    )))
                }
                Some(CommandConfig::Shell(script)) if script.trim().is_empty() => {
                    return Err(EnsembleError::Manifest(format!(
                        "Role '{}' has an empty command",
                        role.name
                    )))
                }
                Some(CommandConfig::Exec(parts)) if parts.is_empty() => {
                    return Err(EnsembleError::Manifest(format!(
                        "Role '{}' has an empty command",
                        role.name
                    )))
                }
                Some(_) => {}
            }

            if role.count == 0 {
                warnings.push(format!("Role '{}' has a count of 0 and launches nothing", role.name));
            }

            if !prefixes.insert(role.prefix()) {
                warnings.push(format!(
                    "Role '{}' shares the member name prefix '{}' with another role",
                    role.name,
                    role.prefix()
                ));
            }

            if let Some(dir) = &role.working_dir {
                if !dir.is_dir() {
                    warnings.push(format!(
                        "Role '{}' working directory {} does not exist",
                        role.name,
                        dir.display()
                    ));
                }
            }
        }

        Ok(warnings)
    }

    /// Replace `${VAR}`, `$VAR` and `${VAR:-default}` in commands and environment values
    pub fn interpolate(config: &mut ManifestConfig, env: &HashMap<String, String>) {
        for role in &mut config.roles {
            match &mut role.command {
                Some(CommandConfig::Shell(script)) => *script = interpolate_string(script, env),
                Some(CommandConfig::Exec(parts)) => {
                    for part in parts.iter_mut() {
                        *part = interpolate_string(part, env);
                    }
                }
                None => {}
            }

            match &mut role.environment {
                Some(EnvironmentConfig::Map(map)) => {
                    for value in map.values_mut().flatten() {
                        *value = interpolate_string(value, env);
                    }
                }
                Some(EnvironmentConfig::Array(items)) => {
                    for item in items.iter_mut() {
                        *item = interpolate_string(item, env);
                    }
                }
                None => {}
            }
        }
    }

    /// Turn a validated manifest into a cluster builder
    pub fn to_builder(config: &ManifestConfig) -> Result<ClusterBuilder> {
        let mut builder = ClusterBuilder::new().with(config.cluster_options()?);

        for role in &config.roles {
            builder = builder.include(role.count, Role::new(&role.name), role.options()?);
        }

        Ok(builder)
    }
}

/// Interpolate environment variables in a string
///
/// `${VAR:-default}`, `${VAR}` and `$VAR` are expanded; references to unknown
/// variables without a default are left as written.
fn interpolate_string(s: &str, env: &HashMap<String, String>) -> String {
    let re = match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };

    re.replace_all(s, |caps: &regex::Captures| {
        let name = caps.get(1).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
        match (env.get(name), caps.get(2)) {
            (Some(value), _) => value.clone(),
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => caps[0].to_string(),
        }
    })
    .to_string()
}
