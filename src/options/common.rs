//! Options shared by every platform

use super::LaunchOption;
use crate::lazy::LazySharedValue;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Prefix used to name members launched with these options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayName(pub String);

impl DisplayName {
    pub fn of(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl LaunchOption for DisplayName {}

/// Per-prefix index assigned to a member by its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discriminator(pub u32);

impl LaunchOption for Discriminator {}

/// Name of the logical cluster the members belong to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterName(pub String);

impl ClusterName {
    pub fn of(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl LaunchOption for ClusterName {}

/// Program to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable(pub String);

impl Executable {
    pub fn named(program: &str) -> Self {
        Self(program.to_string())
    }
}

impl LaunchOption for Executable {}

/// Command line arguments; later arguments are appended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments(Vec<String>);

impl Arguments {
    pub fn of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(Into::into).collect())
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }
}

impl LaunchOption for Arguments {
    fn compose(&self, later: &Self) -> Self {
        let mut values = self.0.clone();
        values.extend(later.0.iter().cloned());
        Self(values)
    }
}

/// Environment variables; later values override earlier ones per key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentVariables(BTreeMap<String, String>);

impl EnvironmentVariables {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Set a variable (builder style)
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl LaunchOption for EnvironmentVariables {
    fn compose(&self, later: &Self) -> Self {
        let mut merged = self.0.clone();
        merged.extend(later.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self(merged)
    }
}

/// Working directory of the launched process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDirectory(pub PathBuf);

impl LaunchOption for WorkingDirectory {}

/// Port shared by every member of a cluster, resolved on first launch
#[derive(Debug, Clone)]
pub struct ClusterPort(pub LazySharedValue<u16>);

impl LaunchOption for ClusterPort {}

/// Time a process is given to exit after a termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePeriod(pub Duration);

impl LaunchOption for GracePeriod {
    fn default_value() -> Option<Self> {
        Some(GracePeriod(Duration::from_secs(10)))
    }
}
