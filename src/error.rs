//! Error types for Ensemble

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Result type for Ensemble operations
pub type Result<T> = std::result::Result<T, EnsembleError>;

/// A member that could not be closed cleanly
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseFailure {
    /// Member name
    pub member: String,
    /// Reason reported by the process handle
    pub reason: String,
}

impl CloseFailure {
    /// Create a new close failure
    pub fn new(member: &str, error: &EnsembleError) -> Self {
        Self {
            member: member.to_string(),
            reason: error.to_string(),
        }
    }
}

/// A member replaced during a rolling relaunch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Replacement {
    /// Name of the member that was closed
    pub replaced: String,
    /// Name of the member launched in its place
    pub replacement: String,
}

/// Ensemble error types
#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error("Failed to launch {member}: {reason}")]
    Launch { member: String, reason: String },

    #[error(
        "Failed to build cluster: launched {launched} of {requested} desired members, \
         all of them were closed: {source}{}",
        describe_failures(.rollback_failures)
    )]
    Build {
        requested: usize,
        launched: usize,
        #[source]
        source: Box<EnsembleError>,
        rollback_failures: Vec<CloseFailure>,
    },

    #[error(
        "Failed to expand cluster with {requested} {role} member(s): \
         closed {launched} that were launched: {source}{}",
        describe_failures(.rollback_failures)
    )]
    Expand {
        role: String,
        requested: usize,
        launched: usize,
        #[source]
        source: Box<EnsembleError>,
        rollback_failures: Vec<CloseFailure>,
    },

    #[error(
        "Stability predicate '{predicate}' was not satisfied within {timeout:?} \
         after {attempts} attempt(s){}",
        .last_error.as_ref().map(|e| format!(" (last error: {})", e)).unwrap_or_default()
    )]
    StabilityTimeout {
        predicate: String,
        timeout: Duration,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error(
        "Relaunch stopped after {} replacement(s) with {} member(s) untouched: {source}",
        .replaced.len(),
        .remaining.len()
    )]
    Relaunch {
        replaced: Vec<Replacement>,
        remaining: Vec<String>,
        #[source]
        source: Box<EnsembleError>,
    },

    #[error("Failed to close {} member(s){}", .failures.len(), describe_failures(.failures))]
    Close { failures: Vec<CloseFailure> },

    #[error("Cluster is closed: {0}")]
    ClusterClosed(String),

    #[error("Member already exists: {0}")]
    MemberExists(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EnsembleError {
    /// Create a launch error
    pub fn launch(member: &str, reason: impl std::fmt::Display) -> Self {
        EnsembleError::Launch {
            member: member.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Split an error into its primary cause and any rollback failures it carries.
    ///
    /// Expansion errors wrap the launch failure that caused them; callers that
    /// roll back further (such as a build) keep the original cause as primary.
    pub(crate) fn into_cause(self) -> (EnsembleError, Vec<CloseFailure>) {
        match self {
            EnsembleError::Expand {
                source,
                rollback_failures,
                ..
            }
            | EnsembleError::Build {
                source,
                rollback_failures,
                ..
            } => {
                let (cause, mut nested) = (*source).into_cause();
                nested.extend(rollback_failures);
                (cause, nested)
            }
            other => (other, Vec::new()),
        }
    }
}

fn describe_failures(failures: &[CloseFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }

    let details: Vec<String> = failures
        .iter()
        .map(|f| format!("{} ({})", f.member, f.reason))
        .collect();

    format!("; close failures: {}", details.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_cause_unwraps_expand() {
        let error = EnsembleError::Expand {
            role: "storage".to_string(),
            requested: 3,
            launched: 1,
            source: Box::new(EnsembleError::launch("storage-2", "boom")),
            rollback_failures: vec![CloseFailure {
                member: "storage-1".to_string(),
                reason: "stuck".to_string(),
            }],
        };

        let (cause, failures) = error.into_cause();

        assert!(matches!(cause, EnsembleError::Launch { ref member, .. } if member == "storage-2"));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].member, "storage-1");
    }

    #[test]
    fn test_close_error_lists_members() {
        let error = EnsembleError::Close {
            failures: vec![CloseFailure {
                member: "proxy-1".to_string(),
                reason: "timed out".to_string(),
            }],
        };

        let message = error.to_string();
        assert!(message.contains("proxy-1 (timed out)"));
    }
}
