//! Rolling membership changes
//!
//! Relaunch, clone and expand all visit members one at a time on the calling
//! thread. Replacing several members concurrently is exactly what the
//! stability predicate exists to prevent, so nothing here runs in parallel.

use super::member::{prefix_for, Member};
use super::{Cluster, View};
use crate::error::{CloseFailure, EnsembleError, Replacement, Result};
use crate::options::Options;
use crate::platform::{Platform, Role};
use crate::stability::{StabilityConfig, StabilityEvaluator, StabilityPredicate};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// How a rolling relaunch waits and closes
#[derive(Debug, Clone)]
pub struct RelaunchPolicy {
    /// Deadline for each stability check
    pub timeout: Duration,
    /// Check the predicate before the first member is touched
    pub pre_check: bool,
    /// Polling behavior; its timeout is replaced by `timeout`
    pub stability: StabilityConfig,
    /// Options passed when closing the replaced members
    pub close_options: Options,
}

impl RelaunchPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pre_check: true,
            stability: StabilityConfig::default(),
            close_options: Options::empty(),
        }
    }

    pub fn pre_check(mut self, enabled: bool) -> Self {
        self.pre_check = enabled;
        self
    }

    pub fn stability(mut self, config: StabilityConfig) -> Self {
        self.stability = config;
        self
    }

    pub fn close_options(mut self, options: Options) -> Self {
        self.close_options = options;
        self
    }

    fn evaluator(&self) -> StabilityEvaluator {
        StabilityEvaluator::new(self.stability.clone().with_timeout(self.timeout))
    }
}

/// What a completed relaunch did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelaunchReport {
    /// Members replaced, in visit order
    pub replacements: Vec<Replacement>,
    /// Members of the view that had already left the cluster
    pub skipped: Vec<String>,
}

fn is_stale(cluster: &Cluster, member: &Member) -> bool {
    member.is_closed() || !cluster.contains(member.name())
}

/// Launch `count` members with a ready configuration and admit them together.
///
/// Nothing is admitted until every launch succeeded; on failure the members
/// launched so far are closed.
pub(crate) fn launch_members(
    cluster: &Cluster,
    count: usize,
    platform: Arc<dyn Platform>,
    role: Role,
    configuration: Options,
) -> Result<Vec<Arc<Member>>> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let membership = cluster.membership();
    let prefix = prefix_for(&role, &configuration);
    let mut launched: Vec<Arc<Member>> = Vec::with_capacity(count);

    tracing::info!(
        "Expanding cluster {} with {} {} member(s) on the {} platform",
        cluster.id(),
        count,
        role,
        platform.name()
    );

    for _ in 0..count {
        let result = membership.next_discriminator(&prefix).and_then(|discriminator| {
            Member::launch(Arc::clone(&platform), role.clone(), configuration.clone(), discriminator)
        });

        match result {
            Ok(member) => launched.push(Arc::new(member)),
            Err(e) => return Err(abandon_expansion(&role, count, launched, e)),
        }
    }

    if let Err(e) = launched.iter().try_for_each(|member| membership.admit(member)) {
        return Err(abandon_expansion(&role, count, launched, e));
    }

    Ok(launched)
}

fn abandon_expansion(
    role: &Role,
    requested: usize,
    launched: Vec<Arc<Member>>,
    source: EnsembleError,
) -> EnsembleError {
    tracing::warn!(
        "Expansion of {} failed after {} launch(es), closing them: {}",
        role,
        launched.len(),
        source
    );

    let rollback_failures: Vec<CloseFailure> = launched
        .iter()
        .filter_map(|member| member.close().err().map(|e| CloseFailure::new(member.name(), &e)))
        .collect();

    EnsembleError::Expand {
        role: role.name().to_string(),
        requested,
        launched: launched.len(),
        source: Box::new(source),
        rollback_failures,
    }
}

/// Close `member` and launch its replacement with the next discriminator
fn replace(cluster: &Cluster, member: &Member, close_options: &Options) -> Result<Arc<Member>> {
    member.close_with(close_options)?;

    let membership = cluster.membership();
    let discriminator = membership.next_discriminator(member.prefix())?;
    let replacement = Arc::new(Member::launch(
        member.platform(),
        member.role().clone(),
        member.configuration().clone(),
        discriminator,
    )?);

    if let Err(e) = membership.admit(&replacement) {
        if let Err(close_error) = replacement.close() {
            tracing::warn!("Failed to close unadmitted {}: {}", replacement.name(), close_error);
        }
        return Err(e);
    }

    Ok(replacement)
}

pub(crate) fn relaunch(
    view: &View,
    predicate: &StabilityPredicate,
    policy: &RelaunchPolicy,
) -> Result<RelaunchReport> {
    let cluster = view.cluster();
    let evaluator = policy.evaluator();
    let targets = view.members();
    let mut report = RelaunchReport::default();

    // Untouched members still in the cluster, from `index` on
    let remaining_from = |index: usize| -> Vec<String> {
        targets[index..]
            .iter()
            .filter(|m| !is_stale(cluster, m))
            .map(|m| m.name().to_string())
            .collect()
    };

    tracing::info!(
        "Relaunching {} member(s) of cluster {} ({}) until '{}'",
        targets.len(),
        cluster.id(),
        view.describe(),
        predicate.name()
    );

    if policy.pre_check {
        if let Err(e) = evaluator.evaluate(predicate, cluster) {
            return Err(EnsembleError::Relaunch {
                replaced: Vec::new(),
                remaining: remaining_from(0),
                source: Box::new(e),
            });
        }
    }

    for (index, member) in targets.iter().enumerate() {
        if is_stale(cluster, member) {
            tracing::debug!("Skipping {}, it already left the cluster", member.name());
            report.skipped.push(member.name().to_string());
            continue;
        }

        let step = replace(cluster, member, &policy.close_options).and_then(|replacement| {
            report.replacements.push(Replacement {
                replaced: member.name().to_string(),
                replacement: replacement.name().to_string(),
            });
            evaluator.evaluate(predicate, cluster)
        });

        if let Err(e) = step {
            tracing::warn!(
                "Relaunch of cluster {} stopped at {}: {}",
                cluster.id(),
                member.name(),
                e
            );
            return Err(EnsembleError::Relaunch {
                replaced: report.replacements,
                remaining: remaining_from(index),
                source: Box::new(e),
            });
        }
    }

    tracing::info!(
        "Relaunched {} member(s) of cluster {}, skipped {}",
        report.replacements.len(),
        cluster.id(),
        report.skipped.len()
    );

    Ok(report)
}

pub(crate) fn clone_members(view: &View, count: usize, overrides: &Options) -> Result<Vec<Arc<Member>>> {
    let cluster = view.cluster();
    let mut cloned = Vec::new();

    for member in view.members() {
        if is_stale(cluster, member) {
            tracing::debug!("Not cloning {}, it already left the cluster", member.name());
            continue;
        }

        cloned.extend(launch_members(
            cluster,
            count,
            member.platform(),
            member.role().clone(),
            member.configuration().merged(overrides),
        )?);
    }

    Ok(cloned)
}
