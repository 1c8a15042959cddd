//! Declarative cluster construction

use super::Cluster;
use crate::error::{CloseFailure, EnsembleError, Result};
use crate::options::Options;
use crate::platform::{Platform, Role};
use crate::stability::{StabilityConfig, StabilityEvaluator, StabilityPredicate};
use std::sync::Arc;

/// `count` identical members of one role
#[derive(Debug, Clone)]
pub struct RoleSpec {
    pub count: usize,
    pub role: Role,
    pub options: Options,
}

/// Accumulates role specs and builds them into a [`Cluster`]
#[derive(Debug, Clone, Default)]
pub struct ClusterBuilder {
    options: Options,
    specs: Vec<RoleSpec>,
    stable_when: Option<StabilityPredicate>,
    stability: StabilityConfig,
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options applied to every role, before the role's own options
    pub fn with(mut self, options: Options) -> Self {
        self.options.add_all(&options);
        self
    }

    /// Declare `count` members of `role` launched with `options`
    pub fn include(mut self, count: usize, role: Role, options: Options) -> Self {
        self.specs.push(RoleSpec { count, role, options });
        self
    }

    /// Require `predicate` to hold once every member is launched
    pub fn stable_when(mut self, predicate: StabilityPredicate) -> Self {
        self.stable_when = Some(predicate);
        self
    }

    /// Polling configuration for [`ClusterBuilder::stable_when`]
    pub fn stability(mut self, config: StabilityConfig) -> Self {
        self.stability = config;
        self
    }

    pub fn specs(&self) -> &[RoleSpec] {
        &self.specs
    }

    /// Total number of members declared
    pub fn size(&self) -> usize {
        self.specs.iter().map(|spec| spec.count).sum()
    }

    /// Launch every declared member on `platform`.
    ///
    /// Returns a cluster with exactly the declared membership, or an error after
    /// closing every member launched so far.
    pub fn build(&self, platform: Arc<dyn Platform>, options: Options) -> Result<Cluster> {
        let cluster = Cluster::new(self.options.merged(&options));
        let requested = self.size();

        tracing::info!(
            "Building cluster {} with {} member(s) on the {} platform",
            cluster.id(),
            requested,
            platform.name()
        );

        for spec in &self.specs {
            if let Err(e) = cluster.expand(spec.count, Arc::clone(&platform), spec.role.clone(), &spec.options) {
                return Err(self.roll_back(cluster, requested, e));
            }
        }

        if let Some(predicate) = &self.stable_when {
            let evaluator = StabilityEvaluator::new(self.stability.clone());
            if let Err(e) = evaluator.evaluate(predicate, &cluster) {
                return Err(self.roll_back(cluster, requested, e));
            }
        }

        tracing::info!("Cluster {} is up with {} member(s)", cluster.id(), cluster.len());
        Ok(cluster)
    }

    fn roll_back(&self, cluster: Cluster, requested: usize, error: EnsembleError) -> EnsembleError {
        let partial = match &error {
            EnsembleError::Expand { launched, .. } => *launched,
            _ => 0,
        };
        let launched = cluster.len() + partial;
        let (source, mut rollback_failures) = error.into_cause();

        tracing::warn!(
            "Building cluster {} failed, closing {} member(s): {}",
            cluster.id(),
            cluster.len(),
            source
        );

        match cluster.close() {
            Ok(()) => {}
            Err(EnsembleError::Close { failures }) => rollback_failures.extend(failures),
            Err(other) => rollback_failures.push(CloseFailure::new(&cluster.id().to_string(), &other)),
        }

        EnsembleError::Build {
            requested,
            launched,
            source: Box::new(source),
            rollback_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{ClusterName, ClusterPort, DisplayName};
    use crate::platform::SimulatedPlatform;
    use crate::lazy::LazySharedValue;
    use std::time::Duration;

    #[test]
    fn test_build_three_members() {
        let platform = Arc::new(SimulatedPlatform::new());

        let cluster = ClusterBuilder::new()
            .include(3, Role::new("Role"), Options::empty().with(ClusterName::of("X")))
            .build(platform.clone(), Options::empty())
            .unwrap();

        assert_eq!(cluster.len(), 3);
        assert_eq!(cluster.names(), vec!["Role-1", "Role-2", "Role-3"]);
        assert_eq!(
            cluster.get("Role-2").unwrap().configuration().get::<ClusterName>(),
            Some(ClusterName::of("X"))
        );
    }

    #[test]
    fn test_heterogeneous_roles_share_a_port() {
        let platform = Arc::new(SimulatedPlatform::new());
        let port = ClusterPort(LazySharedValue::resolved(7574));

        let cluster = ClusterBuilder::new()
            .with(Options::empty().with(port))
            .include(2, Role::new("storage"), Options::empty())
            .include(1, Role::new("storage"), Options::empty().with(DisplayName::of("proxy")))
            .build(platform.clone(), Options::empty())
            .unwrap();

        assert_eq!(cluster.names(), vec!["storage-1", "storage-2", "proxy-1"]);
        for member in cluster.members() {
            let ClusterPort(port) = member.configuration().get::<ClusterPort>().unwrap();
            assert_eq!(port.get().unwrap(), 7574);
        }
    }

    #[test]
    fn test_build_options_override_builder_options() {
        let platform = Arc::new(SimulatedPlatform::new());

        let cluster = ClusterBuilder::new()
            .with(Options::empty().with(ClusterName::of("builder")))
            .include(1, Role::new("node"), Options::empty())
            .build(platform.clone(), Options::empty().with(ClusterName::of("build")))
            .unwrap();

        assert_eq!(cluster.options().get::<ClusterName>(), Some(ClusterName::of("build")));
    }

    #[test]
    fn test_failed_build_leaves_nothing_running() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.fail_role("FailingRole");

        let result = ClusterBuilder::new()
            .include(2, Role::new("Role"), Options::empty())
            .include(1, Role::new("FailingRole"), Options::empty())
            .build(platform.clone(), Options::empty());

        match result {
            Err(EnsembleError::Build {
                requested,
                launched,
                source,
                rollback_failures,
            }) => {
                assert_eq!(requested, 3);
                assert_eq!(launched, 2);
                assert!(matches!(*source, EnsembleError::Launch { ref member, .. } if member == "FailingRole-1"));
                assert!(rollback_failures.is_empty());
            }
            other => panic!("expected a build failure, got {:?}", other),
        }

        assert_eq!(platform.running_count(), 0);
    }

    #[test]
    fn test_rollback_failures_keep_launch_error_as_cause() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.fail_close("Role-1").fail_launch(4);

        let result = ClusterBuilder::new()
            .include(2, Role::new("Role"), Options::empty())
            .include(2, Role::new("Other"), Options::empty())
            .build(platform.clone(), Options::empty());

        match result {
            Err(EnsembleError::Build {
                launched,
                source,
                rollback_failures,
                ..
            }) => {
                assert_eq!(launched, 3);
                assert!(matches!(*source, EnsembleError::Launch { .. }));
                assert_eq!(rollback_failures.len(), 1);
                assert_eq!(rollback_failures[0].member, "Role-1");
            }
            other => panic!("expected a build failure, got {:?}", other),
        }

        assert_eq!(platform.running(), vec!["Role-1"]);
    }

    #[test]
    fn test_unstable_build_is_rolled_back() {
        let platform = Arc::new(SimulatedPlatform::new());

        let result = ClusterBuilder::new()
            .include(2, Role::new("node"), Options::empty())
            .stable_when(StabilityPredicate::minimum_size(3))
            .stability(StabilityConfig {
                timeout: Duration::from_millis(30),
                max_poll_interval: Duration::from_millis(5),
                ..StabilityConfig::default()
            })
            .build(platform.clone(), Options::empty());

        assert!(matches!(
            result,
            Err(EnsembleError::Build { ref source, .. })
                if matches!(**source, EnsembleError::StabilityTimeout { .. })
        ));
        assert_eq!(platform.running_count(), 0);
    }

    #[test]
    fn test_stable_build() {
        let platform = Arc::new(SimulatedPlatform::new());

        let cluster = ClusterBuilder::new()
            .include(2, Role::new("node"), Options::empty())
            .stable_when(StabilityPredicate::all_operational().and(StabilityPredicate::minimum_size(2)))
            .build(platform.clone(), Options::empty())
            .unwrap();

        assert_eq!(cluster.len(), 2);
    }
}
