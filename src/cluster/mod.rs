//! Cluster membership
//!
//! A [`Cluster`] tracks the members whose processes are currently open. Every
//! change to the membership goes through one lock, whatever triggered it: an
//! orchestration call on the caller's thread, or an exit notification arriving
//! from a process watcher. The lock is only held for the map operation itself,
//! never across a launch, a close or a stability poll.

pub mod builder;
pub mod member;
pub mod rolling;
pub mod view;

pub use builder::{ClusterBuilder, RoleSpec};
pub use member::{Member, MemberInfo};
pub use rolling::{RelaunchPolicy, RelaunchReport};
pub use view::{Transform, View};

use crate::error::{CloseFailure, EnsembleError, Result};
use crate::options::Options;
use crate::platform::{Platform, Role};
use crate::stability::StabilityPredicate;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

/// Shared membership state behind every [`Cluster`] handle
pub(crate) struct Membership {
    id: Uuid,
    options: Options,
    /// Members in admission order
    members: RwLock<Vec<Arc<Member>>>,
    /// Last discriminator handed out per name prefix
    discriminators: Mutex<HashMap<String, u32>>,
    closed: AtomicBool,
}

impl Membership {
    // Every critical section is a single push, retain or drain, so a poisoned
    // lock still guards a consistent list.
    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Member>>> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Member>>> {
        self.members.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next discriminator for `prefix`, starting at 1 and never reused
    pub(crate) fn next_discriminator(&self, prefix: &str) -> Result<u32> {
        let mut discriminators = self
            .discriminators
            .lock()
            .map_err(|_| EnsembleError::Lock("Failed to acquire discriminator lock".to_string()))?;

        let next = discriminators.entry(prefix.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }

    /// Add a launched member and subscribe to its exit
    pub(crate) fn admit(self: &Arc<Self>, member: &Arc<Member>) -> Result<()> {
        {
            let mut members = self.write();
            if self.closed.load(Ordering::SeqCst) {
                return Err(EnsembleError::ClusterClosed(self.id.to_string()));
            }
            if members.iter().any(|m| m.name() == member.name()) {
                return Err(EnsembleError::MemberExists(member.name().to_string()));
            }
            members.push(Arc::clone(member));
        }

        member.bind(Arc::downgrade(self));

        // Fires right away if the process already exited
        let owner = Arc::downgrade(self);
        let name = member.name().to_string();
        member.handle().on_exit(Box::new(move |code| {
            if let Some(membership) = owner.upgrade() {
                if membership.remove(&name) {
                    tracing::info!(
                        "{} left cluster {} (exit code {:?})",
                        name,
                        membership.id,
                        code
                    );
                }
            }
        }));

        Ok(())
    }

    /// Remove a member by name, returning whether it was present
    pub(crate) fn remove(&self, name: &str) -> bool {
        let mut members = self.write();
        let before = members.len();
        members.retain(|m| m.name() != name);
        members.len() != before
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.read().iter().any(|m| m.name() == name)
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let members = std::mem::take(self.members.get_mut().unwrap_or_else(PoisonError::into_inner));
        if !members.is_empty() {
            tracing::info!("Cluster {} dropped, closing {} member(s)", self.id, members.len());
        }
        for member in members {
            if let Err(e) = member.close() {
                tracing::warn!("Failed to close {} on drop: {}", member.name(), e);
            }
        }
    }
}

/// A thread-safe, self-maintaining set of members
///
/// Cloning a `Cluster` yields another handle to the same membership. When the
/// last handle (including those held by views) is dropped, members still open
/// are closed.
#[derive(Clone)]
pub struct Cluster {
    shared: Arc<Membership>,
}

impl Cluster {
    pub(crate) fn new(options: Options) -> Self {
        Self {
            shared: Arc::new(Membership {
                id: Uuid::new_v4(),
                options,
                members: RwLock::new(Vec::new()),
                discriminators: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn membership(&self) -> &Arc<Membership> {
        &self.shared
    }

    /// Unique cluster id
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Options every member of the cluster was launched with
    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /// Number of open members
    pub fn len(&self) -> usize {
        self.shared.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`Cluster::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of the open members in admission order
    pub fn members(&self) -> Vec<Arc<Member>> {
        self.shared.read().clone()
    }

    /// Names of the open members in admission order
    pub fn names(&self) -> Vec<String> {
        self.shared.read().iter().map(|m| m.name().to_string()).collect()
    }

    /// Member with exactly this name
    pub fn get(&self, name: &str) -> Option<Arc<Member>> {
        self.shared.read().iter().find(|m| m.name() == name).cloned()
    }

    /// Whether an open member has this name
    pub fn contains(&self, name: &str) -> bool {
        self.shared.contains(name)
    }

    /// View over every open member
    pub fn view(&self) -> View {
        View::of(self.clone())
    }

    /// Members whose name starts with `pattern` or fully matches it as a regular expression
    pub fn get_all(&self, pattern: &str) -> View {
        self.view().get_all(pattern)
    }

    /// Members matching `predicate`
    pub fn filter<F>(&self, predicate: F) -> View
    where
        F: Fn(&Member) -> bool,
    {
        self.view().filter(predicate)
    }

    /// The first `n` members
    pub fn limit(&self, n: usize) -> View {
        self.view().limit(n)
    }

    /// Every member in random order
    pub fn unordered(&self) -> View {
        self.view().unordered()
    }

    /// Launch `count` members of a new role and add them to the cluster.
    ///
    /// The members are launched with the cluster options composed with
    /// `options`. Either all of them join, or the ones launched are closed and
    /// the launch error is returned.
    pub fn expand(
        &self,
        count: usize,
        platform: Arc<dyn Platform>,
        role: Role,
        options: &Options,
    ) -> Result<Vec<Arc<Member>>> {
        let configuration = self.shared.options.merged(options);
        rolling::launch_members(self, count, platform, role, configuration)
    }

    /// Relaunch every member, one at a time, waiting for `predicate` in between
    pub fn relaunch(&self, predicate: &StabilityPredicate, timeout: Duration) -> Result<RelaunchReport> {
        self.view().relaunch(predicate, timeout)
    }

    /// Relaunch every member under an explicit policy
    pub fn relaunch_with(&self, predicate: &StabilityPredicate, policy: &RelaunchPolicy) -> Result<RelaunchReport> {
        self.view().relaunch_with(predicate, policy)
    }

    /// Close every member with default options
    pub fn close(&self) -> Result<()> {
        self.close_with(&Options::empty())
    }

    /// Close every member, carrying on past failures.
    ///
    /// The cluster admits no further members afterwards. Members that failed to
    /// close are reported together in [`EnsembleError::Close`] and stay in the
    /// cluster while their process runs, so closing again retries them.
    pub fn close_with(&self, options: &Options) -> Result<()> {
        let members = {
            let mut members = self.shared.write();
            self.shared.closed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *members)
        };

        if members.is_empty() {
            return Ok(());
        }

        tracing::info!("Closing cluster {} ({} members)", self.shared.id, members.len());

        let mut failures = Vec::new();
        let mut still_open = Vec::new();
        for member in members {
            if let Err(e) = member.close_with(options) {
                failures.push(CloseFailure::new(member.name(), &e));
                still_open.push(member);
            }
        }

        if !still_open.is_empty() {
            // Checked under the lock: a later exit runs the listener's remove after us
            let mut members = self.shared.write();
            members.extend(still_open.into_iter().filter(|m| m.handle().is_operational()));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EnsembleError::Close { failures })
        }
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.shared.id)
            .field("members", &self.names())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DisplayName;
    use crate::platform::SimulatedPlatform;

    fn cluster_of(count: usize, platform: &Arc<SimulatedPlatform>) -> Cluster {
        let cluster = Cluster::new(Options::empty());
        cluster
            .expand(count, platform.clone(), Role::new("node"), &Options::empty())
            .unwrap();
        cluster
    }

    #[test]
    fn test_expand_names_members_per_prefix() {
        let platform = Arc::new(SimulatedPlatform::new());
        let cluster = cluster_of(2, &platform);

        cluster
            .expand(1, platform.clone(), Role::new("node"), &Options::empty().with(DisplayName::of("proxy")))
            .unwrap();
        cluster.expand(1, platform.clone(), Role::new("node"), &Options::empty()).unwrap();

        assert_eq!(cluster.names(), vec!["node-1", "node-2", "proxy-1", "node-3"]);
    }

    #[test]
    fn test_closing_a_member_removes_it() {
        let platform = Arc::new(SimulatedPlatform::new());
        let cluster = cluster_of(3, &platform);

        let member = cluster.get("node-2").unwrap();
        member.close().unwrap();

        assert!(cluster.get("node-2").is_none());
        assert_eq!(cluster.len(), 2);
        assert_eq!(platform.running(), vec!["node-1", "node-3"]);
    }

    #[test]
    fn test_crashed_member_leaves_cluster() {
        let platform = Arc::new(SimulatedPlatform::new());
        let cluster = cluster_of(2, &platform);

        assert!(platform.crash("node-1", 137));

        assert!(cluster.get("node-1").is_none());
        assert_eq!(cluster.names(), vec!["node-2"]);
    }

    #[test]
    fn test_close_aggregates_failures() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.fail_close("node-1").fail_close("node-3");
        let cluster = cluster_of(4, &platform);

        match cluster.close() {
            Err(EnsembleError::Close { failures }) => {
                let names: Vec<&str> = failures.iter().map(|f| f.member.as_str()).collect();
                assert_eq!(names, vec!["node-1", "node-3"]);
            }
            other => panic!("expected close failures, got {:?}", other),
        }

        assert!(cluster.is_closed());
        assert_eq!(cluster.names(), vec!["node-1", "node-3"]);
        assert_eq!(platform.running(), vec!["node-1", "node-3"]);

        // Still tracked, so an exit is observed
        assert!(platform.crash("node-3", 1));
        assert_eq!(cluster.names(), vec!["node-1"]);
    }

    #[test]
    fn test_closed_cluster_admits_nobody() {
        let platform = Arc::new(SimulatedPlatform::new());
        let cluster = cluster_of(1, &platform);
        cluster.close().unwrap();

        let result = cluster.expand(1, platform.clone(), Role::new("node"), &Options::empty());

        assert!(result.is_err());
        assert_eq!(platform.running_count(), 0);
    }

    #[test]
    fn test_dropping_cluster_closes_members() {
        let platform = Arc::new(SimulatedPlatform::new());
        let cluster = cluster_of(2, &platform);
        let handle = cluster.clone();

        drop(cluster);
        assert_eq!(platform.running_count(), 2);

        drop(handle);
        assert_eq!(platform.running_count(), 0);
    }

    #[test]
    fn test_discriminators_are_never_reused() {
        let cluster = Cluster::new(Options::empty());
        let membership = cluster.membership();

        assert_eq!(membership.next_discriminator("a").unwrap(), 1);
        assert_eq!(membership.next_discriminator("a").unwrap(), 2);
        assert_eq!(membership.next_discriminator("b").unwrap(), 1);
        assert_eq!(membership.next_discriminator("a").unwrap(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_local_process_leaves_cluster() {
        use crate::options::{Arguments, Executable};
        use crate::platform::LocalPlatform;

        let cluster = Cluster::new(Options::empty());
        let options = Options::empty()
            .with(Executable::named("sh"))
            .with(Arguments::of(["-c", "sleep 0.2"]));
        cluster
            .expand(1, Arc::new(LocalPlatform::new()), Role::new("short"), &options)
            .unwrap();

        let member = cluster.get("short-1").unwrap();
        assert_eq!(member.wait_for().unwrap(), 0);
        assert!(cluster.get("short-1").is_none());
    }
}
