//! Views over cluster members

use super::rolling::{self, RelaunchPolicy, RelaunchReport};
use super::{Cluster, Member};
use crate::error::Result;
use crate::options::Options;
use crate::stability::StabilityPredicate;
use rand::seq::SliceRandom;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// One step in the derivation of a view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    Filter,
    Limit(usize),
    Unordered,
    Pattern(String),
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Filter => write!(f, "filter"),
            Transform::Limit(n) => write!(f, "limit({})", n),
            Transform::Unordered => write!(f, "unordered"),
            Transform::Pattern(pattern) => write!(f, "get_all({})", pattern),
        }
    }
}

/// An immutable snapshot of some of a cluster's members
///
/// Combinators return new views built from the members still open in the
/// cluster; the receiver never changes. Mutating operations act on the cluster
/// on behalf of the view's members and skip those that have left it since.
#[derive(Clone)]
pub struct View {
    cluster: Cluster,
    members: Vec<Arc<Member>>,
    provenance: Vec<Transform>,
}

impl View {
    pub(crate) fn of(cluster: Cluster) -> Self {
        let members = cluster.members();
        Self {
            cluster,
            members,
            provenance: Vec::new(),
        }
    }

    /// The cluster this view was taken from
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Members in view order, as captured
    pub fn members(&self) -> &[Arc<Member>] {
        &self.members
    }

    pub fn names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Member>> {
        self.members.iter()
    }

    /// Transforms applied to the whole cluster to obtain this view
    pub fn provenance(&self) -> &[Transform] {
        &self.provenance
    }

    /// Human readable provenance, e.g. `cluster | filter | limit(2)`
    pub fn describe(&self) -> String {
        std::iter::once("cluster".to_string())
            .chain(self.provenance.iter().map(Transform::to_string))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    fn live(&self) -> Vec<Arc<Member>> {
        self.members
            .iter()
            .filter(|m| !m.is_closed() && self.cluster.contains(m.name()))
            .cloned()
            .collect()
    }

    fn derive<F>(&self, transform: Transform, select: F) -> View
    where
        F: FnOnce(Vec<Arc<Member>>) -> Vec<Arc<Member>>,
    {
        let mut provenance = self.provenance.clone();
        provenance.push(transform);

        View {
            cluster: self.cluster.clone(),
            members: select(self.live()),
            provenance,
        }
    }

    /// Members matching `predicate`, order preserved
    pub fn filter<F>(&self, predicate: F) -> View
    where
        F: Fn(&Member) -> bool,
    {
        self.derive(Transform::Filter, |members| {
            members.into_iter().filter(|m| predicate(&**m)).collect()
        })
    }

    /// The first `n` members
    pub fn limit(&self, n: usize) -> View {
        self.derive(Transform::Limit(n), |mut members| {
            members.truncate(n);
            members
        })
    }

    /// The same members in random order
    pub fn unordered(&self) -> View {
        self.derive(Transform::Unordered, |mut members| {
            members.shuffle(&mut rand::thread_rng());
            members
        })
    }

    /// Member of this view with exactly this name, if still in the cluster
    pub fn get(&self, name: &str) -> Option<Arc<Member>> {
        self.live().into_iter().find(|m| m.name() == name)
    }

    /// Members whose name starts with `pattern` or fully matches it as a regular expression
    pub fn get_all(&self, pattern: &str) -> View {
        let regex = Regex::new(&format!("^(?:{})$", pattern)).ok();

        self.derive(Transform::Pattern(pattern.to_string()), |members| {
            members
                .into_iter()
                .filter(|m| {
                    m.name().starts_with(pattern)
                        || regex.as_ref().is_some_and(|r| r.is_match(m.name()))
                })
                .collect()
        })
    }

    /// Relaunch the view's members one at a time with the default policy
    pub fn relaunch(&self, predicate: &StabilityPredicate, timeout: Duration) -> Result<RelaunchReport> {
        self.relaunch_with(predicate, &RelaunchPolicy::new(timeout))
    }

    /// Relaunch the view's members one at a time.
    ///
    /// Each member is closed and replaced by one launched with the same
    /// configuration, then `predicate` must hold for the whole cluster before
    /// the next member is touched.
    pub fn relaunch_with(&self, predicate: &StabilityPredicate, policy: &RelaunchPolicy) -> Result<RelaunchReport> {
        rolling::relaunch(self, predicate, policy)
    }

    /// Launch `count` copies of each member of the view
    pub fn clone_members(&self, count: usize) -> Result<Vec<Arc<Member>>> {
        self.clone_members_with(count, &Options::empty())
    }

    /// Launch `count` copies of each member of the view, composing
    /// `overrides` over each member's configuration.
    ///
    /// A [`DisplayName`](crate::options::DisplayName) override names the
    /// copies under a new prefix.
    pub fn clone_members_with(&self, count: usize, overrides: &Options) -> Result<Vec<Arc<Member>>> {
        rolling::clone_members(self, count, overrides)
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("members", &self.names())
            .field("provenance", &self.describe())
            .finish()
    }
}

impl<'a> IntoIterator for &'a View {
    type Item = &'a Arc<Member>;
    type IntoIter = std::slice::Iter<'a, Arc<Member>>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::platform::{Role, SimulatedPlatform};
    use std::collections::HashSet;

    fn cluster_of(count: usize) -> (Arc<SimulatedPlatform>, Cluster) {
        let platform = Arc::new(SimulatedPlatform::new());
        let cluster = Cluster::new(Options::empty());
        cluster
            .expand(count, platform.clone(), Role::new("storage"), &Options::empty())
            .unwrap();
        cluster
            .expand(1, platform.clone(), Role::new("proxy"), &Options::empty())
            .unwrap();
        (platform, cluster)
    }

    #[test]
    fn test_filter_and_limit() {
        let (_platform, cluster) = cluster_of(4);

        let view = cluster.filter(|m| m.role().name() == "storage").limit(2);

        assert_eq!(view.names(), vec!["storage-1", "storage-2"]);
        assert_eq!(view.describe(), "cluster | filter | limit(2)");
        assert_eq!(cluster.limit(10).len(), 5);
    }

    #[test]
    fn test_unordered_keeps_members() {
        let (_platform, cluster) = cluster_of(6);

        let shuffled: HashSet<String> = cluster.unordered().names().into_iter().collect();
        let ordered: HashSet<String> = cluster.names().into_iter().collect();

        assert_eq!(shuffled, ordered);
    }

    #[test]
    fn test_get_all_by_prefix_or_regex() {
        let (_platform, cluster) = cluster_of(3);

        assert_eq!(cluster.get_all("storage").len(), 3);
        assert_eq!(cluster.get_all("storage-[13]").names(), vec!["storage-1", "storage-3"]);
        assert!(cluster.get_all("missing").is_empty());
        assert!(cluster.get_all("(unclosed").is_empty());
    }

    #[test]
    fn test_views_are_snapshots() {
        let (_platform, cluster) = cluster_of(3);
        let view = cluster.view();

        cluster.get("storage-2").unwrap().close().unwrap();

        assert_eq!(view.len(), 4);
        assert!(view.get("storage-2").is_none());
        assert_eq!(view.limit(2).names(), vec!["storage-1", "storage-3"]);
    }
}
