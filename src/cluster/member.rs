//! Cluster members

use super::Membership;
use crate::error::{EnsembleError, Result};
use crate::options::{DisplayName, Discriminator, Options};
use crate::platform::{Platform, ProcessHandle, Role};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Name prefix of members launched for `role` with `configuration`
pub(crate) fn prefix_for(role: &Role, configuration: &Options) -> String {
    configuration
        .get::<DisplayName>()
        .map(|DisplayName(name)| name)
        .unwrap_or_else(|| role.name().to_string())
}

/// One live process plus what is needed to launch it again
pub struct Member {
    name: String,
    prefix: String,
    discriminator: u32,
    role: Role,
    configuration: Options,
    platform: Arc<dyn Platform>,
    handle: Box<dyn ProcessHandle>,
    launched_at: DateTime<Utc>,
    closed: AtomicBool,
    owner: OnceLock<Weak<Membership>>,
}

impl Member {
    /// Launch a member named `<prefix>-<discriminator>`.
    ///
    /// Every failure is reported as [`EnsembleError::Launch`].
    pub(crate) fn launch(
        platform: Arc<dyn Platform>,
        role: Role,
        mut configuration: Options,
        discriminator: u32,
    ) -> Result<Self> {
        configuration.remove::<Discriminator>();

        let prefix = prefix_for(&role, &configuration);
        let name = format!("{}-{}", prefix, discriminator);

        let mut launch_options = configuration.clone();
        launch_options.set(Discriminator(discriminator));

        let handle = platform
            .launch(&name, &role, &launch_options)
            .map_err(|e| match e {
                EnsembleError::Launch { .. } => e,
                other => EnsembleError::launch(&name, other),
            })?;

        tracing::info!("Launched {} on the {} platform", name, platform.name());

        Ok(Self {
            name,
            prefix,
            discriminator,
            role,
            configuration,
            platform,
            handle,
            launched_at: Utc::now(),
            closed: AtomicBool::new(false),
            owner: OnceLock::new(),
        })
    }

    pub(crate) fn bind(&self, owner: Weak<Membership>) {
        // A member is admitted into at most one cluster
        let _ = self.owner.set(owner);
    }

    pub(crate) fn handle(&self) -> &dyn ProcessHandle {
        self.handle.as_ref()
    }

    /// Member name, `<prefix>-<discriminator>`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name prefix shared by every member of the same role configuration
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn discriminator(&self) -> u32 {
        self.discriminator
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Options the member was launched with, without its discriminator
    pub fn configuration(&self) -> &Options {
        &self.configuration
    }

    /// Platform the member runs on
    pub fn platform(&self) -> Arc<dyn Platform> {
        Arc::clone(&self.platform)
    }

    pub fn launched_at(&self) -> DateTime<Utc> {
        self.launched_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    /// Whether the member's process is running and the member not closed
    pub fn is_operational(&self) -> bool {
        !self.is_closed() && self.handle.is_operational()
    }

    /// Whether the member was closed through [`Member::close`]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Block until the member's process terminates
    pub fn wait_for(&self) -> Result<i32> {
        self.handle.wait_for()
    }

    /// Close the member with default options
    pub fn close(&self) -> Result<()> {
        self.close_with(&Options::empty())
    }

    /// Close the member's process and leave its cluster.
    ///
    /// The member is no longer in its cluster when this returns `Ok`. Closing
    /// twice is a no-op. If the handle fails to close, the member stays in its
    /// cluster and can be closed again.
    pub fn close_with(&self, options: &Options) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.handle.close(options) {
            self.closed.store(false, Ordering::SeqCst);
            tracing::warn!("Failed to close {}: {}", self.name, e);
            return Err(e);
        }

        if let Some(owner) = self.owner.get().and_then(Weak::upgrade) {
            owner.remove(&self.name);
        }

        tracing::info!("Closed {}", self.name);
        Ok(())
    }

    /// Serializable summary of the member
    pub fn info(&self) -> MemberInfo {
        MemberInfo {
            name: self.name.clone(),
            role: self.role.name().to_string(),
            discriminator: self.discriminator,
            platform: self.platform.name().to_string(),
            pid: self.pid(),
            operational: self.is_operational(),
            launched_at: self.launched_at,
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("name", &self.name)
            .field("role", &self.role.name())
            .field("platform", &self.platform.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Member summary for reports
#[derive(Debug, Clone, Serialize)]
pub struct MemberInfo {
    pub name: String,
    pub role: String,
    pub discriminator: u32,
    pub platform: String,
    pub pid: Option<u32>,
    pub operational: bool,
    pub launched_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SimulatedPlatform;

    #[test]
    fn test_member_name_uses_role_or_display_name() {
        let platform = Arc::new(SimulatedPlatform::new());

        let member = Member::launch(platform.clone(), Role::new("storage"), Options::empty(), 4).unwrap();
        assert_eq!(member.name(), "storage-4");
        assert_eq!(member.prefix(), "storage");

        let named = Member::launch(
            platform.clone(),
            Role::new("storage"),
            Options::empty().with(DisplayName::of("cache")),
            1,
        )
        .unwrap();
        assert_eq!(named.name(), "cache-1");
        assert!(!named.configuration().contains::<Discriminator>());
    }

    #[test]
    fn test_launch_failures_become_launch_errors() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.fail_role("broken");

        let result = Member::launch(platform.clone(), Role::new("broken"), Options::empty(), 1);
        assert!(matches!(result, Err(EnsembleError::Launch { ref member, .. }) if member == "broken-1"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let platform = Arc::new(SimulatedPlatform::new());
        let member = Member::launch(platform.clone(), Role::new("web"), Options::empty(), 1).unwrap();

        assert!(member.is_operational());
        member.close().unwrap();
        member.close().unwrap();

        assert!(member.is_closed());
        assert!(!member.is_operational());
        assert_eq!(platform.running_count(), 0);
    }

    #[test]
    fn test_failed_close_can_be_retried() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.fail_close("web-1");
        let member = Member::launch(platform.clone(), Role::new("web"), Options::empty(), 1).unwrap();

        assert!(member.close().is_err());
        assert!(!member.is_closed());
        assert!(member.is_operational());
    }
}
