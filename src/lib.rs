//! Ensemble - provision and operate a cluster of processes as one unit
//!
//! Ensemble launches a named group of independently running processes and
//! mutates its membership safely at runtime:
//!
//! - Atomic cluster construction (all members start, or none is left running)
//! - Self-maintaining membership driven by process exit notifications
//! - Views to select members (`filter`, `limit`, `unordered`, `get_all`)
//! - Stability-gated rolling relaunch, cloning and expansion
//!
//! ```no_run
//! use ensemble::{ClusterBuilder, Options, Role, StabilityPredicate};
//! use ensemble::options::{Executable, Arguments};
//! use ensemble::platform::LocalPlatform;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let cluster = ClusterBuilder::new()
//!     .include(
//!         3,
//!         Role::new("storage"),
//!         Options::empty()
//!             .with(Executable::named("sleep"))
//!             .with(Arguments::of(["300"])),
//!     )
//!     .build(Arc::new(LocalPlatform::new()), Options::empty())?;
//!
//! cluster
//!     .unordered()
//!     .relaunch(&StabilityPredicate::all_operational(), Duration::from_secs(30))?;
//! cluster.close()?;
//! # Ok::<(), ensemble::EnsembleError>(())
//! ```

pub mod cluster;
pub mod error;
pub mod lazy;
pub mod manifest;
pub mod options;
pub mod platform;
pub mod stability;

pub use cluster::{Cluster, ClusterBuilder, Member, RelaunchPolicy, RelaunchReport, View};
pub use error::{EnsembleError, Result};
pub use lazy::LazySharedValue;
pub use options::Options;
pub use platform::{Platform, ProcessHandle, Role};
pub use stability::{StabilityConfig, StabilityEvaluator, StabilityPredicate};
