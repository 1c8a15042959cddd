//! Launch platforms
//!
//! A [`Platform`] turns a role and its options into a running process and hands
//! back a [`ProcessHandle`]. The cluster engine only ever talks to these two
//! traits, so local processes, remote hosts or simulated processes all plug in
//! the same way.

pub mod local;
pub mod simulated;

pub use local::LocalPlatform;
pub use simulated::SimulatedPlatform;

use crate::error::Result;
use crate::options::Options;
use serde::Serialize;
use std::fmt;
use std::sync::{Condvar, Mutex, PoisonError};

/// Callback invoked once when a process terminates, with its exit code if known
pub type ExitListener = Box<dyn FnOnce(Option<i32>) + Send>;

/// A class of interchangeable members sharing one launch configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Role {
    name: String,
}

impl Role {
    /// Create a role
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Role name, used as the member name prefix unless a display name is given
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A live process produced by a [`Platform`]
///
/// Implementations must invoke every listener registered through
/// [`ProcessHandle::on_exit`] exactly once, either when the process is observed
/// to terminate or before [`ProcessHandle::close`] returns. A listener registered
/// after termination is invoked immediately.
pub trait ProcessHandle: Send + Sync {
    /// Operating system process id, if there is one
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Whether the process is still running and not being closed
    fn is_operational(&self) -> bool;

    /// Terminate the process
    fn close(&self, options: &Options) -> Result<()>;

    /// Block until the process has terminated and return its exit code
    fn wait_for(&self) -> Result<i32>;

    /// Register a termination listener
    fn on_exit(&self, listener: ExitListener);
}

/// Something that can launch processes
pub trait Platform: Send + Sync {
    /// Platform name, used in logs
    fn name(&self) -> &str;

    /// Launch one process for `role` named `name`.
    ///
    /// A launch either returns a running handle or an error; it never leaves a
    /// half-started process behind.
    fn launch(&self, name: &str, role: &Role, options: &Options) -> Result<Box<dyn ProcessHandle>>;
}

#[derive(Default)]
struct NotifierState {
    exited: Option<Option<i32>>,
    delivered: bool,
    listeners: Vec<ExitListener>,
}

/// Exit listener bookkeeping shared by process handle implementations
#[derive(Default)]
pub struct ExitNotifier {
    state: Mutex<NotifierState>,
    delivered: Condvar,
}

impl ExitNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, invoking it right away if the exit was already seen
    pub fn subscribe(&self, listener: ExitListener) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.exited {
            Some(code) => {
                drop(state);
                listener(code);
            }
            None => state.listeners.push(listener),
        }
    }

    /// Record the exit and run the listeners; returns false if already notified.
    ///
    /// Either way, every listener has run by the time this returns, even when
    /// another thread is the one delivering the notification.
    pub fn notify(&self, code: Option<i32>) -> bool {
        let listeners = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.exited.is_some() {
                drop(state);
                self.wait_delivered();
                return false;
            }
            state.exited = Some(code);
            std::mem::take(&mut state.listeners)
        };

        for listener in listeners {
            listener(code);
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.delivered = true;
        self.delivered.notify_all();

        true
    }

    /// Block until the listeners of a recorded exit have all run
    pub fn wait_delivered(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.exited.is_some() && !state.delivered {
            state = self
                .delivered
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Whether the exit has been recorded
    pub fn has_exited(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exited
            .is_some()
    }

    /// Recorded exit code, if the exit was seen and the code is known
    pub fn exit_code(&self) -> Option<i32> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exited
            .flatten()
    }
}
