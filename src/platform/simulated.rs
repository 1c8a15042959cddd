//! In-memory platform
//!
//! Members launched here are not real processes: they run until closed or
//! crashed through [`SimulatedPlatform::crash`]. Launch and close failures can
//! be scripted, which makes the platform useful for rehearsing orchestration
//! (`ensemble --simulate`) and for tests.

use super::{ExitListener, ExitNotifier, Platform, ProcessHandle, Role};
use crate::error::{EnsembleError, Result};
use crate::options::Options;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

const WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Exit code reported for a simulated process that was closed
pub const CLOSED_EXIT_CODE: i32 = 0;

struct SimulatedProcess {
    name: String,
    running: AtomicBool,
    notifier: ExitNotifier,
    fail_close: bool,
}

impl SimulatedProcess {
    fn stop(&self, code: i32) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.notify(Some(code));
    }
}

#[derive(Default)]
struct SimulatedState {
    launches: usize,
    processes: Vec<Arc<SimulatedProcess>>,
    failing_roles: HashSet<String>,
    failing_launches: HashSet<usize>,
    failing_closes: HashSet<String>,
}

/// Platform that launches simulated processes
#[derive(Default)]
pub struct SimulatedPlatform {
    state: Mutex<SimulatedState>,
}

impl SimulatedPlatform {
    /// Create a simulated platform
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every launch of `role` fail
    pub fn fail_role(&self, role: &str) -> &Self {
        self.state().failing_roles.insert(role.to_string());
        self
    }

    /// Make the `n`th launch (1-based, counted over the platform's lifetime) fail
    pub fn fail_launch(&self, n: usize) -> &Self {
        self.state().failing_launches.insert(n);
        self
    }

    /// Make closing the member called `name` fail, leaving it running
    pub fn fail_close(&self, name: &str) -> &Self {
        self.state().failing_closes.insert(name.to_string());
        self
    }

    /// Number of launch attempts so far, failed ones included
    pub fn launch_attempts(&self) -> usize {
        self.state().launches
    }

    /// Names of every successfully launched process, in launch order
    pub fn launched(&self) -> Vec<String> {
        self.state().processes.iter().map(|p| p.name.clone()).collect()
    }

    /// Names of the processes still running
    pub fn running(&self) -> Vec<String> {
        self.state()
            .processes
            .iter()
            .filter(|p| p.running.load(Ordering::SeqCst))
            .map(|p| p.name.clone())
            .collect()
    }

    /// Number of processes still running
    pub fn running_count(&self) -> usize {
        self.running().len()
    }

    /// Terminate a running process as if it died outside the engine's control.
    ///
    /// Returns false when no running process has that name.
    pub fn crash(&self, name: &str, exit_code: i32) -> bool {
        let process = self
            .state()
            .processes
            .iter()
            .rev()
            .find(|p| p.name == name && p.running.load(Ordering::SeqCst))
            .cloned();

        match process {
            Some(process) => {
                tracing::warn!("Simulated process {} crashed with code {}", name, exit_code);
                process.stop(exit_code);
                true
            }
            None => false,
        }
    }
}

impl Platform for SimulatedPlatform {
    fn name(&self) -> &str {
        "simulated"
    }

    fn launch(&self, name: &str, role: &Role, _options: &Options) -> Result<Box<dyn ProcessHandle>> {
        let mut state = self.state();
        state.launches += 1;

        if state.failing_roles.contains(role.name()) || state.failing_launches.contains(&state.launches) {
            return Err(EnsembleError::launch(name, "simulated launch failure"));
        }

        let process = Arc::new(SimulatedProcess {
            name: name.to_string(),
            running: AtomicBool::new(true),
            notifier: ExitNotifier::new(),
            fail_close: state.failing_closes.contains(name),
        });
        state.processes.push(Arc::clone(&process));

        tracing::debug!("Launched simulated process {}", name);

        Ok(Box::new(SimulatedHandle { process }))
    }
}

struct SimulatedHandle {
    process: Arc<SimulatedProcess>,
}

impl ProcessHandle for SimulatedHandle {
    fn is_operational(&self) -> bool {
        self.process.running.load(Ordering::SeqCst)
    }

    fn close(&self, _options: &Options) -> Result<()> {
        if self.process.fail_close {
            return Err(EnsembleError::Process(format!(
                "simulated close failure for {}",
                self.process.name
            )));
        }

        self.process.stop(CLOSED_EXIT_CODE);
        Ok(())
    }

    fn wait_for(&self) -> Result<i32> {
        loop {
            if self.process.notifier.has_exited() {
                self.process.notifier.wait_delivered();
                return Ok(self.process.notifier.exit_code().unwrap_or(-1));
            }
            thread::sleep(WAIT_INTERVAL);
        }
    }

    fn on_exit(&self, listener: ExitListener) {
        self.process.notifier.subscribe(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_and_close() {
        let platform = SimulatedPlatform::new();
        let handle = platform.launch("web-1", &Role::new("web"), &Options::empty()).unwrap();

        assert!(handle.is_operational());
        assert_eq!(platform.running(), vec!["web-1"]);

        handle.close(&Options::empty()).unwrap();

        assert!(!handle.is_operational());
        assert_eq!(handle.wait_for().unwrap(), CLOSED_EXIT_CODE);
        assert_eq!(platform.running_count(), 0);
        assert_eq!(platform.launched(), vec!["web-1"]);
    }

    #[test]
    fn test_scripted_launch_failures() {
        let platform = SimulatedPlatform::new();
        platform.fail_role("broken").fail_launch(2);

        assert!(platform.launch("ok-1", &Role::new("ok"), &Options::empty()).is_ok());
        assert!(platform.launch("ok-2", &Role::new("ok"), &Options::empty()).is_err());
        assert!(platform.launch("broken-1", &Role::new("broken"), &Options::empty()).is_err());
        assert!(platform.launch("ok-3", &Role::new("ok"), &Options::empty()).is_ok());

        assert_eq!(platform.launch_attempts(), 4);
        assert_eq!(platform.launched(), vec!["ok-1", "ok-3"]);
    }

    #[test]
    fn test_crash_fires_listener() {
        let platform = SimulatedPlatform::new();
        let handle = platform.launch("db-1", &Role::new("db"), &Options::empty()).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        handle.on_exit(Box::new(move |code| {
            *slot.lock().unwrap() = code;
        }));

        assert!(platform.crash("db-1", 137));
        assert!(!platform.crash("db-1", 137));

        assert_eq!(*seen.lock().unwrap(), Some(137));
        assert_eq!(handle.wait_for().unwrap(), 137);
    }

    #[test]
    fn test_failing_close_leaves_process_running() {
        let platform = SimulatedPlatform::new();
        platform.fail_close("db-1");
        let handle = platform.launch("db-1", &Role::new("db"), &Options::empty()).unwrap();

        assert!(handle.close(&Options::empty()).is_err());
        assert!(handle.is_operational());
    }
}
