//! Local process platform
//!
//! Launches members as child processes of the current process. Each child is
//! watched on its own thread so that a process dying outside of the engine's
//! control is reported through the handle's exit listeners.

use super::{ExitListener, ExitNotifier, Platform, ProcessHandle, Role};
use crate::error::{EnsembleError, Result};
use crate::options::{
    Arguments, ClusterName, ClusterPort, Discriminator, EnvironmentVariables, Executable,
    GracePeriod, Options, WorkingDirectory,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Interval at which child processes are polled for termination
const WATCH_INTERVAL: Duration = Duration::from_millis(50);

/// Environment variable carrying the member name
pub const MEMBER_NAME_ENV: &str = "ENSEMBLE_MEMBER_NAME";
/// Environment variable carrying the member's discriminator
pub const MEMBER_INDEX_ENV: &str = "ENSEMBLE_MEMBER_INDEX";
/// Environment variable carrying the role name
pub const ROLE_ENV: &str = "ENSEMBLE_ROLE";
/// Environment variable carrying the cluster name
pub const CLUSTER_NAME_ENV: &str = "ENSEMBLE_CLUSTER_NAME";
/// Environment variable carrying the shared cluster port
pub const CLUSTER_PORT_ENV: &str = "ENSEMBLE_CLUSTER_PORT";

/// Process configuration derived from launch options
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Program to execute
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
}

impl ProcessConfig {
    /// Create a new process config for the given program
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Add an argument
    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    /// Build the process config for member `name` of `role`
    pub fn from_options(name: &str, role: &Role, options: &Options) -> Result<Self> {
        let program = options.get::<Executable>().ok_or_else(|| {
            EnsembleError::InvalidConfig(format!("no executable configured for role {}", role))
        })?;

        let mut config = Self::new(&program.0)
            .env(MEMBER_NAME_ENV, name)
            .env(ROLE_ENV, role.name());

        if let Some(args) = options.get::<Arguments>() {
            config.args.extend(args.values().iter().cloned());
        }

        if let Some(env) = options.get::<EnvironmentVariables>() {
            for (key, value) in env.iter() {
                config.env.insert(key.clone(), value.clone());
            }
        }

        if let Some(Discriminator(index)) = options.get::<Discriminator>() {
            config = config.env(MEMBER_INDEX_ENV, &index.to_string());
        }

        if let Some(ClusterName(cluster)) = options.get::<ClusterName>() {
            config = config.env(CLUSTER_NAME_ENV, &cluster);
        }

        if let Some(ClusterPort(port)) = options.get::<ClusterPort>() {
            config = config.env(CLUSTER_PORT_ENV, &port.get()?.to_string());
        }

        if let Some(WorkingDirectory(dir)) = options.get::<WorkingDirectory>() {
            config = config.cwd(dir);
        }

        Ok(config)
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null());

        if let Some(ref cwd) = self.cwd {
            command.current_dir(cwd);
        }

        command
    }
}

/// Platform launching members as local child processes
pub struct LocalPlatform {
    name: String,
}

impl LocalPlatform {
    /// Create a local platform
    pub fn new() -> Self {
        Self {
            name: "local".to_string(),
        }
    }
}

impl Default for LocalPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for LocalPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&self, name: &str, role: &Role, options: &Options) -> Result<Box<dyn ProcessHandle>> {
        let config = ProcessConfig::from_options(name, role, options)
            .map_err(|e| EnsembleError::launch(name, e))?;

        let child = config.command().spawn().map_err(|e| {
            EnsembleError::launch(name, format!("failed to spawn {}: {}", config.program, e))
        })?;

        let pid = child.id();
        let state = Arc::new(ProcessState {
            name: name.to_string(),
            pid,
            child: Mutex::new(child),
            notifier: ExitNotifier::new(),
            closing: AtomicBool::new(false),
        });

        let watched = Arc::clone(&state);
        let watcher = thread::Builder::new()
            .name(format!("ensemble-watch-{}", name))
            .spawn(move || watch(watched));

        if let Err(e) = watcher {
            if let Ok(mut child) = state.child.lock() {
                let _ = child.kill();
                let _ = child.wait();
            }
            return Err(EnsembleError::launch(name, format!("failed to watch process: {}", e)));
        }

        tracing::info!("Launched {} (pid {}) on {}", name, pid, self.name);

        Ok(Box::new(LocalProcess { state }))
    }
}

struct ProcessState {
    name: String,
    pid: u32,
    child: Mutex<Child>,
    notifier: ExitNotifier,
    closing: AtomicBool,
}

impl ProcessState {
    /// Check whether the child has exited, recording the exit if it has
    fn refresh(&self) -> Result<Option<i32>> {
        let status = {
            let mut child = self
                .child
                .lock()
                .map_err(|_| EnsembleError::Lock("Failed to acquire process lock".to_string()))?;
            child.try_wait()?
        };

        Ok(status.map(|status| {
            let code = exit_code(status);
            self.notifier.notify(Some(code));
            code
        }))
    }

    /// Ask the process to terminate
    fn terminate(&self) {
        #[cfg(unix)]
        {
            let result = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
            if result != 0 {
                tracing::debug!(
                    "SIGTERM to {} (pid {}) failed: {}",
                    self.name,
                    self.pid,
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    /// Kill the process and reap it
    fn force_kill(&self) -> Result<i32> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| EnsembleError::Lock("Failed to acquire process lock".to_string()))?;

        if let Some(status) = child.try_wait()? {
            return Ok(exit_code(status));
        }

        child
            .kill()
            .map_err(|e| EnsembleError::Process(format!("Failed to kill {}: {}", self.name, e)))?;
        let status = child.wait()?;

        Ok(exit_code(status))
    }
}

fn watch(state: Arc<ProcessState>) {
    loop {
        if state.notifier.has_exited() {
            break;
        }

        match state.refresh() {
            Ok(Some(code)) => {
                if !state.closing.load(Ordering::SeqCst) {
                    tracing::warn!("{} (pid {}) exited with code {}", state.name, state.pid, code);
                }
                break;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Lost track of {} (pid {}): {}", state.name, state.pid, e);
                state.notifier.notify(None);
                break;
            }
        }

        thread::sleep(WATCH_INTERVAL);
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Handle to a process launched by [`LocalPlatform`]
pub struct LocalProcess {
    state: Arc<ProcessState>,
}

impl ProcessHandle for LocalProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.state.pid)
    }

    fn is_operational(&self) -> bool {
        if self.state.closing.load(Ordering::SeqCst) || self.state.notifier.has_exited() {
            return false;
        }
        matches!(self.state.refresh(), Ok(None))
    }

    fn close(&self, options: &Options) -> Result<()> {
        if self.state.notifier.has_exited() {
            self.state.notifier.wait_delivered();
            return Ok(());
        }

        self.state.closing.store(true, Ordering::SeqCst);

        let grace = options
            .get::<GracePeriod>()
            .map(|GracePeriod(grace)| grace)
            .unwrap_or_default();
        let deadline = Instant::now() + grace;

        self.state.terminate();

        loop {
            if self.state.refresh()?.is_some() {
                tracing::debug!("{} (pid {}) terminated", self.state.name, self.state.pid);
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(WATCH_INTERVAL.min(deadline - now));
        }

        tracing::warn!(
            "{} (pid {}) did not terminate within {:?}, killing it",
            self.state.name,
            self.state.pid,
            grace
        );

        let code = self.state.force_kill()?;
        self.state.notifier.notify(Some(code));

        Ok(())
    }

    fn wait_for(&self) -> Result<i32> {
        loop {
            if self.state.notifier.has_exited() {
                self.state.notifier.wait_delivered();
                return Ok(self.state.notifier.exit_code().unwrap_or(-1));
            }

            if let Some(code) = self.state.refresh()? {
                return Ok(code);
            }

            thread::sleep(WATCH_INTERVAL);
        }
    }

    fn on_exit(&self, listener: ExitListener) {
        self.state.notifier.subscribe(listener);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn shell(script: &str) -> Options {
        Options::empty()
            .with(Executable::named("/bin/sh"))
            .with(Arguments::of(["-c", script]))
    }

    #[test]
    fn test_process_config_from_options() {
        let options = shell("true")
            .with(Discriminator(2))
            .with(ClusterName::of("grid"))
            .with(EnvironmentVariables::empty().set("MODE", "storage"));

        let config = ProcessConfig::from_options("storage-2", &Role::new("storage"), &options).unwrap();

        assert_eq!(config.program, "/bin/sh");
        assert_eq!(config.args, vec!["-c", "true"]);
        assert_eq!(config.env.get(MEMBER_NAME_ENV).unwrap(), "storage-2");
        assert_eq!(config.env.get(MEMBER_INDEX_ENV).unwrap(), "2");
        assert_eq!(config.env.get(CLUSTER_NAME_ENV).unwrap(), "grid");
        assert_eq!(config.env.get("MODE").unwrap(), "storage");
    }

    #[test]
    fn test_missing_executable_is_a_launch_error() {
        let platform = LocalPlatform::new();
        let result = platform.launch("web-1", &Role::new("web"), &Options::empty());

        assert!(matches!(result, Err(EnsembleError::Launch { ref member, .. }) if member == "web-1"));
    }

    #[test]
    fn test_unknown_program_is_a_launch_error() {
        let platform = LocalPlatform::new();
        let options = Options::empty().with(Executable::named("/nonexistent/ensemble-test-binary"));

        assert!(platform.launch("web-1", &Role::new("web"), &options).is_err());
    }

    #[test]
    fn test_exit_code_and_listener() {
        let platform = LocalPlatform::new();
        let handle = platform.launch("job-1", &Role::new("job"), &shell("exit 3")).unwrap();

        let (tx, rx) = mpsc::channel();
        handle.on_exit(Box::new(move |code| {
            let _ = tx.send(code);
        }));

        assert_eq!(handle.wait_for().unwrap(), 3);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(3));
        assert!(!handle.is_operational());
    }

    #[test]
    fn test_member_environment_reaches_child() {
        let platform = LocalPlatform::new();
        let options = shell("test \"$ENSEMBLE_MEMBER_NAME\" = \"worker-1\" && test \"$ENSEMBLE_ROLE\" = \"worker\"");
        let handle = platform.launch("worker-1", &Role::new("worker"), &options).unwrap();

        assert_eq!(handle.wait_for().unwrap(), 0);
    }

    #[test]
    fn test_working_directory() {
        let temp = tempdir().unwrap();
        let platform = LocalPlatform::new();
        let options = shell("touch marker").with(WorkingDirectory(temp.path().to_path_buf()));

        let handle = platform.launch("writer-1", &Role::new("writer"), &options).unwrap();

        assert_eq!(handle.wait_for().unwrap(), 0);
        assert!(temp.path().join("marker").exists());
    }

    #[test]
    fn test_close_notifies_before_returning() {
        let platform = LocalPlatform::new();
        let handle = platform.launch("sleeper-1", &Role::new("sleeper"), &shell("exec sleep 30")).unwrap();
        assert!(handle.is_operational());

        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        handle.on_exit(Box::new(move |_| flag.store(true, Ordering::SeqCst)));

        handle
            .close(&Options::empty().with(GracePeriod(Duration::from_secs(2))))
            .unwrap();

        assert!(closed.load(Ordering::SeqCst));
        assert!(!handle.is_operational());
        assert_eq!(handle.wait_for().unwrap(), 128 + libc::SIGTERM);
    }

    #[test]
    fn test_close_kills_after_grace_period() {
        let platform = LocalPlatform::new();
        let options = shell("trap '' TERM; while true; do sleep 1; done");
        let handle = platform.launch("stubborn-1", &Role::new("stubborn"), &options).unwrap();

        // give the shell time to install its trap
        thread::sleep(Duration::from_millis(200));

        handle
            .close(&Options::empty().with(GracePeriod(Duration::from_millis(200))))
            .unwrap();

        assert!(!handle.is_operational());
        assert_eq!(handle.wait_for().unwrap(), 128 + libc::SIGKILL);
    }
}
