//! Running root-only shell snippets with a bounded timeout
//!
//! Boot artifacts and driver teardown need root. When the process already runs
//! as root (the daemon), snippets run directly. Otherwise a non-interactive
//! `sudo -n` is preferred and `pkexec` is the prompting fallback.

use crate::errors::{GpuControlError, Result};
use log::{debug, info, warn};
use std::fs;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of a finished privileged job
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes shell snippets with root privileges
pub trait PrivilegedExecutor: Send + Sync {
    fn run(&self, script: &str, timeout: Duration) -> Result<CommandOutput>;
}

/// How to gain root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// Already privileged, or running against a test tree
    Direct,
    /// Non-interactive sudo, no prompt
    Sudo,
    /// Polkit prompt
    Pkexec,
}

impl Elevation {
    /// Pick the least intrusive method available to this process
    pub fn detect() -> Self {
        if running_as_root() {
            Self::Direct
        } else if sudo_available() {
            Self::Sudo
        } else {
            Self::Pkexec
        }
    }

    fn command(self, script: &str) -> Command {
        let mut cmd = match self {
            Self::Direct => Command::new("sh"),
            Self::Sudo => {
                let mut cmd = Command::new("sudo");
                cmd.args(["-n", "sh"]);
                cmd
            }
            Self::Pkexec => {
                let mut cmd = Command::new("pkexec");
                cmd.arg("sh");
                cmd
            }
        };
        cmd.args(["-c", script]);
        cmd
    }
}

fn running_as_root() -> bool {
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|line| line.starts_with("Uid:"))
                .and_then(|line| line.split_whitespace().nth(2).map(|euid| euid == "0"))
        })
        .unwrap_or(false)
}

fn sudo_available() -> bool {
    static SUDO: OnceLock<bool> = OnceLock::new();
    *SUDO.get_or_init(|| {
        Command::new("sudo")
            .args(["-n", "true"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    })
}

/// A spawned privileged process with its output readers
pub struct PrivilegedJob {
    child: Child,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

impl PrivilegedJob {
    pub fn spawn(mut command: Command) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        Ok(Self {
            child,
            stdout,
            stderr,
        })
    }

    /// Wait up to `timeout`, killing the process when it overruns.
    /// A timeout too large to represent waits without a deadline.
    pub fn wait(mut self, timeout: Duration) -> Result<CommandOutput> {
        let deadline = Instant::now().checked_add(timeout);
        let status = loop {
            if let Some(status) = self.child.try_wait()? {
                break status;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!("Privileged job exceeded {:?}, killing pid {}", timeout, self.child.id());
                let _ = self.child.kill();
                let _ = self.child.wait();
                return Err(GpuControlError::PrivilegedTimeout(timeout));
            }
            thread::sleep(POLL_INTERVAL);
        };

        Ok(CommandOutput {
            code: status.code(),
            stdout: join_reader(self.stdout.take()),
            stderr: join_reader(self.stderr.take()),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = reader.read_to_string(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Executor backed by real processes
pub struct SystemExecutor {
    elevation: Elevation,
}

impl SystemExecutor {
    pub fn new(elevation: Elevation) -> Self {
        Self { elevation }
    }

    pub fn detect() -> Self {
        let elevation = Elevation::detect();
        info!("Privileged operations will use {:?}", elevation);
        Self::new(elevation)
    }
}

impl PrivilegedExecutor for SystemExecutor {
    fn run(&self, script: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!("Running privileged script via {:?}:\n{}", self.elevation, script);
        let job = PrivilegedJob::spawn(self.elevation.command(script))?;
        let output = job.wait(timeout)?;
        if !output.stderr.trim().is_empty() {
            debug!("Privileged script stderr: {}", output.stderr.trim());
        }
        Ok(output)
    }
}

/// Quote a value for inclusion in a POSIX shell snippet
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_job_captures_output() {
        let executor = SystemExecutor::new(Elevation::Direct);
        let output = executor
            .run("echo out; echo err >&2; exit 3", Duration::from_secs(10))
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn test_job_timeout_kills_process() {
        let executor = SystemExecutor::new(Elevation::Direct);
        let started = Instant::now();
        let result = executor.run("sleep 5", Duration::from_millis(200));
        assert!(matches!(result, Err(GpuControlError::PrivilegedTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_unrepresentable_timeout_waits_for_exit() {
        let executor = SystemExecutor::new(Elevation::Direct);
        let output = executor.run("exit 0", Duration::MAX).unwrap();
        assert!(output.success());

        let config_timeout = Duration::from_secs(u64::MAX);
        let output = executor.run("echo done", config_timeout).unwrap();
        assert_eq!(output.stdout.trim(), "done");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/modprobe.d/x.conf"), "'/etc/modprobe.d/x.conf'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
