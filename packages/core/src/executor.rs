//! Command execution with privilege escalation and busy-aware retry.
//!
//! Every external tool (`lsblk`, `cryptsetup`, `mount`, `umount`, `bindfs`,
//! `truncate`, `mkfs.*`) is invoked through a [`CommandRunner`] with an
//! explicit argument vector; nothing is interpolated by a shell.

use std::fmt;
use std::io::Write;
use std::process::{Command, Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IoResultExt, Result};

/// Substring of stderr that marks a failure as transient.
pub const BUSY_MARKER: &str = "busy";

/// Privilege escalation method for executing commands that require root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeEscalation {
    /// Execute directly without privilege escalation.
    #[default]
    None,
    /// Use `pkexec` for GUI-based privilege escalation (polkit).
    Pkexec,
    /// Use `sudo` for TTY-based privilege escalation.
    Sudo,
}

impl PrivilegeEscalation {
    fn wrapper(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Pkexec => Some("pkexec"),
            Self::Sudo => Some("sudo"),
        }
    }
}

/// Captured result of one command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Returns true if the failure looks transient ("device or resource busy").
    pub fn is_busy(&self) -> bool {
        self.stderr.to_ascii_lowercase().contains(BUSY_MARKER)
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Executes external commands.
///
/// The seam exists so the orchestration logic can be driven by scripted
/// outcomes in tests.
pub trait CommandRunner {
    /// Runs `argv[0]` with the remaining arguments, writing `input` to stdin.
    fn run(&self, argv: &[String], input: Option<&str>) -> Result<CommandOutput>;

    /// Pauses between busy retries.
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    fn run(&self, argv: &[String], input: Option<&str>) -> Result<CommandOutput> {
        (**self).run(argv, input)
    }

    fn sleep(&self, delay: Duration) {
        (**self).sleep(delay)
    }
}

/// Runs commands on the local system, optionally wrapped by `sudo`/`pkexec`.
///
/// # Example
///
/// ```
/// use luks_tray_core::executor::{PrivilegeEscalation, SystemRunner};
///
/// let runner = SystemRunner::default();
/// assert_eq!(runner.escalation(), PrivilegeEscalation::None);
///
/// let tty_runner = SystemRunner::with_sudo();
/// assert_eq!(tty_runner.escalation(), PrivilegeEscalation::Sudo);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    escalation: PrivilegeEscalation,
}

impl SystemRunner {
    /// Creates a runner that uses `pkexec` for every command.
    pub fn with_pkexec() -> Self {
        Self::with_escalation(PrivilegeEscalation::Pkexec)
    }

    /// Creates a runner that uses `sudo` for every command.
    pub fn with_sudo() -> Self {
        Self::with_escalation(PrivilegeEscalation::Sudo)
    }

    /// Creates a runner with a specific escalation method.
    pub fn with_escalation(escalation: PrivilegeEscalation) -> Self {
        Self { escalation }
    }

    /// Returns the current privilege escalation method.
    pub fn escalation(&self) -> PrivilegeEscalation {
        self.escalation
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[String], input: Option<&str>) -> Result<CommandOutput> {
        let (program, args) = match argv.split_first() {
            Some(split) => split,
            None => snafu::whatever!("empty command line"),
        };
        let line = argv.join(" ");

        let mut command = match self.escalation.wrapper() {
            Some(wrapper) => {
                let mut command = Command::new(wrapper);
                command.arg(program);
                command
            }
            None => Command::new(program),
        };
        command
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().command_context(&line)?;
        if let Some(payload) = input
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin.write_all(payload.as_bytes()).command_context(&line)?;
            // stdin drops here so the child sees EOF
        }

        let output = child.wait_with_output().command_context(&line)?;
        Ok(CommandOutput::from(output))
    }
}

/// Bounded retry for commands that fail with a transient busy signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retry.
    pub const ONCE: RetryPolicy = RetryPolicy {
        retries: 0,
        delay: Duration::ZERO,
    };

    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// A failed command, formatted as one line for the user-facing error list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub command: String,
    pub output: CommandOutput,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FAIL: {}: {} {} [rc={}]",
            self.command,
            self.output.stdout.trim_end(),
            self.output.stderr.trim_end(),
            self.output.code
        )
    }
}

impl std::error::Error for CommandFailure {}

/// Runs a command once.
pub fn run_cmd(
    runner: &dyn CommandRunner,
    argv: &[String],
    input: Option<&str>,
) -> std::result::Result<(), CommandFailure> {
    rerun_if_busy(runner, argv, input, RetryPolicy::ONCE)
}

/// Runs a command, retrying while it fails with a busy signal.
///
/// Up to `policy.retries + 1` attempts are made with `policy.delay` between
/// them. A non-busy failure stops immediately. A command that cannot be
/// spawned at all is reported with `rc=-1` and never retried.
pub fn rerun_if_busy(
    runner: &dyn CommandRunner,
    argv: &[String],
    input: Option<&str>,
    policy: RetryPolicy,
) -> std::result::Result<(), CommandFailure> {
    let command = argv.join(" ");
    let mut last = CommandOutput::default();

    for attempt in 0..=policy.retries {
        if attempt > 0 {
            warn!(%command, attempt, "device busy, retrying");
            runner.sleep(policy.delay);
        }
        debug!(%command, attempt, "running");

        last = match runner.run(argv, input) {
            Ok(output) => output,
            Err(e) => {
                return Err(CommandFailure {
                    command,
                    output: CommandOutput {
                        code: -1,
                        stdout: String::new(),
                        stderr: e.to_string(),
                    },
                });
            }
        };

        if last.success() {
            return Ok(());
        }
        if !last.is_busy() {
            break;
        }
    }

    Err(CommandFailure {
        command,
        output: last,
    })
}

/// Builds an owned argument vector from string-like parts.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::{CommandOutput, CommandRunner};
    use crate::error::Result;

    /// Scripted runner: pops queued outputs for commands whose line starts
    /// with a registered prefix, succeeds otherwise.
    #[derive(Default)]
    pub(crate) struct FakeRunner {
        pub(crate) scripts: Mutex<Vec<(String, VecDeque<CommandOutput>)>>,
        pub(crate) calls: Mutex<Vec<(String, Option<String>)>>,
        pub(crate) sleeps: Mutex<Vec<Duration>>,
    }

    impl FakeRunner {
        pub(crate) fn script(&self, prefix: &str, outputs: Vec<CommandOutput>) {
            self.scripts
                .lock()
                .unwrap()
                .push((prefix.to_string(), outputs.into_iter().collect()));
        }

        pub(crate) fn lines(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(l, _)| l.clone())
                .collect()
        }

        pub(crate) fn count(&self, prefix: &str) -> usize {
            self.lines().iter().filter(|l| l.starts_with(prefix)).count()
        }

        pub(crate) fn input_of(&self, prefix: &str) -> Option<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|(l, _)| l.starts_with(prefix))
                .and_then(|(_, input)| input.clone())
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, argv: &[String], input: Option<&str>) -> Result<CommandOutput> {
            let line = argv.join(" ");
            self.calls
                .lock()
                .unwrap()
                .push((line.clone(), input.map(str::to_string)));
            for (prefix, queue) in self.scripts.lock().unwrap().iter_mut() {
                if line.starts_with(prefix.as_str())
                    && let Some(output) = queue.pop_front()
                {
                    return Ok(output);
                }
            }
            Ok(CommandOutput::default())
        }

        fn sleep(&self, delay: Duration) {
            self.sleeps.lock().unwrap().push(delay);
        }
    }

    pub(crate) fn busy() -> CommandOutput {
        CommandOutput {
            code: 32,
            stdout: String::new(),
            stderr: "umount: /mnt/x: target is busy.".to_string(),
        }
    }

    pub(crate) fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeRunner, busy, failed};
    use super::*;

    #[test]
    fn test_default_runner() {
        let runner = SystemRunner::default();
        assert_eq!(runner.escalation(), PrivilegeEscalation::None);
        assert_eq!(
            SystemRunner::with_pkexec().escalation(),
            PrivilegeEscalation::Pkexec
        );
    }

    #[test]
    fn test_busy_then_success_after_three_retries() {
        let runner = FakeRunner::default();
        runner.script("umount", vec![busy(), busy(), busy()]);
        let policy = RetryPolicy::new(3, Duration::from_millis(500));

        let res = rerun_if_busy(&runner, &argv(["umount", "/mnt/x"]), None, policy);

        assert!(res.is_ok());
        assert_eq!(runner.count("umount"), 4);
        assert_eq!(*runner.sleeps.lock().unwrap(), vec![Duration::from_millis(500); 3]);
    }

    #[test]
    fn test_non_busy_failure_runs_once() {
        let runner = FakeRunner::default();
        runner.script("umount", vec![failed("umount: /mnt/x: not mounted.")]);

        let err = rerun_if_busy(
            &runner,
            &argv(["umount", "/mnt/x"]),
            None,
            RetryPolicy::default(),
        )
        .unwrap_err();

        assert_eq!(runner.count("umount"), 1);
        assert!(runner.sleeps.lock().unwrap().is_empty());
        assert_eq!(
            err.to_string(),
            "FAIL: umount /mnt/x:  umount: /mnt/x: not mounted. [rc=1]"
        );
    }

    #[test]
    fn test_busy_exhausted_reports_last_output() {
        let runner = FakeRunner::default();
        runner.script("umount", vec![busy(); 5]);

        let err = rerun_if_busy(
            &runner,
            &argv(["umount", "/mnt/x"]),
            None,
            RetryPolicy::new(2, Duration::from_millis(10)),
        )
        .unwrap_err();

        assert_eq!(runner.count("umount"), 3);
        assert_eq!(err.output.code, 32);
        assert!(err.to_string().contains("target is busy"));
    }

    #[test]
    fn test_run_cmd_passes_input() {
        let runner = FakeRunner::default();
        run_cmd(&runner, &argv(["cryptsetup", "luksOpen"]), Some("pw")).unwrap();
        assert_eq!(runner.input_of("cryptsetup").as_deref(), Some("pw"));
    }

    #[test]
    fn test_is_busy_case_insensitive() {
        let output = CommandOutput {
            code: 5,
            stdout: String::new(),
            stderr: "Device or resource BUSY".to_string(),
        };
        assert!(output.is_busy());
        assert!(!failed("No key available").is_busy());
    }

    #[test]
    fn test_system_runner_spawn_failure_is_reported() {
        let runner = SystemRunner::default();
        let err = run_cmd(
            &runner,
            &argv(["/nonexistent/luks-tray-test-binary"]),
            None,
        )
        .unwrap_err();
        assert_eq!(err.output.code, -1);
    }
}
