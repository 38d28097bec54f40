//! Raster tool invocation.
//!
//! Runs `<tool> -script <path>` as a child process with no shell in between,
//! so nicknames and other user text embedded in the script never reach a
//! command line. Every outcome, including spawn failures and timeouts, is
//! reported through [`ExecutionResult`] instead of an error.

use serde::Serialize;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Time a timed-out process gets between the terminate and kill signals.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for pipe readers once the process is gone.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Exit code reported when the process produced none (spawn failure, signal).
pub const NO_EXIT_CODE: i32 = -1;

/// Outcome of one raster tool run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Known failure signatures of the raster tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ToolErrorKind {
    Timeout,
    FileNotFound,
    ScriptSyntax,
    Permission,
    Unknown,
}

impl ToolErrorKind {
    pub fn user_message(self) -> &'static str {
        match self {
            ToolErrorKind::Timeout => "Memorial card generation timed out",
            ToolErrorKind::FileNotFound => "A file required for the memorial card could not be found",
            ToolErrorKind::ScriptSyntax => "The raster tool rejected the generated compositing script",
            ToolErrorKind::Permission => "Permission denied while generating the memorial card",
            ToolErrorKind::Unknown => "Memorial card generation failed",
        }
    }
}

/// Advisory classification of a tool failure, used for user-facing messages only.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorClassification {
    pub kind: ToolErrorKind,
    pub message: String,
    pub details: String,
}

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout"];
const FILE_NOT_FOUND_PATTERNS: &[&str] = &[
    "no such file",
    "unable to open",
    "cannot find",
    "not found",
    "does not exist",
];
const SCRIPT_SYNTAX_PATTERNS: &[&str] = &[
    "unrecognized option",
    "unable to parse",
    "syntax error",
    "invalid argument",
    "missing an image filename",
];
const PERMISSION_PATTERNS: &[&str] = &["permission denied", "access denied", "not authorized"];

/// Match `stderr` (case-insensitively) against known failure signatures.
pub fn classify_error(stderr: &str) -> ErrorClassification {
    let lower = stderr.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    let kind = if matches(TIMEOUT_PATTERNS) {
        ToolErrorKind::Timeout
    } else if matches(FILE_NOT_FOUND_PATTERNS) {
        ToolErrorKind::FileNotFound
    } else if matches(SCRIPT_SYNTAX_PATTERNS) {
        ToolErrorKind::ScriptSyntax
    } else if matches(PERMISSION_PATTERNS) {
        ToolErrorKind::Permission
    } else {
        ToolErrorKind::Unknown
    };

    ErrorClassification {
        kind,
        message: kind.user_message().to_string(),
        details: stderr.to_string(),
    }
}

/// Runs the raster tool against generated script files.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    base_args: Vec<String>,
    timeout: Duration,
    kill_grace: Duration,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            timeout,
            kill_grace: KILL_GRACE,
        }
    }

    /// Arguments placed before `-script <path>`.
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `<program> [base args] -script <script_path>`.
    pub async fn run(&self, script_path: &Path) -> ExecutionResult {
        let start = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("-script")
            .arg(script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout takes down anything the tool forked.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(program = %self.program, error = %err, "Failed to spawn raster tool");
                return ExecutionResult {
                    success: false,
                    stdout: String::new(),
                    stderr: format!("Failed to spawn '{}': {}", self.program, err),
                    exit_code: NO_EXIT_CODE,
                    duration_ms: elapsed_ms(start),
                    timed_out: false,
                };
            }
        };

        let stdout_task = child.stdout.take().map(spawn_reader);
        let stderr_task = child.stderr.take().map(spawn_reader);

        let (status, wait_error, timed_out) =
            match tokio::time::timeout(self.timeout, child.wait()).await {
                Ok(Ok(status)) => (Some(status), None, false),
                Ok(Err(err)) => (None, Some(err), false),
                Err(_elapsed) => {
                    warn!(
                        program = %self.program,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Raster tool timed out, terminating"
                    );
                    (self.terminate(&mut child).await, None, true)
                }
            };

        let stdout = drain(stdout_task).await;
        let mut stderr = drain(stderr_task).await;

        if timed_out {
            append_line(
                &mut stderr,
                &format!("Process timed out after {}ms", self.timeout.as_millis()),
            );
        }
        if let Some(err) = wait_error {
            append_line(&mut stderr, &format!("Failed to wait for process: {err}"));
        }

        let exit_code = status.and_then(|s| s.code()).unwrap_or(NO_EXIT_CODE);
        let success = !timed_out && status.is_some_and(|s| s.success());
        let duration_ms = elapsed_ms(start);

        debug!(
            program = %self.program,
            exit_code,
            success,
            duration_ms,
            "Raster tool finished"
        );

        ExecutionResult {
            success,
            stdout,
            stderr,
            exit_code,
            duration_ms,
            timed_out,
        }
    }

    /// Terminate signal, then kill once the grace window passes.
    async fn terminate(&self, child: &mut Child) -> Option<ExitStatus> {
        send_terminate(child);
        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                warn!(program = %self.program, "Raster tool ignored terminate signal, killing");
                send_kill(child);
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        }
    }
}

fn spawn_reader<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

async fn drain(task: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(task) = task else {
        return String::new();
    };
    let abort = task.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => {
            abort.abort();
            String::new()
        }
    }
}

fn append_line(buf: &mut String, line: &str) {
    if !buf.is_empty() && !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str(line);
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pid), signal) {
        warn!(pid, signal = %signal, error = %err, "Failed to signal raster tool");
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    signal_group(child, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn send_kill(child: &mut Child) {
    signal_group(child, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn send_kill(_child: &mut Child) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_missing_file() {
        let stderr = "magick: unable to open image 'bg.png': No such file or directory @ error/blob.c/OpenBlob/3596.";
        let classified = classify_error(stderr);
        assert_eq!(classified.kind, ToolErrorKind::FileNotFound);
        assert_eq!(classified.details, stderr);
    }

    #[test]
    fn test_classify_is_case_insensitive() {
        assert_eq!(classify_error("PERMISSION DENIED").kind, ToolErrorKind::Permission);
        assert_eq!(
            classify_error("magick: unrecognized option `-fil'").kind,
            ToolErrorKind::ScriptSyntax
        );
        assert_eq!(
            classify_error("Process timed out after 30000ms").kind,
            ToolErrorKind::Timeout
        );
    }

    #[test]
    fn test_classify_unknown() {
        let classified = classify_error("segmentation fault");
        assert_eq!(classified.kind, ToolErrorKind::Unknown);
        assert_eq!(classified.message, "Memorial card generation failed");
        assert_eq!(classified.kind.to_string(), "unknown");
    }

    #[cfg(unix)]
    fn sh(script: &str, timeout: Duration) -> CommandExecutor {
        CommandExecutor::new("sh", timeout).with_base_args(["-c", script, "fake-magick"])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_success_passes_script_path() {
        let executor = sh("echo \"$1 $2\"", Duration::from_secs(5));
        let result = executor.run(Path::new("/tmp/script.txt")).await;
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "-script /tmp/script.txt");
        assert!(!result.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_nonzero_exit_resolves() {
        let executor = sh("echo 'unable to open image' >&2; exit 3", Duration::from_secs(5));
        let result = executor.run(Path::new("script.txt")).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert!(result.stderr.contains("unable to open image"));
    }

    #[tokio::test]
    async fn test_spawn_failure_resolves() {
        let executor = CommandExecutor::new("/nonexistent/magick", Duration::from_secs(5));
        let result = executor.run(Path::new("script.txt")).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, NO_EXIT_CODE);
        assert!(result.stderr.starts_with("Failed to spawn '/nonexistent/magick'"));
        assert_eq!(classify_error(&result.stderr).kind, ToolErrorKind::FileNotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_terminates_process() {
        let executor = sh("exec sleep 10", Duration::from_millis(200));
        let start = Instant::now();
        let result = executor.run(Path::new("script.txt")).await;
        assert!(!result.success);
        assert!(result.timed_out);
        assert!(result.stderr.contains("timed out after 200ms"), "got: {}", result.stderr);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_escalates_to_kill() {
        let executor = sh("trap '' TERM; sleep 10", Duration::from_millis(200))
            .with_kill_grace(Duration::from_millis(300));
        let start = Instant::now();
        let result = executor.run(Path::new("script.txt")).await;
        assert!(result.timed_out);
        assert_eq!(result.exit_code, NO_EXIT_CODE);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
