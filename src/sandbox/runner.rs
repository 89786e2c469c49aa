use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;

use super::output::read_capped;
use super::{CappedBuffer, Language, RequestError, RunOutcome, RunRequest, Workspace};

/// How long to keep collecting output after the child is gone.
/// Descendants that inherited the pipes can otherwise hold them open forever.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Runs untrusted snippets as plain child processes
///
/// Each invocation gets its own scratch workspace and interpreter process. The
/// only limits enforced are a wall-clock timeout and a per-stream output cap;
/// there is no filesystem, memory or network isolation.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    scratch_root: PathBuf,
    node_command: String,
    python_command: String,
}

/// Which signal ended the wait for the child
enum Finish {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessRunner {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            scratch_root: config.scratch_root(),
            node_command: config.node_command.clone(),
            python_command: config.python_command.clone(),
        }
    }

    fn interpreter(&self, language: Language) -> &str {
        match language {
            Language::JavaScript => &self.node_command,
            Language::Python => &self.python_command,
        }
    }

    /// Runs one snippet to completion, timeout or spawn failure
    pub async fn execute(&self, request: RunRequest) -> Result<RunOutcome, RequestError> {
        self.execute_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Like [`ProcessRunner::execute`], but `cancel` force-kills the child the
    /// same way the timeout does
    pub async fn execute_with_cancel(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RequestError> {
        if request.code.is_empty() {
            return Err(RequestError::MissingCode);
        }

        let tag = request.language.to_lowercase();
        let Some(language) = Language::resolve(&tag) else {
            log::debug!("Rejected run for unsupported language {tag:?}");
            return Ok(RunOutcome::unsupported(&tag));
        };

        let started = Instant::now();
        let workspace = match Workspace::create(&self.scratch_root).await {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!(
                    "Failed to create workspace under {}: {e}",
                    self.scratch_root.display()
                );
                return Ok(failure(format!("Failed to create workspace: {e}"), started));
            }
        };
        log::debug!(
            "Running {language} snippet in {}",
            workspace.path().display()
        );

        let outcome = self
            .run_in_workspace(&workspace, language, &request, cancel, started)
            .await;

        workspace.remove().await;

        log::debug!(
            "Finished {language} snippet: exit code {:?}, timed out {}, {} ms",
            outcome.exit_code,
            outcome.timed_out,
            outcome.duration_ms
        );
        Ok(outcome)
    }

    async fn run_in_workspace(
        &self,
        workspace: &Workspace,
        language: Language,
        request: &RunRequest,
        cancel: &CancellationToken,
        started: Instant,
    ) -> RunOutcome {
        let source = match workspace
            .write_file(language.file_name(), &request.code)
            .await
        {
            Ok(path) => path,
            Err(e) => return failure(format!("Failed to write source file: {e}"), started),
        };

        let program = self.interpreter(language);
        let mut cmd = Command::new(program);
        cmd.arg(&source)
            .current_dir(workspace.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::warn!("Failed to spawn {program}: {e}");
                return failure(format!("Failed to start {program}: {e}"), started);
            }
        };

        // The child leads its own group, so the group id is its pid
        let process_group = child.id();

        let cap = request.max_output_bytes;
        let stop_reading = CancellationToken::new();
        let stdin_task = child
            .stdin
            .take()
            .map(|stdin| tokio::spawn(feed_stdin(stdin, request.input.clone())));
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_capped(out, cap, stop_reading.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_capped(err, cap, stop_reading.clone())));

        let finish = tokio::select! {
            status = child.wait() => Finish::Exited(status),
            () = sleep(Duration::from_millis(request.timeout_ms)) => Finish::TimedOut,
            () = cancel.cancelled() => Finish::Cancelled,
        };

        let status = match finish {
            Finish::Exited(status) => {
                // Background jobs share the group and must not outlive the run
                kill_process_group(process_group);
                status
            }
            Finish::TimedOut => {
                log::warn!(
                    "{language} snippet exceeded {} ms, killing it",
                    request.timeout_ms
                );
                force_kill(&mut child, process_group);
                child.wait().await
            }
            Finish::Cancelled => {
                log::info!("{language} snippet cancelled, killing it");
                force_kill(&mut child, process_group);
                child.wait().await
            }
        };
        let duration_ms = elapsed_ms(started);

        if let Some(task) = stdin_task {
            task.abort();
        }
        let stdout = collect_output(stdout_task, &stop_reading, cap).await;
        let stderr = collect_output(stderr_task, &stop_reading, cap).await;

        let (exit_code, wait_error) = match status {
            Ok(status) => (status.code(), None),
            Err(e) => (None, Some(e)),
        };

        let mut stderr = stderr.into_string();
        if stderr.is_empty() {
            if let Some(e) = wait_error {
                stderr = format!("Failed to wait for {program}: {e}");
            }
        }

        RunOutcome {
            stdout: stdout.into_string(),
            stderr,
            exit_code,
            // A kill leaves no exit code behind, so a missing code past the deadline means the timer won
            timed_out: duration_ms >= request.timeout_ms && exit_code.is_none(),
            duration_ms,
        }
    }
}

/// Writes the whole input, then closes the pipe
async fn feed_stdin(mut stdin: ChildStdin, input: String) {
    if !input.is_empty() {
        if let Err(e) = stdin.write_all(input.as_bytes()).await {
            log::debug!("Failed to write child stdin: {e}");
        }
    }
    if let Err(e) = stdin.shutdown().await {
        log::debug!("Failed to close child stdin: {e}");
    }
}

/// Waits briefly for a reader task, then takes whatever it has collected
async fn collect_output(
    task: Option<JoinHandle<CappedBuffer>>,
    stop_reading: &CancellationToken,
    cap: usize,
) -> CappedBuffer {
    let Some(mut task) = task else {
        return CappedBuffer::new(cap);
    };

    let joined = match timeout(OUTPUT_DRAIN_GRACE, &mut task).await {
        Ok(joined) => joined,
        Err(_) => {
            log::debug!("Output pipe still open after exit, stopping reader");
            stop_reading.cancel();
            task.await
        }
    };

    joined.unwrap_or_else(|e| {
        log::error!("Output reader task failed: {e}");
        CappedBuffer::new(cap)
    })
}

/// Sends SIGKILL to the child and everything it spawned
fn force_kill(child: &mut Child, process_group: Option<u32>) {
    if kill_process_group(process_group) {
        return;
    }
    if let Err(e) = child.start_kill() {
        log::warn!("Failed to kill child process: {e}");
    }
}

/// Returns false when nothing was signalled; ESRCH just means the group is already empty
#[cfg(unix)]
fn kill_process_group(process_group: Option<u32>) -> bool {
    let Some(pgid) = process_group else {
        return false;
    };
    // SAFETY: plain syscall. A pid is not recycled while a group with that id
    // still has members, so this cannot reach an unrelated group.
    let rc = unsafe { libc::kill(-(pgid as libc::pid_t), libc::SIGKILL) };
    if rc == 0 {
        return true;
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        log::warn!("Failed to kill process group {pgid}: {err}");
    }
    false
}

#[cfg(not(unix))]
fn kill_process_group(_process_group: Option<u32>) -> bool {
    false
}

fn failure(message: String, started: Instant) -> RunOutcome {
    RunOutcome {
        stdout: String::new(),
        stderr: message,
        exit_code: None,
        timed_out: false,
        duration_ms: elapsed_ms(started),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use super::*;

    /// Uses `sh` for both runtimes so the tests do not need node or python
    fn shell_runner(root: &Path) -> ProcessRunner {
        ProcessRunner::new(&SandboxConfig {
            scratch_root: Some(root.to_path_buf()),
            node_command: "sh".to_string(),
            python_command: "sh".to_string(),
            ..SandboxConfig::default()
        })
    }

    fn leftover_entries(root: &Path) -> usize {
        std::fs::read_dir(root).map(|d| d.count()).unwrap_or(0)
    }

    /// Live and not a zombie waiting to be reaped
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| !rest.starts_with('Z')),
            Err(_) => false,
        }
    }

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_empty_code_is_rejected_before_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("scratch");
        let runner = shell_runner(&root);

        let result = runner.execute(RunRequest::new("python", "")).await;
        assert_eq!(result, Err(RequestError::MissingCode));
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("scratch");
        let runner = shell_runner(&root);

        let outcome = runner
            .execute(RunRequest::new("Ruby", "puts 1"))
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "");
        assert_eq!(outcome.stderr, "Unsupported language: ruby");
        assert_eq!(outcome.exit_code, None);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.duration_ms, 0);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_hello_exits_normally() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = shell_runner(tmp.path());

        let outcome = runner
            .execute(RunRequest::new("py", "echo hello"))
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "hello\n");
        assert_eq!(outcome.stderr, "");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);
        assert!(outcome.duration_ms < 3000);
        assert_eq!(leftover_entries(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_aliases_pick_same_interpreter() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(&SandboxConfig {
            scratch_root: Some(tmp.path().to_path_buf()),
            node_command: "sh".to_string(),
            python_command: "coderun-missing-python".to_string(),
            ..SandboxConfig::default()
        });

        let short = runner
            .execute(RunRequest::new("js", "basename \"$0\""))
            .await
            .unwrap();
        let long = runner
            .execute(RunRequest::new("JavaScript", "basename \"$0\""))
            .await
            .unwrap();
        assert_eq!(short.stdout, "main.js\n");
        assert_eq!(short, RunOutcome { duration_ms: short.duration_ms, ..long });
    }

    #[tokio::test]
    async fn test_input_is_relayed_and_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = shell_runner(tmp.path());

        let request = RunRequest::new("python", "read line\necho \"got: $line\"\ncat")
            .with_input("42\n");
        let outcome = runner.execute(request).await.unwrap();
        assert_eq!(outcome.stdout, "got: 42\n");
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_stdin_closed_without_input() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = shell_runner(tmp.path());

        let request = RunRequest::new("python", "cat\necho done").with_timeout_ms(2000);
        let outcome = runner.execute(request).await.unwrap();
        assert_eq!(outcome.stdout, "done\n");
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = shell_runner(tmp.path());

        let request = RunRequest::new("python", "yes | head -c 100000\nyes | head -c 100000 >&2")
            .with_max_output_bytes(1000);
        let outcome = runner.execute(request).await.unwrap();
        assert_eq!(outcome.stdout.len(), 1000);
        assert_eq!(outcome.stderr.len(), 1000);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_stderr_and_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = shell_runner(tmp.path());

        let outcome = runner
            .execute(RunRequest::new("python", "echo oops >&2\nexit 3"))
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "");
        assert_eq!(outcome.stderr, "oops\n");
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = shell_runner(tmp.path());

        let request = RunRequest::new("python", "sleep 10").with_timeout_ms(300);
        let begin = Instant::now();
        let outcome = runner.execute(request).await.unwrap();

        assert!(begin.elapsed() < Duration::from_secs(3));
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.duration_ms >= 300);
        assert_eq!(leftover_entries(tmp.path()), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_background_job_killed_after_normal_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = shell_runner(tmp.path());

        let request = RunRequest::new("python", "sleep 30 >/dev/null 2>&1 &\necho $!")
            .with_timeout_ms(500);
        let outcome = runner.execute(request).await.unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);

        let pid: u32 = outcome.stdout.trim().parse().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while process_alive(pid) && Instant::now() < deadline {
            sleep(Duration::from_millis(20)).await;
        }
        assert!(!process_alive(pid));
        assert_eq!(leftover_entries(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_in_outcome() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(&SandboxConfig {
            scratch_root: Some(tmp.path().to_path_buf()),
            python_command: "coderun-missing-python".to_string(),
            ..SandboxConfig::default()
        });

        let outcome = runner
            .execute(RunRequest::new("python", "print(1)"))
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "");
        assert!(outcome.stderr.contains("coderun-missing-python"));
        assert_eq!(outcome.exit_code, None);
        assert!(!outcome.timed_out);
        assert_eq!(leftover_entries(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = shell_runner(tmp.path());
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let request = RunRequest::new("python", "sleep 10").with_timeout_ms(10_000);
        let outcome = runner.execute_with_cancel(request, &token).await.unwrap();
        assert_eq!(outcome.exit_code, None);
        assert!(!outcome.timed_out);
        assert!(outcome.duration_ms < 10_000);
        assert_eq!(leftover_entries(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_concurrent_runs_do_not_interfere() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = shell_runner(tmp.path());

        let (a, b) = tokio::join!(
            runner.execute(RunRequest::new("python", "sleep 0.2\necho first")),
            runner.execute(RunRequest::new("js", "echo second")),
        );
        assert_eq!(a.unwrap().stdout, "first\n");
        assert_eq!(b.unwrap().stdout, "second\n");
        assert_eq!(leftover_entries(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_python_echoes_input() {
        if !python_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(&SandboxConfig {
            scratch_root: Some(tmp.path().to_path_buf()),
            ..SandboxConfig::default()
        });

        let request = RunRequest::new("python", "print(input())")
            .with_input("hi\n")
            .with_timeout_ms(2000)
            .with_max_output_bytes(1024);
        let outcome = runner.execute(request).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome {
                stdout: "hi\n".to_string(),
                stderr: String::new(),
                exit_code: Some(0),
                timed_out: false,
                duration_ms: outcome.duration_ms,
            }
        );
    }
}
