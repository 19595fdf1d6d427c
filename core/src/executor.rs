use std::io;
#[cfg(unix)]
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::command::Command;
use crate::error::Error;
use crate::log::StageLog;
use crate::stage::{StageFailure, StageResult, NO_EXIT_CODE};

/// Runs one external command at a time inside the working directory.
#[derive(Clone)]
pub struct ProcessRunner {
    log: StageLog,
    workdir: PathBuf,
}

struct Completed {
    status: ExitStatus,
    captured_output: Vec<String>,
}

impl ProcessRunner {
    pub fn new(log: StageLog, workdir: impl Into<PathBuf>) -> Self {
        Self {
            log,
            workdir: workdir.into(),
        }
    }

    pub fn log(&self) -> &StageLog {
        &self.log
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub async fn execute(&self, name: &str, command: &Command, streaming: bool) -> StageResult {
        let start = Instant::now();

        self.log.command(format!("Running: {}", command));

        let outcome = if streaming {
            self.run_streaming(command).await
        } else {
            self.run_quiet(command).await
        };

        let duration = start.elapsed().as_secs_f64();

        let completed = match outcome {
            Ok(completed) => completed,
            Err(err) => {
                let reason = match &err {
                    Error::Launch { source, .. } => source.to_string(),
                    other => other.to_string(),
                };
                self.log.error(format!("Command failed: {}", err));
                let mut result = StageResult::launch_failure(name, reason);
                result.duration = duration;
                return result;
            }
        };

        let exit_code = completed.status.code().unwrap_or(NO_EXIT_CODE);
        let failure = if completed.status.success() {
            None
        } else if completed.status.code().is_none() {
            Some(StageFailure::Signaled)
        } else {
            Some(StageFailure::NonZeroExit(exit_code))
        };

        StageResult {
            stage: name.to_string(),
            succeeded: completed.status.success(),
            captured_output: completed.captured_output,
            exit_code,
            failure,
            duration,
        }
    }

    fn process(&self, command: &Command) -> ProcessCommand {
        let mut process = ProcessCommand::new(command.program());
        process
            .args(command.args())
            .current_dir(&self.workdir)
            .stdin(Stdio::null());
        process
    }

    async fn run_streaming(&self, command: &Command) -> Result<Completed, Error> {
        let (mut child, mut lines) =
            spawn_combined(self.process(command)).map_err(|source| Error::Launch {
                program: command.program().to_string(),
                source,
            })?;

        let mut captured_output = Vec::new();

        while let Some(line) = lines.recv().await {
            self.log.info(line.clone());
            captured_output.push(line);
        }

        let status = child.wait().await?;

        Ok(Completed {
            status,
            captured_output,
        })
    }

    async fn run_quiet(&self, command: &Command) -> Result<Completed, Error> {
        let output = self
            .process(command)
            .output()
            .await
            .map_err(|source| Error::Launch {
                program: command.program().to_string(),
                source,
            })?;

        let captured_output: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
            .map(|line| line.to_string())
            .collect();

        if !output.status.success() {
            for line in &captured_output {
                self.log.info(line.clone());
            }
        }

        Ok(Completed {
            status: output.status,
            captured_output,
        })
    }
}

/// Spawns `process` with stdout and stderr sharing one pipe, so lines arrive
/// in the order the child wrote them. The receiver yields `None` once the
/// child and everything it spawned have closed the pipe.
#[cfg(unix)]
pub(crate) fn spawn_combined(
    mut process: ProcessCommand,
) -> io::Result<(Child, mpsc::UnboundedReceiver<String>)> {
    let (reader, writer) = output_pipe()?;
    process
        .stdout(Stdio::from(writer.try_clone()?))
        .stderr(Stdio::from(writer));

    let child = process.spawn()?;
    // The builder owns the parent's copies of the write end.
    drop(process);

    let (tx, rx) = mpsc::unbounded_channel();
    forward_lines(tokio::fs::File::from_std(std::fs::File::from(reader)), tx);
    Ok((child, rx))
}

#[cfg(unix)]
fn output_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use std::os::fd::{AsRawFd, FromRawFd};

    let (read, write) = nix::unistd::pipe()?;
    // SAFETY: pipe(2) just returned these descriptors and nothing else owns them.
    let fds = unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) };

    // Keep other children spawned meanwhile from holding the write end open.
    for fd in [&fds.0, &fds.1] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }

    Ok(fds)
}

#[cfg(not(unix))]
pub(crate) fn spawn_combined(
    mut process: ProcessCommand,
) -> io::Result<(Child, mpsc::UnboundedReceiver<String>)> {
    let mut child = process
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx);
    }
    Ok((child, rx))
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::log::LogLevel;

    fn sh(script: &str) -> Command {
        Command::new(["sh", "-c", script]).unwrap()
    }

    fn runner(dir: &Path) -> ProcessRunner {
        ProcessRunner::new(StageLog::new(), dir)
    }

    #[tokio::test]
    async fn test_streaming_forwards_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let result = runner
            .execute("echo", &sh("echo a; echo b; echo c"), true)
            .await;

        assert!(result.succeeded);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.captured_output, vec!["a", "b", "c"]);

        let entries = runner.log().entries();
        assert_eq!(entries[0].level, LogLevel::Command);
        let info: Vec<&str> = entries[1..].iter().map(|e| e.message.as_str()).collect();
        assert_eq!(info, vec!["a", "b", "c"]);
        assert!(entries[1..].iter().all(|e| e.level == LogLevel::Info));
    }

    #[tokio::test]
    async fn test_streaming_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let result = runner
            .execute("warn", &sh("echo oops >&2; exit 3"), true)
            .await;

        assert!(!result.succeeded);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.failure, Some(StageFailure::NonZeroExit(3)));
        assert_eq!(result.captured_output, vec!["oops"]);
    }

    #[tokio::test]
    async fn test_streaming_keeps_stdout_and_stderr_interleaved() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let script = "i=0; while [ $i -lt 50 ]; do echo o$i; echo e$i >&2; i=$((i+1)); done";

        let result = runner.execute("interleave", &sh(script), true).await;

        let expected: Vec<String> = (0..50)
            .flat_map(|i| [format!("o{}", i), format!("e{}", i)])
            .collect();
        assert!(result.succeeded);
        assert_eq!(result.captured_output, expected);

        let logged: Vec<String> = runner
            .log()
            .entries()
            .into_iter()
            .filter(|e| e.level == LogLevel::Info)
            .map(|e| e.message)
            .collect();
        assert_eq!(logged, expected);
    }

    #[tokio::test]
    async fn test_streaming_ends_when_child_exits() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            runner.execute("short", &sh("echo done"), true),
        )
        .await
        .unwrap();

        assert_eq!(result.captured_output, vec!["done"]);
    }

    #[tokio::test]
    async fn test_quiet_captures_after_completion() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let result = runner
            .execute("quiet", &sh("echo out; echo 'undefined symbol' >&2; exit 1"), false)
            .await;

        assert!(!result.succeeded);
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.captured_output, vec!["out", "undefined symbol"]);
    }

    #[tokio::test]
    async fn test_quiet_success_emits_only_command() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let result = runner.execute("quiet", &sh("echo hidden"), false).await;

        assert!(result.succeeded);
        assert_eq!(result.captured_output, vec!["hidden"]);
        assert_eq!(runner.log().len(), 1);
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let result = runner.execute("touch", &sh("touch marker"), false).await;

        assert!(result.succeeded);
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let command = Command::new(["popbuild-definitely-missing-tool"]).unwrap();

        for streaming in [true, false] {
            let result = runner.execute("missing", &command, streaming).await;
            assert!(!result.succeeded);
            assert_eq!(result.exit_code, NO_EXIT_CODE);
            assert!(matches!(result.failure, Some(StageFailure::LaunchFailure(_))));
        }

        let errors = runner
            .log()
            .entries()
            .into_iter()
            .filter(|e| e.level == LogLevel::Error)
            .count();
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn test_command_entry_shows_full_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        runner.execute("true", &Command::new(["true", "-x", "a b"]).unwrap(), false).await;

        let entries = runner.log().entries();
        assert_eq!(entries[0].message, "Running: true -x 'a b'");
    }
}
