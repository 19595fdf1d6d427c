use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::config::EmulatorInput;
use crate::executor::spawn_combined;
use crate::log::{Event, StageLog};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    Terminating,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Terminating => "terminating",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// The emulator exited on its own; the code carries no pass/fail meaning.
    Exited { code: Option<i32> },
    Terminated,
}

#[derive(Default)]
struct SessionInner {
    state: SessionState,
    stop: Option<Arc<Notify>>,
}

/// A launched emulator process, handed to [`EmulatorSession::wait`].
pub struct RunningEmulator {
    child: Child,
    stop: Arc<Notify>,
    output: JoinHandle<()>,
}

/// Lifecycle of the single interactive emulator process.
pub struct EmulatorSession {
    log: StageLog,
    workdir: PathBuf,
    input: EmulatorInput,
    inner: Mutex<SessionInner>,
}

impl EmulatorSession {
    pub fn new(log: StageLog, workdir: impl Into<PathBuf>) -> Self {
        Self {
            log,
            workdir: workdir.into(),
            input: EmulatorInput::default(),
            inner: Mutex::new(SessionInner::default()),
        }
    }

    /// Where the emulator's stdin comes from. Inherited unless set.
    pub fn with_input(mut self, input: EmulatorInput) -> Self {
        self.input = input;
        self
    }

    pub fn input(&self) -> EmulatorInput {
        self.input
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Spawns the emulator and moves to `Running`. Does not wait for exit.
    pub fn launch(&self, image: &Path, command: &Command) -> Result<RunningEmulator> {
        let mut inner = self.inner.lock();

        if inner.state != SessionState::Idle {
            return Err(Error::Precondition(format!(
                "Emulator session already {}",
                inner.state
            )));
        }

        if !self.workdir.join(image).exists() {
            return Err(Error::Precondition(format!(
                "{} not found. Build the kernel and create the image first.",
                image.display()
            )));
        }

        self.log
            .info(format!("Starting emulator with {}...", image.display()));
        self.log.command(format!("Running: {}", command));

        let mut process = ProcessCommand::new(command.program());
        process
            .args(command.args())
            .current_dir(&self.workdir)
            .stdin(match self.input {
                EmulatorInput::Inherit => Stdio::inherit(),
                EmulatorInput::Null => Stdio::null(),
            });

        let (child, mut lines) = spawn_combined(process).map_err(|source| Error::Launch {
            program: command.program().to_string(),
            source,
        })?;

        let log = self.log.clone();
        let output = tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                log.info(line);
            }
        });

        let stop = Arc::new(Notify::new());
        inner.state = SessionState::Running;
        inner.stop = Some(Arc::clone(&stop));
        self.log.publish(Event::Emulator {
            state: SessionState::Running,
        });
        self.log.info("Use stop to end the emulator session");

        Ok(RunningEmulator {
            child,
            stop,
            output,
        })
    }

    /// Blocks the calling task until the emulator exits, then returns to `Idle`.
    pub async fn wait(&self, running: RunningEmulator) -> SessionExit {
        let RunningEmulator {
            mut child,
            stop,
            output,
        } = running;

        let natural = tokio::select! {
            status = child.wait() => Some(status),
            _ = stop.notified() => None,
        };

        let (status, terminated) = match natural {
            Some(status) => (status, false),
            None => {
                terminate(&mut child);
                (child.wait().await, true)
            }
        };

        let _ = output.await;

        {
            let mut inner = self.inner.lock();
            inner.state = SessionState::Idle;
            inner.stop = None;
        }

        let exit = match status {
            Ok(_) if terminated => {
                self.log.info("Emulator stopped");
                SessionExit::Terminated
            }
            Ok(status) => {
                self.log.info("Emulator session ended");
                SessionExit::Exited {
                    code: status.code(),
                }
            }
            Err(err) => {
                self.log.error(format!("Emulator error: {}", err));
                SessionExit::Exited { code: None }
            }
        };

        self.log.publish(Event::Emulator {
            state: SessionState::Idle,
        });

        exit
    }

    pub async fn start(&self, image: &Path, command: &Command) -> Result<SessionExit> {
        let running = self.launch(image, command)?;
        Ok(self.wait(running).await)
    }

    /// Requests graceful termination. Returns `false` (and does nothing)
    /// unless a session is running.
    pub fn stop(&self) -> bool {
        let mut inner = self.inner.lock();

        if inner.state != SessionState::Running {
            return false;
        }

        inner.state = SessionState::Terminating;
        if let Some(stop) = &inner.stop {
            stop.notify_one();
        }
        drop(inner);

        self.log.warning("Stopping emulator...");
        self.log.publish(Event::Emulator {
            state: SessionState::Terminating,
        });
        true
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}
