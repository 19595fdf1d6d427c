use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::builder::Builder;
use crate::config::{BuildMode, Config};
use crate::error::{Error, Result};
use crate::executor::ProcessRunner;
use crate::log::{Event, StageLog};
use crate::pipeline::PipelineRun;
use crate::session::{EmulatorSession, SessionExit, SessionState};

const BANNER_WIDTH: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrchestratorState {
    pub build_in_progress: bool,
    pub emulator: SessionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomationStep {
    Clean,
    Build,
    Package,
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomationOutcome {
    Completed(SessionExit),
    Failed(AutomationStep),
}

struct Inner {
    root: PathBuf,
    builder: Builder,
    log: StageLog,
    runner: ProcessRunner,
    session: EmulatorSession,
    building: AtomicBool,
}

/// Held for the lifetime of a build-type operation.
struct BuildGuard {
    inner: Arc<Inner>,
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        self.inner.building.store(false, Ordering::SeqCst);
        self.inner.log.publish(Event::Build { in_progress: false });
    }
}

/// Entry point for the control surface. Checks preconditions on the calling
/// task and runs the long operations on their own tokio tasks.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(root: impl Into<PathBuf>, config: Config) -> Self {
        let root = root.into();
        let log = StageLog::new();

        Self {
            inner: Arc::new(Inner {
                runner: ProcessRunner::new(log.clone(), root.clone()),
                session: EmulatorSession::new(log.clone(), root.clone())
                    .with_input(config.emulator.stdin),
                builder: Builder::new(config),
                building: AtomicBool::new(false),
                log,
                root,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn config(&self) -> &Config {
        self.inner.builder.config()
    }

    pub fn log(&self) -> &StageLog {
        &self.inner.log
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        self.inner.log.subscribe()
    }

    pub fn state(&self) -> OrchestratorState {
        OrchestratorState {
            build_in_progress: self.inner.building.load(Ordering::SeqCst),
            emulator: self.inner.session.state(),
        }
    }

    fn reject(&self, err: Error) -> Error {
        self.inner.log.error(err.to_string());
        err
    }

    fn begin_build(&self) -> Result<BuildGuard> {
        if self
            .inner
            .building
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(self.reject(Error::Concurrency(
                "A build is already in progress".to_string(),
            )));
        }

        self.inner.log.publish(Event::Build { in_progress: true });
        Ok(BuildGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn check_layout(&self) -> Result<()> {
        let missing = self.config().layout.missing_files(&self.inner.root);

        if missing.is_empty() {
            return Ok(());
        }

        Err(self.reject(Error::Precondition(format!(
            "Missing source files in {}: {}",
            self.inner.root.display(),
            missing.join(", ")
        ))))
    }

    /// Logs which external tools are missing and returns them.
    pub fn check_dependencies(&self) -> Vec<String> {
        let log = &self.inner.log;
        log.info("Checking dependencies...");

        let missing = self.inner.builder.missing_tools();
        if missing.is_empty() {
            log.success("All dependencies found");
        } else {
            log.warning(format!(
                "Missing dependencies: {}. Install with: sudo dnf install nasm gcc qemu-system-x86 grub2-tools-extra grub2-pc-modules xorriso mtools",
                missing.join(", ")
            ));
        }

        missing
    }

    fn image_tool(&self) -> Result<String> {
        self.inner.builder.resolve_image_tool().ok_or_else(|| {
            self.reject(Error::Precondition(format!(
                "No image packaging tool found (tried: {})",
                self.config().image.tools.join(", ")
            )))
        })
    }

    pub async fn clean(&self) -> Result<()> {
        let _guard = self.begin_build()?;
        self.inner.remove_artifacts().await
    }

    pub fn build_verbose(&self) -> Result<JoinHandle<PipelineRun>> {
        self.check_layout()?;
        let pipeline = self
            .inner
            .builder
            .verbose_build()
            .map_err(|err| self.reject(err))?;
        let guard = self.begin_build()?;
        let inner = Arc::clone(&self.inner);

        Ok(tokio::spawn(async move {
            let _guard = guard;
            inner.banner("VERBOSE BUILD MODE - Full output enabled");
            pipeline.run(&inner.runner).await
        }))
    }

    pub fn build_and_package(&self) -> Result<JoinHandle<PipelineRun>> {
        self.check_layout()?;
        let tool = self.image_tool()?;
        let pipeline = self
            .inner
            .builder
            .quick_build_and_package(&tool)
            .map_err(|err| self.reject(err))?;
        let guard = self.begin_build()?;
        let inner = Arc::clone(&self.inner);

        Ok(tokio::spawn(async move {
            let _guard = guard;
            inner.log.info("Building kernel (quick mode)...");
            pipeline.run(&inner.runner).await
        }))
    }

    pub fn run_emulator(&self) -> Result<JoinHandle<SessionExit>> {
        let image = PathBuf::from(&self.config().artifacts.image);
        let command = self
            .inner
            .builder
            .emulator_command(&image.to_string_lossy())
            .map_err(|err| self.reject(err))?;
        let running = self
            .inner
            .session
            .launch(&image, &command)
            .map_err(|err| self.reject(err))?;
        let inner = Arc::clone(&self.inner);

        Ok(tokio::spawn(async move { inner.session.wait(running).await }))
    }

    /// No-op when no emulator is running.
    pub fn stop_emulator(&self) -> bool {
        self.inner.session.stop()
    }

    /// Clean, build, package and run as one background operation.
    pub fn automate(&self) -> Result<JoinHandle<AutomationOutcome>> {
        let emulator = self.inner.session.state();
        if emulator != SessionState::Idle {
            return Err(self.reject(Error::Precondition(format!(
                "Emulator session {}; stop it before automating",
                emulator
            ))));
        }

        self.check_layout()?;
        let tool = self.image_tool()?;

        let builder = &self.inner.builder;
        let build = match self.config().automation.build_mode {
            BuildMode::Quick => builder.quick_build(),
            BuildMode::Verbose => builder.verbose_build(),
        }
        .map_err(|err| self.reject(err))?
        .with_messages("Build successful", "Automation failed during build");
        let package = builder
            .package(&tool)
            .map_err(|err| self.reject(err))?
            .with_messages("Image created", "Automation failed during packaging");

        let image = PathBuf::from(&self.config().artifacts.image);
        let command = builder
            .emulator_command(&image.to_string_lossy())
            .map_err(|err| self.reject(err))?;

        let guard = self.begin_build()?;
        let inner = Arc::clone(&self.inner);

        Ok(tokio::spawn(async move {
            inner.banner("FULL AUTOMATION MODE");

            inner.log.info("Step 1/4: Cleaning...");
            if inner.remove_artifacts().await.is_err() {
                return AutomationOutcome::Failed(AutomationStep::Clean);
            }

            inner.log.info("Step 2/4: Building kernel...");
            if !build.run(&inner.runner).await.succeeded() {
                return AutomationOutcome::Failed(AutomationStep::Build);
            }

            inner.log.info("Step 3/4: Creating image...");
            if !package.run(&inner.runner).await.succeeded() {
                return AutomationOutcome::Failed(AutomationStep::Package);
            }

            drop(guard);

            inner.log.info("Step 4/4: Launching emulator...");
            inner.banner("AUTOMATION COMPLETE - Starting kernel...");

            match inner.session.launch(&image, &command) {
                Ok(running) => AutomationOutcome::Completed(inner.session.wait(running).await),
                Err(err) => {
                    inner.log.error(err.to_string());
                    AutomationOutcome::Failed(AutomationStep::Run)
                }
            }
        }))
    }

    /// Writes the session log to the configured file. Failure is logged, not returned.
    pub fn save_log(&self) -> bool {
        let path = self.inner.root.join(&self.config().logs.session_log);
        self.export_log(&path)
    }

    pub fn export_log(&self, path: &Path) -> bool {
        match self.inner.log.export(path) {
            Ok(()) => {
                self.inner
                    .log
                    .success(format!("Log saved to {}", path.display()));
                true
            }
            Err(err) => {
                self.inner.log.error(format!("Failed to save log: {:#}", err));
                false
            }
        }
    }

    pub fn clear_log(&self) {
        self.inner.log.clear();
    }
}

impl Inner {
    fn banner(&self, title: &str) {
        let rule = "=".repeat(BANNER_WIDTH);
        self.log.info(rule.clone());
        self.log.info(title);
        self.log.info(rule);
    }

    async fn remove_artifacts(&self) -> Result<()> {
        self.log.info("Cleaning build files...");

        for artifact in self.builder.config().artifacts.all() {
            let path = self.root.join(&artifact);

            let metadata = match tokio::fs::symlink_metadata(&path).await {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    self.log
                        .error(format!("Failed to remove {}: {}", artifact, err));
                    return Err(err.into());
                }
            };

            let removed = if metadata.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };

            match removed {
                Ok(()) => self.log.info(format!("Removed: {}", artifact)),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    self.log
                        .error(format!("Failed to remove {}: {}", artifact, err));
                    return Err(err.into());
                }
            }
        }

        self.log.success("Clean complete");
        Ok(())
    }
}
