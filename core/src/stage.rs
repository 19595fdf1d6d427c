use std::fmt;
use std::path::PathBuf;

use crate::command::Command;

/// Exit code recorded when no real exit code exists (launch failure, signal).
pub const NO_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone)]
pub struct PipelineStage {
    pub name: String,
    pub command: Command,
    pub streaming: bool,
    pub error_log: Option<PathBuf>,
}

impl PipelineStage {
    pub fn new(name: impl Into<String>, command: Command) -> Self {
        Self {
            name: name.into(),
            command,
            streaming: false,
            error_log: None,
        }
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_error_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.error_log = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageFailure {
    LaunchFailure(String),
    NonZeroExit(i32),
    Signaled,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageFailure::LaunchFailure(reason) => write!(f, "launch failure: {}", reason),
            StageFailure::NonZeroExit(code) => write!(f, "exit code {}", code),
            StageFailure::Signaled => write!(f, "terminated by signal"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: String,
    pub succeeded: bool,
    pub captured_output: Vec<String>,
    pub exit_code: i32,
    pub failure: Option<StageFailure>,
    pub duration: f64,
}

impl StageResult {
    pub fn launch_failure(stage: impl Into<String>, reason: String) -> Self {
        Self {
            stage: stage.into(),
            succeeded: false,
            captured_output: Vec::new(),
            exit_code: NO_EXIT_CODE,
            failure: Some(StageFailure::LaunchFailure(reason)),
            duration: 0.0,
        }
    }

    pub fn captured_text(&self) -> String {
        self.captured_output.join("\n")
    }
}
