pub mod builder;
pub mod cli;
pub mod command;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod log;
pub mod logger;
pub mod orchestrator;
pub mod pipeline;
pub mod session;
pub mod stage;

pub use builder::Builder;
pub use cli::{Cli, Commands};
pub use command::Command;
pub use config::{BuildMode, Config};
pub use diagnostics::Diagnostics;
pub use error::{Error, Result};
pub use executor::ProcessRunner;
pub use log::{Event, LogEntry, LogLevel, StageLog};
pub use orchestrator::{AutomationOutcome, AutomationStep, Orchestrator, OrchestratorState};
pub use pipeline::{BuildPipeline, PipelineRun};
pub use session::{EmulatorSession, SessionExit, SessionState};
pub use stage::{PipelineStage, StageFailure, StageResult};
