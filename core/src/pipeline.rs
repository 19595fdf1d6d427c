use std::collections::HashSet;
use std::time::Instant;

use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::executor::ProcessRunner;
use crate::stage::{PipelineStage, StageResult};

/// Ordered, short-circuiting sequence of stages.
#[derive(Debug, Clone)]
pub struct BuildPipeline {
    name: String,
    stages: Vec<PipelineStage>,
    success_message: String,
    failure_message: String,
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub pipeline: String,
    pub results: Vec<StageResult>,
    pub duration: f64,
}

impl PipelineRun {
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|r| r.succeeded)
    }

    pub fn failed_stage(&self) -> Option<&StageResult> {
        self.results.iter().find(|r| !r.succeeded)
    }

    pub fn stages_executed(&self) -> usize {
        self.results.len()
    }
}

impl BuildPipeline {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            success_message: format!("{} succeeded", name),
            failure_message: format!("{} failed", name),
            name,
            stages: Vec::new(),
        }
    }

    pub fn with_messages(mut self, success: impl Into<String>, failure: impl Into<String>) -> Self {
        self.success_message = success.into();
        self.failure_message = failure.into();
        self
    }

    pub fn stage(mut self, stage: PipelineStage) -> Result<Self> {
        if self.stages.iter().any(|s| s.name == stage.name) {
            return Err(Error::InvalidPipeline(format!(
                "duplicate stage name '{}' in {}",
                stage.name, self.name
            )));
        }
        self.stages.push(stage);
        Ok(self)
    }

    pub fn from_stages(name: impl Into<String>, stages: Vec<PipelineStage>) -> Result<Self> {
        let pipeline = Self::new(name);
        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(Error::InvalidPipeline(format!(
                    "duplicate stage name '{}' in {}",
                    stage.name, pipeline.name
                )));
            }
        }
        Ok(Self { stages, ..pipeline })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub async fn run(&self, runner: &ProcessRunner) -> PipelineRun {
        let start = Instant::now();
        let log = runner.log();
        let mut results = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let result = runner
                .execute(&stage.name, &stage.command, stage.streaming)
                .await;
            let succeeded = result.succeeded;

            if !succeeded {
                if let Some(path) = &stage.error_log {
                    let target = runner.workdir().join(path);
                    match tokio::fs::write(&target, result.captured_text()).await {
                        Ok(()) => log.warning(format!("Error log saved to: {}", path.display())),
                        Err(err) => log.warning(format!(
                            "Failed to save error log {}: {}",
                            path.display(),
                            err
                        )),
                    }
                }
            }

            results.push(result);

            if !succeeded {
                break;
            }
        }

        let run = PipelineRun {
            pipeline: self.name.clone(),
            results,
            duration: start.elapsed().as_secs_f64(),
        };

        match run.failed_stage() {
            None => log.success(&self.success_message),
            Some(failed) => {
                let reason = failed
                    .failure
                    .as_ref()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "unknown failure".to_string());
                let diagnostics = Diagnostics::scan(&failed.captured_output);
                let mut message = format!(
                    "{} at stage '{}' ({})",
                    self.failure_message, failed.stage, reason
                );
                if !diagnostics.is_empty() {
                    message.push_str(&format!(": {}", diagnostics));
                }
                log.error(message);
            }
        }

        run
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::log::{LogLevel, StageLog};
    use std::path::Path;

    fn sh(script: &str) -> Command {
        Command::new(["sh", "-c", script]).unwrap()
    }

    fn runner(dir: &Path) -> ProcessRunner {
        ProcessRunner::new(StageLog::new(), dir)
    }

    #[test]
    fn test_duplicate_stage_names_rejected() {
        let result = BuildPipeline::new("build")
            .stage(PipelineStage::new("link", sh("true")))
            .and_then(|p| p.stage(PipelineStage::new("link", sh("true"))));
        assert!(matches!(result, Err(Error::InvalidPipeline(_))));

        let result = BuildPipeline::from_stages(
            "build",
            vec![
                PipelineStage::new("a", sh("true")),
                PipelineStage::new("a", sh("true")),
            ],
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_short_circuit_skips_later_stages() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let pipeline = BuildPipeline::from_stages(
            "build",
            vec![
                PipelineStage::new("one", sh("touch one")),
                PipelineStage::new("two", sh("exit 2")),
                PipelineStage::new("three", sh("touch three")),
            ],
        )
        .unwrap();

        let run = pipeline.run(&runner).await;

        assert!(!run.succeeded());
        assert_eq!(run.stages_executed(), 2);
        assert_eq!(run.failed_stage().unwrap().stage, "two");
        assert!(dir.path().join("one").exists());
        assert!(!dir.path().join("three").exists());

        let commands = runner
            .log()
            .entries()
            .into_iter()
            .filter(|e| e.level == LogLevel::Command)
            .count();
        assert_eq!(commands, 2);
    }

    #[tokio::test]
    async fn test_succeeded_iff_all_stages_succeeded() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let ok = BuildPipeline::from_stages(
            "ok",
            vec![
                PipelineStage::new("a", sh("true")),
                PipelineStage::new("b", sh("true")),
            ],
        )
        .unwrap()
        .run(&runner)
        .await;
        assert!(ok.succeeded());
        assert!(ok.results.iter().all(|r| r.succeeded));

        let failed = BuildPipeline::from_stages("bad", vec![PipelineStage::new("a", sh("false"))])
            .unwrap()
            .run(&runner)
            .await;
        assert!(!failed.succeeded());
        assert!(failed.results.iter().any(|r| !r.succeeded));
    }

    #[tokio::test]
    async fn test_streaming_stage_emits_lines_then_summary() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let run = BuildPipeline::new("build")
            .stage(PipelineStage::new("echo", sh("echo a; echo b; echo c")).streaming(true))
            .unwrap()
            .run(&runner)
            .await;

        assert!(run.succeeded());
        assert_eq!(run.results[0].captured_output, vec!["a", "b", "c"]);

        let entries: Vec<(LogLevel, String)> = runner
            .log()
            .entries()
            .into_iter()
            .filter(|e| e.level != LogLevel::Command)
            .map(|e| (e.level, e.message))
            .collect();
        assert_eq!(
            entries,
            vec![
                (LogLevel::Info, "a".to_string()),
                (LogLevel::Info, "b".to_string()),
                (LogLevel::Info, "c".to_string()),
                (LogLevel::Success, "build succeeded".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_stage_writes_error_log() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let run = BuildPipeline::new("build")
            .stage(
                PipelineStage::new("link", sh("echo 'undefined symbol' >&2; exit 1"))
                    .with_error_log("build_errors.log"),
            )
            .unwrap()
            .run(&runner)
            .await;

        let result = &run.results[0];
        assert!(!result.succeeded);
        assert_eq!(result.exit_code, 1);

        let content = std::fs::read_to_string(dir.path().join("build_errors.log")).unwrap();
        assert_eq!(content, result.captured_text());
        assert_eq!(content, "undefined symbol");

        let entries = runner.log().entries();
        assert!(entries
            .iter()
            .any(|e| e.level == LogLevel::Warning && e.message.contains("build_errors.log")));
        let last = entries.last().unwrap();
        assert_eq!(last.level, LogLevel::Error);
        assert!(last.message.starts_with("build failed at stage 'link'"));
        assert!(last.message.ends_with("1 error, 0 warnings"));
    }

    #[tokio::test]
    async fn test_successful_stage_leaves_no_error_log() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let run = BuildPipeline::new("build")
            .stage(PipelineStage::new("ok", sh("echo fine")).with_error_log("build_errors.log"))
            .unwrap()
            .run(&runner)
            .await;

        assert!(run.succeeded());
        assert!(!dir.path().join("build_errors.log").exists());
    }

    #[tokio::test]
    async fn test_custom_messages() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        BuildPipeline::new("verbose build")
            .with_messages("BUILD SUCCESSFUL", "BUILD FAILED")
            .stage(PipelineStage::new("ok", sh("true")))
            .unwrap()
            .run(&runner)
            .await;

        let last = runner.log().entries().pop().unwrap();
        assert_eq!(last.message, "BUILD SUCCESSFUL");
    }
}
