use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::command::{object_path, shell_quote, Command, ShellScript, ToolchainCommands};
use crate::config::Config;
use crate::error::Result;
use crate::pipeline::BuildPipeline;
use crate::stage::PipelineStage;

/// Turns the configuration into concrete commands and named pipelines.
#[derive(Debug, Clone)]
pub struct Builder {
    config: Config,
    toolchain: ToolchainCommands,
}

impl Builder {
    pub fn new(config: Config) -> Self {
        let toolchain = ToolchainCommands::new(config.toolchain.clone());
        Self { config, toolchain }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn toolchain(&self) -> &ToolchainCommands {
        &self.toolchain
    }

    /// Objects in link order: `link_order` first, then any remaining
    /// sources (assembly before C).
    pub fn objects(&self) -> Vec<String> {
        let layout = &self.config.layout;
        let object_dir = &self.config.artifacts.object_dir;
        let sources: Vec<&str> = layout
            .asm_sources
            .iter()
            .chain(layout.c_sources.iter())
            .map(|source| source.object.as_str())
            .collect();

        let ordered = layout
            .link_order
            .iter()
            .map(String::as_str)
            .filter(|object| sources.contains(object));
        let rest = sources
            .iter()
            .copied()
            .filter(|object| !layout.link_order.iter().any(|o| o == object));

        ordered
            .chain(rest)
            .map(|object| object_path(object_dir, object))
            .collect()
    }

    fn compile_commands(&self) -> Result<Vec<(String, Command)>> {
        let layout = &self.config.layout;
        let object_dir = &self.config.artifacts.object_dir;
        let mut commands = Vec::new();

        for source in &layout.asm_sources {
            commands.push((
                format!("assemble:{}", source.source),
                self.toolchain.assemble(source, object_dir)?,
            ));
        }

        for source in &layout.c_sources {
            commands.push((
                format!("compile:{}", source.source),
                self.toolchain.compile(source, object_dir)?,
            ));
        }

        Ok(commands)
    }

    fn link_command(&self) -> Result<Command> {
        self.toolchain.link(
            &self.config.layout.linker_script,
            &self.config.artifacts.kernel,
            &self.objects(),
        )
    }

    /// One streaming stage per tool invocation, all sharing the error log.
    pub fn verbose_build(&self) -> Result<BuildPipeline> {
        let object_dir = self.config.artifacts.object_dir.clone();
        let error_log = self.config.logs.error_log.clone();

        let mut stages = vec![
            PipelineStage::new("reset-objects", self.toolchain.remove(&[object_dir.clone()])?),
            PipelineStage::new("create-objects", self.toolchain.make_dir(&object_dir)?),
        ];

        for (name, command) in self.compile_commands()? {
            stages.push(PipelineStage::new(name, command));
        }

        stages.push(PipelineStage::new("link", self.link_command()?));

        let stages = stages
            .into_iter()
            .map(|stage| stage.streaming(true).with_error_log(&error_log))
            .collect();

        Ok(BuildPipeline::from_stages("verbose build", stages)?
            .with_messages("BUILD SUCCESSFUL", "BUILD FAILED"))
    }

    /// Every compile step and the link composed into a single shell stage.
    pub fn quick_build_stage(&self) -> Result<PipelineStage> {
        let mut script = ShellScript::new().then(
            &self
                .toolchain
                .make_dir(&self.config.artifacts.object_dir)?,
        );

        for (_, command) in self.compile_commands()? {
            script = script.then(&command);
        }

        let command = script
            .then(&self.link_command()?)
            .into_command(self.toolchain.shell())?;

        Ok(PipelineStage::new("build", command))
    }

    pub fn package_stage(&self, tool: &str) -> Result<PipelineStage> {
        let artifacts = &self.config.artifacts;
        let staging = artifacts.staging_dir.as_str();
        let grub_dir = format!("{}/boot/grub", staging);

        let menu = self.grub_config();
        let printf = std::iter::once("printf '%s\\n'".to_string())
            .chain(menu.iter().map(|line| shell_quote(line)))
            .collect::<Vec<_>>()
            .join(" ");

        let command = ShellScript::new()
            .then(&self.toolchain.remove(&[staging.to_string()])?)
            .then(&self.toolchain.make_dir(&grub_dir)?)
            .then(
                &self
                    .toolchain
                    .copy(&artifacts.kernel, &format!("{}/boot/kernel", staging))?,
            )
            .then_raw(format!(
                "{} > {}",
                printf,
                shell_quote(&format!("{}/grub.cfg", grub_dir))
            ))
            .then(&self.toolchain.rescue(tool, &artifacts.image, staging)?)
            .then(&self.toolchain.remove(&[staging.to_string()])?)
            .into_command(self.toolchain.shell())?;

        Ok(PipelineStage::new("package", command))
    }

    pub fn grub_config(&self) -> Vec<String> {
        let image = &self.config.image;
        vec![
            format!("set timeout={}", image.timeout),
            "set default=0".to_string(),
            String::new(),
            format!("menuentry \"{}\" {{", image.menu_entry),
            format!("    echo \"{}\"", image.loading_message),
            "    multiboot2 /boot/kernel".to_string(),
            "    echo \"Booting kernel...\"".to_string(),
            "    boot".to_string(),
            "}".to_string(),
        ]
    }

    pub fn quick_build(&self) -> Result<BuildPipeline> {
        Ok(BuildPipeline::new("quick build")
            .with_messages("Kernel built successfully", "Build failed")
            .stage(self.quick_build_stage()?)?)
    }

    pub fn package(&self, tool: &str) -> Result<BuildPipeline> {
        Ok(BuildPipeline::new("package")
            .with_messages(
                format!("Image created: {}", self.config.artifacts.image),
                "Image creation failed",
            )
            .stage(self.package_stage(tool)?)?)
    }

    pub fn quick_build_and_package(&self, tool: &str) -> Result<BuildPipeline> {
        Ok(BuildPipeline::new("quick build+package")
            .with_messages(
                format!(
                    "Kernel and image created: {} is ready to boot",
                    self.config.artifacts.image
                ),
                "Build failed",
            )
            .stage(self.quick_build_stage()?)?
            .stage(self.package_stage(tool)?)?)
    }

    pub fn emulator_command(&self, image: &str) -> Result<Command> {
        let emulator = &self.config.emulator;
        let mut cmd = vec![emulator.program.clone()];
        cmd.extend(emulator.args.iter().map(|arg| arg.replace("{image}", image)));
        Command::new(cmd)
    }

    /// First configured packaging tool that can be found, in order.
    pub fn resolve_image_tool(&self) -> Option<String> {
        resolve_first(&self.config.image.tools, std::env::var_os("PATH"))
    }

    pub fn missing_tools(&self) -> Vec<String> {
        let path = std::env::var_os("PATH");
        let toolchain = &self.config.toolchain;

        let mut missing: Vec<String> = [
            &toolchain.assembler,
            &toolchain.compiler,
            &toolchain.linker,
            &self.config.emulator.program,
        ]
        .into_iter()
        .filter(|tool| find_executable(tool, path.clone()).is_none())
        .cloned()
        .collect();

        if resolve_first(&self.config.image.tools, path).is_none() {
            missing.push(self.config.image.tools.join(" or "));
        }

        missing
    }
}

pub fn resolve_first(candidates: &[String], path: Option<OsString>) -> Option<String> {
    candidates
        .iter()
        .find(|candidate| find_executable(candidate, path.clone()).is_some())
        .cloned()
}

pub fn find_executable(program: &str, path: Option<OsString>) -> Option<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        let candidate = PathBuf::from(program);
        return is_executable(&candidate).then_some(candidate);
    }

    let path = path?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .ok()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
