use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::Cli;

pub const CONFIG_FILE: &str = "popbuild.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub emulator: EmulatorConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub source: String,
    pub object: String,
}

impl SourceFile {
    fn new(source: &str, object: &str) -> Self {
        Self {
            source: source.to_string(),
            object: object.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_linker_script")]
    pub linker_script: String,
    /// Objects in link order. Objects not listed here are linked after them.
    #[serde(default = "default_link_order")]
    pub link_order: Vec<String>,
    #[serde(default = "default_asm_sources")]
    pub asm_sources: Vec<SourceFile>,
    #[serde(default = "default_c_sources")]
    pub c_sources: Vec<SourceFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_assembler")]
    pub assembler: String,
    #[serde(default = "default_asm_flags")]
    pub asm_flags: Vec<String>,
    #[serde(default = "default_compiler")]
    pub compiler: String,
    #[serde(default = "default_cflags")]
    pub cflags: Vec<String>,
    #[serde(default = "default_linker")]
    pub linker: String,
    #[serde(default = "default_ldflags")]
    pub ldflags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default = "default_object_dir")]
    pub object_dir: String,
    #[serde(default = "default_kernel")]
    pub kernel: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Packaging tools in order of preference; the first one found wins.
    #[serde(default = "default_image_tools")]
    pub tools: Vec<String>,
    #[serde(default = "default_menu_entry")]
    pub menu_entry: String,
    #[serde(default = "default_loading_message")]
    pub loading_message: String,
    #[serde(default = "default_boot_timeout")]
    pub timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    #[serde(default = "default_emulator_program")]
    pub program: String,
    /// `{image}` is replaced with the disk image path.
    #[serde(default = "default_emulator_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub stdin: EmulatorInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmulatorInput {
    /// The emulator reads the terminal, for `-serial stdio` and `-nographic`.
    #[default]
    Inherit,
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    #[serde(default = "default_error_log")]
    pub error_log: String,
    #[serde(default = "default_session_log")]
    pub session_log: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Quick,
    Verbose,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default)]
    pub build_mode: BuildMode,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            asm_sources: default_asm_sources(),
            c_sources: default_c_sources(),
            linker_script: default_linker_script(),
            link_order: default_link_order(),
        }
    }
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            assembler: default_assembler(),
            asm_flags: default_asm_flags(),
            compiler: default_compiler(),
            cflags: default_cflags(),
            linker: default_linker(),
            ldflags: default_ldflags(),
        }
    }
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            object_dir: default_object_dir(),
            kernel: default_kernel(),
            image: default_image(),
            staging_dir: default_staging_dir(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            tools: default_image_tools(),
            menu_entry: default_menu_entry(),
            loading_message: default_loading_message(),
            timeout: default_boot_timeout(),
        }
    }
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            program: default_emulator_program(),
            args: default_emulator_args(),
            stdin: EmulatorInput::default(),
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            error_log: default_error_log(),
            session_log: default_session_log(),
        }
    }
}

fn default_asm_sources() -> Vec<SourceFile> {
    vec![
        SourceFile::new("kernel.asm", "kasm.o"),
        SourceFile::new("idt.asm", "idt.o"),
    ]
}

fn default_c_sources() -> Vec<SourceFile> {
    let mut sources = vec![SourceFile::new("kernel.c", "kc.o")];
    sources.extend(
        [
            "console",
            "utils",
            "pop_module",
            "shimjapii_pop",
            "spinner_pop",
            "uptime_pop",
            "halt_pop",
            "filesystem_pop",
            "multiboot2",
            "sysinfo_pop",
            "memory_pop",
            "cpu_pop",
            "dolphin_pop",
            "timer",
            "scheduler",
            "memory",
            "init",
        ]
        .iter()
        .map(|stem| SourceFile::new(&format!("{stem}.c"), &format!("{stem}.o"))),
    );
    sources
}

fn default_linker_script() -> String {
    "link.ld".to_string()
}

fn default_link_order() -> Vec<String> {
    [
        "kasm",
        "kc",
        "console",
        "utils",
        "pop_module",
        "shimjapii_pop",
        "idt",
        "spinner_pop",
        "uptime_pop",
        "halt_pop",
        "filesystem_pop",
        "multiboot2",
        "sysinfo_pop",
        "memory_pop",
        "cpu_pop",
        "dolphin_pop",
        "timer",
        "scheduler",
        "memory",
        "init",
    ]
    .iter()
    .map(|stem| format!("{stem}.o"))
    .collect()
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_assembler() -> String {
    "nasm".to_string()
}

fn default_asm_flags() -> Vec<String> {
    vec!["-f".to_string(), "elf64".to_string()]
}

fn default_compiler() -> String {
    "gcc".to_string()
}

fn default_cflags() -> Vec<String> {
    [
        "-Wall",
        "-Wextra",
        "-fno-stack-protector",
        "-mcmodel=large",
        "-mno-red-zone",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_linker() -> String {
    "ld".to_string()
}

fn default_ldflags() -> Vec<String> {
    vec!["-m".to_string(), "elf_x86_64".to_string()]
}

fn default_object_dir() -> String {
    "obj".to_string()
}

fn default_kernel() -> String {
    "kernel".to_string()
}

fn default_image() -> String {
    "popcorn.iso".to_string()
}

fn default_staging_dir() -> String {
    "isodir".to_string()
}

fn default_image_tools() -> Vec<String> {
    vec!["grub2-mkrescue".to_string(), "grub-mkrescue".to_string()]
}

fn default_menu_entry() -> String {
    "Popcorn Kernel x64".to_string()
}

fn default_loading_message() -> String {
    "Loading Popcorn kernel...".to_string()
}

fn default_boot_timeout() -> u32 {
    3
}

fn default_emulator_program() -> String {
    "qemu-system-x86_64".to_string()
}

fn default_emulator_args() -> Vec<String> {
    ["-cdrom", "{image}", "-cpu", "qemu64", "-m", "256"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_error_log() -> String {
    "build_errors.log".to_string()
}

fn default_session_log() -> String {
    "build_log.txt".to_string()
}

impl LayoutConfig {
    /// Files that must exist before any build is attempted, in build order.
    pub fn required_files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = self.asm_sources.iter().map(|s| s.source.as_str()).collect();
        files.push(self.linker_script.as_str());
        files.extend(self.c_sources.iter().map(|s| s.source.as_str()));
        files
    }

    pub fn missing_files(&self, root: &Path) -> Vec<String> {
        self.required_files()
            .into_iter()
            .filter(|file| !root.join(file).exists())
            .map(|file| file.to_string())
            .collect()
    }
}

impl ArtifactsConfig {
    pub fn all(&self) -> Vec<String> {
        vec![
            self.object_dir.clone(),
            self.kernel.clone(),
            self.image.clone(),
            self.staging_dir.clone(),
        ]
    }
}

impl Config {
    /// Explicit `--config` first, then `popbuild.toml` in the source directory.
    pub fn load_from_cli(cli: &Cli) -> anyhow::Result<Self> {
        match &cli.config {
            Some(path) => {
                let path = Config::expand_path(&path.to_string_lossy());
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                Config::load_from_file(path)
            }
            None => Config::load_from_file(cli.source_directory()?.join(CONFIG_FILE)),
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    pub fn expand_path(path: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path);
        PathBuf::from(expanded.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_popcorn_layout() {
        let config = Config::default();
        assert_eq!(config.layout.asm_sources.len(), 2);
        assert_eq!(config.layout.c_sources.len(), 18);
        assert_eq!(config.layout.c_sources[0], SourceFile::new("kernel.c", "kc.o"));
        assert_eq!(config.artifacts.image, "popcorn.iso");
        assert_eq!(config.image.tools, vec!["grub2-mkrescue", "grub-mkrescue"]);
        assert_eq!(config.automation.build_mode, BuildMode::Quick);
        assert_eq!(config.emulator.stdin, EmulatorInput::Inherit);
        assert_eq!(config.image.loading_message, "Loading Popcorn kernel...");
    }

    #[test]
    fn test_default_link_order_covers_every_object() {
        let layout = LayoutConfig::default();
        assert_eq!(layout.link_order.len(), 20);
        assert_eq!(&layout.link_order[..7], &[
            "kasm.o",
            "kc.o",
            "console.o",
            "utils.o",
            "pop_module.o",
            "shimjapii_pop.o",
            "idt.o"
        ]);
        for source in layout.asm_sources.iter().chain(layout.c_sources.iter()) {
            assert!(layout.link_order.contains(&source.object), "{}", source.object);
        }
    }

    #[test]
    fn test_emulator_stdin_from_toml() {
        let config: Config = toml::from_str(
            r#"
            [emulator]
            stdin = "null"
            "#,
        )
        .unwrap();
        assert_eq!(config.emulator.stdin, EmulatorInput::Null);
        assert_eq!(config.emulator.program, "qemu-system-x86_64");
    }

    #[test]
    fn test_required_files_order() {
        let config = Config::default();
        let files = config.layout.required_files();
        assert_eq!(&files[..4], &["kernel.asm", "idt.asm", "link.ld", "kernel.c"]);
    }

    #[test]
    fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kernel.asm"), "").unwrap();

        let layout = LayoutConfig {
            asm_sources: vec![SourceFile::new("kernel.asm", "kasm.o")],
            c_sources: vec![SourceFile::new("kernel.c", "kc.o")],
            linker_script: "link.ld".to_string(),
            link_order: Vec::new(),
        };

        assert_eq!(layout.missing_files(dir.path()), vec!["link.ld", "kernel.c"]);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [toolchain]
            compiler = "clang"

            [automation]
            build_mode = "verbose"
            "#,
        )
        .unwrap();

        assert_eq!(config.toolchain.compiler, "clang");
        assert_eq!(config.toolchain.assembler, "nasm");
        assert_eq!(config.automation.build_mode, BuildMode::Verbose);
        assert_eq!(config.logs.error_log, "build_errors.log");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_file(dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.artifacts.kernel, "kernel");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut config = Config::default();
        config.emulator.program = "qemu-system-i386".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.emulator.program, "qemu-system-i386");
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[layout\n").unwrap();

        let err = Config::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
