use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

use crate::config::{SourceFile, ToolchainConfig};
use crate::error::{Error, Result};

static SHELL_SAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_@%+=:,./-]+$").unwrap());

/// Program plus arguments. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command {
    tokens: Vec<String>,
}

impl Command {
    pub fn new<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();

        match tokens.first() {
            Some(program) if !program.is_empty() => Ok(Self { tokens }),
            _ => Err(Error::InvalidPipeline("command is empty".to_string())),
        }
    }

    pub fn program(&self) -> &str {
        &self.tokens[0]
    }

    pub fn args(&self) -> &[String] {
        &self.tokens[1..]
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn shell_line(&self) -> String {
        self.tokens
            .iter()
            .map(|token| shell_quote(token))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shell_line())
    }
}

pub fn shell_quote(token: &str) -> String {
    if SHELL_SAFE.is_match(token) {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

/// Steps chained with `&&` and handed to a shell as one command.
#[derive(Debug, Clone, Default)]
pub struct ShellScript {
    segments: Vec<String>,
}

impl ShellScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, command: &Command) -> Self {
        self.segments.push(command.shell_line());
        self
    }

    pub fn then_raw(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn script(&self) -> String {
        self.segments.join(" && ")
    }

    pub fn into_command(self, shell: &str) -> Result<Command> {
        Command::new([shell.to_string(), "-c".to_string(), self.script()])
    }
}

#[derive(Debug, Clone)]
pub struct ToolchainCommands {
    config: ToolchainConfig,
}

impl ToolchainCommands {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    pub fn shell(&self) -> &str {
        &self.config.shell
    }

    pub fn assemble(&self, source: &SourceFile, object_dir: &str) -> Result<Command> {
        let mut cmd = vec![self.config.assembler.clone()];
        cmd.extend(self.config.asm_flags.iter().cloned());
        cmd.push(source.source.clone());
        cmd.push("-o".to_string());
        cmd.push(object_path(object_dir, &source.object));
        Command::new(cmd)
    }

    pub fn compile(&self, source: &SourceFile, object_dir: &str) -> Result<Command> {
        let mut cmd = vec![
            self.config.compiler.clone(),
            "-m64".to_string(),
            "-c".to_string(),
            source.source.clone(),
            "-o".to_string(),
            object_path(object_dir, &source.object),
        ];
        cmd.extend(self.config.cflags.iter().cloned());
        Command::new(cmd)
    }

    pub fn link(&self, script: &str, output: &str, objects: &[String]) -> Result<Command> {
        let mut cmd = vec![self.config.linker.clone()];
        cmd.extend(self.config.ldflags.iter().cloned());
        cmd.extend([
            "-T".to_string(),
            script.to_string(),
            "-o".to_string(),
            output.to_string(),
        ]);
        cmd.extend_from_slice(objects);
        Command::new(cmd)
    }

    pub fn make_dir(&self, path: &str) -> Result<Command> {
        Command::new(["mkdir", "-p", path])
    }

    pub fn remove(&self, paths: &[String]) -> Result<Command> {
        const BASE: [&str; 2] = ["rm", "-rf"];
        let mut cmd = Vec::with_capacity(BASE.len() + paths.len());
        cmd.extend(BASE.iter().map(|s| s.to_string()));
        cmd.extend_from_slice(paths);
        Command::new(cmd)
    }

    pub fn copy(&self, from: &str, to: &str) -> Result<Command> {
        Command::new(["cp", from, to])
    }

    pub fn rescue(&self, tool: &str, image: &str, staging_dir: &str) -> Result<Command> {
        Command::new([tool, "-o", image, staging_dir])
    }
}

pub fn object_path(object_dir: &str, object: &str) -> String {
    format!("{}/{}", object_dir.trim_end_matches('/'), object)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(source: &str, object: &str) -> SourceFile {
        SourceFile {
            source: source.to_string(),
            object: object.to_string(),
        }
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(Command::new(Vec::<String>::new()).is_err());
        assert!(Command::new([""]).is_err());
    }

    #[test]
    fn test_program_and_args() {
        let cmd = Command::new(["nasm", "-f", "elf64"]).unwrap();
        assert_eq!(cmd.program(), "nasm");
        assert_eq!(cmd.args(), &["-f".to_string(), "elf64".to_string()]);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("obj/kc.o"), "obj/kc.o");
        assert_eq!(shell_quote("-mcmodel=large"), "-mcmodel=large");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_shell_script_joins_with_and() {
        let mkdir = Command::new(["mkdir", "-p", "obj"]).unwrap();
        let cmd = ShellScript::new()
            .then(&mkdir)
            .then_raw("echo done > out.txt")
            .into_command("sh")
            .unwrap();

        assert_eq!(
            cmd.tokens(),
            &[
                "sh".to_string(),
                "-c".to_string(),
                "mkdir -p obj && echo done > out.txt".to_string()
            ]
        );
    }

    #[test]
    fn test_toolchain_commands() {
        let toolchain = ToolchainCommands::new(ToolchainConfig::default());

        let asm = toolchain
            .assemble(&source("kernel.asm", "kasm.o"), "obj")
            .unwrap();
        assert_eq!(asm.shell_line(), "nasm -f elf64 kernel.asm -o obj/kasm.o");

        let cc = toolchain.compile(&source("kernel.c", "kc.o"), "obj/").unwrap();
        assert_eq!(
            cc.shell_line(),
            "gcc -m64 -c kernel.c -o obj/kc.o -Wall -Wextra -fno-stack-protector -mcmodel=large -mno-red-zone"
        );

        let ld = toolchain
            .link(
                "link.ld",
                "kernel",
                &["obj/kasm.o".to_string(), "obj/kc.o".to_string()],
            )
            .unwrap();
        assert_eq!(
            ld.shell_line(),
            "ld -m elf_x86_64 -T link.ld -o kernel obj/kasm.o obj/kc.o"
        );

        let rescue = toolchain
            .rescue("grub2-mkrescue", "popcorn.iso", "isodir")
            .unwrap();
        assert_eq!(rescue.shell_line(), "grub2-mkrescue -o popcorn.iso isodir");
    }
}
