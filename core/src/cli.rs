use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "popbuild")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(
        short = 'C',
        long = "directory",
        value_name = "DIR",
        help = "Kernel source directory"
    )]
    pub source_dir: Option<PathBuf>,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Print events as JSON lines instead of text")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    #[command(about = "Remove build artifacts")]
    Clean,

    #[command(about = "Verbose build: one streamed step per source file")]
    Build,

    #[command(about = "Quick build and create the bootable image")]
    Package,

    #[command(about = "Boot the image in the emulator")]
    Run,

    #[command(about = "Clean, build, package and run")]
    Automate,

    #[command(about = "Check the source layout and external tools")]
    Check,

    #[command(about = "Write a default popbuild.toml")]
    Init,
}

impl Cli {
    pub fn source_directory(&self) -> anyhow::Result<PathBuf> {
        match &self.source_dir {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir().context("Failed to determine current directory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directory_and_command() {
        let cli = Cli::parse_from(["popbuild", "-C", "/tmp/popcorn", "automate"]);
        assert_eq!(cli.source_directory().unwrap(), PathBuf::from("/tmp/popcorn"));
        assert_eq!(cli.command, Some(Commands::Automate));
        assert!(!cli.json);
    }

    #[test]
    fn test_no_command_is_interactive() {
        let cli = Cli::parse_from(["popbuild", "--json"]);
        assert!(cli.command.is_none());
        assert!(cli.json);
    }
}
