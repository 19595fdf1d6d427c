use anyhow::{Context, Result};
use std::future::Future;
use clap::Parser;
use popbuild_core::config::CONFIG_FILE;
use popbuild_core::logger::Logger;
use popbuild_core::{AutomationOutcome, Cli, Commands, Config, Event, Orchestrator};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const HELP: &str = "Commands:
  build      verbose build, one streamed step per source file
  package    quick build and create the bootable image
  run        boot the image in the emulator
  stop       stop the running emulator
  automate   clean, build, package and run
  clean      remove build artifacts
  check      check the source layout and external tools
  save       save the session log
  clear      clear the session log
  status     show build and emulator state
  help       show this message
  quit       stop the emulator and exit";

fn spawn_renderer(mut events: mpsc::UnboundedReceiver<Event>, logger: Logger) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            logger.event(&event);
        }
    })
}

fn init_config(cli: &Cli) -> Result<()> {
    let config_path = cli.source_directory()?.join(CONFIG_FILE);

    if config_path.exists() {
        anyhow::bail!(
            "{} already exists at {}. Remove it first if you want to reinitialize.",
            CONFIG_FILE,
            config_path.display()
        );
    }

    Config::default()
        .save_to_file(&config_path)
        .with_context(|| format!("Failed to save {}", CONFIG_FILE))?;

    println!("Created {} at {}", CONFIG_FILE, config_path.display());
    Ok(())
}

/// Waits for an emulator-owning task, forwarding every interrupt as a stop
/// request until the task completes.
async fn until_exit<T, I, F>(
    orchestrator: &Orchestrator,
    mut handle: JoinHandle<T>,
    mut interrupt: I,
) -> Result<T>
where
    I: FnMut() -> F,
    F: Future<Output = std::io::Result<()>>,
{
    loop {
        tokio::select! {
            result = &mut handle => return Ok(result?),
            signal = interrupt() => {
                signal?;
                if !orchestrator.stop_emulator() {
                    orchestrator
                        .log()
                        .info("No emulator running yet; interrupt again once it starts");
                }
            }
        }
    }
}

async fn run_command(cli: &Cli, orchestrator: &Orchestrator, command: Commands) -> Result<bool> {
    let succeeded = match command {
        Commands::Clean => orchestrator.clean().await.is_ok(),
        Commands::Build => match orchestrator.build_verbose() {
            Ok(handle) => handle.await?.succeeded(),
            Err(_) => false,
        },
        Commands::Package => match orchestrator.build_and_package() {
            Ok(handle) => handle.await?.succeeded(),
            Err(_) => false,
        },
        Commands::Run => match orchestrator.run_emulator() {
            Ok(handle) => {
                until_exit(orchestrator, handle, tokio::signal::ctrl_c).await?;
                true
            }
            Err(_) => false,
        },
        Commands::Automate => match orchestrator.automate() {
            Ok(handle) => matches!(
                until_exit(orchestrator, handle, tokio::signal::ctrl_c).await?,
                AutomationOutcome::Completed(_)
            ),
            Err(_) => false,
        },
        Commands::Check => {
            let layout = orchestrator.check_layout().is_ok();
            if layout {
                orchestrator.log().success("Source layout complete");
            }
            let missing = orchestrator.check_dependencies();
            layout && missing.is_empty()
        }
        Commands::Init => {
            init_config(cli)?;
            true
        }
    };

    Ok(succeeded)
}

fn track<T: Send + 'static>(pending: &mut Vec<JoinHandle<()>>, handle: JoinHandle<T>) {
    pending.retain(|task| !task.is_finished());
    pending.push(tokio::spawn(async move {
        let _ = handle.await;
    }));
}

async fn interactive(orchestrator: &Orchestrator) -> Result<()> {
    let log = orchestrator.log();
    log.info(format!(
        "popbuild ready in {}. Type 'help' for commands.",
        orchestrator.root().display()
    ));

    if orchestrator.check_layout().is_ok() {
        log.success("Source layout complete");
    }
    orchestrator.check_dependencies();

    let mut pending: Vec<JoinHandle<()>> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        // Rejected operations have already been logged.
        match line.trim() {
            "" => {}
            "build" => {
                if let Ok(handle) = orchestrator.build_verbose() {
                    track(&mut pending, handle);
                }
            }
            "package" | "quick" => {
                if let Ok(handle) = orchestrator.build_and_package() {
                    track(&mut pending, handle);
                }
            }
            "run" => {
                if let Ok(handle) = orchestrator.run_emulator() {
                    track(&mut pending, handle);
                }
            }
            "automate" => {
                if let Ok(handle) = orchestrator.automate() {
                    track(&mut pending, handle);
                }
            }
            "stop" => {
                if !orchestrator.stop_emulator() {
                    log.info("No emulator running");
                }
            }
            "clean" => {
                let orchestrator = orchestrator.clone();
                track(
                    &mut pending,
                    tokio::spawn(async move { orchestrator.clean().await }),
                );
            }
            "check" => {
                if orchestrator.check_layout().is_ok() {
                    log.success("Source layout complete");
                }
                orchestrator.check_dependencies();
            }
            "save" => {
                orchestrator.save_log();
            }
            "clear" => orchestrator.clear_log(),
            "status" => {
                let state = orchestrator.state();
                log.info(format!(
                    "Build: {} | Emulator: {}",
                    if state.build_in_progress { "running" } else { "idle" },
                    state.emulator
                ));
            }
            "help" => {
                for line in HELP.lines() {
                    log.info(line);
                }
            }
            "quit" | "exit" => break,
            other => log.warning(format!("Unknown command: {}. Type 'help'.", other)),
        }
    }

    orchestrator.stop_emulator();
    for task in pending {
        let _ = task.await;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let root = cli.source_directory()?;
    let config = Config::load_from_cli(&cli)?;
    let orchestrator = Orchestrator::new(root, config);

    let logger = if cli.json { Logger::json() } else { Logger::new() };
    let renderer = spawn_renderer(orchestrator.subscribe(), logger);

    let succeeded = match cli.command {
        Some(command) => run_command(&cli, &orchestrator, command).await?,
        None => {
            interactive(&orchestrator).await?;
            true
        }
    };

    // Closing the log ends the renderer once it has drained.
    drop(orchestrator);
    renderer.await?;

    if !succeeded {
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};

    #[test]
    fn test_help_lists_every_console_command() {
        for command in ["build", "package", "run", "stop", "automate", "clean", "save", "quit"] {
            assert!(HELP.contains(command));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_until_exit_forwards_later_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("popcorn.iso"), "").unwrap();
        let mut config = Config::default();
        config.emulator.program = "sleep".to_string();
        config.emulator.args = vec!["30".to_string()];
        let orchestrator = Orchestrator::new(dir.path(), config);

        let (go_tx, go_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let launcher = orchestrator.clone();
        let task = tokio::spawn(async move {
            go_rx.await.unwrap();
            let session = launcher.run_emulator().unwrap();
            started_tx.send(()).unwrap();
            session.await.unwrap()
        });

        let interrupts = Arc::new(Notify::new());
        let waiter = {
            let orchestrator = orchestrator.clone();
            let interrupts = Arc::clone(&interrupts);
            tokio::spawn(async move {
                until_exit(&orchestrator, task, move || {
                    let interrupts = Arc::clone(&interrupts);
                    async move {
                        interrupts.notified().await;
                        Ok(())
                    }
                })
                .await
            })
        };

        // First interrupt arrives before the emulator exists.
        interrupts.notify_one();
        tokio::time::timeout(Duration::from_secs(10), async {
            while !orchestrator
                .log()
                .entries()
                .iter()
                .any(|e| e.message.starts_with("No emulator running yet"))
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        go_tx.send(()).unwrap();
        started_rx.await.unwrap();
        interrupts.notify_one();

        let exit = tokio::time::timeout(Duration::from_secs(10), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, popbuild_core::SessionExit::Terminated);
    }
}
