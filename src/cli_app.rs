//! Top-level CLI definition and dispatch.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory as _, Parser, Subcommand};
use colored::Colorize as _;

use crate::core::config::Snapshot;
use crate::core::errors::{CrawlerError, Result};
use crate::daemon::detach::{detach, DetachConfig};
use crate::daemon::loop_main::SchedulerLoop;
use crate::daemon::pids::{PidRecord, PidRegistry};
use crate::logger::Logger;
use crate::mail::SendmailMailer;
use crate::plugins::registry::PluginRegistry;

/// Config file consulted when `--cfg` is not given.
pub const DEFAULT_CONFIG: &str = "/etc/crawlerd/crawler.toml";

/// Pid registry directory when the config does not name one.
pub const DEFAULT_PIDDIR: &str = "/var/run/crawlerd";

/// Context assumed when neither the flag nor the config names one.
pub const DEFAULT_CONTEXT: &str = "PROD";

/// check-crawler: periodically fires storage check plugins per context.
#[derive(Parser)]
#[command(name = "crawlerd", version, about)]
pub struct Cli {
    /// Selected subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Start a daemon instance for one context.
    Start {
        /// Config file path.
        #[arg(long, value_name = "PATH")]
        cfg: Option<PathBuf>,
        /// Log file path (overrides crawler.logpath).
        #[arg(long, value_name = "PATH")]
        log: Option<PathBuf>,
        /// Context to run (overrides crawler.context).
        #[arg(long, value_name = "NAME")]
        context: Option<String>,
        /// Stay in the foreground; let the platform supervise.
        #[arg(long)]
        foreground: bool,
    },
    /// Ask a running instance to stop.
    Stop {
        /// Config file path (for the pid registry location).
        #[arg(long, value_name = "PATH")]
        cfg: Option<PathBuf>,
        /// Context to stop.
        #[arg(long, value_name = "NAME")]
        context: Option<String>,
        /// SIGTERM instead of the cooperative exit file.
        #[arg(long)]
        force: bool,
    },
    /// Report live instances.
    Status {
        /// Config file path (for the pid registry location).
        #[arg(long, value_name = "PATH")]
        cfg: Option<PathBuf>,
    },
    /// Run one plugin once, in the foreground, without daemonizing.
    Fire {
        /// Plugin name to fire.
        #[arg(long, value_name = "NAME")]
        plugin: String,
        /// Config file path.
        #[arg(long, value_name = "PATH")]
        cfg: Option<PathBuf>,
    },
    /// Generate a shell completion script.
    Completions {
        /// Target shell.
        shell: clap_complete::Shell,
    },
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Start {
            cfg,
            log,
            context,
            foreground,
        } => start(cfg.as_deref(), log.as_deref(), context.as_deref(), *foreground),
        Command::Stop {
            cfg,
            context,
            force,
        } => stop(cfg.as_deref(), context.as_deref(), *force),
        Command::Status { cfg } => status(cfg.as_deref()),
        Command::Fire { plugin, cfg } => fire(plugin, cfg.as_deref()),
        Command::Completions { shell } => {
            clap_complete::generate(
                *shell,
                &mut Cli::command(),
                "crawlerd",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

fn start(
    cfg: Option<&Path>,
    log: Option<&Path>,
    context: Option<&str>,
    foreground: bool,
) -> Result<()> {
    let config = Snapshot::load(cfg.unwrap_or_else(|| Path::new(DEFAULT_CONFIG)))?;
    let context = resolve_context(context, &config);
    let pids = pid_registry(Some(&config));

    if let Some(live) = pids.find_live(&context)? {
        return Err(CrawlerError::ContextBusy {
            context,
            pid: live.pid,
        });
    }

    // Everything configuration can get wrong must surface before detach:
    // past that point the parent has already exited 0 and stderr points at
    // the redirect target, so a config error would look like a clean start
    // for a daemon that died instantly. Building the loop parses heartbeat
    // and quiet-time; preflight resolves the plugin dir and loads the
    // configured plugin set.
    //
    // Exitpath is checked ahead of the logger so its absence is reported
    // even when the default log location is unwritable.
    let _ = config.get("crawler", "exitpath")?;
    let stdout = stdio_path(&config, "stdout");
    let stderr = stdio_path(&config, "stderr");
    let logger = open_logger(&config, log, &context, foreground)?;
    let mailer = Arc::new(SendmailMailer::new());
    let mut scheduler = SchedulerLoop::new(config, &context, pids, logger.clone(), mailer)?;
    scheduler.preflight()?;

    if !foreground {
        let detach_cfg = DetachConfig {
            stdout,
            stderr,
            // The log file is already open; spare it from the fd sweep.
            keep_fds: logger.raw_fd().into_iter().collect(),
            ..DetachConfig::default()
        };
        // The parent exits inside detach; only the daemonized grandchild
        // returns here.
        detach(&detach_cfg)?;
    }

    scheduler.run()
}

fn stop(cfg: Option<&Path>, context: Option<&str>, force: bool) -> Result<()> {
    let config = optional_snapshot(cfg)?;
    let pids = pid_registry(config.as_ref());
    let live = pids.list_live()?;

    if live.is_empty() {
        println!("crawlerd: not running");
        return Ok(());
    }

    match context {
        Some(wanted) => match live.iter().find(|r| r.context == wanted) {
            Some(record) => stop_instance(&pids, record, force),
            None => {
                println!("crawlerd: no live instance for context {wanted}");
                Ok(())
            }
        },
        None if live.len() == 1 => {
            let record = &live[0];
            if confirm(&format!(
                "Stop context {} (pid {})? [y/N] ",
                record.context, record.pid
            ))? {
                stop_instance(&pids, record, force)
            } else {
                println!("crawlerd: leaving {} running", record.context);
                Ok(())
            }
        }
        None => {
            let contexts: Vec<&str> = live.iter().map(|r| r.context.as_str()).collect();
            Err(CrawlerError::Runtime {
                details: format!(
                    "multiple live instances ({}); say which with --context",
                    contexts.join(", ")
                ),
            })
        }
    }
}

fn stop_instance(pids: &PidRegistry, record: &PidRecord, force: bool) -> Result<()> {
    if force {
        #[cfg(unix)]
        {
            pids.terminate(record.pid)?;
            println!(
                "crawlerd: context {} (pid {}) terminated",
                record.context, record.pid
            );
            return Ok(());
        }
        #[cfg(not(unix))]
        return Err(CrawlerError::Runtime {
            details: "--force requires a unix target".to_string(),
        });
    }
    std::fs::write(&record.exit_path, b"")
        .map_err(|e| CrawlerError::io(&record.exit_path, e))?;
    println!(
        "crawlerd: asked context {} (pid {}) to stop",
        record.context, record.pid
    );
    Ok(())
}

fn status(cfg: Option<&Path>) -> Result<()> {
    let config = optional_snapshot(cfg)?;
    let pids = pid_registry(config.as_ref());
    let live = pids.list_live()?;

    if live.is_empty() {
        println!("crawlerd: not running");
        return Ok(());
    }
    for record in live {
        let note = if record.exit_path.exists() {
            format!(" ({})", "termination requested".yellow())
        } else {
            String::new()
        };
        println!(
            "context {}: running (pid {}){note}",
            record.context.green().bold(),
            record.pid
        );
    }
    Ok(())
}

fn fire(plugin: &str, cfg: Option<&Path>) -> Result<()> {
    let config = Snapshot::load(cfg.unwrap_or_else(|| Path::new(DEFAULT_CONFIG)))?;
    let context = resolve_context(None, &config);
    let logger = Logger::stderr_only(&context);
    let mut registry = PluginRegistry::new(logger);
    registry.load_or_reload(plugin, &config)?;
    registry.force_fire(plugin, &config)?;
    println!("plugin {plugin} fired ok");
    Ok(())
}

fn resolve_context(flag: Option<&str>, config: &Snapshot) -> String {
    flag.map(str::to_string)
        .or_else(|| config.get_opt("crawler", "context").map(str::to_string))
        .unwrap_or_else(|| DEFAULT_CONTEXT.to_string())
}

fn pid_registry(config: Option<&Snapshot>) -> PidRegistry {
    let dir = config
        .and_then(|c| c.get_opt("crawler", "piddir"))
        .unwrap_or(DEFAULT_PIDDIR);
    PidRegistry::new(dir)
}

/// stop/status work without a readable config; they only need the registry.
fn optional_snapshot(cfg: Option<&Path>) -> Result<Option<Snapshot>> {
    match cfg {
        Some(path) => Snapshot::load(path).map(Some),
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if default.exists() {
                Snapshot::load(default).map(Some)
            } else {
                Ok(None)
            }
        }
    }
}

fn stdio_path(config: &Snapshot, option: &str) -> PathBuf {
    config
        .get_opt("crawler", option)
        .map_or_else(|| PathBuf::from("/dev/null"), PathBuf::from)
}

fn open_logger(
    config: &Snapshot,
    flag: Option<&Path>,
    context: &str,
    foreground: bool,
) -> Result<Logger> {
    let path = flag
        .map(Path::to_path_buf)
        .or_else(|| config.get_opt("crawler", "logpath").map(PathBuf::from));
    match path {
        Some(path) => Logger::open(path, context),
        None if foreground => Ok(Logger::stderr_only(context)),
        None => Logger::open(
            PathBuf::from(format!("/var/log/crawlerd/{context}.jsonl")),
            context,
        ),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    std::io::stdout()
        .flush()
        .map_err(|e| CrawlerError::io("/dev/stdout", e))?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .map_err(|e| CrawlerError::io("/dev/stdin", e))?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}
