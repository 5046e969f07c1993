//! procfly: a process supervisor for apps deployed on a private network.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads configuration, renders templates and then runs the
//! supervisor and the environment watcher side by side until shutdown.

mod command;
mod config;
mod discovery;
mod error;
mod output;
mod paths;
mod process;
mod pty;
mod render;
mod restart;
mod runner;
mod scope;
mod supervisor;
mod watch;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::command::Command;
use crate::config::Overrides;
use crate::output::{MuxWriter, OutputOptions};
use crate::paths::Paths;
use crate::render::{process_env, Renderer, Vars};
use crate::runner::Runner;
use crate::scope::Scope;
use crate::supervisor::{Supervisor, SELF_NAME};
use crate::watch::{EnvSource, EnvWatcher};

/// Environment variable holding the tracing filter.
const LOG_ENV: &str = "PROCFLY_LOG";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "procfly",
    version,
    about = "Process supervisor with templated, change-gated reloads",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// The procfly directory (default: current directory).
    dir: Option<PathBuf>,
    /// Path to the configuration file (default: <DIR>/procfly.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Never colorize name prefixes.
    #[arg(long, global = true)]
    no_color: bool,
    /// Strip escape codes from process output.
    #[arg(long, global = true)]
    strip_ansi: bool,
    /// Time between environment refreshes (ms).
    #[arg(long, global = true)]
    interval_ms: Option<u64>,
    /// Diagnostic log filter, used when PROCFLY_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render templates and supervise processes (the default).
    Run {
        /// The procfly directory (default: current directory).
        dir: Option<PathBuf>,
    },
    /// Print the template value tree as JSON.
    Vars {
        /// The procfly directory (default: current directory).
        dir: Option<PathBuf>,
    },
    /// Show version information.
    Version,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            no_color: self.no_color,
            strip_ansi: self.strip_ansi,
            interval_ms: self.interval_ms,
        }
    }

    fn paths(&self, dir: Option<&Path>) -> Result<Paths> {
        let dir = dir.or(self.dir.as_deref()).unwrap_or(Path::new("."));
        let root = dir
            .canonicalize()
            .with_context(|| format!("failed to resolve procfly directory {}", dir.display()))?;
        let mut paths = Paths::new(root);
        if let Some(config) = &self.config {
            let config = if config.is_absolute() {
                config.clone()
            } else {
                std::env::current_dir()
                    .context("failed to read current directory")?
                    .join(config)
            };
            paths = paths.with_config_file(config);
        }
        Ok(paths)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match &cli.command {
        Some(Commands::Version) => {
            println!("procfly {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Vars { dir }) => print_vars(cli.paths(dir.as_deref())?).await,
        Some(Commands::Run { dir }) => run(&cli, cli.paths(dir.as_deref())?).await,
        None => run(&cli, cli.paths(None)?).await,
    }
}

/// Installs the diagnostics subscriber on stderr. Stdout carries process output.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn print_vars(paths: Paths) -> Result<()> {
    let discovery = discovery::from_env(std::env::var("FLY_APP_NAME").ok().as_deref());
    let vars = Vars::load(process_env(), &paths, discovery.as_ref())
        .await
        .context("failed to load vars")?;
    let json = serde_json::to_string_pretty(&vars).context("failed to encode vars")?;
    println!("{}", json);
    Ok(())
}

async fn run(cli: &Cli, paths: Paths) -> Result<()> {
    let config = config::load_config(&paths.config_file)?;
    config.validate()?;
    let settings = config.resolve(&cli.overrides(), OutputOptions::detect());
    debug!(root = %paths.root.display(), config = %paths.config_file.display(), "loaded config");

    let env = process_env();
    let discovery = discovery::from_env(env.get("FLY_APP_NAME").map(String::as_str));
    let vars = Vars::load(env, &paths, discovery.as_ref())
        .await
        .context("failed to load vars")?;

    let templates = Arc::new(config.templates());
    let renderer = Arc::new(Mutex::new(Renderer::new(paths.clone(), Arc::clone(&discovery))));
    let initial = watch::render_blocking(Arc::clone(&renderer), Arc::clone(&templates), vars.clone()).await?;
    info!(digest = %initial, "rendered templates");

    let groups = [
        config.init.clone(),
        config.processes.clone(),
        config.reload.clone(),
    ];
    let [init, processes, reload] = render_commands(Arc::clone(&renderer), groups, vars).await?;

    let token = CancellationToken::new();
    let runner = Runner::new(MuxWriter::stdout(settings.output))
        .with_dir(paths.root.clone())
        .with_grace(settings.stop_grace);
    let mut sup = Supervisor::new(Scope::from_token(token.clone()), runner, settings.supervisor);
    for (name, command) in init {
        sup.register_init(format!("init_{}", name), command);
    }
    for (name, command) in processes {
        sup.register_process(name, command);
    }
    for (name, command) in reload {
        sup.register_reload(format!("reload_{}", name), command);
    }
    let sup = Arc::new(sup);

    spawn_signal_listener(Arc::clone(&sup), token.clone());

    let changes = if settings.watch.template_files && !templates.files.is_empty() {
        let files = templates.files.values().map(|src| paths.resolve(src)).collect();
        let (tx, rx) = mpsc::channel(1);
        watch::spawn_template_watcher(files, settings.watch.debounce, tx)?;
        Some(rx)
    } else {
        None
    };

    let watcher = EnvWatcher::new(
        renderer,
        templates,
        EnvSource::new(paths, discovery),
        Arc::clone(&sup),
        initial,
    );
    let result =
        watch::run_with_watcher(Arc::clone(&sup), watcher, token, settings.watch.interval, changes).await;

    for (name, status) in sup.statuses() {
        if status.is_active() {
            warn!(name = %name, %status, "still active after shutdown");
        } else {
            debug!(name = %name, %status, "final status");
        }
    }
    result
}

/// Renders every command group on a blocking thread.
async fn render_commands<const N: usize>(
    renderer: Arc<Mutex<Renderer>>,
    groups: [BTreeMap<String, String>; N],
    vars: Vars,
) -> Result<[BTreeMap<String, Command>; N]> {
    tokio::task::spawn_blocking(move || {
        let mut renderer = renderer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rendered = Vec::with_capacity(N);
        for group in &groups {
            rendered.push(renderer.commands(group, &vars)?);
        }
        Ok::<_, error::RenderError>(rendered)
    })
    .await
    .context("render task failed")?
    .context("failed to render commands")?
    .try_into()
    .map_err(|_| anyhow::anyhow!("rendered an unexpected number of command groups"))
}

fn spawn_signal_listener(sup: Arc<Supervisor>, token: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => return,
        };
        let name = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = token.cancelled() => return,
        };
        sup.log(SELF_NAME, format!("Received {}, shutting down.", name));
        token.cancel();
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_runs_the_current_directory() {
        let cli = Cli::try_parse_from(["procfly"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.dir.is_none());
        assert_eq!(cli.log_level, "warn");
    }

    #[test]
    fn run_accepts_a_directory_and_trailing_flags() {
        let cli = Cli::try_parse_from(["procfly", "run", "/srv/app", "--no-color", "--interval-ms", "250"])
            .unwrap();
        match &cli.command {
            Some(Commands::Run { dir }) => assert_eq!(dir.as_deref(), Some(Path::new("/srv/app"))),
            other => panic!("unexpected command: {:?}", other),
        }
        let overrides = cli.overrides();
        assert!(overrides.no_color);
        assert!(!overrides.strip_ansi);
        assert_eq!(overrides.interval_ms, Some(250));
    }

    #[test]
    fn directory_without_subcommand() {
        let cli = Cli::try_parse_from(["procfly", "--strip-ansi", "/srv/app"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.dir.as_deref(), Some(Path::new("/srv/app")));
        assert!(cli.overrides().strip_ansi);
    }

    #[test]
    fn vars_and_version_subcommands() {
        let cli = Cli::try_parse_from(["procfly", "vars"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Vars { dir: None })));
        let cli = Cli::try_parse_from(["procfly", "version"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Version)));
    }

    #[test]
    fn paths_resolve_config_against_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let cli = Cli::try_parse_from(["procfly", "--config", "/etc/procfly.toml", root]).unwrap();
        let paths = cli.paths(None).unwrap();
        assert_eq!(paths.root, dir.path().canonicalize().unwrap());
        assert_eq!(paths.config_file, PathBuf::from("/etc/procfly.toml"));

        let cli = Cli::try_parse_from(["procfly", root]).unwrap();
        let paths = cli.paths(None).unwrap();
        assert_eq!(paths.config_file, paths.root.join("procfly.toml"));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let cli = Cli::try_parse_from(["procfly", "/definitely/not/here"]).unwrap();
        let err = cli.paths(None).unwrap_err();
        assert!(err.to_string().contains("failed to resolve procfly directory"), "{}", err);
    }
}
