//! Configuration management for procfly.
//!
//! This module defines the structure of the `procfly.toml` configuration file,
//! loads and validates it, and resolves it together with command-line
//! overrides into runtime settings.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::output::OutputOptions;
use crate::render::Templates;
use crate::restart::Backoff;
use crate::runner::DEFAULT_GRACE;
use crate::supervisor::Settings;
use crate::watch::WatchSettings;

/// Top-level configuration structure corresponding to `procfly.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Destination -> inline template text.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    /// Destination -> template source file.
    #[serde(default)]
    pub template_files: BTreeMap<String, String>,
    /// Commands that must succeed before any process starts.
    #[serde(default)]
    pub init: BTreeMap<String, String>,
    /// Supervised, restarted processes.
    #[serde(default)]
    pub processes: BTreeMap<String, String>,
    /// Commands run when rendered configuration changes, keyed by process.
    #[serde(default)]
    pub reload: BTreeMap<String, String>,
    pub supervisor: Option<SupervisorConfig>,
    pub watch: Option<WatchConfig>,
    pub output: Option<OutputConfig>,
}

/// Timeouts and restart policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SupervisorConfig {
    /// Bound on the init group (default: 10000).
    pub init_timeout_ms: Option<u64>,
    /// Bound on the reload group (default: 5000).
    pub reload_timeout_ms: Option<u64>,
    /// Time between interrupt and kill when stopping (default: 5000).
    pub stop_grace_ms: Option<u64>,
    /// First restart delay (default: 1000).
    pub backoff_initial_ms: Option<u64>,
    /// Growth factor between restart delays (default: 2.0).
    pub backoff_multiplier: Option<f64>,
    /// Longest restart delay (default: 15000).
    pub backoff_max_ms: Option<u64>,
    /// Uptime after which restart delays start over (default: 15000).
    pub backoff_reset_ms: Option<u64>,
}

/// Environment polling.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchConfig {
    /// Time between environment refreshes (default: 5000).
    pub interval_ms: Option<u64>,
    /// Also re-render when a template source file changes (default: true).
    pub template_files: Option<bool>,
    /// Debounce interval for template file events (default: 200).
    pub debounce_ms: Option<u64>,
}

/// Output decoration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    /// Colorize name prefixes (default: when stdout is a terminal).
    pub color: Option<bool>,
    /// Strip escape codes from process output (default: false).
    pub strip_ansi: Option<bool>,
}

/// Command-line flags that take precedence over the file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub no_color: bool,
    pub strip_ansi: bool,
    pub interval_ms: Option<u64>,
}

/// Everything `run` needs besides the command groups.
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub supervisor: Settings,
    pub stop_grace: Duration,
    pub watch: WatchSettings,
    pub output: OutputOptions,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

impl Config {
    /// Checks cross references that the file format cannot express.
    pub fn validate(&self) -> Result<()> {
        for name in self.reload.keys() {
            if !self.processes.contains_key(name) {
                bail!("reload: unknown proc: {}", name);
            }
        }
        for (group, commands) in [
            ("init", &self.init),
            ("processes", &self.processes),
            ("reload", &self.reload),
        ] {
            for (name, command) in commands {
                if command.trim().is_empty() {
                    bail!("{}: {}: empty command", group, name);
                }
            }
        }
        if let Some(multiplier) = self.supervisor.as_ref().and_then(|s| s.backoff_multiplier) {
            if !multiplier.is_finite() || multiplier < 1.0 {
                bail!("supervisor: backoff_multiplier must be at least 1.0, got {}", multiplier);
            }
        }
        Ok(())
    }

    pub fn templates(&self) -> Templates {
        Templates {
            inline: self.templates.clone(),
            files: self.template_files.clone(),
        }
    }

    /// Merges file settings, `overrides` and built-in defaults.
    ///
    /// `detected` supplies output defaults that depend on the terminal.
    pub fn resolve(&self, overrides: &Overrides, detected: OutputOptions) -> RunSettings {
        let sup = self.supervisor.clone().unwrap_or_default();
        let watch = self.watch.clone().unwrap_or_default();
        let output = self.output.clone().unwrap_or_default();
        let defaults = Settings::default();
        let ms = Duration::from_millis;

        let backoff = Backoff {
            initial: sup.backoff_initial_ms.map_or(defaults.backoff.initial, ms),
            multiplier: sup
                .backoff_multiplier
                .unwrap_or(defaults.backoff.multiplier),
            max: sup.backoff_max_ms.map_or(defaults.backoff.max, ms),
            reset_after: sup.backoff_reset_ms.map_or(defaults.backoff.reset_after, ms),
        };
        let watch_defaults = WatchSettings::default();

        RunSettings {
            supervisor: Settings {
                init_timeout: sup.init_timeout_ms.map_or(defaults.init_timeout, ms),
                reload_timeout: sup.reload_timeout_ms.map_or(defaults.reload_timeout, ms),
                backoff,
            },
            stop_grace: sup.stop_grace_ms.map_or(DEFAULT_GRACE, ms),
            watch: WatchSettings {
                interval: overrides
                    .interval_ms
                    .or(watch.interval_ms)
                    .map_or(watch_defaults.interval, ms),
                template_files: watch.template_files.unwrap_or(watch_defaults.template_files),
                debounce: watch.debounce_ms.map_or(watch_defaults.debounce, ms),
            },
            output: OutputOptions {
                color: !overrides.no_color && output.color.unwrap_or(detected.color),
                strip_ansi: overrides.strip_ansi
                    || output.strip_ansi.unwrap_or(detected.strip_ansi),
            },
        }
    }
}
