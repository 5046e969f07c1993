//! Environment watching and change-gated reloads.
//!
//! [`EnvWatcher`] periodically rebuilds the value tree, re-renders every
//! template and compares the aggregate hash with the previous pass. Only a
//! changed hash triggers a reload. Template source files can additionally be
//! watched on disk, so edits to them are picked up without waiting for the
//! next interval.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::Discovery;
use crate::error::{RenderError, SupervisorError};
use crate::paths::Paths;
use crate::render::{process_env, ContentHash, Renderer, Templates, Vars};
use crate::supervisor::Supervisor;

/// How and how often to look for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub interval: Duration,
    /// Watch template source files on disk.
    pub template_files: bool,
    pub debounce: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            template_files: true,
            debounce: Duration::from_millis(200),
        }
    }
}

/// Something that can be told that configuration changed.
#[async_trait]
pub trait Reloader: Send + Sync {
    async fn reload(&self) -> Result<(), SupervisorError>;
}

#[async_trait]
impl Reloader for Arc<Supervisor> {
    async fn reload(&self) -> Result<(), SupervisorError> {
        Supervisor::reload(self).await
    }
}

/// Produces a fresh value tree on every pass.
#[async_trait]
pub trait VarsSource: Send + Sync {
    async fn load(&self) -> Result<Vars, RenderError>;
}

/// Reads the process environment and asks discovery about peers.
pub struct EnvSource {
    paths: Paths,
    discovery: Arc<dyn Discovery>,
}

impl EnvSource {
    pub fn new(paths: Paths, discovery: Arc<dyn Discovery>) -> Self {
        Self { paths, discovery }
    }
}

#[async_trait]
impl VarsSource for EnvSource {
    async fn load(&self) -> Result<Vars, RenderError> {
        Vars::load(process_env(), &self.paths, self.discovery.as_ref()).await
    }
}

/// Renders every template on a blocking thread.
///
/// Template functions may block on the runtime, so rendering never happens on
/// an async worker.
pub async fn render_blocking(
    renderer: Arc<Mutex<Renderer>>,
    templates: Arc<Templates>,
    vars: Vars,
) -> Result<ContentHash> {
    tokio::task::spawn_blocking(move || {
        let mut renderer = renderer.lock().unwrap_or_else(PoisonError::into_inner);
        renderer.render_all(&templates, &vars)
    })
    .await
    .context("render task failed")?
    .context("failed to render templates")
}

pub struct EnvWatcher<S, R> {
    renderer: Arc<Mutex<Renderer>>,
    templates: Arc<Templates>,
    source: S,
    reloader: R,
    prev: ContentHash,
}

enum Trigger {
    Stop,
    Interval,
    FileChange,
    WatcherGone,
}

impl<S: VarsSource, R: Reloader> EnvWatcher<S, R> {
    /// `initial` is the hash of the render that happened before supervision started.
    pub fn new(
        renderer: Arc<Mutex<Renderer>>,
        templates: Arc<Templates>,
        source: S,
        reloader: R,
        initial: ContentHash,
    ) -> Self {
        Self {
            renderer,
            templates,
            source,
            reloader,
            prev: initial,
        }
    }

    /// One refresh. Returns whether the rendered output changed.
    pub async fn tick(&mut self) -> Result<bool> {
        let vars = self.source.load().await.context("failed to load vars")?;
        let hash = render_blocking(Arc::clone(&self.renderer), Arc::clone(&self.templates), vars).await?;
        if hash == self.prev {
            debug!(digest = %hash, "rendered configuration unchanged");
            return Ok(false);
        }

        info!(digest = %hash, previous = %self.prev, "rendered configuration changed");
        self.prev = hash;
        match self.reloader.reload().await {
            Ok(()) => Ok(true),
            Err(SupervisorError::NotRunning) => {
                debug!("nothing running to reload");
                Ok(true)
            }
            Err(err) => Err(err).context("failed to run reloaders"),
        }
    }

    /// Refreshes every `interval` and on every message from `changes` until
    /// `token` is cancelled. Returns the first error.
    pub async fn run(
        mut self,
        token: CancellationToken,
        interval: Duration,
        mut changes: Option<mpsc::Receiver<()>>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and the initial render already happened.
        ticker.tick().await;

        loop {
            let trigger = tokio::select! {
                _ = token.cancelled() => Trigger::Stop,
                _ = ticker.tick() => Trigger::Interval,
                change = next_change(&mut changes) => match change {
                    Some(()) => Trigger::FileChange,
                    None => Trigger::WatcherGone,
                },
            };

            match trigger {
                Trigger::Stop => return Ok(()),
                Trigger::WatcherGone => {
                    warn!("template file watcher stopped");
                    changes = None;
                }
                Trigger::Interval | Trigger::FileChange => {
                    self.tick().await?;
                }
            }
        }
    }
}

/// Runs `sup` with `watcher` beside it until the supervisor is done.
///
/// A watcher failure cancels `token`, which must be the supervisor's root, so
/// the run ends. Once the supervisor returns the watcher is stopped too. The
/// supervisor's error is reported before the watcher's.
pub async fn run_with_watcher<S>(
    sup: Arc<Supervisor>,
    watcher: EnvWatcher<S, Arc<Supervisor>>,
    token: CancellationToken,
    interval: Duration,
    changes: Option<mpsc::Receiver<()>>,
) -> Result<()>
where
    S: VarsSource + 'static,
{
    let watch_token = token.clone();
    let watch_task = tokio::spawn(async move {
        let result = watcher.run(watch_token.clone(), interval, changes).await;
        if let Err(err) = &result {
            warn!(error = %err, "watcher failed, shutting down");
            watch_token.cancel();
        }
        result
    });

    let run_result = sup.run().await;
    token.cancel();
    let watch_result = watch_task.await.context("watch task failed")?;

    if let Err(err) = &run_result {
        warn!(kind = err.as_label(), error = %err, "supervisor failed");
    }
    run_result.context("supervisor failed")?;
    watch_result
}

async fn next_change(changes: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Watches template source files, sending one message per debounced burst
/// of changes.
///
/// Parent directories are watched so files replaced by rename are still seen.
pub fn spawn_template_watcher(files: Vec<PathBuf>, debounce: Duration, tx: mpsc::Sender<()>) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }

    let (raw_tx, raw_rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = raw_tx.send(res);
        },
        notify::Config::default(),
    )
    .context("failed to create watcher")?;

    let dirs: HashSet<PathBuf> = files
        .iter()
        .filter_map(|file| file.parent().map(PathBuf::from))
        .collect();
    for dir in &dirs {
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;
    }

    let files: HashSet<PathBuf> = files.into_iter().collect();
    std::thread::spawn(move || {
        // Dropping the watcher ends the event stream.
        let _watcher = watcher;
        loop {
            let event = match raw_rx.recv() {
                Ok(res) => res,
                Err(_) => break,
            };
            if !is_relevant(&event, &files) {
                continue;
            }

            let mut last = Instant::now();
            loop {
                let elapsed = last.elapsed();
                if elapsed >= debounce {
                    break;
                }
                match raw_rx.recv_timeout(debounce - elapsed) {
                    Ok(res) => {
                        if is_relevant(&res, &files) {
                            last = Instant::now();
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }

            debug!("template file changed");
            if tx.blocking_send(()).is_err() {
                break;
            }
        }
    });
    Ok(())
}

fn is_relevant(event: &notify::Result<NotifyEvent>, files: &HashSet<PathBuf>) -> bool {
    let event = match event {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "watch error");
            return true;
        }
    };
    // Rendering reads the sources; those reads must not count as changes.
    if event.kind.is_access() {
        return false;
    }
    event.paths.iter().any(|path| files.contains(path))
}
