//! The supervisor: init, process and reload command groups.
//!
//! [`Supervisor::run`] runs every init command to completion under a timeout,
//! then launches every process in its own restart loop. It returns once all
//! processes have exited cleanly or the root scope is cancelled.
//!
//! [`Supervisor::reload`] runs the reload commands, and is only valid while a
//! run is in progress.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::error::{RunError, SupervisorError};
use crate::process::ProcessStatus;
use crate::restart::{self, Backoff, Outcome};
use crate::runner::Runner;
use crate::scope::{Scope, StopReason};

/// Output name used for the supervisor's own messages.
pub const SELF_NAME: &str = "procfly";

/// Timeouts and restart policy.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Bound on the whole init group.
    pub init_timeout: Duration,
    /// Bound on the whole reload group.
    pub reload_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
            reload_timeout: Duration::from_secs(5),
            backoff: Backoff::default(),
        }
    }
}

pub struct Supervisor {
    root: Scope,
    runner: Runner,
    settings: Settings,
    init: BTreeMap<String, Command>,
    processes: BTreeMap<String, Command>,
    reload: BTreeMap<String, Command>,
    statuses: Mutex<BTreeMap<String, ProcessStatus>>,
    running: AtomicBool,
}

/// Proof that the run lock is held. Releases it on drop.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Supervisor {
    /// Creates a supervisor whose runs end when `root` is cancelled.
    pub fn new(root: Scope, runner: Runner, settings: Settings) -> Self {
        runner.mux().register_name(SELF_NAME);
        Self {
            root,
            runner,
            settings,
            init: BTreeMap::new(),
            processes: BTreeMap::new(),
            reload: BTreeMap::new(),
            statuses: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Adds a command that must succeed before any process starts.
    pub fn register_init(&mut self, name: impl Into<String>, command: Command) {
        let name = self.register(name.into());
        self.init.insert(name, command);
    }

    /// Adds a long-running, restarted process.
    pub fn register_process(&mut self, name: impl Into<String>, command: Command) {
        let name = self.register(name.into());
        self.processes.insert(name, command);
    }

    /// Adds a command run on every [`reload`](Self::reload).
    pub fn register_reload(&mut self, name: impl Into<String>, command: Command) {
        let name = self.register(name.into());
        self.reload.insert(name, command);
    }

    fn register(&mut self, name: String) -> String {
        self.runner.mux().register_name(&name);
        self.statuses
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), ProcessStatus::NotStarted);
        name
    }

    /// Writes `message` to the shared output under `name`.
    pub fn log(&self, name: &str, message: impl Display) {
        self.runner.mux().log(name, message);
    }

    /// Current status of every registered command.
    pub fn statuses(&self) -> BTreeMap<String, ProcessStatus> {
        self.lock_statuses().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn lock_statuses(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ProcessStatus>> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, name: &str, status: ProcessStatus) {
        debug!(name, %status, "status");
        self.lock_statuses().insert(name.to_string(), status);
    }

    fn try_lock(&self) -> Result<RunGuard<'_>, SupervisorError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SupervisorError::AlreadyRunning)?;
        Ok(RunGuard {
            flag: &self.running,
        })
    }

    /// Runs init commands, then supervises processes until they are all done.
    ///
    /// Cancellation of the root scope is a normal way for a run to end and is
    /// reported as success.
    pub async fn run(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let _guard = self.try_lock()?;

        if !self.init.is_empty() {
            self.log(SELF_NAME, "Running initializers.");
            let scope = self.root.with_timeout(self.settings.init_timeout);
            if let Err((name, err)) = self.run_group(&self.init, &scope).await {
                if err.stop_reason() == Some(StopReason::Cancelled) && self.root.is_cancelled() {
                    info!("shutdown requested during init");
                    return Ok(());
                }
                return Err(SupervisorError::Setup { name, source: err });
            }
            self.log(SELF_NAME, "Initializers complete.");
        }

        let mut tasks = JoinSet::new();
        for (name, command) in &self.processes {
            let sup = Arc::clone(self);
            let name = name.clone();
            let command = command.clone();
            tasks.spawn(async move { sup.supervise(name, command).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "process task failed");
            }
        }
        Ok(())
    }

    /// Runs every reload command concurrently under the reload timeout.
    ///
    /// Shutdown while reloading is not an error; the timeout expiring is.
    pub async fn reload(self: &Arc<Self>) -> Result<(), SupervisorError> {
        if !self.is_running() {
            return Err(SupervisorError::NotRunning);
        }
        if self.reload.is_empty() {
            return Ok(());
        }

        self.log(SELF_NAME, "Running reloaders.");
        let scope = self.root.with_timeout(self.settings.reload_timeout);
        match self.run_group(&self.reload, &scope).await {
            Ok(()) => Ok(()),
            Err((_, RunError::Stopped(StopReason::Cancelled))) => Ok(()),
            Err((name, source)) => Err(SupervisorError::Reload { name, source }),
        }
    }

    /// Runs a group of one-shot commands concurrently.
    ///
    /// The first failure cancels the rest of the group and is returned once
    /// every command has finished.
    async fn run_group(
        self: &Arc<Self>,
        group: &BTreeMap<String, Command>,
        scope: &Scope,
    ) -> Result<(), (String, RunError)> {
        let group_scope = scope.child();
        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        for (name, command) in group {
            let sup = Arc::clone(self);
            let task_name = name.clone();
            let command = command.clone();
            let scope = group_scope.clone();
            let task = tasks.spawn(async move { sup.run_once(&task_name, &command, &scope).await });
            names.insert(task.id(), name.clone());
        }
        first_failure(tasks, names, &group_scope).await
    }

    async fn run_once(&self, name: &str, command: &Command, scope: &Scope) -> Result<(), RunError> {
        match self.launch(name, command, scope).await {
            Outcome::Clean => Ok(()),
            Outcome::Abnormal(err) => {
                self.log(name, &err);
                Err(err)
            }
            Outcome::Stopped(reason) => Err(RunError::Stopped(reason)),
        }
    }

    /// Keeps one process running until it exits cleanly or the root scope ends.
    async fn supervise(&self, name: String, command: Command) {
        let scope = self.root.child();
        let (name, command, scope) = (&name, &command, &scope);

        let outcome = restart::with_restarts(
            &self.settings.backoff,
            scope,
            move || self.launch(name, command, scope),
            move |err, delay| {
                self.log(name, err);
                info!(name = %name, ?delay, "scheduling restart");
                self.log(
                    SELF_NAME,
                    format!("Waiting {:?} before restarting {}", delay, name),
                );
            },
        )
        .await;

        match outcome {
            Outcome::Clean => self.log(SELF_NAME, format!("{} exited cleanly", name)),
            Outcome::Stopped(reason) => debug!(name = %name, %reason, "stopped"),
            Outcome::Abnormal(err) => warn!(name = %name, error = %err, "gave up"),
        }
    }

    /// Launches `command` once and waits for it under `scope`.
    async fn launch(&self, name: &str, command: &Command, scope: &Scope) -> Outcome {
        self.set_status(name, ProcessStatus::Starting);
        self.log(SELF_NAME, format!("Start {}: {}", name, command.quoted()));

        let handle = match self.runner.launch(name, command) {
            Ok(handle) => handle,
            Err(err) => {
                self.set_status(name, ProcessStatus::Failed { error: err.to_string() });
                return Outcome::Abnormal(err);
            }
        };
        self.set_status(name, ProcessStatus::Running { pid: handle.pid() });

        let result = handle
            .stop(scope, |_| self.set_status(name, ProcessStatus::Stopping))
            .await;
        match result {
            Ok(status) => {
                self.set_status(name, ProcessStatus::Exited { code: status.code() });
                if status.success() {
                    Outcome::Clean
                } else {
                    Outcome::Abnormal(RunError::Exit(status))
                }
            }
            Err(RunError::Stopped(reason)) => {
                self.set_status(name, ProcessStatus::Stopped);
                Outcome::Stopped(reason)
            }
            Err(err) => {
                self.set_status(name, ProcessStatus::Failed { error: err.to_string() });
                Outcome::Abnormal(err)
            }
        }
    }
}

/// Waits for every task of a group, cancelling `scope` on the first failure.
///
/// A task that panicked counts as a failure of the command it was running.
async fn first_failure(
    mut tasks: JoinSet<Result<(), RunError>>,
    mut names: HashMap<Id, String>,
    scope: &Scope,
) -> Result<(), (String, RunError)> {
    let mut first = None;
    while let Some(joined) = tasks.join_next_with_id().await {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(err) => (err.id(), Err(task_failed(err))),
        };
        let name = names.remove(&id).unwrap_or_default();
        if let Err(err) = result {
            if first.is_none() {
                scope.cancel();
                first = Some((name, err));
            }
        }
    }
    first.map_or(Ok(()), Err)
}

fn task_failed(err: JoinError) -> RunError {
    warn!(error = %err, "command task failed");
    RunError::Task(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests::SharedBuf;
    use crate::output::{MuxWriter, OutputOptions};
    use std::path::Path;

    struct Fixture {
        root: Scope,
        buf: SharedBuf,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                root: Scope::new(),
                buf: SharedBuf::default(),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn supervisor(&self, settings: Settings) -> Supervisor {
            let mux = MuxWriter::new(
                self.buf.clone(),
                OutputOptions {
                    color: false,
                    strip_ansi: false,
                },
            );
            let runner = Runner::new(mux)
                .with_dir(self.dir.path())
                .with_grace(Duration::from_millis(500));
            Supervisor::new(self.root.clone(), runner, settings)
        }

        fn path(&self, name: &str) -> std::path::PathBuf {
            self.dir.path().join(name)
        }
    }

    fn fast() -> Settings {
        Settings {
            init_timeout: Duration::from_secs(5),
            reload_timeout: Duration::from_secs(5),
            backoff: Backoff {
                initial: Duration::from_millis(10),
                multiplier: 2.0,
                max: Duration::from_millis(50),
                reset_after: Duration::from_secs(15),
            },
        }
    }

    fn sh(script: &str) -> Command {
        Command {
            name: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    async fn bounded<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(20), fut)
            .await
            .expect("supervisor did not finish in time")
    }

    async fn wait_until_running(sup: &Supervisor, name: &str) {
        bounded(async {
            loop {
                if matches!(sup.statuses().get(name), Some(ProcessStatus::Running { .. })) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[tokio::test]
    async fn reload_without_run_is_not_running() {
        let fx = Fixture::new();
        let mut sup = fx.supervisor(fast());
        sup.register_reload("reload_web", sh("true"));
        let sup = Arc::new(sup);
        let err = sup.reload().await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning), "{:?}", err);
    }

    #[tokio::test]
    async fn init_completes_before_processes_start() {
        let fx = Fixture::new();
        let mut sup = fx.supervisor(fast());
        sup.register_init("init_a", sh("sleep 0.2; touch ready"));
        sup.register_process("web", sh("test -f ready && echo ok > seen"));
        let sup = Arc::new(sup);

        bounded(sup.run()).await.unwrap();

        assert_eq!(read(&fx.path("seen")).trim(), "ok");
        assert_eq!(
            sup.statuses().get("web"),
            Some(&ProcessStatus::Exited { code: Some(0) })
        );
        let out = fx.buf.lines();
        let init_done = out.iter().position(|l| l.ends_with("Initializers complete."));
        let web_start = out.iter().position(|l| l.contains("Start web:"));
        assert!(init_done.unwrap() < web_start.unwrap(), "{:#?}", out);
        assert!(out.iter().any(|l| l.ends_with("web exited cleanly")));
    }

    #[tokio::test]
    async fn failing_init_aborts_the_run() {
        let fx = Fixture::new();
        let mut sup = fx.supervisor(fast());
        sup.register_init("init_ok", sh("sleep 5"));
        sup.register_init("init_bad", sh("exit 4"));
        sup.register_process("web", sh("echo never"));
        let sup = Arc::new(sup);

        let err = bounded(sup.run()).await.unwrap_err();
        match err {
            SupervisorError::Setup { name, source } => {
                assert_eq!(name, "init_bad");
                assert!(matches!(source, RunError::Exit(_)), "{:?}", source);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sup.statuses().get("web"), Some(&ProcessStatus::NotStarted));
        assert!(!sup.is_running());
    }

    fn explode() -> Result<(), RunError> {
        panic!("init blew up")
    }

    #[tokio::test]
    async fn panicked_command_fails_its_group() {
        let scope = Scope::new();
        let mut tasks: JoinSet<Result<(), RunError>> = JoinSet::new();
        let mut names = HashMap::new();

        let task = tasks.spawn(async { explode() });
        names.insert(task.id(), "init_boom".to_string());
        let waiter = scope.clone();
        let task = tasks.spawn(async move { Err(RunError::Stopped(waiter.done().await)) });
        names.insert(task.id(), "init_wait".to_string());

        let (name, err) = bounded(first_failure(tasks, names, &scope)).await.unwrap_err();
        assert_eq!(name, "init_boom");
        assert!(matches!(err, RunError::Task(_)), "{:?}", err);
        assert!(scope.is_cancelled());
    }

    #[tokio::test]
    async fn init_timeout_is_a_setup_failure() {
        let fx = Fixture::new();
        let mut sup = fx.supervisor(Settings {
            init_timeout: Duration::from_millis(200),
            ..fast()
        });
        sup.register_init("init_slow", sh("sleep 30"));
        let sup = Arc::new(sup);

        let err = bounded(sup.run()).await.unwrap_err();
        assert!(
            matches!(
                err,
                SupervisorError::Setup {
                    source: RunError::Stopped(StopReason::DeadlineExceeded),
                    ..
                }
            ),
            "{:?}",
            err
        );
    }

    #[tokio::test]
    async fn failing_process_is_restarted_until_clean() {
        let fx = Fixture::new();
        let mut sup = fx.supervisor(fast());
        sup.register_process(
            "flaky",
            sh("n=$(cat count 2>/dev/null || echo 0); n=$((n+1)); echo $n > count; [ $n -ge 3 ]"),
        );
        let sup = Arc::new(sup);

        bounded(sup.run()).await.unwrap();

        assert_eq!(read(&fx.path("count")).trim(), "3");
        let out = fx.buf.lines();
        let waits = out
            .iter()
            .filter(|l| l.contains("before restarting flaky"))
            .count();
        assert_eq!(waits, 2, "{:#?}", out);
        assert!(out.iter().any(|l| l.ends_with("flaky exited cleanly")));
    }

    #[tokio::test]
    async fn second_run_fails_fast_and_shutdown_is_success() {
        let fx = Fixture::new();
        let mut sup = fx.supervisor(fast());
        sup.register_process("web", sh("sleep 30"));
        let sup = Arc::new(sup);

        let first = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.run().await }
        });
        wait_until_running(&sup, "web").await;

        let err = sup.run().await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning));

        fx.root.cancel();
        bounded(first).await.unwrap().unwrap();
        assert_eq!(sup.statuses().get("web"), Some(&ProcessStatus::Stopped));
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn reload_runs_while_supervising() {
        let fx = Fixture::new();
        let mut sup = fx.supervisor(fast());
        sup.register_process("web", sh("sleep 30"));
        sup.register_reload("reload_web", sh("echo reloaded"));
        let sup = Arc::new(sup);

        let run = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.run().await }
        });
        wait_until_running(&sup, "web").await;

        bounded(sup.reload()).await.unwrap();
        assert!(fx.buf.lines().iter().any(|l| l.ends_with("| reloaded")));

        fx.root.cancel();
        bounded(run).await.unwrap().unwrap();
        assert!(matches!(
            sup.reload().await,
            Err(SupervisorError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn failing_reload_is_surfaced() {
        let fx = Fixture::new();
        let mut sup = fx.supervisor(fast());
        sup.register_process("web", sh("sleep 30"));
        sup.register_reload("reload_web", sh("exit 2"));
        let sup = Arc::new(sup);

        let run = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.run().await }
        });
        wait_until_running(&sup, "web").await;

        let err = bounded(sup.reload()).await.unwrap_err();
        assert!(
            matches!(err, SupervisorError::Reload { ref name, .. } if name == "reload_web"),
            "{:?}",
            err
        );

        fx.root.cancel();
        bounded(run).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_during_reload_is_not_an_error() {
        let fx = Fixture::new();
        let mut sup = fx.supervisor(fast());
        sup.register_process("web", sh("sleep 30"));
        sup.register_reload("reload_web", sh("sleep 30"));
        let sup = Arc::new(sup);

        let run = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.run().await }
        });
        wait_until_running(&sup, "web").await;

        let root = fx.root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            root.cancel();
        });
        bounded(sup.reload()).await.unwrap();
        bounded(run).await.unwrap().unwrap();
    }
}
