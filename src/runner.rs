//! Process execution and management.
//!
//! [`Runner::launch`] starts a [`Command`] on its own pseudo-terminal, in its
//! own session, with everything it prints copied into the [`MuxWriter`] under
//! the given name. [`Handle::stop`] then waits for the process while watching
//! a [`Scope`]; when the scope finishes first the process group is
//! interrupted, given a grace period, and killed.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command::Command;
use crate::error::RunError;
use crate::output::{MuxWriter, NameWriter};
use crate::pty::{self, Pty};
use crate::scope::{Scope, StopReason};

/// Time a process gets to exit after an interrupt before it is killed.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for buffered terminal output once a process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Launches commands attached to the shared output.
#[derive(Clone)]
pub struct Runner {
    mux: MuxWriter,
    dir: Option<PathBuf>,
    grace: Duration,
}

impl Runner {
    pub fn new(mux: MuxWriter) -> Self {
        Self {
            mux,
            dir: None,
            grace: DEFAULT_GRACE,
        }
    }

    /// Working directory for launched processes.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn mux(&self) -> &MuxWriter {
        &self.mux
    }

    /// Starts `command` with its stdio on a fresh pseudo-terminal.
    ///
    /// The process leads a new session whose controlling terminal is the pty,
    /// so it and everything it spawns can be signalled as one group.
    pub fn launch(&self, name: &str, command: &Command) -> Result<Handle, RunError> {
        let pty = Pty::open().map_err(RunError::Pty)?;
        let stdin = pty.slave.try_clone().map_err(RunError::Pty)?;
        let stdout = pty.slave.try_clone().map_err(RunError::Pty)?;

        let mut cmd = tokio::process::Command::new(&command.name);
        cmd.args(&command.args);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(pty.slave));
        cmd.kill_on_drop(true);

        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                // stdin is already the pty slave here.
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| RunError::Spawn {
            command: command.name.clone(),
            source,
        })?;
        // Drops the parent's copies of the slave so the master sees a hangup
        // once the process group is gone.
        drop(cmd);

        let pid = child.id();
        debug!(name, pid, "launched");

        pty::set_nonblocking(&pty.master).map_err(RunError::Pty)?;
        let master = AsyncFd::new(pty.master).map_err(RunError::Pty)?;
        let output = tokio::spawn(copy_output(master, self.mux.writer(name)));

        Ok(Handle {
            name: name.to_string(),
            pid,
            child,
            output,
            grace: self.grace,
        })
    }
}

async fn copy_output(master: AsyncFd<File>, mut writer: NameWriter) {
    let mut buf = [0u8; 4096];
    loop {
        let mut ready = match master.readable().await {
            Ok(ready) => ready,
            Err(err) => {
                warn!(name = writer.name(), error = %err, "polling pty failed");
                break;
            }
        };
        let read = ready.try_io(|fd| {
            let mut file: &File = fd.get_ref();
            file.read(&mut buf)
        });
        match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if let Err(err) = writer.write_all(&buf[..n]) {
                    debug!(name = writer.name(), error = %err, "dropping output");
                }
            }
            Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(err)) if pty::is_hangup(&err) => break,
            Ok(Err(err)) => {
                warn!(name = writer.name(), error = %err, "reading pty failed");
                break;
            }
            Err(_would_block) => continue,
        }
    }
}

/// A running process.
pub struct Handle {
    name: String,
    pid: Option<u32>,
    child: Child,
    output: JoinHandle<()>,
    grace: Duration,
}

enum First {
    Exited(io::Result<ExitStatus>),
    Finished(StopReason),
}

impl Handle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Waits for the process, stopping it if `scope` finishes first.
    ///
    /// Returns the exit status when the process exits on its own, and
    /// [`RunError::Stopped`] with the scope's reason when it had to be stopped.
    /// `on_interrupt` runs right before the process group is interrupted.
    pub async fn stop(
        mut self,
        scope: &Scope,
        on_interrupt: impl FnOnce(StopReason),
    ) -> Result<ExitStatus, RunError> {
        let first = tokio::select! {
            status = self.child.wait() => First::Exited(status),
            reason = scope.done() => First::Finished(reason),
        };

        match first {
            First::Exited(status) => {
                self.drain().await;
                status.map_err(RunError::Wait)
            }
            First::Finished(reason) => {
                on_interrupt(reason);
                self.interrupt_then_kill().await;
                self.drain().await;
                Err(RunError::Stopped(reason))
            }
        }
    }

    async fn interrupt_then_kill(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        self.signal(Signal::SIGINT);
        if tokio::time::timeout(self.grace, self.child.wait()).await.is_ok() {
            return;
        }
        warn!(name = %self.name, pid = self.pid, grace = ?self.grace, "still running after interrupt, killing");
        self.signal(Signal::SIGKILL);
        if let Err(err) = self.child.wait().await {
            warn!(name = %self.name, error = %err, "waiting for killed process");
        }
    }

    fn signal(&self, sig: Signal) {
        let Some(pid) = self.pid else {
            return;
        };
        // The process leads its own session, so its pid is also the group id.
        match killpg(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(name = %self.name, pid, signal = %sig, error = %err, "signal failed"),
        }
    }

    /// Waits briefly for the output copier, then closes the terminal.
    ///
    /// A detached descendant can keep the slave open forever; aborting the
    /// copier drops the master so its output is no longer shown under this name.
    async fn drain(&mut self) {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut self.output)
            .await
            .is_err()
        {
            warn!(name = %self.name, "terminal still held open after exit, closing it");
            self.output.abort();
            let _ = (&mut self.output).await;
        }
    }
}
