//! Pseudo-terminal allocation.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::{tcgetattr, tcsetattr, OutputFlags, SetArg, Termios};

/// The two ends of a freshly opened pseudo-terminal.
pub struct Pty {
    /// Controller side, read by the supervisor.
    pub master: File,
    /// Terminal side, handed to the child as stdio.
    pub slave: OwnedFd,
}

impl Pty {
    /// Opens a new pty pair.
    ///
    /// The master is close-on-exec so children only inherit the slave. Output
    /// post-processing is off, so lines arrive ending in `\n` rather than `\r\n`.
    pub fn open() -> io::Result<Self> {
        let pty = openpty(None::<&Winsize>, None::<&Termios>)?;

        let mut termios = tcgetattr(&pty.slave)?;
        termios.output_flags.remove(OutputFlags::OPOST);
        tcsetattr(&pty.slave, SetArg::TCSANOW, &termios)?;

        fcntl(pty.master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

        Ok(Self {
            master: File::from(pty.master),
            slave: pty.slave,
        })
    }
}

/// Switches `fd` to non-blocking reads.
pub fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Whether a read error on the master means the terminal side has closed.
///
/// Linux reports a hung-up slave as `EIO` rather than end of file.
pub fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(Errno::EIO as i32)
}
