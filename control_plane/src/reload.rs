//! Delivery of the in-process "reload configuration" signal.

use std::io;

/// Sends the reload signal to a process.
pub trait ReloadSignaller: Send + Sync {
    fn send_reload(&self, pid: u32) -> io::Result<()>;
}

/// Sends `SIGUSR2`, which the gateway treats as "reload configuration".
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessReloader;

impl ReloadSignaller for ProcessReloader {
    #[cfg(unix)]
    fn send_reload(&self, pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        if pid <= 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pid <= 0"));
        }
        // SAFETY: kill(2) has no memory-safety preconditions; pid is a positive process id.
        let rc = unsafe { libc::kill(pid, libc::SIGUSR2) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn send_reload(&self, _pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "reload signals are only supported on unix",
        ))
    }
}
