//! A handle to the VMM child process that works whether this process spawned
//! it (`Attached`) or is re-attaching to one spawned by an earlier control
//! plane instance (`Detached`, tracked by PID + pidfd instead of a `Child`).

use std::{
    os::{
        fd::{AsFd, FromRawFd, OwnedFd, RawFd},
        unix::process::ExitStatusExt,
    },
    process::ExitStatus,
};

use nix::{
    sys::{
        signal::Signal,
        wait::{Id, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use tokio::{
    io::unix::AsyncFd,
    process::{Child, ChildStderr, ChildStdin, ChildStdout},
};

pub struct ProcessHandle(ProcessHandleInner);

pub struct RawPipes {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub stdin: ChildStdin,
}

#[derive(Debug, thiserror::Error)]
pub enum RawPipesError {
    #[error("the process handle is detached, its pipes were never ours to take")]
    ProcessIsDetached,
    #[error("the process's pipes have already been taken")]
    PipesAlreadyTaken,
}

enum ProcessHandleInner {
    Attached { child: Child, pipes_taken: bool },
    Detached { pid: Pid, pidfd: AsyncFd<OwnedFd> },
}

impl ProcessHandle {
    pub fn attached(child: Child) -> Self {
        Self(ProcessHandleInner::Attached {
            child,
            pipes_taken: false,
        })
    }

    /// Build a handle to a process this control plane did not spawn, using
    /// `pidfd_open` so exit can still be awaited without being the parent.
    pub fn detached(pid: Pid) -> Result<Self, std::io::Error> {
        let ret = unsafe { nix::libc::syscall(nix::libc::SYS_pidfd_open, pid, 0) };
        if ret == -1 {
            return Err(std::io::Error::last_os_error());
        }

        let pidfd = AsyncFd::new(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })?;
        Ok(Self(ProcessHandleInner::Detached { pid, pidfd }))
    }

    pub fn is_detached(&self) -> bool {
        matches!(self.0, ProcessHandleInner::Detached { .. })
    }

    /// `None` for an attached child that has already been waited on, since
    /// `std`/`tokio` drop the pid once the handle is reaped.
    pub fn pid(&self) -> Option<u32> {
        match self.0 {
            ProcessHandleInner::Attached { ref child, .. } => child.id(),
            ProcessHandleInner::Detached { pid, .. } => Some(pid.as_raw() as u32),
        }
    }

    pub fn kill(&mut self) -> Result<(), std::io::Error> {
        match self.0 {
            ProcessHandleInner::Attached { ref mut child, .. } => child.start_kill(),
            ProcessHandleInner::Detached { pid, .. } => {
                nix::sys::signal::kill(pid, Signal::SIGKILL).map_err(|_| std::io::Error::last_os_error())
            }
        }
    }

    pub fn terminate(&mut self) -> Result<(), std::io::Error> {
        match self.0 {
            ProcessHandleInner::Attached { ref child, .. } => {
                let pid = Pid::from_raw(child.id().ok_or_else(|| {
                    std::io::Error::other("child has no pid, it must have already been waited on")
                })? as i32);
                nix::sys::signal::kill(pid, Signal::SIGTERM).map_err(|_| std::io::Error::last_os_error())
            }
            ProcessHandleInner::Detached { pid, .. } => {
                nix::sys::signal::kill(pid, Signal::SIGTERM).map_err(|_| std::io::Error::last_os_error())
            }
        }
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, std::io::Error> {
        match self.0 {
            ProcessHandleInner::Attached { ref mut child, .. } => child.wait().await,
            ProcessHandleInner::Detached { ref pidfd, .. } => {
                pidfd.readable().await?.retain_ready();

                let result = match nix::sys::wait::waitid(Id::PIDFd(pidfd.as_fd()), WaitPidFlag::WEXITED) {
                    Ok(WaitStatus::Exited(_, exit_status)) => Ok(exit_status),
                    Ok(_) => Err(std::io::Error::other(
                        "waitid on WEXITED returned something other than Exited",
                    )),
                    Err(_) => Err(std::io::Error::last_os_error()),
                }?;

                Ok(ExitStatus::from_raw(result))
            }
        }
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, std::io::Error> {
        match self.0 {
            ProcessHandleInner::Attached { ref mut child, .. } => child.try_wait(),
            ProcessHandleInner::Detached { ref pidfd, .. } => {
                let result = match nix::sys::wait::waitid(Id::PIDFd(pidfd.as_fd()), WaitPidFlag::WNOHANG | WaitPidFlag::WEXITED)
                {
                    Ok(WaitStatus::Exited(_, exit_status)) => Ok(Some(exit_status)),
                    Ok(WaitStatus::StillAlive) => Ok(None),
                    Ok(_) => Err(std::io::Error::other(
                        "waitid on WNOHANG|WEXITED returned something unexpected",
                    )),
                    Err(_) => Err(std::io::Error::last_os_error()),
                }?;

                Ok(result.map(ExitStatus::from_raw))
            }
        }
    }

    pub fn take_pipes(&mut self) -> Result<RawPipes, RawPipesError> {
        match self.0 {
            ProcessHandleInner::Detached { .. } => Err(RawPipesError::ProcessIsDetached),
            ProcessHandleInner::Attached {
                ref mut child,
                ref mut pipes_taken,
            } => {
                if *pipes_taken {
                    return Err(RawPipesError::PipesAlreadyTaken);
                }
                *pipes_taken = true;
                Ok(RawPipes {
                    stdout: child.stdout.take().expect("stdio was not piped"),
                    stderr: child.stderr.take().expect("stdio was not piped"),
                    stdin: child.stdin.take().expect("stdio was not piped"),
                })
            }
        }
    }
}
