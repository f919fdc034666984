//! PTY (pseudo-terminal) management
//!
//! Creates PTY pair with forkpty and spawns the session command in the
//! child process. Provides master side read/write and terminal size
//! setting.

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid};
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

/// PTY management structure
pub struct Pty {
    /// Master side file descriptor
    master: OwnedFd,
    /// Child process PID
    child_pid: Pid,
    /// Exit code once the child has been reaped
    exit_code: Option<i32>,
}

impl Pty {
    /// Create PTY and spawn `program` with `args`
    ///
    /// Specify initial terminal size with `cols`, `rows`.
    /// `term_env` sets the TERM environment variable.
    /// `extra_env` sets additional environment variables for the child process.
    pub fn spawn(
        program: &str,
        args: &[String],
        cols: u16,
        rows: u16,
        term_env: &str,
        extra_env: &[(String, String)],
    ) -> Result<Self> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // Build argv before forking so failures are reported to the caller
        let program_cstr =
            CString::new(program).with_context(|| format!("NUL byte in program {:?}", program))?;
        let mut argv = vec![program_cstr.clone()];
        for arg in args {
            argv.push(CString::new(arg.as_str()).with_context(|| format!("NUL byte in argument {:?}", arg))?);
        }

        let ForkptyResult {
            master,
            fork_result,
        } = unsafe { forkpty(Some(&winsize), None)? };

        match fork_result {
            ForkResult::Child => {
                std::env::set_var("TERM", term_env);
                for (key, value) in extra_env {
                    std::env::set_var(key, value);
                }

                let err = match nix::unistd::execvp(&program_cstr, &argv) {
                    Ok(infallible) => match infallible {},
                    Err(e) => e,
                };
                eprintln!("Failed to exec {}: {}", program, err);
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                info!(
                    "PTY spawned: pid={}, master_fd={}, command={}",
                    child,
                    master.as_raw_fd(),
                    program
                );

                // Set master fd to non-blocking
                let flags = nix::fcntl::fcntl(master.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFL)?;
                let mut flags = nix::fcntl::OFlag::from_bits_truncate(flags);
                flags.insert(nix::fcntl::OFlag::O_NONBLOCK);
                nix::fcntl::fcntl(master.as_raw_fd(), nix::fcntl::FcntlArg::F_SETFL(flags))?;

                Ok(Self {
                    master,
                    child_pid: child,
                    exit_code: None,
                })
            }
        }
    }

    pub fn pid(&self) -> i32 {
        self.child_pid.as_raw()
    }

    /// Non-blocking read from PTY
    ///
    /// Returns number of bytes read if data available.
    /// Returns Ok(0) if no data. EIO means the slave side is gone
    /// (child exited) and is also reported as no data.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match nix::unistd::read(self.master.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EIO) => Ok(0),
            Err(e) => Err(anyhow!("PTY read error: {}", e)),
        }
    }

    /// Write all of `data` to PTY
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < data.len() {
            match nix::unistd::write(self.master.as_raw_fd(), &data[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EAGAIN) => std::thread::yield_now(),
                Err(e) => return Err(anyhow!("PTY write error: {}", e)),
            }
        }
        Ok(written)
    }

    /// Change terminal size (TIOCSWINSZ)
    pub fn set_size(&self, cols: u16, rows: u16) -> Result<()> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        unsafe {
            let ret = libc::ioctl(
                self.master.as_raw_fd(),
                libc::TIOCSWINSZ,
                &winsize as *const Winsize,
            );
            if ret < 0 {
                return Err(anyhow!("TIOCSWINSZ failed: {}", io::Error::last_os_error()));
            }
        }

        // Send SIGWINCH to child process
        let _ = nix::sys::signal::kill(self.child_pid, nix::sys::signal::Signal::SIGWINCH);

        Ok(())
    }

    /// Reap the child if it has exited, returning its exit code
    pub fn try_wait(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => None,
            Ok(WaitStatus::Exited(_, code)) => {
                self.exit_code = Some(code);
                self.exit_code
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                self.exit_code = Some(128 + signal as i32);
                self.exit_code
            }
            Ok(_) => None,
            Err(e) => {
                warn!("waitpid failed: {}", e);
                self.exit_code = Some(-1);
                self.exit_code
            }
        }
    }

    /// Ask the child to terminate (SIGHUP)
    pub fn kill(&self) {
        if self.exit_code.is_none() {
            let _ = nix::sys::signal::kill(self.child_pid, nix::sys::signal::Signal::SIGHUP);
        }
    }

    /// Send SIGINT to the child's process group (Ctrl-C)
    pub fn interrupt(&self) {
        let _ = nix::sys::signal::killpg(self.child_pid, nix::sys::signal::Signal::SIGINT);
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        // Send SIGHUP and wait for child process to exit
        if self.exit_code.is_none() {
            let _ = nix::sys::signal::kill(self.child_pid, nix::sys::signal::Signal::SIGHUP);
            let _ = waitpid(self.child_pid, None);
        }
    }
}
