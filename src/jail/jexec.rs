//! Run a shell command inside a jail using jail_attach(2)
//!
//! The child is forked, attached to the jail and exec'd into `/bin/sh -c`.
//! Stdout and stderr share one pipe so the caller sees them interleaved the
//! way a terminal would.

use crate::error::{Error, Result};
use crate::jail::ffi;
use crossbeam::channel;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, pipe, ForkResult, Pid};
use std::ffi::CString;
use std::fmt::Write;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::mem;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const CHUNK_SIZE: usize = 8192;

/// Execute `command` in jail `jid` and return its combined output
///
/// A non-zero exit status is not an error: whatever the command printed is
/// returned. Death by signal, a failed attach and an expired `timeout` are.
/// At most `max_output` bytes are kept; anything beyond is read and dropped,
/// and the returned text ends with a note saying how much.
pub fn exec_captured(
    jid: i32,
    command: &str,
    timeout: Option<Duration>,
    max_output: usize,
) -> Result<String> {
    run_captured(Some(jid), command, timeout, max_output)
}

/// Fork, optionally attach to a jail, and run `/bin/sh -c command`
fn run_captured(
    jid: Option<i32>,
    command: &str,
    timeout: Option<Duration>,
    max_output: usize,
) -> Result<String> {
    let target = jid.map_or_else(|| "host".to_string(), |jid| jid.to_string());
    let describe = || format!("jexec {} {:?}", target, command);

    // Everything the child needs is allocated before fork
    let shell = CString::new("/bin/sh")?;
    let flag = CString::new("-c")?;
    let script = CString::new(command)?;
    let argv: [*const libc::c_char; 4] = [
        shell.as_ptr(),
        flag.as_ptr(),
        script.as_ptr(),
        std::ptr::null(),
    ];

    let (read_end, write_end) = pipe().map_err(|e| Error::CommandFailed {
        command: describe(),
        message: format!("Failed to create output pipe: {}", e),
    })?;

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(read_end);
            unsafe {
                libc::dup2(write_end.as_raw_fd(), libc::STDOUT_FILENO);
                libc::dup2(write_end.as_raw_fd(), libc::STDERR_FILENO);
            }
            drop(write_end);

            if let Some(jid) = jid
                && ffi::jail_attach(jid).is_err()
            {
                unsafe { libc::_exit(126) };
            }
            unsafe {
                libc::execv(shell.as_ptr(), argv.as_ptr());
                libc::_exit(127);
            }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(write_end);

            // Drain concurrently so a chatty command can't fill the pipe and stall
            let capture = Arc::new(Mutex::new(Capture::new(max_output)));
            let (done_tx, done_rx) = channel::bounded::<()>(1);
            let sink = Arc::clone(&capture);
            let reader = File::from(read_end);
            thread::spawn(move || {
                drain(reader, &sink);
                let _ = done_tx.send(());
            });

            let status = wait_with_deadline(child, timeout, &describe)?;

            // Background jobs may still hold the pipe; keep what arrived so far
            if done_rx.recv_timeout(DRAIN_GRACE).is_err() {
                tracing::debug!(jail = %target, "output pipe still open, returning partial output");
            }
            let output = mem::replace(&mut *lock(&capture), Capture::new(0)).into_text();

            match status {
                WaitStatus::Exited(_, 126) if jid.is_some() && output.is_empty() => {
                    Err(Error::CommandFailed {
                        command: describe(),
                        message: format!("jail_attach({}) failed", target),
                    })
                }
                WaitStatus::Exited(_, code) => {
                    tracing::debug!(jail = %target, code, bytes = output.len(), "command exited");
                    Ok(output)
                }
                WaitStatus::Signaled(_, signal, _) => Err(Error::CommandFailed {
                    command: describe(),
                    message: format!("Process killed by signal {}", signal),
                }),
                other => Err(Error::CommandFailed {
                    command: describe(),
                    message: format!("Unexpected wait status: {:?}", other),
                }),
            }
        }
        Err(e) => Err(Error::CommandFailed {
            command: describe(),
            message: format!("Fork failed: {}", e),
        }),
    }
}

/// Command output kept up to a byte limit
struct Capture {
    bytes: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        let kept = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..kept]);
        self.dropped += chunk.len() - kept;
    }

    fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            let _ = writeln!(text, "[output truncated: {} bytes dropped]", self.dropped);
        }
        text
    }
}

/// Copy `reader` into `capture` chunk by chunk until EOF
fn drain(mut reader: impl Read, capture: &Mutex<Capture>) {
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => lock(capture).push(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn lock(capture: &Mutex<Capture>) -> MutexGuard<'_, Capture> {
    capture.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll the child until it exits, killing it once `timeout` has passed
fn wait_with_deadline(
    child: Pid,
    timeout: Option<Duration>,
    describe: &dyn Fn() -> String,
) -> Result<WaitStatus> {
    let start = Instant::now();

    loop {
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if let Some(limit) = timeout
                    && start.elapsed() > limit
                {
                    let _ = kill(child, Signal::SIGKILL);
                    let _ = waitpid(child, None);
                    tracing::warn!(pid = child.as_raw(), ?limit, "command timed out, killed");
                    return Err(Error::JailTimeout(limit));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Ok(status) => return Ok(status),
            Err(e) => {
                return Err(Error::CommandFailed {
                    command: describe(),
                    message: format!("waitpid failed: {}", e),
                });
            }
        }
    }
}
