// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The pty adapter. Forks a child process attached to a
//! pseudo-terminal and exposes write, resize, kill, a chunk-oriented
//! reader, and exit notification. Chunks are opaque byte strings;
//! nothing here transcodes or reframes them, and reads can split the
//! stream anywhere, including mid escape sequence.

use std::{
    ffi::OsString,
    io::{Read as _, Write as _},
    os::fd::{AsFd, RawFd},
    path::Path,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread, time,
};

use anyhow::{anyhow, Context};
use nix::{
    poll,
    sys::{signal, termios},
    unistd::Pid,
};
use tracing::{error, info, instrument, span, trace, warn, Level};

use super::exit_notify::ExitNotifier;
use crate::consts;

const STDERR_FD: i32 = 2;

// see `man ioctl_tty` for the window size ioctl
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

/// Push session dimensions down to the kernel side of the pty. The
/// daemon only ever sets sizes (clients dictate dimensions on create
/// and resize); there is no terminal of our own to query.
fn set_term_size(fd: RawFd, cols: u16, rows: u16) -> anyhow::Result<()> {
    let winsize = libc::winsize { ws_row: rows, ws_col: cols, ws_xpixel: 0, ws_ypixel: 0 };

    // Safety: winsize lives on the stack for the duration of the call
    unsafe {
        tiocswinsz(fd, &winsize)
            .with_context(|| format!("setting terminal size to {cols}x{rows}"))?;
    }

    Ok(())
}

/// Sessions driven by programs rather than humans read cleaner
/// without the tty echoing their input back into the output stream.
fn disable_echo<F: AsFd>(fd: F) -> anyhow::Result<()> {
    let mut term = termios::tcgetattr(&fd).context("reading termios flags")?;
    term.local_flags.remove(termios::LocalFlags::ECHO);
    termios::tcsetattr(&fd, termios::SetArg::TCSANOW, &term).context("writing termios flags")?;

    Ok(())
}

/// Everything needed to launch a child process under a pty.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(OsString, OsString)>,
    pub cols: u16,
    pub rows: u16,
    /// Spawn with arg0 prefixed with "-" so shells start as login
    /// shells, the same trick sshd uses.
    pub login_shell: bool,
    pub noecho: bool,
}

/// A handle on a running pty child. Owned by exactly one session.
pub struct Pty {
    // Never dropped until the Pty goes away since the Fork's
    // destructor closes the master fd out from under the reader.
    #[allow(dead_code)]
    fork: shpool_pty::fork::Fork,
    master: shpool_pty::fork::Master,
    child_pid: libc::pid_t,
    exit_notifier: Arc<ExitNotifier>,
    stop_reader: Arc<AtomicBool>,
}

impl std::fmt::Debug for Pty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pty").field("child_pid", &self.child_pid).finish()
    }
}

/// Fork the child and start the waitpid watcher thread. Failure here
/// is the `spawn-failed` case: the caller gets an error and no
/// session comes into existence.
#[instrument(skip_all, fields(cmd = spec.command))]
pub fn spawn(spec: &LaunchSpec) -> anyhow::Result<Pty> {
    let mut cmd = process::Command::new(&spec.command);
    cmd.args(&spec.args)
        .stdin(process::Stdio::inherit())
        .stdout(process::Stdio::inherit())
        .stderr(process::Stdio::inherit())
        // The env is rebuilt from scratch by the caller; a blank
        // slate avoids leaking daemon-process vars into sessions.
        .env_clear();
    cmd.envs(spec.env.iter().cloned());
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    if spec.login_shell {
        use std::os::unix::process::CommandExt as _;
        let shell_basename = Path::new(&spec.command)
            .file_name()
            .ok_or(anyhow!("error building login shell indicator"))?
            .to_str()
            .ok_or(anyhow!("error parsing shell name as utf8"))?;
        cmd.arg0(format!("-{shell_basename}"));
    }

    info!("about to fork pty child");
    let fork = shpool_pty::fork::Fork::from_ptmx().context("forking pty")?;
    if let Ok(slave) = fork.is_child() {
        use std::os::unix::process::CommandExt as _;
        if spec.noecho {
            if let Some(fd) = slave.borrow_fd() {
                let _ = disable_echo(fd);
            }
        }
        for fd in STDERR_FD + 1..(nix::unistd::SysconfVar::OPEN_MAX as i32) {
            let _ = nix::unistd::close(fd);
        }
        let err = cmd.exec();
        eprintln!("exec err: {err:?}");
        std::process::exit(1);
    }

    let master = fork.is_parent().context("resolving pty master")?;
    let child_pid = fork.child_pid().ok_or(anyhow!("missing child pid"))?;

    // set the initial size before the child starts drawing
    if let Some(fd) = master.raw_fd() {
        if let Err(e) = set_term_size(*fd, spec.cols, spec.rows) {
            warn!("could not set initial pty size: {:?}", e);
        }
    }

    let exit_notifier = Arc::new(ExitNotifier::new());
    spawn_child_watcher(child_pid, Arc::clone(&exit_notifier));

    Ok(Pty { fork, master, child_pid, exit_notifier, stop_reader: Arc::new(AtomicBool::new(false)) })
}

/// Reap the child when it exits and notify about the exit status.
///
/// The watcher only needs the child pid, not the pty fd; holding a
/// clone of the whole fork here would close the master early when
/// this thread exits.
fn spawn_child_watcher(child_pid: libc::pid_t, exit_notifier: Arc<ExitNotifier>) {
    thread::spawn(move || {
        let _s = span!(Level::INFO, "child_watcher", pid = child_pid).entered();

        let mut status = 0;
        let mut exit_code = None;
        loop {
            // Safety: all basic ffi, the pid stays valid until waitpid
            //         returns since nothing else reaps it.
            unsafe {
                match libc::waitpid(child_pid, &mut status, 0) {
                    0 => continue,
                    -1 => break,
                    _ => {
                        if libc::WIFEXITED(status) {
                            exit_code = Some(libc::WEXITSTATUS(status));
                        } else if libc::WIFSIGNALED(status) {
                            // shell convention for signal deaths
                            exit_code = Some(128 + libc::WTERMSIG(status));
                        }
                        break;
                    }
                }
            }
        }
        let exit_code = exit_code.unwrap_or(1);
        info!("child exited with status {}", exit_code);
        exit_notifier.notify_exit(exit_code);
    });
}

impl Pty {
    pub fn child_pid(&self) -> libc::pid_t {
        self.child_pid
    }

    pub fn exit_notifier(&self) -> Arc<ExitNotifier> {
        Arc::clone(&self.exit_notifier)
    }

    /// Write input bytes to the child's terminal.
    pub fn write_all(&self, buf: &[u8]) -> anyhow::Result<()> {
        let mut master = self.master;
        master.write_all(buf).context("writing chunk to pty master")?;
        master.flush().context("flushing pty master")?;
        Ok(())
    }

    /// Resize the child's terminal. Idempotent.
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let fd = self.master.raw_fd().ok_or(anyhow!("no master fd"))?;
        set_term_size(fd, cols, rows)
    }

    /// Ask the child to die with SIGHUP, escalating to SIGKILL after
    /// the grace period. SIGHUP rather than SIGTERM because shells
    /// forward SIGTERM to their children rather than exiting; SIGHUP
    /// is the terminal-hangup signal they honor themselves.
    #[instrument(skip_all, fields(pid = self.child_pid))]
    pub fn kill(&self, grace: time::Duration) -> anyhow::Result<()> {
        signal::kill(Pid::from_raw(self.child_pid), Some(signal::Signal::SIGHUP))
            .context("sending SIGHUP to child proc")?;

        if self.exit_notifier.wait(Some(grace)).is_none() {
            info!("child failed to exit within kill grace period, no longer being polite");
            signal::kill(Pid::from_raw(self.child_pid), Some(signal::Signal::SIGKILL))
                .context("sending SIGKILL to child proc")?;
            // SIGKILL cannot be ignored; the bounded wait is only for
            // the reaper to run
            self.exit_notifier.wait(Some(grace));
        }

        Ok(())
    }

    /// Signal the reader thread to wind down at its next poll tick.
    pub fn stop_reader(&self) {
        self.stop_reader.store(true, Ordering::Relaxed);
    }

    /// Spawn the reader thread, which continually reads output from
    /// the pty and hands each chunk to `on_chunk`. The thread exits
    /// when the child does (or when `stop_reader` is called), after
    /// draining whatever output is immediately available.
    pub fn spawn_reader(
        &self,
        name: &str,
        mut on_chunk: impl FnMut(&[u8]) + Send + 'static,
    ) -> anyhow::Result<thread::JoinHandle<anyhow::Result<()>>> {
        let mut master = self.master;
        let watchable_master = self.master;
        let exit_notifier = Arc::clone(&self.exit_notifier);
        let stop = Arc::clone(&self.stop_reader);
        let session = String::from(name);

        let mut closure = move || -> anyhow::Result<()> {
            let _s = span!(Level::INFO, "pty_reader", s = session).entered();

            let mut buf: Vec<u8> = vec![0; consts::BUF_SIZE];
            let mut poll_fds = [poll::PollFd::new(
                watchable_master.borrow_fd().ok_or(anyhow!("no master fd"))?,
                poll::PollFlags::POLLIN,
            )];
            loop {
                if stop.load(Ordering::Relaxed) {
                    info!("reader stopping on request");
                    return Ok(());
                }

                // Block with a timeout until the child has data so we
                // can notice exit/stop even when the shell is quiet.
                let nready = match poll::poll(&mut poll_fds, consts::PTY_POLL_MS) {
                    Ok(n) => n,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        error!("polling pty master: {:?}", e);
                        return Err(e).context("polling pty master")?;
                    }
                };
                if nready == 0 {
                    // timeout, the child exited if the notifier fired
                    // and there is nothing more to read
                    if exit_notifier.poll().is_some() {
                        info!("reader stopping, child exited");
                        return Ok(());
                    }
                    continue;
                }

                let len = match master.read(&mut buf) {
                    Ok(l) => l,
                    Err(e) => {
                        // EIO is how the kernel says the child side of
                        // the pty is gone
                        info!("read from pty master failed, assuming child exit: {:?}", e);
                        return Ok(());
                    }
                };
                if len == 0 {
                    if exit_notifier.poll().is_some() {
                        return Ok(());
                    }
                    continue;
                }
                trace!("read pty master len={} '{}'", len, String::from_utf8_lossy(&buf[..len]));

                on_chunk(&buf[..len]);
            }
        };

        Ok(thread::Builder::new()
            .name(format!("pty-reader({name})"))
            .spawn(move || {
                closure().map_err(|e| {
                    error!("error in pty reader: {:?}", e);
                    e
                })
            })
            .context("spawning pty reader thread")?)
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        // the fork's own destructor closes the pty fd pair
        self.stop_reader.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use ntest::timeout;

    use super::*;

    fn spec(command: &str, args: Vec<String>) -> LaunchSpec {
        LaunchSpec {
            command: String::from(command),
            args,
            cwd: None,
            env: vec![(OsString::from("PATH"), OsString::from("/usr/bin:/bin"))],
            cols: 80,
            rows: 24,
            login_shell: false,
            noecho: true,
        }
    }

    #[test]
    #[timeout(30000)]
    fn echo_child_produces_output_and_exits() {
        let pty = spawn(&spec("/bin/echo", vec![String::from("marker-bytes")]))
            .expect("echo to spawn");

        let chunks: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(vec![]));
        let sink = Arc::clone(&chunks);
        let reader = pty
            .spawn_reader("test", move |chunk| {
                sink.lock().unwrap().extend_from_slice(chunk);
            })
            .expect("reader to spawn");

        let status = pty.exit_notifier().wait(Some(time::Duration::from_secs(10)));
        assert_eq!(status, Some(0));

        reader.join().expect("reader join").expect("reader result");
        let got = chunks.lock().unwrap();
        let got = String::from_utf8_lossy(&got);
        assert!(got.contains("marker-bytes"), "got: {got:?}");
    }

    #[test]
    #[timeout(30000)]
    fn kill_escalates_and_reaps() {
        let pty = spawn(&spec("/bin/cat", vec![])).expect("cat to spawn");
        // cat ignores nothing, so the SIGHUP alone should do it
        pty.kill(time::Duration::from_millis(500)).expect("kill to succeed");
        let status = pty.exit_notifier().wait(Some(time::Duration::from_secs(10)));
        assert!(status.is_some());
    }

    #[test]
    #[timeout(30000)]
    fn spawn_failure_is_an_error() {
        let res = spawn(&spec("/definitely/not/a/real/binary", vec![]));
        // the exec failure happens in the child, so either the fork
        // itself errors or the child exits nonzero immediately
        if let Ok(pty) = res {
            let status = pty.exit_notifier().wait(Some(time::Duration::from_secs(10)));
            assert_eq!(status, Some(1));
        }
    }
}
