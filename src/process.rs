use std::io::{BufRead, BufReader};
use std::process::{Child, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cmd::POLL_INTERVAL;
use crate::locate::FetcherHandle;

/// How long a terminated process gets to exit gracefully before being killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationStatus {
    /// Zero exit code.
    Ok,
    /// Nonzero exit code (or no exit code, e.g. signal death).
    Error(Option<i32>),
    /// The supervisor killed the process on a cancellation request.
    Killed,
}

#[derive(Debug)]
pub enum LineRead {
    Line(String),
    /// No output within the poll window; the process may still be running.
    Idle,
    /// Output fully drained; the process has closed both pipes.
    Eof,
}

/// Owns one live fetcher process: merged stdout/stderr line stream,
/// cooperative termination, terminal status.
pub struct Supervisor {
    child: Child,
    lines: mpsc::Receiver<String>,
    readers: Vec<thread::JoinHandle<()>>,
    killed: bool,
}

impl Supervisor {
    pub fn spawn(fetcher: &FetcherHandle, args: &[String]) -> std::io::Result<Self> {
        let mut cmd = fetcher.to_command();
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Own process group so termination reaches the whole tree (the
        // fetcher forks the media tool for merges); otherwise orphaned
        // grandchildren keep the pipes open past finish().
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn()?;
        debug!(pid = child.id(), program = %fetcher.program, "fetcher spawned");

        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "stdout pipe missing")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "stderr pipe missing")
        })?;

        // Both pipes feed one channel so the caller sees a single merged,
        // FIFO-per-pipe stream of lines.
        let (tx, rx) = mpsc::channel();
        let tx_err = tx.clone();
        let readers = vec![
            thread::spawn(move || forward_lines(stdout, tx)),
            thread::spawn(move || forward_lines(stderr, tx_err)),
        ];

        Ok(Self {
            child,
            lines: rx,
            readers,
            killed: false,
        })
    }

    /// Waits up to one poll interval for the next output line. This is the
    /// only suspension point; callers check their cancellation flag between
    /// calls, which bounds cancellation latency by one poll window.
    pub fn next_line(&mut self) -> LineRead {
        match self.lines.recv_timeout(POLL_INTERVAL) {
            Ok(line) => LineRead::Line(line),
            Err(mpsc::RecvTimeoutError::Timeout) => LineRead::Idle,
            Err(mpsc::RecvTimeoutError::Disconnected) => LineRead::Eof,
        }
    }

    /// Graceful-then-forceful termination. A process that already exited on
    /// its own keeps its natural status (cancellation race resolves to
    /// whichever terminal state came first).
    pub fn terminate(&mut self) {
        match self.child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(err) => {
                warn!(pid = self.child.id(), %err, "try_wait failed during terminate");
            }
        }

        self.killed = true;
        debug!(pid = self.child.id(), "terminating fetcher");
        request_graceful_exit(&mut self.child);

        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            if matches!(self.child.try_wait(), Ok(Some(_))) {
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }

        warn!(pid = self.child.id(), "grace period expired, killing fetcher");
        kill_process_tree(&mut self.child);
    }

    /// Reaps the process and joins the reader threads.
    pub fn finish(mut self) -> TerminationStatus {
        let status = self.child.wait();
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }

        if self.killed {
            return TerminationStatus::Killed;
        }
        match status {
            Ok(s) if s.success() => TerminationStatus::Ok,
            Ok(s) => TerminationStatus::Error(s.code()),
            Err(_) => TerminationStatus::Error(None),
        }
    }
}

fn forward_lines(pipe: impl std::io::Read, tx: mpsc::Sender<String>) {
    let reader = BufReader::new(pipe);
    for line in reader.lines() {
        match line {
            Ok(line) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(unix)]
fn request_graceful_exit(child: &mut Child) {
    // Negative pid targets the process group set at spawn.
    unsafe {
        libc::kill(-(child.id() as libc::pid_t), libc::SIGTERM);
    }
}

#[cfg(windows)]
fn request_graceful_exit(child: &mut Child) {
    let pid = child.id().to_string();
    let _ = crate::cmd::command("taskkill")
        .args(["/PID", &pid, "/T"])
        .status();
}

fn kill_process_tree(child: &mut Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = crate::cmd::command("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .status();
    }
    #[cfg(unix)]
    unsafe {
        libc::kill(-(child.id() as libc::pid_t), libc::SIGKILL);
    }

    let _ = child.kill();
    let _ = child.wait();
}
