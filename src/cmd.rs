use std::ffi::OsStr;
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

/// Poll interval while waiting on an external process.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Prevent console windows from stealing focus on Windows while running tools.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

/// Runs a command to completion, capturing stdout/stderr. Returns `Ok(None)`
/// when the process is still running after `timeout` (it is killed first).
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> std::io::Result<Option<Output>> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    let mut stdout = child.stdout.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "stdout pipe missing")
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "stderr pipe missing")
    })?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let started = Instant::now();
    loop {
        match child.try_wait()? {
            Some(status) => {
                let stdout = stdout_handle.join().unwrap_or_default();
                let stderr = stderr_handle.join().unwrap_or_default();
                return Ok(Some(Output {
                    status,
                    stdout,
                    stderr,
                }));
            }
            None => {
                if started.elapsed() >= timeout {
                    debug!(timeout_ms = timeout.as_millis() as u64, "probe timed out, killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Ok(None);
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Runs a probe command and returns the first non-empty stdout line on success.
pub fn probe_first_line(cmd: &mut Command, timeout: Duration) -> Option<String> {
    let output = run_with_timeout(cmd, timeout).ok()??;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    Some(first.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn run_with_timeout_captures_output() {
        let mut cmd = command("sh");
        cmd.args(["-c", "echo hello; echo oops >&2"]);
        let output = run_with_timeout(&mut cmd, Duration::from_secs(10))
            .expect("run")
            .expect("not timed out");
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn run_with_timeout_kills_slow_process() {
        let mut cmd = command("sh");
        cmd.args(["-c", "sleep 30"]);
        let started = Instant::now();
        let result = run_with_timeout(&mut cmd, Duration::from_millis(300)).expect("run");
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn probe_first_line_skips_blank_lines() {
        let mut cmd = command("sh");
        cmd.args(["-c", "echo; echo '  2025.01.01  '"]);
        let line = probe_first_line(&mut cmd, Duration::from_secs(10)).expect("line");
        assert_eq!(line, "2025.01.01");
    }

    #[test]
    fn probe_first_line_missing_program_is_none() {
        let mut cmd = command("definitely-not-a-real-program-xyz");
        cmd.arg("--version");
        assert!(probe_first_line(&mut cmd, Duration::from_secs(5)).is_none());
    }
}
