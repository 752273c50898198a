//! Process execution with explicit timeouts and process groups.
//!
//! The engine runs in privileged contexts; external commands must not hang
//! indefinitely, and cancellation has to take down the whole child tree, so
//! every spawn puts the child into its own process group.

use crate::{HalError, HalResult};
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

/// Captured output of a finished child.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    /// stdout and stderr joined the way diagnostic output is logged.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr).trim().to_string()
    }
}

/// Run a command to completion and capture its output.
pub fn run_capture(
    program: &str,
    path: &Path,
    args: &[String],
    timeout: Duration,
) -> HalResult<RunOutput> {
    run_streaming(program, path, args, timeout, &mut |_| true)
}

/// Run a command, invoking `on_line` for every stdout line as it arrives.
///
/// The callback returns `false` to abort: the child's whole process group is
/// terminated and the run fails. The `timeout` bounds the entire run
/// including the line stream.
pub fn run_streaming(
    program: &str,
    path: &Path,
    args: &[String],
    timeout: Duration,
    on_line: &mut dyn FnMut(&str) -> bool,
) -> HalResult<RunOutput> {
    let mut cmd = Command::new(path);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    unsafe {
        // Own process group so cancellation can signal the whole tree.
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            HalError::CommandNotFound(program.to_string())
        } else {
            HalError::Io(err)
        }
    })?;
    let pid = child.id() as i32;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (line_tx, line_rx) = mpsc::channel::<String>();
    let stdout_handle = std::thread::spawn(move || {
        let mut all = String::new();
        if let Some(out) = stdout {
            for line in BufReader::new(out).lines().map_while(Result::ok) {
                all.push_str(&line);
                all.push('\n');
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        }
        all
    });
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut err) = stderr {
            let _ = err.read_to_string(&mut buf);
        }
        buf
    });

    let deadline = Instant::now() + timeout;
    let mut aborted = false;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            kill_group(pid);
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout_handle.join();
            let _ = stderr_handle.join();
            return Err(HalError::CommandTimeout {
                program: program.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
        match line_rx.recv_timeout(remaining.min(Duration::from_millis(200))) {
            Ok(line) => {
                if !on_line(&line) {
                    aborted = true;
                    kill_group(pid);
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    let status = match child
        .wait_timeout(remaining.max(Duration::from_millis(100)))
        .map_err(HalError::Io)?
    {
        Some(status) => status,
        None => {
            kill_group(pid);
            let _ = child.wait();
            let _ = stdout_handle.join();
            let _ = stderr_handle.join();
            return Err(HalError::CommandTimeout {
                program: program.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    if aborted {
        return Err(HalError::Other(format!("{program} aborted by caller")));
    }

    if !status.success() {
        return Err(HalError::CommandFailed {
            program: program.to_string(),
            code: status.code(),
            stderr: if stderr.trim().is_empty() {
                stdout
            } else {
                stderr
            },
        });
    }

    Ok(RunOutput { stdout, stderr })
}

/// Signal an entire process group. Used by cancellation paths.
pub fn kill_group(pid: i32) {
    unsafe {
        libc::killpg(pid, libc::SIGTERM);
    }
}
