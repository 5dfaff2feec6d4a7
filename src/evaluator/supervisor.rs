//! Evaluator subprocess supervision.
//!
//! The child's stdout and stderr share one pipe so REPL text and diagnostics
//! arrive as a single ordered byte stream. A waiter task owns the
//! `tokio::process::Child`, reaps it, and publishes the exit through a
//! `watch` channel; everything else observes liveness through that channel.

use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::process::{ChildStdin, Command};
use tokio::sync::watch;

use crate::config::defaults::TERMINATE_TIMEOUT_MS;
use crate::error::ErrorReport;

/// Lifecycle of the evaluator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl ProcessState {
    pub fn is_exited(&self) -> bool {
        matches!(self, ProcessState::Exited { .. })
    }

    /// Human-readable exit classification, `None` while alive.
    pub fn exit_reason(&self) -> Option<String> {
        match *self {
            ProcessState::Exited {
                signal: Some(signum),
                ..
            } => Some(format!(
                "Process exited with signal {} ({})",
                signum,
                signal_name(signum)
            )),
            ProcessState::Exited {
                code: Some(code), ..
            } => Some(format!("Process exited with code {}", code)),
            ProcessState::Exited { .. } => Some("Process exited".to_string()),
            _ => None,
        }
    }
}

impl From<ExitStatus> for ProcessState {
    fn from(status: ExitStatus) -> Self {
        ProcessState::Exited {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Symbolic name of a signal number, e.g. `SIGTERM` for 15.
pub fn signal_name(signum: i32) -> String {
    Signal::try_from(signum)
        .map(|sig| sig.as_str().to_string())
        .unwrap_or_else(|_| format!("unknown signal {}", signum))
}

/// One running evaluator process and the pipes the bridge owns.
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    output: Option<pipe::Receiver>,
    state: watch::Receiver<ProcessState>,
    terminate_timeout: Duration,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("state", &self.poll())
            .finish()
    }
}

impl ProcessHandle {
    /// Spawn `command` (program followed by its arguments).
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(command: &[String], environment: &HashMap<String, String>) -> io::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Empty evaluator command"))?;

        let (output_reader, output_writer) = io::pipe()?;
        let stderr_writer = output_writer.try_clone()?;

        // The Command (and with it our copies of the pipe's write end) is
        // dropped at the end of this block so EOF reflects the child alone.
        let mut child = {
            let mut cmd = Command::new(program);
            cmd.args(args)
                .envs(environment)
                .stdin(Stdio::piped())
                .stdout(output_writer)
                .stderr(stderr_writer);
            cmd.spawn()
                .map_err(|e| io::Error::new(e.kind(), format!("Failed to spawn {}: {}", program, e)))?
        };

        let pid = child.id();
        let stdin = child.stdin.take();
        let output = pipe::Receiver::from_owned_fd(OwnedFd::from(output_reader))?;

        let (state_tx, state_rx) = watch::channel(ProcessState::Starting);
        tokio::spawn(async move {
            state_tx.send_replace(ProcessState::Running);
            let state = match child.wait().await {
                Ok(status) => ProcessState::from(status),
                Err(e) => {
                    warn!(
                        target: "swankbridge::process",
                        "Failed to wait for evaluator process: {}",
                        e
                    );
                    ProcessState::Exited {
                        code: None,
                        signal: None,
                    }
                }
            };
            debug!(
                target: "swankbridge::process",
                "Evaluator process {:?} reaped: {:?}",
                pid,
                state
            );
            state_tx.send_replace(state);
        });

        debug!(
            target: "swankbridge::process",
            "Started {} as pid {:?}",
            command.join(" "),
            pid
        );

        Ok(Self {
            pid,
            stdin,
            output: Some(output),
            state: state_rx,
            terminate_timeout: Duration::from_millis(TERMINATE_TIMEOUT_MS),
        })
    }

    /// Grace period between SIGTERM and SIGKILL in [`terminate`](Self::terminate).
    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness check.
    pub fn poll(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Fail with the classified exit reason once the process is gone.
    pub fn check_alive(&self) -> Result<(), ErrorReport> {
        match self.poll().exit_reason() {
            Some(reason) => Err(ErrorReport::fatal(reason)),
            None => Ok(()),
        }
    }

    /// Subscribe to lifecycle changes.
    pub fn state_watch(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Hand the combined stdout/stderr pipe to its reader (once).
    pub fn take_output(&mut self) -> Option<pipe::Receiver> {
        self.output.take()
    }

    /// Write one line to stdin and flush it.
    ///
    /// Surrounding whitespace is trimmed and a single newline appended.
    pub async fn write(&mut self, text: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "Evaluator stdin is closed"))?;
        let mut line = text.trim().as_bytes().to_vec();
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await
    }

    /// Stop the process: SIGTERM, bounded wait, then SIGKILL.
    ///
    /// Failures are logged; this never returns an error.
    pub async fn terminate(&mut self) {
        if self.poll().is_exited() {
            return;
        }
        self.stdin = None;
        let Some(pid) = self.pid else {
            return;
        };

        send_signal(pid, Signal::SIGTERM);
        if self.wait_for_exit(self.terminate_timeout).await {
            return;
        }

        warn!(
            target: "swankbridge::process",
            "Evaluator pid {} ignored SIGTERM for {:?}, sending SIGKILL",
            pid,
            self.terminate_timeout
        );
        send_signal(pid, Signal::SIGKILL);
        if !self.wait_for_exit(self.terminate_timeout).await {
            warn!(
                target: "swankbridge::process",
                "Failed to terminate evaluator pid {}",
                pid
            );
        }
    }

    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        match tokio::time::timeout(timeout, state.wait_for(ProcessState::is_exited)).await {
            Ok(Ok(_)) => true,
            _ => false,
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let (Some(pid), false) = (self.pid, self.poll().is_exited()) {
            debug!(
                target: "swankbridge::process",
                "Dropping handle of live evaluator pid {}, sending SIGTERM",
                pid
            );
            send_signal(pid, Signal::SIGTERM);
        }
    }
}

fn send_signal(pid: u32, sig: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = signal::kill(Pid::from_raw(raw), sig) {
        warn!(
            target: "swankbridge::process",
            "Failed to send {} to pid {}: {}",
            sig.as_str(),
            pid,
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn command(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    async fn wait_exited(handle: &ProcessHandle) -> ProcessState {
        let mut state = handle.state_watch();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(ProcessState::is_exited),
        )
        .await
        .expect("process should exit")
        .expect("state sender alive");
        *result
    }

    #[tokio::test]
    async fn start_runs_process_and_echoes_stdin() {
        let mut handle = ProcessHandle::start(&command(&["cat"]), &HashMap::new())
            .expect("cat should spawn");
        let mut output = handle.take_output().expect("output pipe");

        assert!(!handle.poll().is_exited());
        handle.write("hello").await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), output.read(&mut buf))
            .await
            .expect("cat should echo")
            .unwrap();
        assert_eq!(&buf[..n], b"hello\n");

        handle.terminate().await;
    }

    #[tokio::test]
    async fn write_adds_exactly_one_newline() {
        let mut handle = ProcessHandle::start(&command(&["cat"]), &HashMap::new()).unwrap();
        let mut output = handle.take_output().unwrap();

        handle.write("  (+ 1 2)\n").await.unwrap();
        handle.write("(list 3)").await.unwrap();

        let expected: &[u8] = b"(+ 1 2)\n(list 3)\n";
        let mut echoed = Vec::new();
        let mut buf = [0u8; 64];
        while echoed.len() < expected.len() {
            let n = tokio::time::timeout(Duration::from_secs(5), output.read(&mut buf))
                .await
                .expect("cat should echo")
                .unwrap();
            assert_ne!(n, 0, "cat closed its output early");
            echoed.extend_from_slice(&buf[..n]);
        }
        assert_eq!(echoed, expected);

        handle.terminate().await;
    }

    #[tokio::test]
    async fn output_pipe_is_handed_out_once() {
        let mut handle = ProcessHandle::start(&command(&["cat"]), &HashMap::new()).unwrap();

        assert!(handle.take_output().is_some());
        assert!(handle.take_output().is_none());

        handle.terminate().await;
    }

    #[tokio::test]
    async fn stderr_is_merged_into_output_in_order() {
        let mut handle = ProcessHandle::start(
            &command(&["sh", "-c", "echo out; echo err 1>&2; echo again"]),
            &HashMap::new(),
        )
        .unwrap();
        let mut output = handle.take_output().unwrap();

        let mut text = String::new();
        tokio::time::timeout(Duration::from_secs(5), output.read_to_string(&mut text))
            .await
            .expect("sh should finish")
            .unwrap();

        assert_eq!(text, "out\nerr\nagain\n");
    }

    #[tokio::test]
    async fn environment_is_passed_to_child() {
        let mut environment = HashMap::new();
        environment.insert("SWANKBRIDGE_TEST_VAR".to_string(), "visible".to_string());
        let mut handle = ProcessHandle::start(
            &command(&["sh", "-c", "printf %s \"$SWANKBRIDGE_TEST_VAR\""]),
            &environment,
        )
        .unwrap();
        let mut output = handle.take_output().unwrap();

        let mut text = String::new();
        tokio::time::timeout(Duration::from_secs(5), output.read_to_string(&mut text))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(text, "visible");
    }

    #[tokio::test]
    async fn exit_code_is_classified() {
        let handle =
            ProcessHandle::start(&command(&["sh", "-c", "exit 3"]), &HashMap::new()).unwrap();

        let state = wait_exited(&handle).await;

        assert_eq!(
            state.exit_reason().as_deref(),
            Some("Process exited with code 3")
        );
        let report = handle.check_alive().unwrap_err();
        assert!(report.fatal);
    }

    #[tokio::test]
    async fn signal_exit_is_translated_to_name() {
        let handle =
            ProcessHandle::start(&command(&["sh", "-c", "kill -9 $$"]), &HashMap::new()).unwrap();

        let state = wait_exited(&handle).await;

        assert_eq!(
            state.exit_reason().as_deref(),
            Some("Process exited with signal 9 (SIGKILL)")
        );
    }

    #[tokio::test]
    async fn terminate_sends_sigterm() {
        let mut handle =
            ProcessHandle::start(&command(&["sleep", "30"]), &HashMap::new()).unwrap();

        handle.terminate().await;

        assert_eq!(
            handle.poll(),
            ProcessState::Exited {
                code: None,
                signal: Some(15)
            }
        );
    }

    #[tokio::test]
    async fn terminate_escalates_to_sigkill() {
        let mut handle = ProcessHandle::start(
            &command(&["sh", "-c", "trap '' TERM; while true; do sleep 1; done"]),
            &HashMap::new(),
        )
        .unwrap()
        .with_terminate_timeout(Duration::from_millis(300));
        // Give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.terminate().await;

        assert_eq!(
            handle.poll(),
            ProcessState::Exited {
                code: None,
                signal: Some(9)
            }
        );
    }

    #[tokio::test]
    async fn terminate_after_exit_is_noop() {
        let mut handle =
            ProcessHandle::start(&command(&["sh", "-c", "exit 0"]), &HashMap::new()).unwrap();
        wait_exited(&handle).await;

        handle.terminate().await;

        assert_eq!(
            handle.poll(),
            ProcessState::Exited {
                code: Some(0),
                signal: None
            }
        );
    }

    #[tokio::test]
    async fn start_fails_for_missing_binary() {
        let err = ProcessHandle::start(&command(&["nonexistent-binary-xyz123"]), &HashMap::new())
            .unwrap_err();

        assert!(err.to_string().contains("Failed to spawn"));
        assert!(err.to_string().contains("nonexistent-binary-xyz123"));
    }

    #[tokio::test]
    async fn start_rejects_empty_command() {
        let err = ProcessHandle::start(&[], &HashMap::new()).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn signal_names() {
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(2), "SIGINT");
        assert_eq!(signal_name(999), "unknown signal 999");
    }
}
