//! Connection to one evaluator process.
//!
//! User evaluations are written to the process's stdin; their printed output
//! arrives on the output pipe and ends with the session token. The outcome
//! (`result` + payload, `error` + message, or `abort`) then arrives as
//! length-prefixed frames on the loopback socket the evaluator connected
//! back to. Internal commands skip stdin and go straight to the socket.
//!
//! Only one operation is in flight at a time: every operation borrows the
//! link mutably, and an [`OutputStream`] holds that borrow until dropped.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::Ipv4Addr;

use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::debugger::{CALL_STACK_PADDING, StackFrame, parse_call_stack};
use super::demux::{TokenSplitter, strip_color};
use super::output_reader::{OutputReaderHandle, spawn_output_reader};
use super::supervisor::ProcessHandle;
use crate::config::{BridgeSettings, EvaluatorOptions};
use crate::error::ErrorReport;
use crate::frame;
use crate::sexp::{self, Value};

/// Sent on stdin once the evaluator has connected, to enter its REPL loop.
const INIT_COMMAND: &str = "(slime:slimetop)";

/// Sent on stdin to leave any nested REPL level.
const TOP_LEVEL_COMMAND: &str = "reset";

/// Sent on the socket after a call-stack dump to leave the error REPL level.
const RESET_REPL_LEVEL_COMMAND: &str = "(reset *replevel*)";

/// Sentinel the evaluator prints after each evaluation's output.
pub fn session_token(port: u16) -> String {
    format!("\u{1d}euslime-token-{}", port)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Evaluating,
    ErrorRaised,
    Failed,
}

/// One item produced while draining an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalItem {
    /// Printed output, color-stripped unless color is enabled
    Text(String),
    /// The evaluation's value, and its text exactly as the evaluator printed
    /// it (minus color escapes)
    Result { value: Value, printed: String },
    /// End of a user evaluation
    Complete,
}

/// Outcome announced on the socket after the token.
#[derive(Debug)]
enum SocketReply {
    Result { value: Value, printed: String },
    Error(String),
    Abort,
    /// Error tag during introspection; its message frame is left unread
    Deferred,
}

pub struct EvaluatorLink {
    process: ProcessHandle,
    socket: TcpStream,
    port: u16,
    token: String,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    _reader: Option<OutputReaderHandle>,
    options: EvaluatorOptions,
    state: LinkState,
}

impl std::fmt::Debug for EvaluatorLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluatorLink")
            .field("process", &self.process)
            .field("port", &self.port)
            .field("state", &self.state)
            .finish()
    }
}

impl EvaluatorLink {
    /// Start an evaluator and wait for it to connect back.
    pub async fn launch(settings: &BridgeSettings) -> Result<Self, ErrorReport> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| ErrorReport::fatal(format!("Failed to open evaluator socket: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| ErrorReport::fatal(format!("Failed to open evaluator socket: {}", e)))?
            .port();

        let command = settings.evaluator_command(port);
        info!(
            target: "swankbridge::link",
            "Starting evaluator: {}",
            command.join(" ")
        );
        let mut process = ProcessHandle::start(&command, &settings.environment)
            .map_err(|e| ErrorReport::fatal(e.to_string()))?
            .with_terminate_timeout(settings.terminate_timeout);

        let output = process
            .take_output()
            .ok_or_else(|| ErrorReport::fatal("Evaluator output pipe unavailable"))?;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let reader = spawn_output_reader(output, process.state_watch(), queue_tx, settings.evaluator);

        debug!(
            target: "swankbridge::link",
            "Waiting up to {:?} for evaluator to connect on port {}",
            settings.connect_timeout,
            port
        );
        let accepted = tokio::time::timeout(
            settings.connect_timeout,
            guard_liveness(&process, settings.evaluator.poll_interval, listener.accept()),
        )
        .await;
        let socket = match accepted {
            Ok(Ok(Ok((socket, peer)))) => {
                debug!(
                    target: "swankbridge::link",
                    "Evaluator connected from {}",
                    peer
                );
                socket
            }
            Ok(Ok(Err(e))) => {
                process.terminate().await;
                return Err(ErrorReport::fatal(format!(
                    "Failed to accept evaluator connection: {}",
                    e
                )));
            }
            Ok(Err(report)) => return Err(report),
            Err(_elapsed) => {
                process.terminate().await;
                return Err(ErrorReport::fatal(format!(
                    "Evaluator did not connect within {:?}",
                    settings.connect_timeout
                )));
            }
        };

        let mut link = Self::from_parts(process, socket, port, queue_rx, Some(reader), settings.evaluator);
        if let Err(e) = link.process.write(INIT_COMMAND).await {
            let report = link.write_failure(e);
            link.process.terminate().await;
            return Err(report);
        }
        info!(
            target: "swankbridge::link",
            "Evaluator pid {:?} ready on port {}",
            link.process_id(),
            port
        );
        Ok(link)
    }

    /// Assemble a link from already-connected parts.
    pub(crate) fn from_parts(
        process: ProcessHandle,
        socket: TcpStream,
        port: u16,
        output: mpsc::UnboundedReceiver<Vec<u8>>,
        reader: Option<OutputReaderHandle>,
        options: EvaluatorOptions,
    ) -> Self {
        Self {
            process,
            socket,
            port,
            token: session_token(port),
            output,
            _reader: reader,
            options,
            state: LinkState::Idle,
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process.id()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_failed(&self) -> bool {
        self.state == LinkState::Failed
    }

    /// Leave the error state after the editor picked a restart.
    pub fn acknowledge_recovery(&mut self) {
        if self.state != LinkState::Failed {
            self.state = LinkState::Idle;
        }
    }

    /// Send the evaluator back to its top-level REPL.
    pub async fn reset_to_top_level(&mut self) -> Result<(), ErrorReport> {
        self.ensure_usable()?;
        self.reset_output();
        if let Err(e) = self.process.write(TOP_LEVEL_COMMAND).await {
            let report = self.write_failure(e);
            return Err(self.record_failure(report));
        }
        self.state = LinkState::Idle;
        Ok(())
    }

    /// Drop queued output left over from earlier operations.
    pub fn reset_output(&mut self) {
        let mut dropped = 0usize;
        while let Ok(chunk) = self.output.try_recv() {
            dropped += chunk.len();
        }
        if dropped > 0 {
            debug!(
                target: "swankbridge::link",
                "Discarded {} bytes of stale output",
                dropped
            );
        }
    }

    /// Run an internal command over the socket and return its value.
    ///
    /// An `abort` reply yields `nil`; an `error` reply fetches the call stack
    /// and fails with a recoverable report.
    pub async fn exec_once(&mut self, command: &str) -> Result<Value, ErrorReport> {
        self.ensure_usable()?;
        self.discard_stale_socket_bytes();
        debug!(target: "swankbridge::link", "exec_once: {}", command);

        let depth = self.options.call_stack_depth;
        let outcome = async {
            self.send_socket_command(command).await?;
            match self.read_socket_reply(false).await? {
                SocketReply::Result { value, .. } => Ok(value),
                SocketReply::Abort | SocketReply::Deferred => Ok(Value::Nil),
                SocketReply::Error(message) => {
                    let frames = self.fetch_call_stack(depth).await?;
                    Err(ErrorReport::evaluator(message, frames))
                }
            }
        }
        .await;
        outcome.map_err(|report| self.record_failure(report))
    }

    /// Submit a user evaluation and stream its output.
    ///
    /// The stream yields text chunks, then at most one result, then
    /// [`EvalItem::Complete`].
    pub async fn eval(&mut self, command: &str) -> Result<OutputStream<'_>, ErrorReport> {
        self.ensure_usable()?;
        self.reset_output();
        self.discard_stale_socket_bytes();
        debug!(target: "swankbridge::link", "eval: {}", command);

        if let Err(e) = self.process.write(command).await {
            let report = self.write_failure(e);
            return Err(self.record_failure(report));
        }
        self.state = LinkState::Evaluating;
        Ok(OutputStream::new(self, false, true))
    }

    /// Drain output up to the next token and its socket reply.
    ///
    /// In recursive mode an `error` reply ends the stream quietly instead of
    /// fetching a call stack.
    pub fn consume_output(&mut self, recursive: bool) -> OutputStream<'_> {
        OutputStream::new(self, recursive, false)
    }

    /// Ask the evaluator for its call stack and parse it into frames.
    pub async fn fetch_call_stack(&mut self, depth: usize) -> Result<Vec<StackFrame>, ErrorReport> {
        self.reset_output();
        self.discard_stale_socket_bytes();
        self.send_socket_command(&format!(
            "(slime:print-callstack {})",
            depth + CALL_STACK_PADDING
        ))
        .await?;

        let mut splitter = TokenSplitter::new(&self.token);
        let mut text = String::new();
        loop {
            let chunk = self.next_chunk().await?;
            let split = splitter.push(&chunk);
            text.push_str(&self.clean(split.text));
            if split.found_token {
                self.read_socket_reply(true).await?;
                break;
            }
        }

        self.send_socket_command(RESET_REPL_LEVEL_COMMAND).await?;
        let frames = parse_call_stack(&text);
        debug!(
            target: "swankbridge::link",
            "Fetched {} call stack frames",
            frames.len()
        );
        Ok(frames)
    }

    /// Terminate the evaluator and close the socket.
    pub async fn shutdown(mut self) {
        info!(
            target: "swankbridge::link",
            "Shutting down evaluator pid {:?}",
            self.process_id()
        );
        if let Err(e) = self.socket.shutdown().await {
            debug!(
                target: "swankbridge::link",
                "Evaluator socket shutdown failed: {}",
                e
            );
        }
        self.process.terminate().await;
    }

    fn ensure_usable(&mut self) -> Result<(), ErrorReport> {
        if self.state == LinkState::Failed {
            return Err(ErrorReport::fatal(
                "Evaluator connection has failed; invoke RESTART to start a new evaluator",
            ));
        }
        if let Err(report) = self.process.check_alive() {
            return Err(self.record_failure(report));
        }
        Ok(())
    }

    fn record_failure(&mut self, report: ErrorReport) -> ErrorReport {
        if report.fatal {
            if self.state != LinkState::Failed {
                warn!(
                    target: "swankbridge::link",
                    "Evaluator connection failed: {}",
                    report.message
                );
            }
            self.state = LinkState::Failed;
        } else {
            self.state = LinkState::ErrorRaised;
        }
        report
    }

    fn write_failure(&self, err: io::Error) -> ErrorReport {
        match self.process.check_alive() {
            Err(report) => report,
            Ok(()) => ErrorReport::fatal(format!("Failed to write to evaluator: {}", err)),
        }
    }

    /// Drop bytes already waiting on the socket, such as late replies to an
    /// abandoned operation.
    fn discard_stale_socket_bytes(&mut self) {
        let mut buf = [0u8; 1024];
        loop {
            match self.socket.try_read(&mut buf) {
                Ok(0) => break,
                Ok(n) => debug!(
                    target: "swankbridge::link",
                    "Ignore msg: {}",
                    String::from_utf8_lossy(&buf[..n])
                ),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(
                        target: "swankbridge::link",
                        "Failed to discard stale socket bytes: {}",
                        e
                    );
                    break;
                }
            }
        }
    }

    async fn send_socket_command(&mut self, command: &str) -> Result<(), ErrorReport> {
        let mut line = command.trim().as_bytes().to_vec();
        line.push(b'\n');
        let written = async {
            self.socket.write_all(&line).await?;
            self.socket.flush().await
        }
        .await;
        written.map_err(|e| ErrorReport::fatal(format!("Socket error: {}", e)))
    }

    async fn read_socket_frame(&mut self) -> Result<Vec<u8>, ErrorReport> {
        let payload = guard_liveness(
            &self.process,
            self.options.poll_interval,
            frame::read_frame(&mut self.socket),
        )
        .await??;
        Ok(payload)
    }

    async fn read_socket_reply(&mut self, recursive: bool) -> Result<SocketReply, ErrorReport> {
        let payload = self.read_socket_frame().await?;
        let tag = sexp::decode_bytes(&payload).ok();
        let tag_name = tag
            .as_ref()
            .and_then(|value| value.as_symbol().or_else(|| value.as_str()))
            .unwrap_or_default();

        if tag_name.eq_ignore_ascii_case("result") {
            let payload = self.read_socket_frame().await?;
            let (value, printed) = decode_result(&payload);
            Ok(SocketReply::Result { value, printed })
        } else if tag_name.eq_ignore_ascii_case("error") {
            if recursive {
                return Ok(SocketReply::Deferred);
            }
            let payload = self.read_socket_frame().await?;
            let message = match sexp::decode_bytes(&payload) {
                Ok(value) => value.display_text(),
                Err(_) => String::from_utf8_lossy(&payload).into_owned(),
            };
            Ok(SocketReply::Error(self.clean(message)))
        } else if tag_name.eq_ignore_ascii_case("abort") {
            Ok(SocketReply::Abort)
        } else {
            Err(ErrorReport::desync(format!(
                "Unhandled socket response type: {}",
                String::from_utf8_lossy(&payload)
            )))
        }
    }

    fn clean(&self, text: String) -> String {
        if self.options.color {
            text
        } else {
            strip_color(&text).into_owned()
        }
    }

    /// Next output chunk, failing within one poll interval of process death.
    async fn next_chunk(&mut self) -> Result<Vec<u8>, ErrorReport> {
        loop {
            match tokio::time::timeout(self.options.poll_interval, self.output.recv()).await {
                Ok(Some(chunk)) => return Ok(chunk),
                Ok(None) => {
                    self.process.check_alive()?;
                    return Err(ErrorReport::fatal("Evaluator output reader stopped"));
                }
                Err(_elapsed) => self.process.check_alive()?,
            }
        }
    }
}

/// Decode a result payload, keeping the printed text for display.
///
/// Payloads that are not readable S-expressions (`#<object ...>`) decode to an
/// atom holding the text.
fn decode_result(payload: &[u8]) -> (Value, String) {
    let printed = strip_color(&String::from_utf8_lossy(payload)).into_owned();
    let value = sexp::decode(&printed).unwrap_or_else(|_| Value::Symbol(printed.clone()));
    (value, printed)
}

/// Await `future`, checking process liveness every `interval`.
async fn guard_liveness<F>(
    process: &ProcessHandle,
    interval: std::time::Duration,
    future: F,
) -> Result<F::Output, ErrorReport>
where
    F: Future,
{
    tokio::pin!(future);
    loop {
        tokio::select! {
            output = &mut future => return Ok(output),
            _ = tokio::time::sleep(interval) => process.check_alive()?,
        }
    }
}

/// Lazily drained output of one operation.
///
/// Holds the link's mutable borrow; dropping it abandons the operation, and
/// the next operation discards whatever it left behind.
pub struct OutputStream<'a> {
    link: &'a mut EvaluatorLink,
    recursive: bool,
    complete_marker: bool,
    splitter: TokenSplitter,
    queued: VecDeque<EvalItem>,
    finished: bool,
}

impl<'a> OutputStream<'a> {
    fn new(link: &'a mut EvaluatorLink, recursive: bool, complete_marker: bool) -> Self {
        let splitter = TokenSplitter::new(&link.token);
        Self {
            link,
            recursive,
            complete_marker,
            splitter,
            queued: VecDeque::new(),
            finished: false,
        }
    }

    /// Next item, or `None` once the operation has ended.
    pub async fn next(&mut self) -> Option<Result<EvalItem, ErrorReport>> {
        loop {
            if let Some(item) = self.queued.pop_front() {
                return Some(Ok(item));
            }
            if self.finished {
                return None;
            }
            if let Err(report) = self.advance().await {
                self.finished = true;
                self.queued.clear();
                return Some(Err(self.link.record_failure(report)));
            }
        }
    }

    /// Collect every remaining item.
    pub async fn collect(mut self) -> Result<Vec<EvalItem>, ErrorReport> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    async fn advance(&mut self) -> Result<(), ErrorReport> {
        let chunk = self.link.next_chunk().await?;
        let split = self.splitter.push(&chunk);
        let text = self.link.clean(split.text);
        if !text.is_empty() {
            self.queued.push_back(EvalItem::Text(text));
        }
        if !split.found_token {
            return Ok(());
        }

        self.finished = true;
        match self.link.read_socket_reply(self.recursive).await? {
            SocketReply::Result { value, printed } => {
                self.queued.push_back(EvalItem::Result { value, printed })
            }
            SocketReply::Abort | SocketReply::Deferred => {}
            SocketReply::Error(message) => {
                let depth = self.link.options.call_stack_depth;
                let frames = self.link.fetch_call_stack(depth).await?;
                return Err(ErrorReport::evaluator(message, frames));
            }
        }
        if self.complete_marker {
            self.queued.push_back(EvalItem::Complete);
        }
        self.link.state = LinkState::Idle;
        Ok(())
    }
}
