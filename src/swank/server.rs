//! Editor-facing SWANK server.
//!
//! One editor connection is served at a time. Inbound frames are handled in
//! order; everything bound for the editor goes through a writer task fed by
//! the connection's [`Outbox`], so streamed output, debugger notices and
//! replies keep the order they were produced in.

use log::{debug, error, info, warn};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::dispatch::{HandlerTable, Outbox};
use super::protocol::{self, Inbound, SwankRequest, SwankResponse};
use super::session::Session;
use crate::error::{BridgeError, BridgeResult, ErrorReport};
use crate::frame::{self, FrameError};
use crate::sexp;

pub struct CommandBridge {
    session: Session,
    handlers: HandlerTable,
}

impl CommandBridge {
    pub fn new(session: Session, handlers: HandlerTable) -> Self {
        Self { session, handlers }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Dispatch one request and emit its reply or a debugger session.
    pub async fn handle_request(&mut self, request: SwankRequest, outbox: &Outbox) {
        let SwankRequest {
            operation,
            args,
            call_id,
            ..
        } = request;
        debug!(
            target: "swankbridge::swank",
            "Request {}: {}",
            call_id,
            operation
        );

        let result = match self.handlers.lookup(&operation) {
            Some(handler) => handler(&mut self.session, args, outbox).await,
            None => Err(BridgeError::UnknownOperation(operation.clone())),
        };

        match result {
            Ok(response) => outbox.send(response.into_message(call_id)),
            Err(BridgeError::Report(report)) => self.enter_debugger(call_id, report, outbox),
            Err(err) => {
                warn!(
                    target: "swankbridge::swank",
                    "Request {} ({}) failed: {}",
                    call_id,
                    operation,
                    err
                );
                outbox.send(SwankResponse::abort(err.to_string()).into_message(call_id));
            }
        }
    }

    /// Decode one inbound frame and handle it.
    pub async fn handle_payload(&mut self, payload: &[u8], outbox: &Outbox) {
        let message = match sexp::decode_bytes(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    target: "swankbridge::swank",
                    "Ignoring undecodable message {:?}: {}",
                    String::from_utf8_lossy(payload),
                    e
                );
                return;
            }
        };
        debug!(target: "swankbridge::swank", "<-- {}", message);

        match Inbound::parse(message) {
            Ok(Inbound::Rex(request)) => self.handle_request(request, outbox).await,
            Ok(Inbound::Other(value)) => {
                info!(
                    target: "swankbridge::swank",
                    "Ignoring unsupported message: {}",
                    value
                );
            }
            Err(e) => {
                warn!(target: "swankbridge::swank", "{}", e);
            }
        }
    }

    fn enter_debugger(&mut self, call_id: i64, report: ErrorReport, outbox: &Outbox) {
        if report.fatal {
            error!(
                target: "swankbridge::swank",
                "Evaluator failure during request {}: {}",
                call_id,
                report.message
            );
        }
        let session = self.session.debugger_mut().open(call_id, report);
        outbox.send(protocol::debug(session));
        outbox.send(protocol::debug_activate(session.level));
    }

    /// Serve one editor connection until it closes or shutdown is requested.
    pub async fn serve_connection(&mut self, stream: TcpStream) {
        let shutdown = self.session.shutdown_token();
        let (mut reader, writer) = stream.into_split();
        let (outbox, writer_task) = spawn_writer(writer);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                frame = frame::read_frame(&mut reader) => match frame {
                    Ok(payload) => self.handle_payload(&payload, &outbox).await,
                    Err(FrameError::ConnectionClosed) => {
                        info!(target: "swankbridge::swank", "Editor disconnected");
                        break;
                    }
                    Err(e) => {
                        warn!(target: "swankbridge::swank", "Dropping editor connection: {}", e);
                        break;
                    }
                },
            }
        }

        // Let queued replies reach the editor before the socket closes
        drop(outbox);
        if let Err(e) = writer_task.await {
            warn!(target: "swankbridge::swank", "Writer task failed: {}", e);
        }
    }

    /// Accept editor connections one at a time until shutdown, then stop the
    /// evaluator.
    pub async fn serve(&mut self, listener: TcpListener) -> BridgeResult<()> {
        let shutdown = self.session.shutdown_token();
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    info!(target: "swankbridge::swank", "Editor connected from {}", peer);
                    self.serve_connection(stream).await;
                }
                Err(e) => {
                    self.session.shutdown().await;
                    return Err(e.into());
                }
            }
        }
        info!(target: "swankbridge::swank", "Shutting down");
        self.session.shutdown().await;
        Ok(())
    }
}

/// Spawn the task that frames and writes outgoing messages in order.
fn spawn_writer(mut writer: OwnedWriteHalf) -> (Outbox, JoinHandle<()>) {
    let (outbox, mut receiver) = Outbox::channel();
    let handle = tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            let text = sexp::encode(&message);
            debug!(target: "swankbridge::swank", "--> {}", text);
            if let Err(e) = frame::write_frame(&mut writer, text.as_bytes()).await {
                warn!(
                    target: "swankbridge::swank",
                    "Failed to write to editor: {}",
                    e
                );
                break;
            }
        }
    });
    (outbox, handle)
}
