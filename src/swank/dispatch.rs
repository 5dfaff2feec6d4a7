//! Operation name to handler lookup, and the outgoing message queue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use log::debug;
use tokio::sync::mpsc;

use super::protocol::SwankResponse;
use super::session::Session;
use crate::error::BridgeResult;
use crate::sexp::Value;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type HandlerResult = BridgeResult<SwankResponse>;

/// A registered operation.
///
/// Handlers emit intermediate messages (output, debugger notices) through the
/// [`Outbox`] and return the final reply; the bridge attaches the request id.
pub type HandlerFn =
    for<'a> fn(&'a mut Session, Vec<Value>, &'a Outbox) -> BoxFuture<'a, HandlerResult>;

/// Normalize an operation name to its table key.
///
/// `swank:connection-info` and `swank-repl:listener-eval` become
/// `swank_connection_info` and `swank_repl_listener_eval`.
pub fn handler_key(operation: &str) -> String {
    operation.to_ascii_lowercase().replace([':', '-'], "_")
}

#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, operation: &str, handler: HandlerFn) {
        self.handlers.insert(handler_key(operation), handler);
    }

    pub fn lookup(&self, operation: &str) -> Option<HandlerFn> {
        self.handlers.get(&handler_key(operation)).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Ordered queue of messages bound for the editor.
#[derive(Debug, Clone)]
pub struct Outbox {
    sender: mpsc::UnboundedSender<Value>,
}

impl Outbox {
    pub fn new(sender: mpsc::UnboundedSender<Value>) -> Self {
        Self { sender }
    }

    /// Outbox paired with the receiver its messages arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }

    pub fn send(&self, message: Value) {
        if self.sender.send(message).is_err() {
            debug!(
                target: "swankbridge::swank",
                "Editor connection closed; dropping outgoing message"
            );
        }
    }
}
