//! SWANK message shapes exchanged with the editor.

use crate::error::{BridgeError, BridgeResult};
use crate::evaluator::{DebuggerSession, RecoveryAction, StackFrame};
use crate::sexp::Value;

/// Thread designator sent in debugger messages; the bridge is single-threaded
/// from the editor's point of view.
pub const DEBUG_THREAD: i64 = 0;

/// `(:emacs-rex form package thread id)`
#[derive(Debug, Clone, PartialEq)]
pub struct SwankRequest {
    /// Operator symbol, e.g. `swank:connection-info`
    pub operation: String,
    pub args: Vec<Value>,
    pub package: Option<String>,
    pub thread: Value,
    pub call_id: i64,
}

/// A decoded editor message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Rex(SwankRequest),
    /// Anything other than `:emacs-rex`; logged and ignored
    Other(Value),
}

impl Inbound {
    pub fn parse(value: Value) -> BridgeResult<Self> {
        let is_rex = value
            .as_list()
            .and_then(|items| items.first())
            .and_then(Value::as_symbol)
            .is_some_and(|head| head.eq_ignore_ascii_case(":emacs-rex"));
        if is_rex {
            SwankRequest::from_value(value).map(Inbound::Rex)
        } else {
            Ok(Inbound::Other(value))
        }
    }
}

impl SwankRequest {
    pub fn from_value(value: Value) -> BridgeResult<Self> {
        let Value::List(items) = value else {
            return Err(BridgeError::malformed(format!("expected a list, got {}", value)));
        };
        let [_, form, package, thread, id] = <[Value; 5]>::try_from(items).map_err(|items| {
            BridgeError::malformed(format!(
                "expected (:emacs-rex form package thread id), got {} elements",
                items.len()
            ))
        })?;

        let call_id = id
            .as_integer()
            .ok_or_else(|| BridgeError::malformed(format!("request id {} is not an integer", id)))?;

        let (operation, args) = match form {
            Value::List(mut parts) if !parts.is_empty() => {
                let head = parts.remove(0);
                match head {
                    Value::Symbol(name) => (name, parts),
                    other => {
                        return Err(BridgeError::malformed(format!(
                            "operator {} is not a symbol",
                            other
                        )));
                    }
                }
            }
            other => {
                return Err(BridgeError::malformed(format!("form {} is not a call", other)));
            }
        };

        let package = match package {
            Value::String(name) => Some(name),
            Value::Symbol(name) => Some(name),
            _ => None,
        };

        Ok(Self {
            operation,
            args,
            package,
            thread,
            call_id,
        })
    }
}

/// Final reply to one request.
#[derive(Debug, Clone, PartialEq)]
pub enum SwankResponse {
    Ok(Value),
    Abort(String),
}

impl SwankResponse {
    pub fn ok(value: impl Into<Value>) -> Self {
        SwankResponse::Ok(value.into())
    }

    pub fn abort(message: impl Into<String>) -> Self {
        SwankResponse::Abort(message.into())
    }

    /// `(:return (:ok value) id)` or `(:return (:abort "message") id)`
    pub fn into_message(self, call_id: i64) -> Value {
        let outcome = match self {
            SwankResponse::Ok(value) => Value::list([Value::keyword("ok"), value]),
            SwankResponse::Abort(message) => {
                Value::list([Value::keyword("abort"), Value::string(message)])
            }
        };
        Value::list([Value::keyword("return"), outcome, Value::Integer(call_id)])
    }
}

/// `(:write-string "text")`
pub fn write_string(text: impl Into<String>) -> Value {
    Value::list([Value::keyword("write-string"), Value::string(text)])
}

/// `(:write-string "text" :repl-result)`
pub fn repl_result(text: impl Into<String>) -> Value {
    Value::list([
        Value::keyword("write-string"),
        Value::string(text),
        Value::keyword("repl-result"),
    ])
}

/// `(:debug thread level (message "" nil) restarts frames (call-id))`
pub fn debug(session: &DebuggerSession) -> Value {
    Value::list([
        Value::keyword("debug"),
        Value::Integer(DEBUG_THREAD),
        Value::Integer(session.level as i64),
        Value::list([
            Value::string(session.message.clone()),
            Value::string(""),
            Value::Nil,
        ]),
        RecoveryAction::restarts_value(),
        frames_value(&session.frames),
        Value::list([Value::Integer(session.call_id)]),
    ])
}

/// `(:debug-activate thread level nil)`
pub fn debug_activate(level: usize) -> Value {
    Value::list([
        Value::keyword("debug-activate"),
        Value::Integer(DEBUG_THREAD),
        Value::Integer(level as i64),
        Value::Nil,
    ])
}

/// `(:debug-return thread level nil)`
pub fn debug_return(level: usize) -> Value {
    Value::list([
        Value::keyword("debug-return"),
        Value::Integer(DEBUG_THREAD),
        Value::Integer(level as i64),
        Value::Nil,
    ])
}

pub fn frames_value(frames: &[StackFrame]) -> Value {
    Value::list(frames.iter().map(StackFrame::to_value))
}
