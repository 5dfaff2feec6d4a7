//! Evaluator side of the bridge: the subprocess, its output, and the
//! loopback socket it reports outcomes on.

mod debugger;
mod demux;
mod link;
mod output_reader;
mod supervisor;

pub use debugger::{
    CALL_STACK_PADDING, DebuggerSession, DebuggerStack, RecoveryAction, StackFrame,
    parse_call_stack,
};
pub use demux::{Split, TokenSplitter, strip_color};
pub use link::{EvalItem, EvaluatorLink, LinkState, OutputStream, session_token};
pub use output_reader::{OutputReaderHandle, spawn_output_reader};
pub use supervisor::{ProcessHandle, ProcessState, signal_name};
