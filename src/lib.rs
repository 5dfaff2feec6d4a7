//! Bridge between a SLIME editor speaking SWANK and a Lisp evaluator run as a
//! subprocess.

pub mod config;
pub mod error;
pub mod evaluator;
pub mod frame;
pub mod sexp;
pub mod swank;

pub use config::{BridgeConfig, BridgeSettings};
pub use error::{BridgeError, BridgeResult, ErrorReport};
pub use evaluator::{EvalItem, EvaluatorLink};
pub use swank::{CommandBridge, Session};
