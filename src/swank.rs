//! Editor side of the bridge: SWANK requests in, replies and notifications out.

pub mod dispatch;
pub mod handlers;
pub mod protocol;
pub mod server;
pub mod session;

pub use dispatch::{BoxFuture, HandlerFn, HandlerResult, HandlerTable, Outbox, handler_key};
pub use handlers::default_handlers;
pub use protocol::{Inbound, SwankRequest, SwankResponse};
pub use server::CommandBridge;
pub use session::Session;
