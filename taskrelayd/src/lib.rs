//! taskrelay daemon
//!
//! Serializes a slow external action behind a Unix domain socket. Clients send newline-delimited
//! JSON requests; each is queued, executed one at a time, and answered with stage notices and a
//! single terminal message on the same connection.

pub mod acceptor;
pub mod executor;
pub mod queue;

pub use acceptor::{Acceptor, ShutdownHandle};
pub use executor::{CommandExecutor, TaskExecutor, TaskRequest};
pub use queue::{QueueItem, QueueSettings, ReplyHandle, WorkQueue};

pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");
