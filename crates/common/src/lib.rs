// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod codec;
pub mod config;
pub mod protocol;

pub use codec::{encode, FrameError, LineDecoder};
pub use config::{RelayConfig, DEFAULT_SOCK};
pub use protocol::{ActionKinds, Message, ProtocolError, Severity, TaskOutcome};
