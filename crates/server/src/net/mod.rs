//! Networking: the TCP listener and the per-connection session engine

pub mod listener;
pub mod session;

mod submit;
mod unlink;

pub use listener::Listener;
pub use session::{CloseReason, run_session};

/// Result of handing a response to the session writer
///
/// An error means the writer is gone and the session cannot deliver
/// anything further.
pub(crate) type DispatchResult = Result<(), tokio::sync::mpsc::error::SendError<Vec<u8>>>;
