//! Meridian IPC
//!
//! Advisory cross-process signaling for processes sharing one database
//! file (main app and the notification-service extension). A write signal
//! carries no payload: receivers only learn that at least one external
//! write happened since they last checked, and must re-derive state.

mod activation;
mod error;
mod signal;

pub use activation::ProcessActivation;
pub use error::IpcError;
pub use signal::CrossProcessNotifier;

pub type Result<T> = std::result::Result<T, IpcError>;
