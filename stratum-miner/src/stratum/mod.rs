//! Stratum protocol.
//!
//! The protocol layer is pure state: [`session::ProtocolSession`] consumes
//! received lines and produces lines to send, leaving all socket handling to
//! the pool connection that owns it.

pub mod error;
pub mod messages;
pub mod session;

pub use error::{StratumError, StratumResult};
pub use session::{
    AuthFailurePolicy, AuthStatus, ProtocolSession, SessionEvent, SessionSettings, SessionState,
};
