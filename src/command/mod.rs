//! Command capture after a wake event or during a follow-up window.

pub mod policy;
pub mod session;

pub use policy::CompletionPolicy;
pub use session::{CommandOutcome, CommandRequest, CommandSession, SessionConfig, run_session};
