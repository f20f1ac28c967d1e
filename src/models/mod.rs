pub mod event;
pub mod session;

pub use event::{ProctorEvent, ProctorEventType, Severity};
pub use session::{SessionContext, SessionStatus, Terminator};
