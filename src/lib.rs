//! Signal detection and event classification for proctored test sessions.
//!
//! The host forwards page events to the monitors owned by a
//! [`ProctorController`] and implements the capability traits (event sink,
//! window geometry, display capture, cross-tab bus, face detector). Every
//! classified observation leaves the engine through one [`EventSink`].

pub mod clock;
pub mod config;
pub mod emitter;
pub mod models;
pub mod monitors;
pub mod proctor;
pub mod sensing;
pub mod utils;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigStore, ProctorConfig};
pub use emitter::{EventEmitter, EventSink, RateLimiter, SeenSet, SinkResponse};
pub use models::{
    ProctorEvent, ProctorEventType, SessionContext, SessionStatus, Severity, Terminator,
};
pub use proctor::{FaceCapabilities, ProctorCapabilities, ProctorController, ProctorState};
pub use utils::init_logging;
