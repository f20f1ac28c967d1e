pub mod capture;
pub mod periodic;
pub mod window;

pub use capture::{CaptureError, CaptureRequest, CaptureTrack, DisplayCapture, ReadyState, TrackSettings};
pub use periodic::PeriodicTask;
pub use window::{WindowMetrics, WindowProbe};
