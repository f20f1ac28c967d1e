pub mod controller;
pub mod state;

pub use controller::{FaceCapabilities, ProctorCapabilities, ProctorController};
pub use state::ProctorState;
