pub mod logging;

pub use logging::{init_logging, DEBUG_ENV_VAR};
