use serde::{Deserialize, Serialize};

/// Geometry of the browser window as the page sees it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WindowMetrics {
    pub outer_width: u32,
    pub outer_height: u32,
    pub inner_width: u32,
    pub inner_height: u32,
    /// `screen.availWidth`
    pub avail_width: u32,
    pub device_pixel_ratio: f64,
}

impl WindowMetrics {
    pub fn width_chrome(&self) -> u32 {
        self.outer_width.abs_diff(self.inner_width)
    }

    pub fn height_chrome(&self) -> u32 {
        self.outer_height.abs_diff(self.inner_height)
    }
}

impl Default for WindowMetrics {
    fn default() -> Self {
        Self {
            outer_width: 1920,
            outer_height: 1080,
            inner_width: 1920,
            inner_height: 1080,
            avail_width: 1920,
            device_pixel_ratio: 1.0,
        }
    }
}

pub trait WindowProbe: Send + Sync {
    fn metrics(&self) -> WindowMetrics;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Window whose geometry tests can resize between polls.
    #[derive(Default)]
    pub struct FakeWindow {
        metrics: Mutex<WindowMetrics>,
    }

    impl FakeWindow {
        pub fn set(&self, metrics: WindowMetrics) {
            *self.metrics.lock().unwrap() = metrics;
        }
    }

    impl WindowProbe for FakeWindow {
        fn metrics(&self) -> WindowMetrics {
            *self.metrics.lock().unwrap()
        }
    }
}
