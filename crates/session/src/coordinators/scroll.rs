use crate::state::RunState;

/// Distance from the bottom under which the view keeps following new output.
pub const STICKY_SCROLL_THRESHOLD: f32 = 120.0;

/// Geometry of the scrollable transcript view, in host rendering units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollMetrics {
    pub scroll_height: f32,
    pub scroll_top: f32,
    pub client_height: f32,
}

impl ScrollMetrics {
    pub fn distance_from_bottom(&self) -> f32 {
        (self.scroll_height - self.scroll_top - self.client_height).max(0.0)
    }

    /// Scroll offset that shows the tail of the content.
    pub fn bottom_offset(&self) -> f32 {
        (self.scroll_height - self.client_height).max(0.0)
    }
}

/// Sticky scroll-to-bottom while a generation streams in.
///
/// Follow mode pauses once the user scrolls further than the threshold from the
/// tail and resumes as soon as they come back within it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StickyScroll {
    threshold: f32,
    following: bool,
}

impl StickyScroll {
    pub fn new() -> Self {
        Self::with_threshold(STICKY_SCROLL_THRESHOLD)
    }

    pub fn with_threshold(threshold: f32) -> Self {
        Self {
            threshold,
            following: true,
        }
    }

    pub fn is_following(&self) -> bool {
        self.following
    }

    /// Called on every transcript or run-state change.
    ///
    /// Returns the offset to scroll to, or `None` when the view should stay put.
    pub fn on_change(&mut self, metrics: ScrollMetrics, run_state: RunState) -> Option<f32> {
        if !run_state.is_running() {
            return None;
        }

        self.following = metrics.distance_from_bottom() < self.threshold;
        self.following.then(|| metrics.bottom_offset())
    }
}

impl Default for StickyScroll {
    fn default() -> Self {
        Self::new()
    }
}
