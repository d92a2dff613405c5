//! Reactive helpers for hosts that render the transcript and input box.
pub mod input;
pub mod scroll;

pub use input::{InputAutoResize, MAX_INPUT_HEIGHT, MIN_INPUT_HEIGHT};
pub use scroll::{STICKY_SCROLL_THRESHOLD, ScrollMetrics, StickyScroll};
