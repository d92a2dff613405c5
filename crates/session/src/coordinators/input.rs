/// Smallest input height, in host rendering units.
pub const MIN_INPUT_HEIGHT: f32 = 24.0;
/// Largest input height before the input scrolls internally.
pub const MAX_INPUT_HEIGHT: f32 = 200.0;

/// Keeps the input control sized to its content.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputAutoResize {
    height: f32,
}

impl InputAutoResize {
    pub fn new() -> Self {
        Self {
            height: MIN_INPUT_HEIGHT,
        }
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    /// Recomputes the height from content measured against a zero baseline.
    ///
    /// The previous height is never consulted, so deleting text shrinks the input.
    pub fn resize(&mut self, content_height: f32) -> f32 {
        self.height = if content_height.is_finite() {
            content_height.clamp(MIN_INPUT_HEIGHT, MAX_INPUT_HEIGHT)
        } else {
            MIN_INPUT_HEIGHT
        };
        self.height
    }

    /// Content height for hosts that measure by line count.
    pub fn measure_lines(text: &str, line_height: f32) -> f32 {
        let lines = text.split('\n').count().max(1);
        lines as f32 * line_height
    }
}

impl Default for InputAutoResize {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_is_clamped_between_bounds() {
        let mut input = InputAutoResize::new();
        assert_eq!(input.resize(0.0), MIN_INPUT_HEIGHT);
        assert_eq!(input.resize(96.0), 96.0);
        assert_eq!(input.resize(4_000.0), MAX_INPUT_HEIGHT);
        assert_eq!(input.resize(f32::NAN), MIN_INPUT_HEIGHT);
    }

    #[test]
    fn deleting_text_shrinks_the_input() {
        let mut input = InputAutoResize::new();
        let tall = InputAutoResize::measure_lines("a\nb\nc\nd\ne", 20.0);
        assert_eq!(input.resize(tall), 100.0);

        let short = InputAutoResize::measure_lines("a", 20.0);
        assert_eq!(input.resize(short), MIN_INPUT_HEIGHT);
        assert_eq!(input.height(), MIN_INPUT_HEIGHT);
    }
}
