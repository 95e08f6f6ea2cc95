use std::time::Duration;

/// Contains configuration options for the renderer like vsync, frame pacing, and the clear color
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub vsync: bool,
    /// Upper bound on the per-frame fence wait and image acquisition
    pub fence_timeout: Duration,
    pub clear_color: [f32; 4],
    /// Number of frames per pulse of the clear color's blue channel. Zero disables the pulse.
    pub flash_period: f32,
}

impl RenderConfig {
    pub fn fence_timeout_ns(&self) -> u64 {
        u64::try_from(self.fence_timeout.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Clear color of a given frame
    pub fn clear_color_at(&self, frame_number: u64) -> [f32; 4] {
        let [r, g, b, a] = self.clear_color;
        if self.flash_period <= 0.0 {
            return self.clear_color;
        }
        let flash = (frame_number as f32 / self.flash_period).sin().abs();
        [r, g, (b + flash).min(1.0), a]
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            fence_timeout: Duration::from_secs(1),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            flash_period: 120.0,
        }
    }
}
