//! Per-tick work budget
//!
//! Caps how many chunks the scheduler may dispatch in one tick. In adaptive
//! mode the cap follows the frame rate: an exponential moving average of the
//! frame time is compared with the target every `adjust_interval` seconds and
//! the cap moves by one step within `min..=max`.

use crate::config::BudgetSettings;

/// Frame-time driven chunks-per-tick budget
#[derive(Clone, Debug)]
pub struct AdaptiveBudget {
    settings: BudgetSettings,
    current: u32,
    /// Smoothed frame time in seconds, `None` until the first frame
    smoothed: Option<f32>,
    since_adjust: f32,
}

impl AdaptiveBudget {
    pub fn new(settings: BudgetSettings) -> Self {
        let current = if settings.adaptive {
            settings
                .chunks_per_tick
                .clamp(settings.min_chunks_per_tick, settings.max_chunks_per_tick.max(settings.min_chunks_per_tick))
        } else {
            settings.chunks_per_tick
        };
        Self {
            settings,
            current,
            smoothed: None,
            since_adjust: 0.0,
        }
    }

    /// Feed one frame time
    ///
    /// # Arguments
    /// * `dt` - Duration of the last frame in seconds
    ///
    /// # Returns
    /// True if the budget changed
    pub fn record_frame(&mut self, dt: f32) -> bool {
        if !self.settings.adaptive || !dt.is_finite() || dt <= 0.0 {
            return false;
        }

        let alpha = self.settings.smoothing;
        let smoothed = match self.smoothed {
            Some(previous) => previous + (dt - previous) * alpha,
            None => dt,
        };
        self.smoothed = Some(smoothed);

        self.since_adjust += dt;
        if self.since_adjust < self.settings.adjust_interval {
            return false;
        }
        self.since_adjust = 0.0;

        let fps = 1.0 / smoothed;
        let before = self.current;
        if fps < self.settings.target_fps - self.settings.fps_buffer {
            self.current = self.current.saturating_sub(1).max(self.settings.min_chunks_per_tick);
        } else if fps > self.settings.target_fps + self.settings.fps_buffer {
            self.current = (self.current + 1).min(self.settings.max_chunks_per_tick);
        }

        if self.current != before {
            log::debug!("Chunk budget {} -> {} at {:.1} fps", before, self.current, fps);
        }
        self.current != before
    }

    /// Chunks that may be dispatched this tick
    pub fn chunks_this_tick(&self) -> usize {
        self.current as usize
    }

    /// Smoothed frames per second, if any frame was recorded
    pub fn smoothed_fps(&self) -> Option<f32> {
        self.smoothed.map(|dt| 1.0 / dt)
    }

    pub fn settings(&self) -> &BudgetSettings {
        &self.settings
    }
}
