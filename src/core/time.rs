//! Frame timing utilities

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// FPS statistics for a time window
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct FpsWindow {
    pub avg: f32,
    pub min: f32,
    pub max: f32,
}

/// Tracks frame timing for the application loop driving `TerrainSystem::tick`
pub struct FrameTimer {
    last_frame: Instant,
    delta: Duration,
    frame_count: u64,
    /// Ring buffer of (timestamp, frame_time_secs) for rolling stats
    frame_history: VecDeque<(Instant, f32)>,
    history_window: Duration,
}

impl FrameTimer {
    /// Create a new frame timer keeping 15 seconds of history
    pub fn new() -> Self {
        Self::with_history(Duration::from_secs(15))
    }

    pub fn with_history(history_window: Duration) -> Self {
        Self {
            last_frame: Instant::now(),
            delta: Duration::ZERO,
            frame_count: 0,
            frame_history: VecDeque::new(),
            history_window,
        }
    }

    /// Call once per frame to update timing
    pub fn tick(&mut self) {
        let now = Instant::now();
        self.record(now, now - self.last_frame);
        self.last_frame = now;
    }

    /// Record a frame of known duration (headless loops, tests)
    pub fn record(&mut self, now: Instant, delta: Duration) {
        self.delta = delta;
        self.frame_count += 1;
        self.frame_history.push_back((now, delta.as_secs_f32()));

        // Prune frames older than the history window
        while let Some(&(timestamp, _)) = self.frame_history.front() {
            if now.duration_since(timestamp) > self.history_window {
                self.frame_history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Get delta time in seconds
    pub fn delta_secs(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    /// Get total frame count
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// FPS statistics over everything in the history window
    pub fn fps_window(&self) -> FpsWindow {
        let mut frame_count = 0;
        let mut total_time = 0.0f32;
        let mut min_fps = f32::INFINITY;
        let mut max_fps = 0.0f32;

        for &(_, frame_time) in self.frame_history.iter() {
            frame_count += 1;
            total_time += frame_time;

            let fps = if frame_time > 0.0 { 1.0 / frame_time } else { 0.0 };
            min_fps = min_fps.min(fps);
            max_fps = max_fps.max(fps);
        }

        if frame_count == 0 {
            return FpsWindow::default();
        }

        FpsWindow {
            avg: if total_time > 0.0 { frame_count as f32 / total_time } else { 0.0 },
            min: min_fps,
            max: max_fps,
        }
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_frames() {
        let mut timer = FrameTimer::new();
        let start = Instant::now();
        timer.record(start, Duration::from_millis(20));
        timer.record(start + Duration::from_millis(10), Duration::from_millis(10));

        assert_eq!(timer.frame_count(), 2);
        assert!((timer.delta_secs() - 0.01).abs() < 1e-6);

        let window = timer.fps_window();
        assert!((window.min - 50.0).abs() < 0.01);
        assert!((window.max - 100.0).abs() < 0.01);
        assert!((window.avg - 2.0 / 0.03).abs() < 0.01);
    }

    #[test]
    fn test_history_pruned() {
        let mut timer = FrameTimer::with_history(Duration::from_secs(1));
        let start = Instant::now();
        timer.record(start, Duration::from_millis(500));
        timer.record(start + Duration::from_secs(3), Duration::from_millis(100));

        let window = timer.fps_window();
        assert!((window.avg - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_empty_window() {
        let timer = FrameTimer::new();
        let window = timer.fps_window();
        assert_eq!(window.avg, 0.0);
        assert_eq!(window.min, 0.0);
    }
}
