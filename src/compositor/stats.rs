// Frame statistics for the compositing pass
use std::time::{Duration, Instant};

/// One reporting window's worth of measurements
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub fps: f64,
    /// Slowest compositing pass in the window
    pub slowest: Duration,
}

/// Rolling FPS counter that also tracks the slowest compositing pass
pub struct FrameStats {
    /// When the current window started
    last_report: Instant,
    /// Frames since last report
    frame_count: u32,
    /// Slowest pass since last report
    slowest: Duration,
    /// Last completed report
    current: Option<FrameReport>,
    /// Report interval
    report_interval: Duration,
}

impl FrameStats {
    pub fn new(report_interval: Duration) -> Self {
        Self::starting_at(Instant::now(), report_interval)
    }

    fn starting_at(now: Instant, report_interval: Duration) -> Self {
        Self {
            last_report: now,
            frame_count: 0,
            slowest: Duration::ZERO,
            current: None,
            report_interval,
        }
    }

    /// Call this after each compositing pass with the time it took
    /// Returns a report when the interval has elapsed
    pub fn tick(&mut self, cost: Duration) -> Option<FrameReport> {
        self.tick_at(Instant::now(), cost)
    }

    fn tick_at(&mut self, now: Instant, cost: Duration) -> Option<FrameReport> {
        self.frame_count += 1;
        self.slowest = self.slowest.max(cost);

        let elapsed = now.saturating_duration_since(self.last_report);
        if elapsed >= self.report_interval && !elapsed.is_zero() {
            let report = FrameReport {
                fps: self.frame_count as f64 / elapsed.as_secs_f64(),
                slowest: self.slowest,
            };
            self.current = Some(report);
            self.frame_count = 0;
            self.slowest = Duration::ZERO;
            self.last_report = now;
            Some(report)
        } else {
            None
        }
    }

    /// Get the last calculated FPS
    pub fn fps(&self) -> f64 {
        self.current.map_or(0.0, |r| r.fps)
    }

    pub fn last_report(&self) -> Option<FrameReport> {
        self.current
    }
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}
