use std::time::{Duration, Instant};

/// Weight of the newest sample in the smoothed speed.
pub const SPEED_ALPHA: f64 = 0.3;

/// Minimum interval a speed sample is measured over.
pub const SPEED_MIN_WINDOW: Duration = Duration::from_secs(1);

/// Displayed speed never drops below this once bytes have moved (0.1 KB/s).
pub const SPEED_FLOOR_BPS: f64 = 102.4;

/// Emit progress after this many bytes since the last report (1 MiB).
pub const PROGRESS_BYTE_STEP: u64 = 1024 * 1024;

/// Emit progress after this many percentage points since the last report.
pub const PROGRESS_PERCENT_STEP: f64 = 2.0;

/// Emit progress at least this often while bytes keep moving.
pub const PROGRESS_TIME_STEP: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// SpeedEstimator
// ---------------------------------------------------------------------------

/// Exponentially smoothed transfer speed.
///
/// Bytes accumulate in a window; once the window spans at least
/// `min_window`, its rate becomes a sample folded into the average with
/// weight `alpha`. The first sample seeds the average directly.
#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    alpha: f64,
    min_window: Duration,
    window_start: Instant,
    window_bytes: u64,
    smoothed: f64,
    moved: bool,
}

impl SpeedEstimator {
    /// Creates an estimator whose first window opens at `start`.
    pub fn new(alpha: f64, min_window: Duration, start: Instant) -> Self {
        Self {
            alpha,
            min_window,
            window_start: start,
            window_bytes: 0,
            smoothed: 0.0,
            moved: false,
        }
    }

    /// Records `bytes` moved at `now`.
    pub fn record(&mut self, bytes: u64, now: Instant) {
        if bytes > 0 {
            self.moved = true;
        }
        self.window_bytes += bytes;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.min_window {
            return;
        }

        let sample = self.window_bytes as f64 / elapsed.as_secs_f64();
        self.smoothed = if self.smoothed == 0.0 {
            sample
        } else {
            self.alpha * sample + (1.0 - self.alpha) * self.smoothed
        };
        self.window_start = now;
        self.window_bytes = 0;
    }

    /// Starts a fresh window, discarding bytes not yet sampled.
    ///
    /// Used after a pause so idle time is not counted as slowness.
    pub fn restart_window(&mut self, now: Instant) {
        self.window_start = now;
        self.window_bytes = 0;
    }

    /// Smoothed speed in bytes per second.
    pub fn bytes_per_second(&self) -> f64 {
        if self.moved {
            self.smoothed.max(SPEED_FLOOR_BPS)
        } else {
            0.0
        }
    }

    /// Estimated time to move `remaining` bytes, `None` before any bytes moved.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }
}

// ---------------------------------------------------------------------------
// ProgressThrottle
// ---------------------------------------------------------------------------

/// Decides when a progress report is due.
///
/// A report fires when the byte step, the percentage step, or the time step
/// is crossed since the last report, whichever comes first, and always on
/// the final byte.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    byte_step: u64,
    percent_step: f64,
    time_step: Duration,
    last_bytes: u64,
    last_at: Instant,
}

impl ProgressThrottle {
    /// Creates a throttle with the default steps, measuring time from `start`.
    pub fn new(start: Instant) -> Self {
        Self::with_steps(
            PROGRESS_BYTE_STEP,
            PROGRESS_PERCENT_STEP,
            PROGRESS_TIME_STEP,
            start,
        )
    }

    /// Creates a throttle with explicit steps.
    pub fn with_steps(byte_step: u64, percent_step: f64, time_step: Duration, start: Instant) -> Self {
        Self {
            byte_step,
            percent_step,
            time_step,
            last_bytes: 0,
            last_at: start,
        }
    }

    /// Returns `true` (and arms the next step) if a report is due.
    pub fn should_emit(&mut self, transferred: u64, total: u64, now: Instant) -> bool {
        if transferred == self.last_bytes {
            return false;
        }

        let moved = transferred.saturating_sub(self.last_bytes);
        let percent_moved = if total > 0 {
            moved as f64 * 100.0 / total as f64
        } else {
            0.0
        };

        let due = transferred >= total
            || moved >= self.byte_step
            || percent_moved >= self.percent_step
            || now.saturating_duration_since(self.last_at) >= self.time_step;

        if due {
            self.last_bytes = transferred;
            self.last_at = now;
        }
        due
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Formats an ETA as `42s`, `3m 12s`, or `1h 5m`.
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Renders a `[====>    ]` bar of `width` cells for `percent` (0–100).
pub fn render_bar(percent: f64, width: usize) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * width as f64) as usize;
    let mut bar = String::with_capacity(width + 2);
    bar.push('[');
    for i in 0..width {
        bar.push(match i.cmp(&filled) {
            std::cmp::Ordering::Less => '=',
            std::cmp::Ordering::Equal => '>',
            std::cmp::Ordering::Greater => ' ',
        });
    }
    bar.push(']');
    bar
}
