//! # Transfer Monitor
//!
//! EMA-smoothed throughput and ETA for a batch in flight, following the
//! teacher's `SpeedTracker`/`FlowControl` shape: a small piece of mutable
//! state updated on every chunk and sampled on a fixed tick to produce
//! human-readable progress.

const EMA_ALPHA: f64 = 0.7;
const MIN_TICK_MILLIS: i64 = 500;

/// A progress snapshot ready for display or for a `progress-sync` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub transferred_bytes: u64,
    pub total_size: u64,
    pub speed_bps: f64,
    pub eta_label: String,
}

/// EMA-smoothed throughput tracker for one batch.
pub struct TransferMonitor {
    total_size: u64,
    transferred_bytes: u64,
    ema_bps: f64,
    last_tick_millis: i64,
    last_tick_bytes: u64,
}

impl TransferMonitor {
    pub fn new() -> Self {
        Self {
            total_size: 0,
            transferred_bytes: 0,
            ema_bps: 0.0,
            last_tick_millis: 0,
            last_tick_bytes: 0,
        }
    }

    /// Start tracking a new batch. Clears the EMA so a prior batch's speed
    /// never bleeds into the next one's first samples.
    pub fn reset(&mut self, total_size: u64, now_millis: i64) {
        self.total_size = total_size;
        self.transferred_bytes = 0;
        self.ema_bps = 0.0;
        self.last_tick_millis = now_millis;
        self.last_tick_bytes = 0;
    }

    /// Record `delta` additional bytes transferred. Recomputes the EMA only
    /// if at least [`MIN_TICK_MILLIS`] has elapsed since the last sample,
    /// so a burst of tiny chunks doesn't thrash the average.
    pub fn update(&mut self, delta: u64, now_millis: i64) {
        self.transferred_bytes += delta;
        let elapsed = now_millis - self.last_tick_millis;
        if elapsed < MIN_TICK_MILLIS {
            return;
        }
        let bytes_since_tick = self.transferred_bytes - self.last_tick_bytes;
        let instant_bps = bytes_since_tick as f64 / (elapsed as f64 / 1000.0);
        self.ema_bps = if self.last_tick_bytes == 0 && self.ema_bps == 0.0 {
            instant_bps
        } else {
            EMA_ALPHA * instant_bps + (1.0 - EMA_ALPHA) * self.ema_bps
        };
        self.last_tick_millis = now_millis;
        self.last_tick_bytes = self.transferred_bytes;
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            transferred_bytes: self.transferred_bytes,
            total_size: self.total_size,
            speed_bps: self.ema_bps,
            eta_label: self.eta_label(),
        }
    }

    fn eta_label(&self) -> String {
        if self.transferred_bytes >= self.total_size {
            return "done".to_string();
        }
        if self.ema_bps <= 0.0 {
            return "calculating".to_string();
        }
        let remaining = (self.total_size - self.transferred_bytes) as f64;
        let seconds = (remaining / self.ema_bps).ceil() as u64;
        format_eta(seconds)
    }
}

impl Default for TransferMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// `X.Y MB/s` above 1 MiB/s, otherwise `N KB/s`.
pub fn format_speed(bps: f64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    if bps >= MIB {
        format!("{:.1} MB/s", bps / MIB)
    } else {
        format!("{} KB/s", (bps / 1024.0).round() as u64)
    }
}

/// `Ns left` under a minute, otherwise `Mm Ss left`.
fn format_eta(total_seconds: u64) -> String {
    if total_seconds < 60 {
        format!("{total_seconds}s left")
    } else {
        let minutes = total_seconds / 60;
        let seconds = total_seconds % 60;
        format!("{minutes}m {seconds}s left")
    }
}
