//! Reliable client command flood limiter

/// Window in which at most `burst` commands are executed
pub const FLOOD_WINDOW_MSEC: u64 = 1500;

/// Fixed window limiter opened by the first command after a quiet period
///
/// Commands over the limit are consumed but not executed, so a flooder only
/// lags itself and learns nothing about which command would get it dropped.
#[derive(Debug, Clone, Default)]
pub struct FloodGuard {
    window_start: Option<u64>,
    count: u32,
}

impl FloodGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a command at `now` and reports whether it may run
    pub fn allow(&mut self, now: u64, burst: u32) -> bool {
        match self.window_start {
            Some(start) if now.saturating_sub(start) < FLOOD_WINDOW_MSEC => {
                self.count += 1;
                self.count <= burst.max(1)
            }
            _ => {
                self.window_start = Some(now);
                self.count = 1;
                true
            }
        }
    }
}
