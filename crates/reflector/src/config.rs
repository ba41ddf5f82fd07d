use std::time::Duration;

/// Default full-resync period.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(60);
/// Default interval between watch-health checks.
pub const DEFAULT_WATCH_CHECK_PERIOD: Duration = Duration::from_secs(2);

/// Timing knobs of a [`crate::Reflector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectorConfig {
    /// Period between full list passes.
    pub resync_period: Duration,
    /// Period between checks that the watch loop is still alive.
    pub watch_check_period: Duration,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self { resync_period: DEFAULT_RESYNC_PERIOD, watch_check_period: DEFAULT_WATCH_CHECK_PERIOD }
    }
}

impl ReflectorConfig {
    /// Defaults overridden by `MIRRA_RESYNC_SECS` and `MIRRA_WATCH_CHECK_MS`.
    pub fn from_env() -> Self {
        let resync_secs = std::env::var("MIRRA_RESYNC_SECS").ok().and_then(|s| s.parse::<u64>().ok());
        let check_ms = std::env::var("MIRRA_WATCH_CHECK_MS").ok().and_then(|s| s.parse::<u64>().ok());
        Self::default().with_overrides(resync_secs, check_ms)
    }

    fn with_overrides(mut self, resync_secs: Option<u64>, check_ms: Option<u64>) -> Self {
        if let Some(secs) = resync_secs.filter(|s| *s > 0) {
            self.resync_period = Duration::from_secs(secs);
        }
        if let Some(ms) = check_ms.filter(|ms| *ms > 0) {
            self.watch_check_period = Duration::from_millis(ms);
        }
        self
    }

    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn with_watch_check_period(mut self, period: Duration) -> Self {
        self.watch_check_period = period;
        self
    }
}
