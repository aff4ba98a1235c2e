use anyhow::Result;
use std::time::{Duration, Instant};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize JSON logging with reloadable level.
pub fn init_tracing(log_level: Option<&str>) -> Result<LogHandle> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// Swap the active filter; invalid directives leave the current one in place.
pub fn set_log_level(handle: &LogHandle, level: &str) -> bool {
    match EnvFilter::try_new(level) {
        Ok(filter) => handle.modify(|f| *f = filter).is_ok(),
        Err(_) => false,
    }
}

/// Admits at most one log line per window so a failing sink cannot flood the log.
#[derive(Debug, Clone)]
pub struct LogThrottle {
    window: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns the number of suppressed events since the last admitted one, or `None` to stay quiet.
    pub fn admit(&mut self, now: Instant) -> Option<u64> {
        let open = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.window,
        };
        if open {
            self.last = Some(now);
            Some(std::mem::take(&mut self.suppressed))
        } else {
            self.suppressed = self.suppressed.saturating_add(1);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_admits_once_per_window() {
        let mut throttle = LogThrottle::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert_eq!(throttle.admit(t0), Some(0));
        assert_eq!(throttle.admit(t0 + Duration::from_millis(500)), None);
        assert_eq!(throttle.admit(t0 + Duration::from_millis(2_000)), None);
        assert_eq!(throttle.admit(t0 + Duration::from_millis(2_001)), Some(2));
    }
}
