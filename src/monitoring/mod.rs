use std::time::{Duration, Instant};
use tracing::debug;

/// Timer that logs how long an engine operation took when it goes out of scope
pub struct Timer {
    start: Instant,
    name: String,
}

impl Timer {
    pub fn new(name: String) -> Self {
        debug!("[PERF] timer_start | name={}", name);
        Self {
            start: Instant::now(),
            name,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!("[PERF] timer_end | name={} | duration_ms={}", self.name, self.elapsed_ms());
    }
}

/// Time a block, logging its duration at debug level
#[macro_export]
macro_rules! timed_operation {
    ($name:expr, $block:block) => {{
        let _timer = $crate::monitoring::Timer::new($name.to_string());
        $block
    }};
}
