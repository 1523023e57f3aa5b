use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PerfStats {
    pub render_ms: f64,
    pub convert_ms: f64,
    pub render_samples: u64,
    pub convert_samples: u64,
    pub soft_failures: u64,
    pub page_cache_hit_rate: f64,
}

impl PerfStats {
    pub fn record_render(&mut self, elapsed: Duration) {
        self.render_ms = elapsed.as_secs_f64() * 1000.0;
        self.render_samples += 1;
    }

    pub fn record_convert(&mut self, elapsed: Duration) {
        self.convert_ms = elapsed.as_secs_f64() * 1000.0;
        self.convert_samples += 1;
    }

    pub fn record_soft_failure(&mut self) {
        self.soft_failures += 1;
    }

    pub fn set_page_cache_hit_rate(&mut self, rate: f64) {
        self.page_cache_hit_rate = rate.clamp(0.0, 1.0);
    }
}
