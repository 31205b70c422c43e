use crate::Collector;
use anyhow::Result;
use sysinfo::System;
use telemon_common::types::{Metric, Metrics};

pub struct LoadCollector;

impl LoadCollector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LoadCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for LoadCollector {
    fn id(&self) -> &str {
        "load"
    }

    fn collect(&mut self) -> Result<Metrics> {
        let load_avg = System::load_average();
        let mut metrics = Metrics::new();

        metrics.insert("load.1min".to_string(), Metric::double(load_avg.one));
        metrics.insert("load.5min".to_string(), Metric::double(load_avg.five));
        metrics.insert("load.15min".to_string(), Metric::double(load_avg.fifteen));
        metrics.insert(
            "system.uptime".to_string(),
            Metric::uint64(System::uptime()),
        );

        Ok(metrics)
    }
}
