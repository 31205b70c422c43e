use crate::Collector;
use anyhow::Result;
use sysinfo::System;
use telemon_common::types::{Metric, Metrics};

pub struct MemoryCollector {
    system: System,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for MemoryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for MemoryCollector {
    fn id(&self) -> &str {
        "memory"
    }

    fn collect(&mut self) -> Result<Metrics> {
        self.system.refresh_memory();
        let mut metrics = Metrics::new();

        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let available = self.system.available_memory();
        let usage_pct = if total > 0 {
            (used as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        metrics.insert("memory.total".to_string(), Metric::uint64(total));
        metrics.insert("memory.used".to_string(), Metric::uint64(used));
        metrics.insert("memory.available".to_string(), Metric::uint64(available));
        metrics.insert("memory.used_percent".to_string(), Metric::double(usage_pct));

        let swap_total = self.system.total_swap();
        let swap_used = self.system.used_swap();
        let swap_pct = if swap_total > 0 {
            (swap_used as f64 / swap_total as f64) * 100.0
        } else {
            0.0
        };

        metrics.insert("swap.total".to_string(), Metric::uint64(swap_total));
        metrics.insert("swap.used".to_string(), Metric::uint64(swap_used));
        metrics.insert("swap.used_percent".to_string(), Metric::double(swap_pct));

        Ok(metrics)
    }
}
