use crate::Collector;
use anyhow::Result;
use sysinfo::System;
use telemon_common::types::{Metric, Metrics};

pub struct CpuCollector {
    system: System,
}

impl CpuCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        Self { system }
    }
}

impl Default for CpuCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for CpuCollector {
    fn id(&self) -> &str {
        "cpu"
    }

    fn collect(&mut self) -> Result<Metrics> {
        self.system.refresh_cpu_all();
        let mut metrics = Metrics::new();

        metrics.insert(
            "cpu.usage".to_string(),
            Metric::double(self.system.global_cpu_usage() as f64),
        );
        metrics.insert(
            "cpu.cores".to_string(),
            Metric::uint32(self.system.cpus().len() as u32),
        );

        for (i, cpu) in self.system.cpus().iter().enumerate() {
            metrics.insert(
                format!("cpu.{i}.usage"),
                Metric::double(cpu.cpu_usage() as f64),
            );
        }

        Ok(metrics)
    }
}
