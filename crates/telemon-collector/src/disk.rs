use crate::Collector;
use anyhow::Result;
use sysinfo::Disks;
use telemon_common::types::{Metric, Metrics};

pub struct DiskCollector {
    disks: Disks,
}

impl Default for DiskCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskCollector {
    pub fn new() -> Self {
        Self {
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl Collector for DiskCollector {
    fn id(&self) -> &str {
        "disk"
    }

    fn collect(&mut self) -> Result<Metrics> {
        self.disks.refresh(true);
        let mut metrics = Metrics::new();

        for disk in self.disks.iter() {
            let mount = disk.mount_point().to_string_lossy().to_string();

            // Skip virtual/pseudo filesystems (snap, tmpfs, overlay, etc.)
            if mount.starts_with("/snap/")
                || mount.starts_with("/sys/")
                || mount.starts_with("/proc/")
                || mount.starts_with("/dev/")
                || mount.starts_with("/run/")
            {
                continue;
            }

            let total = disk.total_space();

            // Virtual mounts report 0 total space
            if total == 0 {
                continue;
            }
            let available = disk.available_space();
            let used = total.saturating_sub(available);
            let usage_pct = (used as f64 / total as f64) * 100.0;

            metrics.insert(format!("disk.{mount}.total"), Metric::uint64(total));
            metrics.insert(format!("disk.{mount}.used"), Metric::uint64(used));
            metrics.insert(format!("disk.{mount}.available"), Metric::uint64(available));
            metrics.insert(
                format!("disk.{mount}.used_percent"),
                Metric::double(usage_pct),
            );
        }

        Ok(metrics)
    }
}
