use crate::Collector;
use anyhow::Result;
use std::collections::HashMap;
use sysinfo::Networks;
use telemon_common::types::{Metric, Metrics};

pub struct NetworkCollector {
    networks: Networks,
    prev_received: HashMap<String, u64>,
    prev_transmitted: HashMap<String, u64>,
}

impl NetworkCollector {
    pub fn new() -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
            prev_received: HashMap::new(),
            prev_transmitted: HashMap::new(),
        }
    }
}

impl Default for NetworkCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for NetworkCollector {
    fn id(&self) -> &str {
        "network"
    }

    fn collect(&mut self) -> Result<Metrics> {
        self.networks.refresh(true);
        let mut metrics = Metrics::new();

        for (name, data) in self.networks.iter() {
            let received = data.total_received();
            let transmitted = data.total_transmitted();

            // Delta since the previous snapshot; first snapshot reports 0
            let rx_delta =
                received.saturating_sub(*self.prev_received.get(name).unwrap_or(&received));
            let tx_delta = transmitted
                .saturating_sub(*self.prev_transmitted.get(name).unwrap_or(&transmitted));

            self.prev_received.insert(name.clone(), received);
            self.prev_transmitted.insert(name.clone(), transmitted);

            metrics.insert(
                format!("network.{name}.bytes_recv"),
                Metric::uint64(rx_delta),
            );
            metrics.insert(
                format!("network.{name}.bytes_sent"),
                Metric::uint64(tx_delta),
            );
            metrics.insert(
                format!("network.{name}.bytes_recv_total"),
                Metric::uint64(received),
            );
            metrics.insert(
                format!("network.{name}.bytes_sent_total"),
                Metric::uint64(transmitted),
            );
        }

        Ok(metrics)
    }
}
