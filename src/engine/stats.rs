//! Engine statistics snapshot.

use serde::Serialize;

use crate::error::{Error, Result};
pub use crate::stack::{ConnSnapshot, PoolStats, StackCounters};

/// Point-in-time view of the stack and its connections.
#[derive(Debug, Clone, Serialize)]
pub struct IpStats {
    /// Memory pool utilization.
    pub pools: Vec<PoolStats>,
    /// TCP connections in TIME_WAIT, then active TCP, then UDP.
    pub connections: Vec<ConnSnapshot>,
    pub counters: StackCounters,
    pub intercepts: usize,
    pub io_contexts: usize,
}

impl IpStats {
    pub fn pool(&self, name: &str) -> Option<&PoolStats> {
        self.pools.iter().find(|p| p.name == name)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Internal(format!("stats serialization: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    #[test]
    fn test_json_shape() {
        let stats = IpStats {
            pools: vec![PoolStats {
                name: "tcp_pcb",
                used: 1,
                max: 2,
                avail: 1024,
            }],
            connections: vec![ConnSnapshot {
                protocol: Protocol::Tcp,
                local: "10.0.0.1:80".into(),
                remote: "192.168.1.5:40000".into(),
                state: "ESTABLISHED".into(),
            }],
            counters: StackCounters::default(),
            intercepts: 1,
            io_contexts: 1,
        };

        let value: serde_json::Value = serde_json::from_str(&stats.to_json().unwrap()).unwrap();
        assert_eq!(value["pools"][0]["name"], "tcp_pcb");
        assert_eq!(value["connections"][0]["protocol"], "tcp");
        assert_eq!(value["connections"][0]["state"], "ESTABLISHED");
        assert_eq!(stats.pool("tcp_pcb").unwrap().max, 2);
        assert!(stats.pool("pbuf_pool").is_none());
    }
}
