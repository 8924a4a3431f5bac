//! Embedded IP stack.
//!
//! A deliberately small stack: it parses inbound packets, hands them to the
//! raw protocol handler registered for their transport protocol, accounts
//! for its memory pools and collects outbound packets for the interface.
//!
//! ```text
//!   netif ──► IpStack::input ──► raw handler table ──► TcpHandler / UdpHandler
//!                                                          │
//!   netif ◄──────────────── outbox ◄─────────────────────── ┘
//! ```

mod handler;
pub mod packet;
mod tcp;
mod udp;

pub use handler::{ConnSnapshot, ProtocolHandler, StackContext};
pub use tcp::{TcpHandler, TcpState};
pub use udp::UdpHandler;

use std::collections::HashMap;

use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::{Error, FatalError, Result};
use crate::types::Protocol;
use packet::IpPacket;

/// Utilization of one memory pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: &'static str,
    /// Entries in use now.
    pub used: usize,
    /// High-water mark of `used`.
    pub max: usize,
    /// Capacity.
    pub avail: usize,
}

/// Bounded allocation counter.
#[derive(Debug, Clone)]
pub struct MemPool {
    name: &'static str,
    used: usize,
    max: usize,
    avail: usize,
}

impl MemPool {
    pub fn new(name: &'static str, avail: usize) -> Self {
        Self {
            name,
            used: 0,
            max: 0,
            avail,
        }
    }

    /// Take one entry. Fails when the pool is exhausted.
    pub fn alloc(&mut self) -> bool {
        if self.used >= self.avail {
            return false;
        }
        self.used += 1;
        self.max = self.max.max(self.used);
        true
    }

    pub fn free(&mut self) {
        self.used = self.used.saturating_sub(1);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name,
            used: self.used,
            max: self.max,
            avail: self.avail,
        }
    }
}

/// Pools tracked by the stack.
#[derive(Debug, Clone)]
pub struct MemPools {
    pub pbuf: MemPool,
    pub tcp_pcb: MemPool,
    pub udp_pcb: MemPool,
}

impl MemPools {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            pbuf: MemPool::new("pbuf_pool", config.pools.pbufs),
            tcp_pcb: MemPool::new("tcp_pcb", config.pools.tcp_pcbs),
            udp_pcb: MemPool::new("udp_pcb", config.pools.udp_pcbs),
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        vec![self.pbuf.stats(), self.tcp_pcb.stats(), self.udp_pcb.stats()]
    }
}

/// State of the interface attached to the stack.
#[derive(Debug, Clone)]
pub struct NetifState {
    pub name: String,
    pub up: bool,
    pub link_up: bool,
}

/// Packet counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StackCounters {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub dropped: u64,
}

/// The embedded IP stack.
#[derive(Debug)]
pub struct IpStack {
    netif: Option<NetifState>,
    raw: HashMap<u8, Protocol>,
    pub(crate) pools: MemPools,
    pub(crate) outbox: Vec<Vec<u8>>,
    pub(crate) counters: StackCounters,
}

impl IpStack {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        if config.pools.pbufs == 0 {
            return Err(FatalError::StackInit("packet buffer pool is empty".into()).into());
        }
        Ok(Self {
            netif: None,
            raw: HashMap::new(),
            pools: MemPools::new(config),
            outbox: Vec::new(),
            counters: StackCounters::default(),
        })
    }

    /// Attach the default interface.
    pub fn attach_netif(&mut self, name: &str) -> Result<()> {
        if let Some(existing) = &self.netif {
            return Err(FatalError::NetifAttach(format!(
                "interface {} already attached",
                existing.name
            ))
            .into());
        }
        self.netif = Some(NetifState {
            name: name.to_string(),
            up: false,
            link_up: false,
        });
        Ok(())
    }

    pub fn set_up(&mut self) {
        if let Some(netif) = &mut self.netif {
            netif.up = true;
        }
    }

    pub fn set_link_up(&mut self) {
        if let Some(netif) = &mut self.netif {
            netif.link_up = true;
        }
    }

    pub fn netif(&self) -> Option<&NetifState> {
        self.netif.as_ref()
    }

    /// Route packets with IP protocol number `ip_proto` to `protocol`'s handler.
    pub fn register_raw(&mut self, ip_proto: u8, protocol: Protocol) -> Result<()> {
        if let Some(existing) = self.raw.get(&ip_proto) {
            return Err(Error::Fatal(FatalError::HandlerRegistration {
                protocol: protocol.as_str(),
                reason: format!("IP protocol {ip_proto} already bound to {existing}"),
            }));
        }
        self.raw.insert(ip_proto, protocol);
        Ok(())
    }

    /// Parse an inbound packet and find the handler that should see it.
    pub fn input<'a>(&mut self, data: &'a [u8]) -> Option<(Protocol, IpPacket<'a>)> {
        self.counters.rx_packets += 1;

        if !self.netif.as_ref().is_some_and(|n| n.up && n.link_up) {
            tracing::trace!(len = data.len(), "Interface down, dropping packet");
            self.counters.dropped += 1;
            return None;
        }

        let packet = match IpPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::trace!(error = %e, "Dropping unparseable packet");
                self.counters.dropped += 1;
                return None;
            }
        };

        match self.raw.get(&packet.protocol.protocol_number()) {
            Some(protocol) => Some((*protocol, packet)),
            None => {
                tracing::trace!(
                    protocol = packet.protocol.protocol_number(),
                    dst = %packet.dst_addr,
                    "No handler for protocol, dropping"
                );
                self.counters.dropped += 1;
                None
            }
        }
    }

    pub(crate) fn record_drop(&mut self) {
        self.counters.dropped += 1;
    }

    /// Take every queued outbound packet.
    pub(crate) fn drain_outbox(&mut self) -> Vec<Vec<u8>> {
        self.counters.tx_packets += self.outbox.len() as u64;
        std::mem::take(&mut self.outbox)
    }

    pub fn counters(&self) -> StackCounters {
        self.counters
    }
}
