//! UDP protocol handler.
//!
//! UDP has no handshake, so the first datagram of a flow both creates the
//! connection and triggers the backend dial. Datagrams that arrive before
//! the dial completes are held, bounded, and flushed in order afterwards.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use super::handler::{ConnSnapshot, ProtocolHandler, StackContext};
use super::packet::{build_udp_packet, max_payload, FlowTuple, IpPacket, TransportProtocol, UdpDatagram};
use crate::backend::{DialRequest, WriteAck};
use crate::config::UdpConfig;
use crate::error::{Error, Result};
use crate::types::{BackendHandle, IoId, Protocol};

const UDP_HEADER_LEN: usize = 8;

struct UdpConn {
    io: IoId,
    intercept: BackendHandle,
    client: SocketAddr,
    local: SocketAddr,
    ready: bool,
    pending: VecDeque<Vec<u8>>,
}

impl UdpConn {
    fn snapshot(&self) -> ConnSnapshot {
        ConnSnapshot {
            protocol: Protocol::Udp,
            local: self.local.to_string(),
            remote: self.client.to_string(),
            state: if self.ready { "CONNECTED" } else { "DIALING" }.to_string(),
        }
    }
}

/// UDP handler state.
pub struct UdpHandler {
    config: UdpConfig,
    conns: HashMap<FlowTuple, UdpConn>,
    by_io: HashMap<IoId, FlowTuple>,
}

/// Hand one datagram to the backend.
fn deliver(ctx: &mut StackContext<'_>, io: IoId, payload: &[u8]) {
    let Some(io_ctx) = ctx.ios.get(io) else { return };
    let Some(backend) = io_ctx.backend_conn() else { return };
    let write = Arc::clone(&io_ctx.callbacks.write);

    if let Err(e) = write(backend, payload, WriteAck::new(Protocol::Udp, io, payload.len())) {
        tracing::warn!(%io, error = %e, "Backend write failed, dropping datagram");
    }
}

impl UdpHandler {
    pub fn new(config: UdpConfig) -> Self {
        Self {
            config,
            conns: HashMap::new(),
            by_io: HashMap::new(),
        }
    }

    fn queue(&self, ctx: &mut StackContext<'_>, conn: &mut UdpConn, payload: &[u8]) {
        if conn.pending.len() >= self.config.max_pending_datagrams || !ctx.pools.pbuf.alloc() {
            tracing::debug!(io = %conn.io, "Dial pending and queue full, dropping datagram");
            return;
        }
        conn.pending.push_back(payload.to_vec());
    }

    fn accept(&mut self, ctx: &mut StackContext<'_>, flow: FlowTuple, payload: &[u8]) -> bool {
        let Some(matched) = ctx.match_intercept(Protocol::Udp, &flow) else {
            tracing::trace!(client = %flow.src(), dst = %flow.dst(), "No intercept for UDP destination");
            return false;
        };

        if !ctx.pools.udp_pcb.alloc() {
            tracing::warn!(service = %matched.service_name, "UDP pcb pool exhausted, dropping datagram");
            return true;
        }

        let io = ctx.open_io(Protocol::Udp, &matched, flow.src(), flow.dst(), self.config.idle_timeout);
        if let Some(io_ctx) = ctx.ios.get_mut(io) {
            io_ctx.arm_idle_timer(ctx.now);
        }

        let request = DialRequest {
            io,
            intercept: matched.handle,
            service_name: &matched.service_name,
            protocol: Protocol::Udp,
            client: flow.src(),
            intercepted: flow.dst(),
        };
        tracing::debug!(%io, service = %matched.service_name, client = %flow.src(), dst = %flow.dst(), "Dialing backend for UDP flow");

        let Some(backend) = (matched.callbacks.dial)(&request) else {
            tracing::debug!(%io, service = %matched.service_name, "Backend refused dial");
            ctx.ios.remove(io);
            ctx.pools.udp_pcb.free();
            return true;
        };
        if let Some(io_ctx) = ctx.ios.get_mut(io) {
            io_ctx.set_backend_conn(backend);
        }

        let mut conn = UdpConn {
            io,
            intercept: matched.handle,
            client: flow.src(),
            local: flow.dst(),
            ready: false,
            pending: VecDeque::new(),
        };
        self.queue(ctx, &mut conn, payload);
        self.conns.insert(flow, conn);
        self.by_io.insert(io, flow);
        true
    }

    fn remove_conn(&mut self, ctx: &mut StackContext<'_>, io: IoId) -> Option<UdpConn> {
        let flow = self.by_io.remove(&io)?;
        let conn = self.conns.remove(&flow)?;
        for _ in &conn.pending {
            ctx.pools.pbuf.free();
        }
        ctx.pools.udp_pcb.free();
        Some(conn)
    }
}

impl ProtocolHandler for UdpHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn input(&mut self, ctx: &mut StackContext<'_>, packet: &IpPacket<'_>) -> bool {
        let datagram = match UdpDatagram::parse(packet.transport()) {
            Ok(d) => d,
            Err(e) => {
                tracing::trace!(error = %e, src = %packet.src_addr, "Dropping malformed UDP datagram");
                return true;
            }
        };
        if ctx.verify_checksums && !packet.transport_checksum_valid() {
            tracing::trace!(src = %packet.src_addr, "Dropping UDP datagram with bad checksum");
            return true;
        }

        let flow = FlowTuple {
            src_addr: packet.src_addr,
            dst_addr: packet.dst_addr,
            src_port: datagram.src_port,
            dst_port: datagram.dst_port,
            protocol: TransportProtocol::Udp,
        };

        let Some(mut conn) = self.conns.remove(&flow) else {
            return self.accept(ctx, flow, datagram.payload);
        };
        ctx.ios.touch(conn.io, ctx.now);
        if conn.ready {
            deliver(ctx, conn.io, datagram.payload);
        } else {
            self.queue(ctx, &mut conn, datagram.payload);
        }
        self.conns.insert(flow, conn);
        true
    }

    fn dial_completed(&mut self, ctx: &mut StackContext<'_>, io: IoId, ok: bool) {
        if !ok {
            tracing::debug!(%io, "UDP dial failed, dropping flow");
            self.remove_conn(ctx, io);
            ctx.ios.remove(io);
            return;
        }

        let Some(flow) = self.by_io.get(&io).copied() else {
            tracing::warn!(%io, "Dial completed for unknown UDP flow");
            return;
        };
        let Some(conn) = self.conns.get_mut(&flow) else { return };
        conn.ready = true;
        let pending = std::mem::take(&mut conn.pending);
        for datagram in pending {
            ctx.pools.pbuf.free();
            deliver(ctx, io, &datagram);
        }
    }

    fn write(&mut self, ctx: &mut StackContext<'_>, io: IoId, data: &[u8]) -> Result<usize> {
        let flow = self.by_io.get(&io).ok_or(Error::UnknownConnection(io))?;
        let conn = self.conns.get(flow).ok_or(Error::ConnectionClosed)?;

        let max = max_payload(ctx.mtu, &conn.client.ip(), UDP_HEADER_LEN);
        if data.len() > max {
            return Err(Error::PayloadTooLarge {
                size: data.len(),
                max,
            });
        }

        let packet = build_udp_packet(conn.local, conn.client, data)?;
        ctx.emit(packet);
        ctx.ios.touch(io, ctx.now);
        Ok(data.len())
    }

    fn close(&mut self, ctx: &mut StackContext<'_>, io: IoId) {
        if let Some(conn) = self.remove_conn(ctx, io) {
            tracing::debug!(%io, client = %conn.client, "UDP flow closed");
        }
    }

    fn active_connections(&self, intercept: BackendHandle) -> Vec<IoId> {
        let mut ios: Vec<IoId> = self
            .conns
            .values()
            .filter(|c| c.intercept == intercept)
            .map(|c| c.io)
            .collect();
        ios.sort_unstable();
        ios
    }

    fn snapshots(&self) -> Vec<ConnSnapshot> {
        self.conns.values().map(UdpConn::snapshot).collect()
    }

    fn connection_count(&self) -> usize {
        self.conns.len()
    }
}
