//! Interface between the stack and the per-protocol connection handlers.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::packet::{FlowTuple, IpPacket};
use super::MemPools;
use crate::backend::{Callbacks, ConnCallbacks, IoTable, NewIo};
use crate::error::Result;
use crate::intercept::InterceptRegistry;
use crate::types::{BackendHandle, IoId, Protocol};

/// Endpoint and state of one connection, for statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnSnapshot {
    pub protocol: Protocol,
    pub local: String,
    pub remote: String,
    pub state: String,
}

/// Engine state a handler may touch while processing an event.
///
/// Built fresh by the engine for every call so that the handler, the
/// registry and the I/O table can be borrowed side by side.
pub struct StackContext<'a> {
    pub(crate) intercepts: &'a mut InterceptRegistry,
    pub(crate) ios: &'a mut IoTable,
    pub(crate) callbacks: &'a Callbacks,
    pub(crate) pools: &'a mut MemPools,
    pub(crate) outbox: &'a mut Vec<Vec<u8>>,
    pub(crate) mtu: u16,
    pub(crate) verify_checksums: bool,
    pub(crate) now: Instant,
}

/// The rule a new flow matched, with its callbacks resolved.
pub(crate) struct MatchedIntercept {
    pub(crate) handle: BackendHandle,
    pub(crate) service_name: String,
    pub(crate) callbacks: ConnCallbacks,
}

impl StackContext<'_> {
    /// Find the rule covering the destination of `flow`.
    pub(crate) fn match_intercept(&mut self, protocol: Protocol, flow: &FlowTuple) -> Option<MatchedIntercept> {
        let rule = self.intercepts.lookup(protocol, flow.dst_addr, flow.dst_port)?;
        Some(MatchedIntercept {
            handle: rule.backend_handle(),
            service_name: rule.service_name().to_string(),
            callbacks: self.callbacks.resolve(rule.overrides()),
        })
    }

    /// Create the I/O context for a new flow.
    pub(crate) fn open_io(
        &mut self,
        protocol: Protocol,
        matched: &MatchedIntercept,
        client: SocketAddr,
        intercepted: SocketAddr,
        idle_timeout: Duration,
    ) -> IoId {
        self.ios.insert(
            NewIo {
                protocol,
                intercept: matched.handle,
                service_name: matched.service_name.clone(),
                client,
                intercepted,
                idle_timeout,
                callbacks: matched.callbacks.clone(),
            },
            self.now,
        )
    }

    pub(crate) fn emit(&mut self, packet: Vec<u8>) {
        self.outbox.push(packet);
    }
}

/// Per-protocol connection state machine driven by the engine.
pub trait ProtocolHandler: Send {
    fn protocol(&self) -> Protocol;

    /// Handle an inbound packet. Returns `false` when no intercept claimed it.
    fn input(&mut self, ctx: &mut StackContext<'_>, packet: &IpPacket<'_>) -> bool;

    /// The backend finished dialing for `io`.
    fn dial_completed(&mut self, ctx: &mut StackContext<'_>, io: IoId, ok: bool);

    /// Send backend bytes to the client. Returns the number of bytes accepted.
    fn write(&mut self, ctx: &mut StackContext<'_>, io: IoId, data: &[u8]) -> Result<usize>;

    /// The backend closed its side completely. The engine releases the I/O
    /// context afterwards.
    fn close(&mut self, ctx: &mut StackContext<'_>, io: IoId);

    /// The backend will send no more data.
    fn close_write(&mut self, _ctx: &mut StackContext<'_>, io: IoId) -> Result<()> {
        tracing::debug!(%io, protocol = %self.protocol(), "Half-close not supported, ignoring");
        Ok(())
    }

    /// The backend finished writing `len` bytes previously handed to it.
    fn write_acked(&mut self, _ctx: &mut StackContext<'_>, _io: IoId, _len: usize) {}

    /// Tear the connection down at once, without a graceful close. The
    /// engine notifies the backend and releases the I/O context itself.
    fn abort(&mut self, ctx: &mut StackContext<'_>, io: IoId) {
        self.close(ctx, io);
    }

    /// I/O contexts of live connections matched to `intercept`.
    fn active_connections(&self, intercept: BackendHandle) -> Vec<IoId>;

    fn snapshots(&self) -> Vec<ConnSnapshot>;

    fn connection_count(&self) -> usize;
}
