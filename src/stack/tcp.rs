//! TCP protocol handler.
//!
//! Terminates client TCP connections inside the engine. A SYN to an
//! intercepted address is held while the backend dials; the handshake is
//! completed (or refused) once the backend reports the dial result. After
//! that, client bytes flow to the backend through the write callback and
//! backend bytes are segmented, sent and retransmitted until acknowledged.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::handler::{ConnSnapshot, ProtocolHandler, StackContext};
use super::packet::{
    build_tcp_packet, FlowTuple, IpPacket, TcpFields, TcpSegment, TransportProtocol, TCP_ACK,
    TCP_FIN, TCP_PSH, TCP_RST, TCP_SYN,
};
use crate::backend::{DialRequest, WriteAck};
use crate::config::TcpConfig;
use crate::error::{Error, Result};
use crate::types::{BackendHandle, IoId, Protocol};

/// MSS assumed when the client does not send the option, or sends zero.
const DEFAULT_PEER_MSS: u16 = 536;

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    /// SYN received, backend dial in progress.
    Dialing,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub fn name(&self) -> &'static str {
        match self {
            TcpState::Dialing => "DIALING",
            TcpState::SynReceived => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        }
    }

    /// States in which queued data or a FIN may be transmitted.
    fn can_send(&self) -> bool {
        matches!(
            self,
            TcpState::Established
                | TcpState::CloseWait
                | TcpState::FinWait1
                | TcpState::Closing
                | TcpState::LastAck
        )
    }

    /// States in which client data is accepted.
    fn can_receive(&self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    }
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    !seq_lt(b, a)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Keep,
    Remove,
}

struct TcpConn {
    io: Option<IoId>,
    intercept: BackendHandle,
    state: TcpState,
    client: SocketAddr,
    local: SocketAddr,

    rcv_nxt: u32,
    /// Bytes handed to the backend and not yet acknowledged.
    unacked_rx: u32,

    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_max: u32,
    snd_wnd: u32,
    peer_mss: u16,
    /// Unacknowledged and unsent bytes, starting at `snd_una`.
    send_buf: VecDeque<u8>,
    fin_queued: bool,
    fin_seq: Option<u32>,

    rto: Duration,
    retransmit_at: Option<Instant>,
    retries: u32,
    time_wait_until: Option<Instant>,
}

impl TcpConn {
    fn advertised_window(&self, config: &TcpConfig) -> u16 {
        u32::from(config.window)
            .saturating_sub(self.unacked_rx)
            .min(u32::from(u16::MAX)) as u16
    }

    fn segment_size(&self, config: &TcpConfig) -> usize {
        usize::from(self.peer_mss.min(config.mss))
    }

    fn send(
        &self,
        ctx: &mut StackContext<'_>,
        config: &TcpConfig,
        flags: u8,
        seq: u32,
        payload: &[u8],
        mss: Option<u16>,
    ) {
        let fields = TcpFields {
            seq,
            ack: self.rcv_nxt,
            flags,
            window: self.advertised_window(config),
            mss,
            payload,
        };
        match build_tcp_packet(self.local, self.client, &fields) {
            Ok(packet) => ctx.emit(packet),
            Err(e) => tracing::warn!(error = %e, client = %self.client, "Failed to build TCP segment"),
        }
    }

    fn send_ack(&self, ctx: &mut StackContext<'_>, config: &TcpConfig) {
        self.send(ctx, config, TCP_ACK, self.snd_nxt, &[], None);
    }

    fn send_syn_ack(&self, ctx: &mut StackContext<'_>, config: &TcpConfig) {
        self.send(ctx, config, TCP_SYN | TCP_ACK, self.iss, &[], Some(config.mss));
    }

    fn send_rst(&self, ctx: &mut StackContext<'_>, config: &TcpConfig) {
        self.send(ctx, config, TCP_RST | TCP_ACK, self.snd_nxt, &[], None);
    }

    /// Already-acknowledged sequence number, so the client answers with its
    /// current window.
    fn send_window_probe(&self, ctx: &mut StackContext<'_>, config: &TcpConfig) {
        self.send(ctx, config, TCP_ACK, self.snd_una.wrapping_sub(1), &[], None);
    }

    fn advance(&mut self, len: u32, now: Instant) {
        self.snd_nxt = self.snd_nxt.wrapping_add(len);
        if seq_lt(self.snd_max, self.snd_nxt) {
            self.snd_max = self.snd_nxt;
        }
        if self.retransmit_at.is_none() {
            self.retransmit_at = Some(now + self.rto);
        }
    }

    /// Transmit whatever the peer window allows, then the FIN if queued.
    /// Returns whether anything was sent.
    fn flush(&mut self, ctx: &mut StackContext<'_>, config: &TcpConfig) -> bool {
        if !self.state.can_send() {
            return false;
        }
        let mss = self.segment_size(config);
        let mut sent = false;

        loop {
            let in_flight = self.snd_nxt.wrapping_sub(self.snd_una) as usize;
            let unsent = self.send_buf.len().saturating_sub(in_flight);
            let room = (self.snd_wnd as usize).saturating_sub(in_flight);

            let len = unsent.min(room).min(mss);
            if len > 0 {
                let chunk: Vec<u8> = self
                    .send_buf
                    .range(in_flight..in_flight + len)
                    .copied()
                    .collect();
                self.send(ctx, config, TCP_ACK | TCP_PSH, self.snd_nxt, &chunk, None);
                self.advance(len as u32, ctx.now);
                sent = true;
                continue;
            }

            let fin_due = self.fin_queued
                && unsent == 0
                && in_flight == self.send_buf.len()
                && self.fin_seq.map_or(true, |fin| fin == self.snd_nxt);
            if fin_due {
                self.fin_seq = Some(self.snd_nxt);
                self.send(ctx, config, TCP_FIN | TCP_ACK, self.snd_nxt, &[], None);
                self.advance(1, ctx.now);
                sent = true;
            }
            // Zero window with data waiting: the persist timer probes it
            if unsent > 0 && room == 0 && self.retransmit_at.is_none() {
                self.retransmit_at = Some(ctx.now + self.rto);
            }
            return sent;
        }
    }

    fn enter_time_wait(&mut self, now: Instant, config: &TcpConfig) {
        self.state = TcpState::TimeWait;
        self.retransmit_at = None;
        self.time_wait_until = Some(now + config.time_wait);
    }

    /// Send client bytes to the backend. `Err` means the connection must be reset.
    fn deliver(&mut self, ctx: &mut StackContext<'_>, config: &TcpConfig, payload: &[u8]) -> std::result::Result<usize, ()> {
        let io = self.io.ok_or(())?;
        let room = u32::from(config.window).saturating_sub(self.unacked_rx) as usize;
        let take = payload.len().min(room);
        if take == 0 {
            return Ok(0);
        }

        let (backend, write) = {
            let io_ctx = ctx.ios.get(io).ok_or(())?;
            (io_ctx.backend_conn().ok_or(())?, Arc::clone(&io_ctx.callbacks.write))
        };

        match write(backend, &payload[..take], WriteAck::new(Protocol::Tcp, io, take)) {
            Ok(_) => {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(take as u32);
                self.unacked_rx += take as u32;
                ctx.ios.touch(io, ctx.now);
                Ok(take)
            }
            Err(e) => {
                tracing::warn!(%io, error = %e, "Backend write failed, resetting connection");
                Err(())
            }
        }
    }

    fn backend_close_write(&self, ctx: &mut StackContext<'_>) {
        let Some(io) = self.io else { return };
        let Some(io_ctx) = ctx.ios.get(io) else { return };
        if let Some(backend) = io_ctx.backend_conn() {
            tracing::debug!(%io, client = %self.client, "Client sent FIN, closing backend write side");
            let close_write = Arc::clone(&io_ctx.callbacks.close_write);
            close_write(backend);
        }
    }

    fn established(&mut self, ctx: &mut StackContext<'_>, config: &TcpConfig, seg: &TcpSegment<'_>) {
        self.snd_una = seg.ack;
        self.snd_wnd = u32::from(seg.window);
        self.retransmit_at = None;
        self.retries = 0;
        self.rto = config.rto;
        self.state = if self.fin_queued {
            TcpState::FinWait1
        } else {
            TcpState::Established
        };
        tracing::debug!(io = ?self.io, client = %self.client, "TCP connection established");
        self.flush(ctx, config);
    }

    fn on_segment(&mut self, ctx: &mut StackContext<'_>, config: &TcpConfig, seg: &TcpSegment<'_>) -> Next {
        let now = ctx.now;

        if seg.has(TCP_RST) {
            let window = u32::from(self.advertised_window(config)).max(1);
            let in_window = seq_le(self.rcv_nxt, seg.seq)
                && seq_lt(seg.seq, self.rcv_nxt.wrapping_add(window));
            if self.state == TcpState::Dialing || in_window {
                tracing::debug!(io = ?self.io, client = %self.client, "Client reset connection");
                return Next::Remove;
            }
            return Next::Keep;
        }

        match self.state {
            TcpState::Dialing => return Next::Keep,
            TcpState::SynReceived => {
                if seg.has(TCP_SYN) && !seg.has(TCP_ACK) {
                    self.send_syn_ack(ctx, config);
                    return Next::Keep;
                }
                if !seg.has(TCP_ACK) {
                    return Next::Keep;
                }
                if seg.ack != self.iss.wrapping_add(1) {
                    reset_for(ctx, &self.local, &self.client, seg);
                    return Next::Keep;
                }
                self.established(ctx, config, seg);
            }
            TcpState::TimeWait => {
                if seg.has(TCP_FIN) {
                    self.send_ack(ctx, config);
                }
                return Next::Keep;
            }
            _ => {}
        }

        if seg.has(TCP_SYN) {
            self.send_ack(ctx, config);
            return Next::Keep;
        }
        if !seg.has(TCP_ACK) {
            return Next::Keep;
        }

        if seq_lt(self.snd_max, seg.ack) {
            self.send_ack(ctx, config);
            return Next::Keep;
        }
        if seq_lt(self.snd_una, seg.ack) {
            let acked = seg.ack.wrapping_sub(self.snd_una) as usize;
            let data_acked = acked.min(self.send_buf.len());
            self.send_buf.drain(..data_acked);
            self.snd_una = seg.ack;
            if seq_lt(self.snd_nxt, self.snd_una) {
                self.snd_nxt = self.snd_una;
            }
            self.retries = 0;
            self.rto = config.rto;
            self.retransmit_at = if self.snd_una == self.snd_max {
                None
            } else {
                Some(now + self.rto)
            };
        }
        self.snd_wnd = u32::from(seg.window);

        if let Some(fin) = self.fin_seq {
            if seq_lt(fin, seg.ack) {
                match self.state {
                    TcpState::FinWait1 => self.state = TcpState::FinWait2,
                    TcpState::Closing => self.enter_time_wait(now, config),
                    TcpState::LastAck => return Next::Remove,
                    _ => {}
                }
            }
        }

        let mut need_ack = false;
        if !seg.payload.is_empty() && self.state.can_receive() {
            if seg.seq == self.rcv_nxt {
                if self.deliver(ctx, config, seg.payload).is_err() {
                    self.send_rst(ctx, config);
                    return Next::Remove;
                }
            }
            need_ack = true;
        }

        let fin_at = seg.seq.wrapping_add(seg.payload.len() as u32);
        if seg.has(TCP_FIN) && fin_at == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            need_ack = true;
            match self.state {
                TcpState::Established => {
                    self.state = TcpState::CloseWait;
                    self.backend_close_write(ctx);
                }
                TcpState::FinWait1 => {
                    self.state = TcpState::Closing;
                    self.backend_close_write(ctx);
                }
                TcpState::FinWait2 => {
                    self.enter_time_wait(now, config);
                    self.backend_close_write(ctx);
                }
                _ => {}
            }
        } else if seg.has(TCP_FIN) {
            need_ack = true;
        }

        if !self.flush(ctx, config) && need_ack {
            self.send_ack(ctx, config);
        }
        Next::Keep
    }

    fn on_retransmit_timeout(&mut self, ctx: &mut StackContext<'_>, config: &TcpConfig) -> Next {
        self.retries += 1;
        if self.retries > config.max_retransmits {
            tracing::warn!(io = ?self.io, client = %self.client, retries = self.retries, "Retransmission limit reached, aborting");
            self.send_rst(ctx, config);
            return Next::Remove;
        }

        self.rto = (self.rto * 2).min(config.max_rto);
        self.retransmit_at = Some(ctx.now + self.rto);
        tracing::trace!(client = %self.client, rto = ?self.rto, "TCP retransmission");

        if self.state == TcpState::SynReceived {
            self.send_syn_ack(ctx, config);
        } else {
            self.snd_nxt = self.snd_una;
            self.flush(ctx, config);
            if self.snd_nxt == self.snd_una && self.has_unsent() {
                tracing::trace!(client = %self.client, retries = self.retries, "Peer window closed, sending probe");
                self.send_window_probe(ctx, config);
            }
        }
        Next::Keep
    }

    fn has_unsent(&self) -> bool {
        self.send_buf.len() > self.snd_nxt.wrapping_sub(self.snd_una) as usize
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.retransmit_at, self.time_wait_until) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn snapshot(&self) -> ConnSnapshot {
        ConnSnapshot {
            protocol: Protocol::Tcp,
            local: self.local.to_string(),
            remote: self.client.to_string(),
            state: self.state.name().to_string(),
        }
    }
}

/// Answer a segment that belongs to no usable connection with RST.
fn reset_for(ctx: &mut StackContext<'_>, local: &SocketAddr, client: &SocketAddr, seg: &TcpSegment<'_>) {
    let fields = if seg.has(TCP_ACK) {
        TcpFields {
            seq: seg.ack,
            ack: 0,
            flags: TCP_RST,
            window: 0,
            mss: None,
            payload: &[],
        }
    } else {
        TcpFields {
            seq: 0,
            ack: seg.seq.wrapping_add(seg.seq_len()),
            flags: TCP_RST | TCP_ACK,
            window: 0,
            mss: None,
            payload: &[],
        }
    };
    match build_tcp_packet(*local, *client, &fields) {
        Ok(packet) => ctx.emit(packet),
        Err(e) => tracing::warn!(error = %e, "Failed to build TCP reset"),
    }
}

struct Binding {
    flow: FlowTuple,
    intercept: BackendHandle,
}

/// TCP handler state.
pub struct TcpHandler {
    config: TcpConfig,
    conns: HashMap<FlowTuple, TcpConn>,
    by_io: HashMap<IoId, Binding>,
    last_check: Instant,
}

impl TcpHandler {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            conns: HashMap::new(),
            by_io: HashMap::new(),
            last_check: Instant::now(),
        }
    }

    /// Whether any connection, including TIME_WAIT, still needs the timer.
    pub fn has_pcbs(&self) -> bool {
        !self.conns.is_empty()
    }

    pub fn state_of(&self, io: IoId) -> Option<TcpState> {
        let binding = self.by_io.get(&io)?;
        self.conns.get(&binding.flow).map(|c| c.state)
    }

    /// Time until the next timer event, capped at the timer interval.
    pub fn sleep_time(&self, now: Instant) -> Duration {
        self.conns
            .values()
            .filter_map(TcpConn::next_deadline)
            .map(|d| d.saturating_duration_since(now))
            .min()
            .map_or(self.config.timer_interval, |d| d.min(self.config.timer_interval))
    }

    /// Shift every pending deadline by the time elapsed since the last check,
    /// so a stopped timer does not fire a backlog of stale timeouts.
    pub fn restart_timeouts(&mut self, now: Instant) {
        let gap = now.saturating_duration_since(self.last_check);
        for conn in self.conns.values_mut() {
            conn.retransmit_at = conn.retransmit_at.map(|t| t + gap);
            conn.time_wait_until = conn.time_wait_until.map(|t| t + gap);
        }
        self.last_check = now;
    }

    /// Run retransmission and TIME_WAIT timeouts due at `ctx.now`.
    pub fn check_timeouts(&mut self, ctx: &mut StackContext<'_>) {
        let now = ctx.now;
        self.last_check = now;

        let mut finished = Vec::new();
        for (flow, conn) in &mut self.conns {
            if conn.time_wait_until.is_some_and(|t| t <= now) {
                finished.push(*flow);
                continue;
            }
            if conn.retransmit_at.is_some_and(|t| t <= now)
                && conn.on_retransmit_timeout(ctx, &self.config) == Next::Remove
            {
                finished.push(*flow);
            }
        }
        for flow in finished {
            self.remove_conn(ctx, flow, true);
        }
    }

    fn accept(&mut self, ctx: &mut StackContext<'_>, flow: FlowTuple, seg: &TcpSegment<'_>) -> bool {
        let Some(matched) = ctx.match_intercept(Protocol::Tcp, &flow) else {
            tracing::debug!(client = %flow.src(), dst = %flow.dst(), "No intercept for TCP destination, resetting");
            reset_for(ctx, &flow.dst(), &flow.src(), seg);
            return false;
        };

        if !ctx.pools.tcp_pcb.alloc() {
            tracing::warn!(service = %matched.service_name, "TCP pcb pool exhausted, refusing connection");
            reset_for(ctx, &flow.dst(), &flow.src(), seg);
            return true;
        }

        let io = ctx.open_io(Protocol::Tcp, &matched, flow.src(), flow.dst(), Duration::ZERO);
        let iss: u32 = rand::random();
        let conn = TcpConn {
            io: Some(io),
            intercept: matched.handle,
            state: TcpState::Dialing,
            client: flow.src(),
            local: flow.dst(),
            rcv_nxt: seg.seq.wrapping_add(1),
            unacked_rx: 0,
            iss,
            snd_una: iss,
            snd_nxt: iss,
            snd_max: iss,
            snd_wnd: u32::from(seg.window),
            peer_mss: seg.mss.filter(|&mss| mss > 0).unwrap_or(DEFAULT_PEER_MSS),
            send_buf: VecDeque::new(),
            fin_queued: false,
            fin_seq: None,
            rto: self.config.rto,
            retransmit_at: None,
            retries: 0,
            time_wait_until: None,
        };

        let request = DialRequest {
            io,
            intercept: matched.handle,
            service_name: &matched.service_name,
            protocol: Protocol::Tcp,
            client: flow.src(),
            intercepted: flow.dst(),
        };
        tracing::debug!(%io, service = %matched.service_name, client = %flow.src(), dst = %flow.dst(), "Dialing backend for TCP connection");

        match (matched.callbacks.dial)(&request) {
            Some(backend) => {
                if let Some(io_ctx) = ctx.ios.get_mut(io) {
                    io_ctx.set_backend_conn(backend);
                }
                self.conns.insert(flow, conn);
                self.by_io.insert(
                    io,
                    Binding {
                        flow,
                        intercept: matched.handle,
                    },
                );
            }
            None => {
                tracing::debug!(%io, service = %matched.service_name, "Backend refused dial");
                ctx.ios.remove(io);
                ctx.pools.tcp_pcb.free();
                conn.send_rst(ctx, &self.config);
            }
        }
        true
    }

    /// Drop a connection and release its I/O context, telling the backend
    /// when `notify_backend` is set.
    fn remove_conn(&mut self, ctx: &mut StackContext<'_>, flow: FlowTuple, notify_backend: bool) {
        let Some(conn) = self.conns.remove(&flow) else {
            return;
        };
        ctx.pools.tcp_pcb.free();

        let Some(io) = conn.io else { return };
        self.by_io.remove(&io);
        if let Some(io_ctx) = ctx.ios.remove(io) {
            if let (true, Some(backend)) = (notify_backend, io_ctx.backend_conn()) {
                (io_ctx.callbacks.close)(backend);
            }
        }
    }

    fn flow_of(&self, io: IoId) -> Option<FlowTuple> {
        self.by_io.get(&io).map(|b| b.flow)
    }
}

impl ProtocolHandler for TcpHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn input(&mut self, ctx: &mut StackContext<'_>, packet: &IpPacket<'_>) -> bool {
        let seg = match TcpSegment::parse(packet.transport()) {
            Ok(seg) => seg,
            Err(e) => {
                tracing::trace!(error = %e, src = %packet.src_addr, "Dropping malformed TCP segment");
                return true;
            }
        };
        if ctx.verify_checksums && !packet.transport_checksum_valid() {
            tracing::trace!(src = %packet.src_addr, "Dropping TCP segment with bad checksum");
            return true;
        }

        let flow = FlowTuple {
            src_addr: packet.src_addr,
            dst_addr: packet.dst_addr,
            src_port: seg.src_port,
            dst_port: seg.dst_port,
            protocol: TransportProtocol::Tcp,
        };

        if let Some(conn) = self.conns.get_mut(&flow) {
            if conn.on_segment(ctx, &self.config, &seg) == Next::Remove {
                self.remove_conn(ctx, flow, true);
            }
            return true;
        }

        if seg.has(TCP_RST) {
            return true;
        }
        if seg.has(TCP_SYN) && !seg.has(TCP_ACK) {
            return self.accept(ctx, flow, &seg);
        }

        reset_for(ctx, &flow.dst(), &flow.src(), &seg);
        true
    }

    fn dial_completed(&mut self, ctx: &mut StackContext<'_>, io: IoId, ok: bool) {
        let Some(flow) = self.flow_of(io) else {
            tracing::warn!(%io, "Dial completed for unknown TCP connection");
            return;
        };
        let Some(conn) = self.conns.get_mut(&flow) else {
            return;
        };
        if conn.state != TcpState::Dialing {
            tracing::debug!(%io, state = conn.state.name(), "Dial completion for connection not dialing");
            return;
        }

        if ok {
            conn.state = TcpState::SynReceived;
            conn.send_syn_ack(ctx, &self.config);
            conn.advance(1, ctx.now);
        } else {
            conn.send_rst(ctx, &self.config);
            self.remove_conn(ctx, flow, false);
        }
    }

    fn write(&mut self, ctx: &mut StackContext<'_>, io: IoId, data: &[u8]) -> Result<usize> {
        let flow = self.flow_of(io).ok_or(Error::UnknownConnection(io))?;
        let conn = self.conns.get_mut(&flow).ok_or(Error::ConnectionClosed)?;

        let writable = matches!(
            conn.state,
            TcpState::Dialing | TcpState::SynReceived | TcpState::Established | TcpState::CloseWait
        );
        if !writable || conn.fin_queued {
            return Err(Error::ConnectionClosed);
        }

        let room = self.config.send_buffer.saturating_sub(conn.send_buf.len());
        if room == 0 {
            return Err(Error::BufferFull);
        }
        let take = room.min(data.len());
        conn.send_buf.extend(&data[..take]);
        conn.flush(ctx, &self.config);
        ctx.ios.touch(io, ctx.now);
        Ok(take)
    }

    fn close(&mut self, ctx: &mut StackContext<'_>, io: IoId) {
        let Some(binding) = self.by_io.remove(&io) else {
            return;
        };
        let Some(conn) = self.conns.get_mut(&binding.flow) else {
            return;
        };
        conn.io = None;

        match conn.state {
            TcpState::Dialing | TcpState::SynReceived => {
                conn.send_rst(ctx, &self.config);
                self.remove_conn(ctx, binding.flow, false);
            }
            TcpState::Established => {
                conn.fin_queued = true;
                conn.state = TcpState::FinWait1;
                conn.flush(ctx, &self.config);
            }
            TcpState::CloseWait => {
                conn.fin_queued = true;
                conn.state = TcpState::LastAck;
                conn.flush(ctx, &self.config);
            }
            _ => {}
        }
    }

    fn close_write(&mut self, ctx: &mut StackContext<'_>, io: IoId) -> Result<()> {
        let flow = self.flow_of(io).ok_or(Error::UnknownConnection(io))?;
        let conn = self.conns.get_mut(&flow).ok_or(Error::ConnectionClosed)?;

        match conn.state {
            TcpState::Dialing | TcpState::SynReceived => conn.fin_queued = true,
            TcpState::Established => {
                conn.fin_queued = true;
                conn.state = TcpState::FinWait1;
                conn.flush(ctx, &self.config);
            }
            TcpState::CloseWait => {
                conn.fin_queued = true;
                conn.state = TcpState::LastAck;
                conn.flush(ctx, &self.config);
            }
            _ => {}
        }
        Ok(())
    }

    fn write_acked(&mut self, ctx: &mut StackContext<'_>, io: IoId, len: usize) {
        let Some(flow) = self.flow_of(io) else { return };
        let Some(conn) = self.conns.get_mut(&flow) else { return };

        let before = conn.advertised_window(&self.config);
        conn.unacked_rx = conn.unacked_rx.saturating_sub(len as u32);
        let after = conn.advertised_window(&self.config);

        // Window update once the client could send at least another segment
        if before == 0 || usize::from(after - before) >= conn.segment_size(&self.config) {
            conn.send_ack(ctx, &self.config);
        }
    }

    fn active_connections(&self, intercept: BackendHandle) -> Vec<IoId> {
        let mut ios: Vec<IoId> = self
            .by_io
            .iter()
            .filter(|(_, b)| b.intercept == intercept)
            .map(|(io, _)| *io)
            .collect();
        ios.sort_unstable();
        ios
    }

    fn snapshots(&self) -> Vec<ConnSnapshot> {
        let (time_wait, active): (Vec<&TcpConn>, Vec<&TcpConn>) = self
            .conns
            .values()
            .partition(|c| c.state == TcpState::TimeWait);
        time_wait
            .into_iter()
            .chain(active)
            .map(TcpConn::snapshot)
            .collect()
    }

    fn connection_count(&self) -> usize {
        self.conns.len()
    }

    fn abort(&mut self, ctx: &mut StackContext<'_>, io: IoId) {
        let Some(flow) = self.flow_of(io) else { return };
        if let Some(conn) = self.conns.get(&flow) {
            if conn.state != TcpState::Dialing {
                conn.send_rst(ctx, &self.config);
            }
        }
        self.remove_conn(ctx, flow, false);
    }
}
