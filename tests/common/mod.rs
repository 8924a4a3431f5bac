//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;

use tunnelgate::backend::{ConfigType, HostContext, TunnelCallbacks, WriteAck};
use tunnelgate::config::EngineConfig;
use tunnelgate::engine::Engine;
use tunnelgate::error::{Error, Result};
use tunnelgate::netif::NetifDriver;
use tunnelgate::stack::packet::{
    build_tcp_packet, build_udp_packet, IpPacket, TcpFields, TcpSegment, UdpDatagram, TCP_ACK, TCP_SYN,
};
use tunnelgate::types::{BackendConn, BackendHandle, IoId, Protocol};

pub const CLIENT: &str = "192.168.1.5:40000";

/// Everything the driver was asked to do.
#[derive(Debug, Default)]
pub struct DriverLog {
    pub written: Vec<Vec<u8>>,
    pub routes_added: Vec<IpNet>,
    pub routes_deleted: Vec<IpNet>,
    pub excluded: Vec<IpAddr>,
    /// `add_route` fails for this destination.
    pub fail_route: Option<IpNet>,
}

/// In-memory interface driver without packet input.
#[derive(Clone, Default)]
pub struct RecordingDriver {
    pub log: Arc<Mutex<DriverLog>>,
    pub exclusion: bool,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exclusion() -> Self {
        Self {
            exclusion: true,
            ..Self::default()
        }
    }

    /// Take every packet written so far.
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.log.lock().written)
    }

    /// Take written packets and parse them as TCP.
    pub fn take_segments(&self) -> Vec<Segment> {
        self.take_written().iter().filter_map(|p| parse_tcp(p)).collect()
    }
}

impl NetifDriver for RecordingDriver {
    fn name(&self) -> &str {
        "test0"
    }

    fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.log.lock().written.push(packet.to_vec());
        Ok(())
    }

    fn add_route(&mut self, dest: &IpNet) -> Result<()> {
        let mut log = self.log.lock();
        if log.fail_route == Some(*dest) {
            return Err(Error::Route(format!("cannot add {dest}")));
        }
        log.routes_added.push(*dest);
        Ok(())
    }

    fn delete_route(&mut self, dest: &IpNet) -> Result<()> {
        self.log.lock().routes_deleted.push(*dest);
        Ok(())
    }

    fn supports_route_exclusion(&self) -> bool {
        self.exclusion
    }

    fn exclude_route(&mut self, dest: IpAddr) -> Result<()> {
        self.log.lock().excluded.push(dest);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Dial {
    pub io: IoId,
    pub intercept: BackendHandle,
    pub protocol: Protocol,
    pub client: SocketAddr,
    pub intercepted: SocketAddr,
}

/// Everything the backend callbacks saw.
#[derive(Default)]
pub struct BackendLog {
    pub dials: Vec<Dial>,
    pub writes: Vec<(BackendConn, Vec<u8>)>,
    pub acks: Vec<WriteAck>,
    pub closed: Vec<BackendConn>,
    pub closed_write: Vec<BackendConn>,
    pub hosted: Vec<(BackendHandle, String, serde_json::Value)>,
    /// `dial` returns `None` while set.
    pub refuse: bool,
}

/// Backend that records calls and hands out one connection per dial.
#[derive(Clone, Default)]
pub struct RecordingBackend {
    pub log: Arc<Mutex<BackendLog>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> TunnelCallbacks {
        let dial_log = Arc::clone(&self.log);
        let write_log = Arc::clone(&self.log);
        let close_log = Arc::clone(&self.log);
        let close_write_log = Arc::clone(&self.log);
        let host_log = Arc::clone(&self.log);

        TunnelCallbacks::new()
            .on_dial(move |req| {
                let mut log = dial_log.lock();
                if log.refuse {
                    return None;
                }
                log.dials.push(Dial {
                    io: req.io,
                    intercept: req.intercept,
                    protocol: req.protocol,
                    client: req.client,
                    intercepted: req.intercepted,
                });
                Some(BackendConn(req.io.get()))
            })
            .on_write(move |conn, data, ack| {
                let mut log = write_log.lock();
                log.writes.push((conn, data.to_vec()));
                log.acks.push(ack);
                Ok(data.len())
            })
            .on_close(move |conn| close_log.lock().closed.push(conn))
            .on_close_write(move |conn| close_write_log.lock().closed_write.push(conn))
            .on_host(move |handle, service, _config_type: ConfigType, config| {
                host_log.lock().hosted.push((handle, service.to_string(), config.clone()));
                Some(Box::new(handle.0) as HostContext)
            })
    }

    pub fn last_dial(&self) -> Dial {
        self.log.lock().dials.last().cloned().expect("no dial recorded")
    }

    pub fn written_payloads(&self) -> Vec<Vec<u8>> {
        self.log.lock().writes.iter().map(|(_, d)| d.clone()).collect()
    }

    pub fn take_acks(&self) -> Vec<WriteAck> {
        std::mem::take(&mut self.log.lock().acks)
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.log.lock().refuse = refuse;
    }
}

pub fn engine(driver: &RecordingDriver, backend: &RecordingBackend) -> Engine {
    Engine::new(EngineConfig::default(), backend.callbacks(), Box::new(driver.clone())).unwrap()
}

/// Hand every pending acknowledgement back to the engine.
pub fn ack_all(engine: &mut Engine, backend: &RecordingBackend) {
    for ack in backend.take_acks() {
        engine.ack(ack);
    }
}

/// A parsed outbound TCP segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }
}

pub fn parse_tcp(packet: &[u8]) -> Option<Segment> {
    let ip = IpPacket::parse(packet).ok()?;
    let seg = TcpSegment::parse(ip.transport()).ok()?;
    Some(Segment {
        src: SocketAddr::new(ip.src_addr, seg.src_port),
        dst: SocketAddr::new(ip.dst_addr, seg.dst_port),
        seq: seg.seq,
        ack: seg.ack,
        flags: seg.flags,
        window: seg.window,
        payload: seg.payload.to_vec(),
    })
}

pub fn parse_udp(packet: &[u8]) -> Option<(SocketAddr, SocketAddr, Vec<u8>)> {
    let ip = IpPacket::parse(packet).ok()?;
    let datagram = UdpDatagram::parse(ip.transport()).ok()?;
    Some((
        SocketAddr::new(ip.src_addr, datagram.src_port),
        SocketAddr::new(ip.dst_addr, datagram.dst_port),
        datagram.payload.to_vec(),
    ))
}

pub fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

pub fn tcp(client: &str, server: &str, flags: u8, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
    let fields = TcpFields {
        seq,
        ack,
        flags,
        window: 65535,
        mss: (flags & TCP_SYN != 0).then_some(1460),
        payload,
    };
    build_tcp_packet(client.parse().unwrap(), server.parse().unwrap(), &fields).unwrap()
}

pub fn tcp_with(client: &str, server: &str, fields: &TcpFields<'_>) -> Vec<u8> {
    build_tcp_packet(client.parse().unwrap(), server.parse().unwrap(), fields).unwrap()
}

pub fn syn(client: &str, server: &str, seq: u32) -> Vec<u8> {
    tcp(client, server, TCP_SYN, seq, 0, &[])
}

pub fn udp(client: &str, server: &str, payload: &[u8]) -> Vec<u8> {
    build_udp_packet(client.parse().unwrap(), server.parse().unwrap(), payload).unwrap()
}

/// Run a TCP handshake for `client -> server`, returning the I/O id and the
/// server's initial sequence number.
pub fn connect(
    engine: &mut Engine,
    driver: &RecordingDriver,
    backend: &RecordingBackend,
    client: &str,
    server: &str,
) -> (IoId, u32) {
    engine.input_packet(&syn(client, server, 1000));
    let io = backend.last_dial().io;
    engine.dial_completed(io, true);

    let syn_ack = driver
        .take_segments()
        .into_iter()
        .find(|s| s.has(TCP_SYN | TCP_ACK))
        .expect("no SYN-ACK sent");
    engine.input_packet(&tcp(client, server, TCP_ACK, 1001, syn_ack.seq.wrapping_add(1), &[]));
    (io, syn_ack.seq)
}
