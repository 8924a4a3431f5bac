//! Network interface drivers.
//!
//! A [`NetifDriver`] connects the engine to the host: it delivers client IP
//! packets, accepts packets the engine sends back and manages the host
//! routes that steer intercepted destinations into the interface.
//!
//! Packet input works in one of two modes:
//!
//! - **push**: the driver is handed a [`PacketSink`] in
//!   [`NetifDriver::setup`] and pushes packets from its own thread.
//! - **poll**: the driver returns a [`PacketReader`] the engine loop awaits.
//!
//! A driver offering neither leaves the engine without packet input, which
//! is valid for hosting-only use.

mod local;
mod routing;
mod tun;

pub use local::{local_networks, LocalNetwork};
pub use routing::{Route, RouteManager, RouteOp};
pub use tun::{TunConfig, TunDriver};

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Host interface used by the engine.
pub trait NetifDriver: Send {
    /// Interface name.
    fn name(&self) -> &str;

    /// Prepare push-mode input. Returns `Ok(true)` if the driver will push
    /// packets into `sink`, `Ok(false)` if it does not support push mode.
    fn setup(&mut self, _sink: PacketSink) -> Result<bool> {
        Ok(false)
    }

    /// Poll-mode input, taken once when the engine starts.
    fn reader(&mut self) -> Option<Box<dyn PacketReader>> {
        None
    }

    /// Deliver an outbound packet to the host.
    fn write_packet(&mut self, packet: &[u8]) -> Result<()>;

    /// Route `dest` into the interface.
    fn add_route(&mut self, dest: &IpNet) -> Result<()>;

    fn delete_route(&mut self, dest: &IpNet) -> Result<()>;

    /// Whether [`exclude_route`](Self::exclude_route) is available.
    fn supports_route_exclusion(&self) -> bool {
        false
    }

    /// Keep traffic for `dest` on the host's original path.
    fn exclude_route(&mut self, dest: IpAddr) -> Result<()> {
        Err(Error::NotSupported(format!(
            "route exclusion for {dest} on {}",
            self.name()
        )))
    }

    /// Apply route changes queued by a driver that defers them.
    fn commit_routes(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Async packet source for poll-mode drivers.
#[async_trait]
pub trait PacketReader: Send {
    /// Read one packet into `buf`, returning its length. `Ok(0)` means the
    /// interface is gone.
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Thread-safe entry point for push-mode drivers.
#[derive(Debug, Clone)]
pub struct PacketSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl PacketSink {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a packet for the engine. Returns `false` if it was dropped
    /// because the queue is full or the engine has stopped.
    pub fn push(&self, packet: Vec<u8>) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!("Packet queue full, dropping inbound packet");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// How the engine receives packets from its driver.
pub(crate) enum NetifInput {
    Push(mpsc::Receiver<Vec<u8>>),
    Poll(Box<dyn PacketReader>),
}

impl NetifInput {
    /// Pick the input mode a driver supports, preferring push. `None` when
    /// the driver offers neither.
    pub(crate) fn open(driver: &mut dyn NetifDriver, queue: usize) -> Result<Option<Self>> {
        let (sink, rx) = PacketSink::channel(queue);
        if driver.setup(sink)? {
            return Ok(Some(NetifInput::Push(rx)));
        }
        Ok(driver.reader().map(NetifInput::Poll))
    }

    /// Wait for the next inbound packet and copy it into `buf`, growing it
    /// for pushed packets that do not fit. `Ok(None)` means the input is
    /// closed for good.
    pub(crate) async fn recv(&mut self, buf: &mut Vec<u8>) -> io::Result<Option<usize>> {
        match self {
            NetifInput::Push(rx) => Ok(rx.recv().await.map(|packet| {
                if packet.len() > buf.len() {
                    tracing::trace!(len = packet.len(), buffer = buf.len(), "Growing read buffer for oversize packet");
                    buf.resize(packet.len(), 0);
                }
                buf[..packet.len()].copy_from_slice(&packet);
                packet.len()
            })),
            NetifInput::Poll(reader) => reader
                .read_packet(buf.as_mut_slice())
                .await
                .map(|len| (len > 0).then_some(len)),
        }
    }
}
