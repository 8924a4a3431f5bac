//! Tunnel backend adapter types.
//!
//! The tunnel backend supplies five callbacks when an engine is created:
//! `dial`, `write`, `close`, `close_write` and `host`. The engine calls them
//! from its loop thread; a backend that needs to call back into the engine
//! (`dial_completed`, `write`, `ack`, `close`) marshals through
//! [`EngineHandle::dispatch`](crate::engine::EngineHandle::dispatch).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{FatalError, Result};
use crate::types::{BackendConn, BackendHandle, IoId, Protocol};

/// Opens a backend connection for a newly intercepted flow. `None` refuses it.
pub type DialFn = Arc<dyn Fn(&DialRequest<'_>) -> Option<BackendConn> + Send + Sync>;

/// Delivers client bytes to the backend. The backend resolves the
/// acknowledgement with [`Engine::ack`](crate::engine::Engine::ack) once the
/// bytes are written.
pub type WriteFn = Arc<dyn Fn(BackendConn, &[u8], WriteAck) -> Result<usize> + Send + Sync>;

/// Closes (or half-closes) a backend connection.
pub type CloseFn = Arc<dyn Fn(BackendConn) + Send + Sync>;

/// Starts hosting a service.
pub type HostFn =
    Arc<dyn Fn(BackendHandle, &str, ConfigType, &serde_json::Value) -> Option<HostContext> + Send + Sync>;

/// Backend-owned state returned from `host`.
pub type HostContext = Box<dyn Any + Send>;

/// Kind of hosting configuration passed through to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigType {
    #[serde(rename = "host.v1")]
    HostV1,
    #[serde(rename = "tunneler-server.v1")]
    ServerV1,
}

/// Callback set supplied by the tunnel backend.
#[derive(Clone, Default)]
pub struct TunnelCallbacks {
    dial: Option<DialFn>,
    write: Option<WriteFn>,
    close: Option<CloseFn>,
    close_write: Option<CloseFn>,
    host: Option<HostFn>,
}

impl TunnelCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_dial<F>(mut self, f: F) -> Self
    where
        F: Fn(&DialRequest<'_>) -> Option<BackendConn> + Send + Sync + 'static,
    {
        self.dial = Some(Arc::new(f));
        self
    }

    pub fn on_write<F>(mut self, f: F) -> Self
    where
        F: Fn(BackendConn, &[u8], WriteAck) -> Result<usize> + Send + Sync + 'static,
    {
        self.write = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(BackendConn) + Send + Sync + 'static,
    {
        self.close = Some(Arc::new(f));
        self
    }

    pub fn on_close_write<F>(mut self, f: F) -> Self
    where
        F: Fn(BackendConn) + Send + Sync + 'static,
    {
        self.close_write = Some(Arc::new(f));
        self
    }

    pub fn on_host<F>(mut self, f: F) -> Self
    where
        F: Fn(BackendHandle, &str, ConfigType, &serde_json::Value) -> Option<HostContext>
            + Send
            + Sync
            + 'static,
    {
        self.host = Some(Arc::new(f));
        self
    }

    /// Check that every callback is present.
    pub(crate) fn validate(self) -> std::result::Result<Callbacks, FatalError> {
        Ok(Callbacks {
            dial: self.dial.ok_or(FatalError::MissingCallback("dial"))?,
            write: self.write.ok_or(FatalError::MissingCallback("write"))?,
            close: self.close.ok_or(FatalError::MissingCallback("close"))?,
            close_write: self
                .close_write
                .ok_or(FatalError::MissingCallback("close_write"))?,
            host: self.host.ok_or(FatalError::MissingCallback("host"))?,
        })
    }
}

impl fmt::Debug for TunnelCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelCallbacks")
            .field("dial", &self.dial.is_some())
            .field("write", &self.write.is_some())
            .field("close", &self.close.is_some())
            .field("close_write", &self.close_write.is_some())
            .field("host", &self.host.is_some())
            .finish()
    }
}

/// Per-rule replacements for the connection callbacks. Unset entries fall
/// back to the engine-wide callbacks.
#[derive(Clone, Default)]
pub struct CallbackOverrides {
    dial: Option<DialFn>,
    write: Option<WriteFn>,
    close_write: Option<CloseFn>,
    close: Option<CloseFn>,
}

impl CallbackOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dial<F>(mut self, f: F) -> Self
    where
        F: Fn(&DialRequest<'_>) -> Option<BackendConn> + Send + Sync + 'static,
    {
        self.dial = Some(Arc::new(f));
        self
    }

    pub fn write<F>(mut self, f: F) -> Self
    where
        F: Fn(BackendConn, &[u8], WriteAck) -> Result<usize> + Send + Sync + 'static,
    {
        self.write = Some(Arc::new(f));
        self
    }

    pub fn close_write<F>(mut self, f: F) -> Self
    where
        F: Fn(BackendConn) + Send + Sync + 'static,
    {
        self.close_write = Some(Arc::new(f));
        self
    }

    pub fn close<F>(mut self, f: F) -> Self
    where
        F: Fn(BackendConn) + Send + Sync + 'static,
    {
        self.close = Some(Arc::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.dial.is_none() && self.write.is_none() && self.close_write.is_none() && self.close.is_none()
    }
}

/// Validated engine-wide callbacks.
#[derive(Clone)]
pub(crate) struct Callbacks {
    pub(crate) dial: DialFn,
    pub(crate) write: WriteFn,
    pub(crate) close: CloseFn,
    pub(crate) close_write: CloseFn,
    pub(crate) host: HostFn,
}

impl Callbacks {
    /// Merge a rule's overrides over the engine-wide set.
    pub(crate) fn resolve(&self, overrides: &CallbackOverrides) -> ConnCallbacks {
        ConnCallbacks {
            dial: overrides.dial.clone().unwrap_or_else(|| Arc::clone(&self.dial)),
            write: overrides.write.clone().unwrap_or_else(|| Arc::clone(&self.write)),
            close_write: overrides
                .close_write
                .clone()
                .unwrap_or_else(|| Arc::clone(&self.close_write)),
            close: overrides.close.clone().unwrap_or_else(|| Arc::clone(&self.close)),
        }
    }
}

/// Callbacks bound to a single connection.
#[derive(Clone)]
pub(crate) struct ConnCallbacks {
    pub(crate) dial: DialFn,
    pub(crate) write: WriteFn,
    pub(crate) close_write: CloseFn,
    pub(crate) close: CloseFn,
}

/// Everything the backend needs to open a connection for an intercepted flow.
#[derive(Debug, Clone)]
pub struct DialRequest<'a> {
    pub io: IoId,
    pub intercept: BackendHandle,
    pub service_name: &'a str,
    pub protocol: Protocol,
    pub client: SocketAddr,
    pub intercepted: SocketAddr,
}

impl DialRequest<'_> {
    /// Source/destination metadata in the shape hosting peers expect.
    pub fn app_data(&self) -> serde_json::Value {
        serde_json::json!({
            "dst_protocol": self.protocol.as_str(),
            "dst_ip": self.intercepted.ip().to_string(),
            "dst_port": self.intercepted.port().to_string(),
            "src_protocol": self.protocol.as_str(),
            "src_ip": self.client.ip().to_string(),
            "src_port": self.client.port().to_string(),
        })
    }
}

/// One-shot acknowledgement for bytes handed to the backend.
///
/// The token is neither `Clone` nor `Copy`; [`Engine::ack`](crate::engine::Engine::ack)
/// consumes it, so a write can be acknowledged at most once.
#[must_use = "write acknowledgements must be passed back to Engine::ack"]
pub struct WriteAck {
    pending: Option<PendingAck>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingAck {
    pub(crate) protocol: Protocol,
    pub(crate) io: IoId,
    pub(crate) len: usize,
}

impl WriteAck {
    pub(crate) fn new(protocol: Protocol, io: IoId, len: usize) -> Self {
        Self {
            pending: Some(PendingAck { protocol, io, len }),
        }
    }

    /// Connection the acknowledged bytes belong to.
    pub fn io(&self) -> Option<IoId> {
        self.pending.map(|p| p.io)
    }

    /// Number of bytes covered by this acknowledgement.
    pub fn len(&self) -> usize {
        self.pending.map_or(0, |p| p.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn resolve(mut self) -> Option<PendingAck> {
        self.pending.take()
    }
}

impl fmt::Debug for WriteAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteAck").field("pending", &self.pending).finish()
    }
}

impl Drop for WriteAck {
    fn drop(&mut self) {
        if let Some(p) = self.pending {
            tracing::warn!(io = %p.io, len = p.len, "Write acknowledgement dropped without completion");
        }
    }
}

/// Engine record of one live tunneled connection.
pub struct IoContext {
    id: IoId,
    protocol: Protocol,
    intercept: BackendHandle,
    service_name: String,
    backend_conn: Option<BackendConn>,
    client: SocketAddr,
    intercepted: SocketAddr,
    client_addr: String,
    intercepted_addr: String,
    idle_timeout: Duration,
    last_activity: Instant,
    timer: Option<Instant>,
    pub(crate) callbacks: ConnCallbacks,
}

impl IoContext {
    pub fn id(&self) -> IoId {
        self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Backend handle of the rule this connection matched.
    pub fn intercept(&self) -> BackendHandle {
        self.intercept
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn backend_conn(&self) -> Option<BackendConn> {
        self.backend_conn
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn intercepted(&self) -> SocketAddr {
        self.intercepted
    }

    /// Client address as `proto:ip:port`.
    pub fn client_address(&self) -> &str {
        &self.client_addr
    }

    /// Intercepted address as `proto:ip:port`.
    pub fn intercepted_address(&self) -> &str {
        &self.intercepted_addr
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Deadline of the idle timer, when armed.
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.timer
    }

    pub(crate) fn set_backend_conn(&mut self, conn: BackendConn) {
        self.backend_conn = Some(conn);
    }

    pub(crate) fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
        if self.timer.is_some() {
            self.timer = Some(self.last_activity + timeout);
        }
    }

    /// Record activity, pushing the idle deadline out if it is armed.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
        if self.timer.is_some() {
            self.timer = Some(now + self.idle_timeout);
        }
    }

    pub(crate) fn arm_idle_timer(&mut self, now: Instant) {
        self.last_activity = now;
        self.timer = Some(now + self.idle_timeout);
    }
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("intercept", &self.intercept)
            .field("service_name", &self.service_name)
            .field("backend_conn", &self.backend_conn)
            .field("client", &self.client_addr)
            .field("intercepted", &self.intercepted_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

/// Parameters for a new I/O context.
pub(crate) struct NewIo {
    pub(crate) protocol: Protocol,
    pub(crate) intercept: BackendHandle,
    pub(crate) service_name: String,
    pub(crate) client: SocketAddr,
    pub(crate) intercepted: SocketAddr,
    pub(crate) idle_timeout: Duration,
    pub(crate) callbacks: ConnCallbacks,
}

/// Live I/O contexts keyed by never-reused ids.
pub(crate) struct IoTable {
    entries: HashMap<IoId, IoContext>,
    next: u64,
}

impl Default for IoTable {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next: 1,
        }
    }
}

impl IoTable {
    pub(crate) fn insert(&mut self, new: NewIo, now: Instant) -> IoId {
        let id = IoId::new(NonZeroU64::new(self.next).unwrap_or(NonZeroU64::MIN));
        self.next += 1;
        let ctx = IoContext {
            id,
            protocol: new.protocol,
            intercept: new.intercept,
            service_name: new.service_name,
            backend_conn: None,
            client_addr: format!("{}:{}", new.protocol, new.client),
            intercepted_addr: format!("{}:{}", new.protocol, new.intercepted),
            client: new.client,
            intercepted: new.intercepted,
            idle_timeout: new.idle_timeout,
            last_activity: now,
            timer: None,
            callbacks: new.callbacks,
        };
        self.entries.insert(id, ctx);
        id
    }

    pub(crate) fn get(&self, id: IoId) -> Option<&IoContext> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: IoId) -> Option<&mut IoContext> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: IoId) -> Option<IoContext> {
        self.entries.remove(&id)
    }

    pub(crate) fn contains(&self, id: IoId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn touch(&mut self, id: IoId, now: Instant) {
        if let Some(ctx) = self.entries.get_mut(&id) {
            ctx.touch(now);
        }
    }

    /// Earliest armed idle deadline.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|c| c.timer).min()
    }

    /// Contexts whose idle deadline has passed.
    pub(crate) fn expired(&self, now: Instant) -> Vec<IoId> {
        let mut ids: Vec<IoId> = self
            .entries
            .values()
            .filter(|c| c.timer.is_some_and(|t| t <= now))
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}
