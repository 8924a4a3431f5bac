//! Packet-routing engine.
//!
//! The [`Engine`] owns everything on the packet path: the intercept
//! registry, the embedded stack, the protocol handlers, the I/O context
//! table and the interface driver. It is driven from a single thread;
//! other threads reach it through an [`EngineHandle`].
//!
//! ```text
//!              ┌──────────────── Engine ────────────────┐
//!   driver ──► │ IpStack ──► TcpHandler / UdpHandler ──►│──► backend dial / write
//!          ◄── │ outbox  ◄──      ▲         ▲           │◄── dial_completed / write / ack / close
//!              │           InterceptRegistry  IoTable   │
//!              └─────────────────────▲──────────────────┘
//!                                    │ EngineHandle::dispatch (any thread)
//! ```

mod dispatch;
mod stats;
mod timer;

pub use dispatch::{dispatch_default, EngineHandle, DEFAULT_LOOP_THREAD};
pub use stats::IpStats;

use std::net::IpAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ipnet::IpNet;
use tokio::sync::mpsc;

use crate::backend::{Callbacks, ConfigType, HostContext, IoContext, IoTable, TunnelCallbacks, WriteAck};
use crate::config::EngineConfig;
use crate::error::{Error, FatalError, Result};
use crate::intercept::{Intercept, InterceptRegistry};
use crate::netif::{local_networks, NetifDriver, NetifInput};
use crate::stack::{IpStack, ProtocolHandler, StackContext, TcpHandler, UdpHandler};
use crate::types::{BackendHandle, IoId, Protocol};
use dispatch::EngineTask;
use timer::StackTimer;

/// Smallest read buffer used for interface input.
const MIN_READ_BUFFER: usize = 2048;

/// Borrow the handler-facing parts of the engine side by side.
macro_rules! stack_context {
    ($engine:ident, $now:expr) => {
        StackContext {
            intercepts: &mut $engine.registry,
            ios: &mut $engine.ios,
            callbacks: &$engine.callbacks,
            pools: &mut $engine.stack.pools,
            outbox: &mut $engine.stack.outbox,
            mtu: $engine.config.mtu,
            verify_checksums: $engine.config.verify_checksums,
            now: $now,
        }
    };
}

/// The intercept and packet-routing engine.
pub struct Engine {
    config: EngineConfig,
    callbacks: Callbacks,
    driver: Option<Box<dyn NetifDriver>>,
    stack: IpStack,
    registry: InterceptRegistry,
    ios: IoTable,
    tcp: TcpHandler,
    udp: UdpHandler,
    timer: StackTimer,
    input: Option<NetifInput>,
    mailbox: Option<mpsc::UnboundedReceiver<EngineTask>>,
    handle: EngineHandle,
    running: bool,
}

impl Engine {
    /// Bring up an engine on `driver`.
    ///
    /// Every failure here is [`Error::Fatal`].
    pub fn new(config: EngineConfig, callbacks: TunnelCallbacks, driver: Box<dyn NetifDriver>) -> Result<Self> {
        Self::init(config, callbacks, Some(driver))
    }

    /// Bring up an engine without an interface. Only hosting works;
    /// [`intercept`](Self::intercept) fails with [`Error::NotInitialized`].
    pub fn host_only(config: EngineConfig, callbacks: TunnelCallbacks) -> Result<Self> {
        Self::init(config, callbacks, None)
    }

    fn init(config: EngineConfig, callbacks: TunnelCallbacks, mut driver: Option<Box<dyn NetifDriver>>) -> Result<Self> {
        let callbacks = callbacks.validate()?;

        config
            .validate()
            .map_err(|e| FatalError::StackInit(e.to_string()))?;
        let mut stack = IpStack::new(&config)?;

        let mut input = None;
        if let Some(driver) = driver.as_mut() {
            stack.attach_netif(driver.name())?;
            stack.set_up();
            stack.set_link_up();

            input = NetifInput::open(&mut **driver, config.packet_queue)
                .map_err(|e| FatalError::InputSetup(e.to_string()))?;
            if input.is_none() {
                tracing::info!(netif = driver.name(), "Interface offers no packet input, running without one");
            }
        }

        for protocol in Protocol::ALL {
            stack.register_raw(protocol.ip_number(), protocol)?;
        }

        let (handle, mailbox) = EngineHandle::new();
        tracing::info!(
            netif = driver.as_ref().map_or("none", |d| d.name()),
            mtu = config.mtu,
            "Engine initialized"
        );

        Ok(Self {
            tcp: TcpHandler::new(config.tcp.clone()),
            udp: UdpHandler::new(config.udp.clone()),
            config,
            callbacks,
            driver,
            stack,
            registry: InterceptRegistry::new(),
            ios: IoTable::default(),
            timer: StackTimer::default(),
            input,
            mailbox: Some(mailbox),
            handle,
            running: true,
        })
    }

    /// Handle for dispatching work onto this engine's loop.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether [`shutdown`](Self::shutdown) has not been called.
    pub fn is_running(&self) -> bool {
        self.running
    }

    // ---- intercept registry ----

    /// Start intercepting traffic covered by `rule`.
    ///
    /// Routes are added for every CIDR address of the rule. If one fails,
    /// routes already added for the rule are removed and the registry is
    /// left unchanged.
    pub fn intercept(&mut self, rule: Intercept) -> Result<()> {
        let Some(driver) = self.driver.as_mut() else {
            return Err(Error::NotInitialized(format!(
                "cannot intercept {} without a network interface",
                rule.service_name()
            )));
        };
        self.registry.invalidate();

        let mut added: Vec<IpNet> = Vec::new();
        for net in rule.addresses().iter().filter_map(|a| a.as_cidr()) {
            if let Err(e) = driver.add_route(net) {
                tracing::warn!(service = rule.service_name(), route = %net, error = %e, "Failed to add route");
                for done in added.iter().rev() {
                    if let Err(e) = driver.delete_route(done) {
                        tracing::warn!(route = %done, error = %e, "Failed to roll back route");
                    }
                }
                return Err(e);
            }
            added.push(*net);
        }

        for protocol in rule.protocols() {
            for address in rule.addresses() {
                for range in rule.port_ranges() {
                    tracing::debug!(service = rule.service_name(), "Intercepting {protocol}:{address}:{range}");
                }
            }
        }
        tracing::info!(
            service = rule.service_name(),
            handle = %rule.backend_handle(),
            routes = added.len(),
            "Intercepting service"
        );

        self.registry.insert(rule);
        Ok(())
    }

    /// Stop intercepting for `handle`, closing its live connections.
    ///
    /// A handle without a rule is not an error: its connections, if any,
    /// are still closed.
    pub fn stop_intercepting(&mut self, handle: BackendHandle) {
        self.registry.invalidate();
        let rule = self.registry.remove(handle);
        if rule.is_none() {
            tracing::debug!(%handle, "No intercept for backend handle, closing active connections only");
        }

        self.kill_active(handle);

        let Some(rule) = rule else { return };
        tracing::info!(service = rule.service_name(), %handle, "Stopped intercepting service");
        if let Some(driver) = self.driver.as_mut() {
            for net in rule.addresses().iter().filter_map(|a| a.as_cidr()) {
                if let Err(e) = driver.delete_route(net) {
                    tracing::warn!(route = %net, error = %e, "Failed to delete route");
                }
            }
        }
    }

    pub fn find_intercept(&self, handle: BackendHandle) -> Option<&Intercept> {
        self.registry.find_by_handle(handle)
    }

    /// Active rules in lookup order, newest first.
    pub fn intercepts(&self) -> impl Iterator<Item = &Intercept> {
        self.registry.iter()
    }

    /// Remove every rule and close all intercepted connections. Routes are
    /// left for the caller to tear down with the interface.
    pub fn shutdown(&mut self) {
        tracing::info!(intercepts = self.registry.len(), "Shutting down engine");
        while let Some(rule) = self.registry.pop() {
            tracing::debug!(service = rule.service_name(), "Removing intercept");
            self.kill_active(rule.backend_handle());
        }
        self.running = false;
    }

    /// Close every live connection matched to `handle`, TCP first.
    pub fn kill_active(&mut self, handle: BackendHandle) {
        let now = Instant::now();
        for protocol in Protocol::ALL {
            let active = self.handler(protocol).active_connections(handle);
            for io in active {
                if let Some(ctx) = self.ios.get(io) {
                    if let Some(conn) = ctx.backend_conn() {
                        tracing::debug!(%io, service = ctx.service_name(), client = ctx.client_address(), "Closing active connection");
                        let close = Arc::clone(&ctx.callbacks.close);
                        close(conn);
                    }
                }
                self.with_handler(protocol, now, |h, ctx| h.abort(ctx, io));
                self.ios.remove(io);
            }
        }
        self.on_stack_timer(now);
        self.flush();
    }

    // ---- backend adapter ----

    /// The backend finished dialing for `io`.
    pub fn dial_completed(&mut self, io: IoId, ok: bool) {
        let Some(ctx) = self.ios.get(io) else {
            tracing::error!(%io, "Dial completed for unknown connection");
            return;
        };
        let protocol = ctx.protocol();
        tracing::debug!(
            %io,
            client = ctx.client_address(),
            intercepted = ctx.intercepted_address(),
            "Dial {}",
            if ok { "succeeded" } else { "failed" }
        );

        let now = Instant::now();
        self.with_handler(protocol, now, |h, ctx| h.dial_completed(ctx, io, ok));
        self.after(protocol, now);
    }

    /// Send backend bytes to the client of `io`. Returns how many bytes
    /// were accepted.
    pub fn write(&mut self, io: IoId, data: &[u8]) -> Result<usize> {
        let protocol = self.protocol_of(io)?;
        let now = Instant::now();
        let result = self.with_handler(protocol, now, |h, ctx| h.write(ctx, io, data));
        self.after(protocol, now);
        result
    }

    /// The backend connection for `io` is gone. Releases the I/O context.
    pub fn close(&mut self, io: IoId) {
        let Some(ctx) = self.ios.get(io) else {
            tracing::debug!(%io, "Close for unknown connection");
            return;
        };
        let protocol = ctx.protocol();
        tracing::debug!(%io, client = ctx.client_address(), "Backend closed connection");

        let now = Instant::now();
        self.with_handler(protocol, now, |h, ctx| h.close(ctx, io));
        self.ios.remove(io);
        self.after(protocol, now);
    }

    /// The backend will send no more data on `io`. A no-op for UDP.
    pub fn close_write(&mut self, io: IoId) -> Result<()> {
        let protocol = self.protocol_of(io)?;
        let now = Instant::now();
        let result = self.with_handler(protocol, now, |h, ctx| h.close_write(ctx, io));
        self.after(protocol, now);
        result
    }

    /// Complete a write previously handed to the backend.
    pub fn ack(&mut self, ack: WriteAck) {
        let Some(pending) = ack.resolve() else { return };
        if !self.ios.contains(pending.io) {
            tracing::debug!(io = %pending.io, "Acknowledgement for closed connection");
            return;
        }

        let now = Instant::now();
        self.with_handler(pending.protocol, now, |h, ctx| h.write_acked(ctx, pending.io, pending.len));
        self.after(pending.protocol, now);
    }

    /// Change the inactivity timeout of `io`.
    pub fn set_idle_timeout(&mut self, io: IoId, timeout: Duration) -> Result<()> {
        let ctx = self.ios.get_mut(io).ok_or(Error::UnknownConnection(io))?;
        ctx.set_idle_timeout(timeout);
        Ok(())
    }

    /// Ask the backend to host `service`. `config` is passed through untouched.
    pub fn host(
        &self,
        handle: BackendHandle,
        service: &str,
        config_type: ConfigType,
        config: &serde_json::Value,
    ) -> Option<HostContext> {
        tracing::info!(%handle, service, ?config_type, "Hosting service");
        let context = (self.callbacks.host)(handle, service, config_type, config);
        if context.is_none() {
            tracing::warn!(%handle, service, "Backend declined to host service");
        }
        context
    }

    pub fn io_context(&self, io: IoId) -> Option<&IoContext> {
        self.ios.get(io)
    }

    pub fn client_address(&self, io: IoId) -> Option<&str> {
        self.ios.get(io).map(IoContext::client_address)
    }

    pub fn intercepted_address(&self, io: IoId) -> Option<&str> {
        self.ios.get(io).map(IoContext::intercepted_address)
    }

    // ---- packet path ----

    /// Feed one inbound IP packet from the interface.
    pub fn input_packet(&mut self, data: &[u8]) {
        let now = Instant::now();
        let Some((protocol, packet)) = self.stack.input(data) else {
            return;
        };

        let claimed = self.with_handler(protocol, now, |h, ctx| h.input(ctx, &packet));
        if !claimed {
            tracing::trace!(%protocol, dst = %packet.dst_addr, "Packet not intercepted");
            self.stack.record_drop();
        }
        self.after(protocol, now);
    }

    /// Run stack and idle timers due at `now`.
    pub fn process_timeouts(&mut self, now: Instant) {
        if self.timer.is_due(now) {
            self.on_stack_timer(now);
        }
        for io in self.ios.expired(now) {
            self.expire_idle(io, now);
        }
        self.flush();
    }

    // ---- routes ----

    /// Apply route changes the driver has queued.
    pub fn commit_routes(&mut self) -> Result<()> {
        match self.driver.as_mut() {
            Some(driver) => driver.commit_routes(),
            None => Ok(()),
        }
    }

    /// Exclude already resolved addresses of `dest` from interception.
    /// Addresses on a local IPv4 network are skipped.
    pub fn exclude_resolved(&mut self, dest: &str, addrs: &[IpAddr]) {
        let Some(driver) = self.driver.as_mut() else {
            tracing::info!(dest, "No network interface, skipping route exclusion");
            return;
        };
        if !driver.supports_route_exclusion() {
            tracing::info!(dest, netif = driver.name(), "Interface cannot exclude routes, skipping");
            return;
        }

        let local = local_networks().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to list local networks");
            Vec::new()
        });

        for ip in addrs {
            match ip {
                IpAddr::V4(_) => {
                    if let Some(network) = local.iter().find(|n| n.contains(ip)) {
                        tracing::debug!(dest, %ip, interface = %network.name, "Address is on a local network, not excluding");
                        continue;
                    }
                }
                IpAddr::V6(_) => {
                    tracing::trace!(dest, %ip, "Local network check not implemented for IPv6");
                }
            }

            match driver.exclude_route(*ip) {
                Ok(()) => tracing::info!(dest, %ip, "Excluded route"),
                Err(e) => tracing::warn!(dest, %ip, error = %e, "Failed to exclude route"),
            }
        }
    }

    // ---- statistics ----

    pub fn ip_stats(&self) -> IpStats {
        let mut connections = self.tcp.snapshots();
        connections.extend(self.udp.snapshots());
        IpStats {
            pools: self.stack.pools.stats(),
            connections,
            counters: self.stack.counters(),
            intercepts: self.registry.len(),
            io_contexts: self.ios.len(),
        }
    }

    // ---- loop ----

    /// Run the engine loop until [`EngineHandle::stop`] or
    /// [`shutdown`](Self::shutdown) is called.
    pub async fn run(mut self) -> Result<()> {
        let mut mailbox = self
            .mailbox
            .take()
            .ok_or_else(|| Error::Internal("engine loop already ran".into()))?;
        let mut input = self.input.take();
        let mut buf = vec![0u8; usize::from(self.config.mtu).max(MIN_READ_BUFFER)];

        tracing::info!(netif = self.driver.as_ref().map_or("none", |d| d.name()), "Engine loop started");

        while self.running {
            let stack_deadline = self.timer.deadline();
            let idle_deadline = self.ios.next_deadline();

            tokio::select! {
                task = mailbox.recv() => match task {
                    Some(task) => task(&mut self),
                    None => break,
                },
                result = recv_packet(&mut input, &mut buf) => match result {
                    Ok(Some(len)) => self.input_packet(&buf[..len]),
                    Ok(None) => {
                        tracing::info!("Interface input closed");
                        input = None;
                    }
                    Err(e) => tracing::debug!(error = %e, "Interface read error"),
                },
                _ = sleep_until(stack_deadline) => self.process_timeouts(Instant::now()),
                _ = sleep_until(idle_deadline) => self.process_timeouts(Instant::now()),
            }
        }

        self.handle.close();
        while let Ok(task) = mailbox.try_recv() {
            task(&mut self);
        }
        tracing::info!("Engine loop stopped");
        Ok(())
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> Result<EngineThread> {
        let handle = self.handle();
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let join = std::thread::Builder::new()
            .name("tunnelgate-engine".to_string())
            .spawn(move || runtime.block_on(self.run()))?;
        Ok(EngineThread { handle, join })
    }

    // ---- internals ----

    fn handler(&self, protocol: Protocol) -> &dyn ProtocolHandler {
        match protocol {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
        }
    }

    fn with_handler<R>(
        &mut self,
        protocol: Protocol,
        now: Instant,
        f: impl FnOnce(&mut dyn ProtocolHandler, &mut StackContext<'_>) -> R,
    ) -> R {
        let mut ctx = stack_context!(self, now);
        let handler: &mut dyn ProtocolHandler = match protocol {
            Protocol::Tcp => &mut self.tcp,
            Protocol::Udp => &mut self.udp,
        };
        f(handler, &mut ctx)
    }

    fn protocol_of(&self, io: IoId) -> Result<Protocol> {
        self.ios
            .get(io)
            .map(IoContext::protocol)
            .ok_or(Error::UnknownConnection(io))
    }

    fn after(&mut self, protocol: Protocol, now: Instant) {
        if protocol == Protocol::Tcp {
            self.on_stack_timer(now);
        }
        self.flush();
    }

    /// Run TCP timeouts and keep the timer running only while TCP has
    /// connections.
    fn on_stack_timer(&mut self, now: Instant) {
        if !self.timer.is_active() {
            self.tcp.restart_timeouts(now);
        }
        let mut ctx = stack_context!(self, now);
        self.tcp.check_timeouts(&mut ctx);

        if self.tcp.has_pcbs() {
            self.timer.schedule(now + self.tcp.sleep_time(now));
        } else {
            self.timer.stop();
        }
    }

    fn expire_idle(&mut self, io: IoId, now: Instant) {
        let Some(ctx) = self.ios.get(io) else { return };
        let protocol = ctx.protocol();
        tracing::debug!(%io, client = ctx.client_address(), idle = ?ctx.idle_timeout(), "Connection idle, closing");
        if let Some(conn) = ctx.backend_conn() {
            let close = Arc::clone(&ctx.callbacks.close);
            close(conn);
        }

        self.with_handler(protocol, now, |h, ctx| h.close(ctx, io));
        self.ios.remove(io);
    }

    /// Hand queued outbound packets to the driver.
    fn flush(&mut self) {
        let packets = self.stack.drain_outbox();
        let Some(driver) = self.driver.as_mut() else {
            if !packets.is_empty() {
                tracing::trace!(packets = packets.len(), "No interface, dropping outbound packets");
            }
            return;
        };
        for packet in packets {
            if let Err(e) = driver.write_packet(&packet) {
                tracing::debug!(error = %e, "Failed to write packet to interface");
                self.stack.record_drop();
            }
        }
    }
}

async fn recv_packet(input: &mut Option<NetifInput>, buf: &mut Vec<u8>) -> std::io::Result<Option<usize>> {
    match input {
        Some(input) => input.recv(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// An engine loop running on its own thread.
pub struct EngineThread {
    handle: EngineHandle,
    join: JoinHandle<Result<()>>,
}

impl EngineThread {
    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    /// Shut the engine down and wait for its thread.
    pub fn stop(self) -> Result<()> {
        self.handle.stop();
        self.join()
    }

    pub fn join(self) -> Result<()> {
        self.join
            .join()
            .map_err(|_| Error::Internal("engine thread panicked".into()))?
    }
}
