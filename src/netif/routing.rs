//! Host routing table management for the TUN driver.
//!
//! Routes for intercepted destinations point into the TUN interface.
//! Excluded destinations are pinned to the default gateway that was active
//! before the tunnel came up. Changes are applied immediately, or queued
//! until [`RouteManager::commit`] when the driver defers them.

use std::net::IpAddr;
use std::process::Command;

use ipnet::IpNet;

use crate::error::{Error, Result};

/// A host route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub interface: String,
}

impl Route {
    pub fn via_interface(destination: IpNet, interface: &str) -> Self {
        Self {
            destination,
            gateway: None,
            interface: interface.to_string(),
        }
    }

    pub fn via_gateway(destination: IpNet, gateway: IpAddr, interface: &str) -> Self {
        Self {
            destination,
            gateway: Some(gateway),
            interface: interface.to_string(),
        }
    }
}

/// A routing table change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOp {
    Add(Route),
    Delete(Route),
}

impl RouteOp {
    /// Program and arguments that apply this change on the current platform.
    pub fn command(&self) -> Option<(&'static str, Vec<String>)> {
        #[cfg(target_os = "linux")]
        {
            Some(self.linux_command())
        }

        #[cfg(target_os = "macos")]
        {
            Some(self.macos_command())
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            None
        }
    }

    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    fn linux_command(&self) -> (&'static str, Vec<String>) {
        let (verb, route) = match self {
            RouteOp::Add(r) => ("add", r),
            RouteOp::Delete(r) => ("del", r),
        };
        let mut args = Vec::new();
        if route.destination.addr().is_ipv6() {
            args.push("-6".to_string());
        }
        args.extend(["route".to_string(), verb.to_string(), route.destination.to_string()]);
        if let Some(gw) = route.gateway {
            args.extend(["via".to_string(), gw.to_string()]);
        }
        args.extend(["dev".to_string(), route.interface.clone()]);
        ("ip", args)
    }

    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    fn macos_command(&self) -> (&'static str, Vec<String>) {
        let (verb, route) = match self {
            RouteOp::Add(r) => ("add", r),
            RouteOp::Delete(r) => ("delete", r),
        };
        let family = if route.destination.addr().is_ipv6() {
            "-inet6"
        } else {
            "-net"
        };
        let mut args = vec![
            "-n".to_string(),
            verb.to_string(),
            family.to_string(),
            route.destination.to_string(),
        ];
        match (self, route.gateway) {
            (RouteOp::Add(_), Some(gw)) => args.push(gw.to_string()),
            (RouteOp::Add(_), None) => args.extend(["-interface".to_string(), route.interface.clone()]),
            (RouteOp::Delete(_), _) => {}
        }
        ("route", args)
    }

    fn apply(&self) -> Result<()> {
        let (program, args) = self
            .command()
            .ok_or_else(|| Error::NotSupported("route management on this platform".into()))?;

        let output = Command::new(program).args(&args).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let benign = match self {
                RouteOp::Add(_) => stderr.contains("File exists"),
                RouteOp::Delete(_) => stderr.contains("No such process") || stderr.contains("not in table"),
            };
            if !benign {
                return Err(Error::Route(format!("{program} {}: {}", args.join(" "), stderr.trim())));
            }
        }
        tracing::debug!(op = ?self, "Applied route change");
        Ok(())
    }
}

/// Tracks and applies routes owned by one interface.
#[derive(Debug)]
pub struct RouteManager {
    interface: String,
    defer_commit: bool,
    installed: Vec<Route>,
    pending: Vec<RouteOp>,
    default_gateway: Option<(IpAddr, String)>,
}

impl RouteManager {
    pub fn new(interface: &str, defer_commit: bool) -> Self {
        Self {
            interface: interface.to_string(),
            defer_commit,
            installed: Vec::new(),
            pending: Vec::new(),
            default_gateway: None,
        }
    }

    /// Route `dest` into the interface.
    pub fn add(&mut self, dest: &IpNet) -> Result<()> {
        let route = Route::via_interface(dest.trunc(), &self.interface);
        if self.installed.contains(&route) {
            return Ok(());
        }
        self.submit(RouteOp::Add(route))
    }

    pub fn delete(&mut self, dest: &IpNet) -> Result<()> {
        let route = Route::via_interface(dest.trunc(), &self.interface);
        self.submit(RouteOp::Delete(route))
    }

    /// Pin `dest` to the host's original default gateway.
    pub fn exclude(&mut self, dest: IpAddr) -> Result<()> {
        let (gateway, interface) = match &self.default_gateway {
            Some(gw) => gw.clone(),
            None => {
                let gw = default_gateway()?
                    .ok_or_else(|| Error::Route("no default gateway to exclude routes through".into()))?;
                tracing::info!(gateway = %gw.0, interface = %gw.1, "Saved original default gateway");
                self.default_gateway = Some(gw.clone());
                gw
            }
        };
        let route = Route::via_gateway(IpNet::from(dest), gateway, &interface);
        if self.installed.contains(&route) {
            return Ok(());
        }
        self.submit(RouteOp::Add(route))
    }

    /// Apply every queued change.
    pub fn commit(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            tracing::debug!(changes = pending.len(), "Committing route changes");
        }
        let mut first_error = None;
        for op in pending {
            if let Err(e) = self.execute(op) {
                tracing::warn!(error = %e, "Route change failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Changes waiting for [`commit`](Self::commit).
    pub fn pending(&self) -> &[RouteOp] {
        &self.pending
    }

    pub fn installed(&self) -> &[Route] {
        &self.installed
    }

    /// Remove every installed route, newest first.
    pub fn teardown(&mut self) {
        self.pending.clear();
        while let Some(route) = self.installed.pop() {
            if let Err(e) = RouteOp::Delete(route.clone()).apply() {
                tracing::warn!(route = %route.destination, error = %e, "Failed to remove route");
            }
        }
    }

    fn submit(&mut self, op: RouteOp) -> Result<()> {
        if self.defer_commit {
            self.pending.push(op);
            return Ok(());
        }
        self.execute(op)
    }

    fn execute(&mut self, op: RouteOp) -> Result<()> {
        op.apply()?;
        match op {
            RouteOp::Add(route) => self.installed.push(route),
            RouteOp::Delete(route) => self.installed.retain(|r| r.destination != route.destination),
        }
        Ok(())
    }
}

impl Drop for RouteManager {
    fn drop(&mut self) {
        if !self.installed.is_empty() {
            self.teardown();
        }
    }
}

fn default_gateway() -> Result<Option<(IpAddr, String)>> {
    #[cfg(target_os = "linux")]
    {
        let output = Command::new("ip").args(["route", "show", "default"]).output()?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_linux_default(&String::from_utf8_lossy(&output.stdout)))
    }

    #[cfg(target_os = "macos")]
    {
        let output = Command::new("route").args(["-n", "get", "default"]).output()?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_macos_default(&String::from_utf8_lossy(&output.stdout)))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Ok(None)
    }
}

/// Parse `default via 192.168.1.1 dev eth0 ...`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_linux_default(output: &str) -> Option<(IpAddr, String)> {
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["default", "via", gw, "dev", dev, ..] => Some((gw.parse().ok()?, (*dev).to_string())),
            _ => None,
        }
    })
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_macos_default(output: &str) -> Option<(IpAddr, String)> {
    let mut gateway = None;
    let mut interface = None;
    for line in output.lines().map(str::trim) {
        if let Some(v) = line.strip_prefix("gateway:") {
            gateway = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("interface:") {
            interface = Some(v.trim().to_string());
        }
    }
    Some((gateway?, interface?))
}
