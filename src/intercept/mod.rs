//! Interception rules.
//!
//! An [`Intercept`] maps a set of protocols, addresses and port ranges to a
//! tunnel service. Rules are assembled with the builder methods below and then
//! handed to [`Engine::intercept`](crate::engine::Engine::intercept), which
//! installs routes and makes the rule visible to the protocol handlers.
//!
//! ```rust
//! use tunnelgate::intercept::Intercept;
//! use tunnelgate::BackendHandle;
//!
//! let mut rule = Intercept::new("web", BackendHandle(1));
//! rule.add_protocol("tcp");
//! rule.add_address("10.0.0.1").unwrap();
//! let range = rule.add_port_range(443, 80);
//! assert_eq!(range.to_string(), "[80-443]");
//! ```

mod registry;

pub use registry::InterceptRegistry;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::backend::CallbackOverrides;
use crate::error::{Error, Result};
use crate::types::{BackendHandle, Protocol};

/// Predicate consulted when none of a rule's CIDR addresses contain the
/// destination, e.g. for hostnames resolved to addresses by a DNS layer.
pub type MatchAddrFn = Arc<dyn Fn(&IpAddr, BackendHandle) -> bool + Send + Sync>;

/// Structured form of an intercept address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Cidr(IpNet),
    Hostname(String),
}

/// An intercept address, kept in structured and printable form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterceptAddress {
    kind: AddressKind,
    display: String,
}

impl InterceptAddress {
    /// Address covering a CIDR block.
    pub fn cidr(net: IpNet) -> Self {
        Self {
            display: net.to_string(),
            kind: AddressKind::Cidr(net),
        }
    }

    /// Address naming a host (wildcards such as `*.example.com` allowed).
    pub fn hostname(name: &str) -> Result<Self> {
        let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
        let valid = !name.is_empty()
            && name.len() <= 253
            && name
                .split('.')
                .enumerate()
                .all(|(i, label)| valid_label(label, i == 0));
        if !valid {
            return Err(Error::InvalidAddress(name));
        }
        Ok(Self {
            display: name.clone(),
            kind: AddressKind::Hostname(name),
        })
    }

    pub fn kind(&self) -> &AddressKind {
        &self.kind
    }

    /// Printable form, as used for route commands and logs.
    pub fn as_str(&self) -> &str {
        &self.display
    }

    pub fn as_cidr(&self) -> Option<&IpNet> {
        match &self.kind {
            AddressKind::Cidr(net) => Some(net),
            AddressKind::Hostname(_) => None,
        }
    }

    /// Check whether an IP falls inside this address. Hostnames never
    /// contain an IP directly.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.as_cidr().is_some_and(|net| net.contains(ip))
    }
}

fn valid_label(label: &str, first: bool) -> bool {
    if first && label == "*" {
        return true;
    }
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl FromStr for InterceptAddress {
    type Err = Error;

    /// Parse `10.0.0.1`, `10.0.0.0/24`, `fd00::1` or a hostname.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidAddress("empty address".into()));
        }
        if let Ok(net) = s.parse::<IpNet>() {
            return Ok(Self::cidr(net.trunc()));
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Self::cidr(IpNet::from(ip)));
        }
        if s.contains('/') {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        Self::hostname(s)
    }
}

impl fmt::Display for InterceptAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// Inclusive port range. `low <= high` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    low: u16,
    high: u16,
}

impl PortRange {
    /// Build a range, swapping the bounds if they arrive reversed.
    pub fn new(low: u16, high: u16) -> Self {
        Self {
            low: low.min(high),
            high: low.max(high),
        }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    pub fn low(&self) -> u16 {
        self.low
    }

    pub fn high(&self) -> u16 {
        self.high
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.low == self.high {
            write!(f, "{}", self.low)
        } else {
            write!(f, "[{}-{}]", self.low, self.high)
        }
    }
}

/// Interception policy of one service.
#[derive(Clone)]
pub struct Intercept {
    service_name: String,
    handle: BackendHandle,
    protocols: Vec<String>,
    addresses: Vec<InterceptAddress>,
    port_ranges: Vec<PortRange>,
    allowed_source_addresses: Vec<InterceptAddress>,
    match_addr: Option<MatchAddrFn>,
    overrides: CallbackOverrides,
}

impl Intercept {
    /// Create an empty rule for a service.
    pub fn new(service_name: impl Into<String>, handle: BackendHandle) -> Self {
        Self {
            service_name: service_name.into(),
            handle,
            protocols: Vec::new(),
            addresses: Vec::new(),
            port_ranges: Vec::new(),
            allowed_source_addresses: Vec::new(),
            match_addr: None,
            overrides: CallbackOverrides::default(),
        }
    }

    /// Add a protocol name (`tcp`, `udp`). Names are matched case-insensitively.
    pub fn add_protocol(&mut self, name: &str) -> &mut Self {
        let name = name.trim().to_string();
        if name.parse::<Protocol>().is_err() {
            tracing::warn!(service = %self.service_name, protocol = %name, "Protocol not handled by engine");
        }
        self.protocols.push(name);
        self
    }

    /// Parse and add an address.
    pub fn add_address(&mut self, address: &str) -> Result<&mut Self> {
        let address = address.parse()?;
        self.addresses.push(address);
        Ok(self)
    }

    pub fn push_address(&mut self, address: InterceptAddress) -> &mut Self {
        self.addresses.push(address);
        self
    }

    /// Parse and add a source address allowed to reach this service when
    /// it is hosted. Enforcement belongs to the hosting backend.
    pub fn add_allowed_source_address(&mut self, address: &str) -> Result<&mut Self> {
        let address = address.parse()?;
        self.allowed_source_addresses.push(address);
        Ok(self)
    }

    /// Add a port range and return the normalized range.
    pub fn add_port_range(&mut self, low: u16, high: u16) -> PortRange {
        let range = PortRange::new(low, high);
        self.port_ranges.push(range);
        range
    }

    pub fn set_match_addr<F>(&mut self, predicate: F) -> &mut Self
    where
        F: Fn(&IpAddr, BackendHandle) -> bool + Send + Sync + 'static,
    {
        self.match_addr = Some(Arc::new(predicate));
        self
    }

    /// Replace the global backend callbacks for connections matched by this rule.
    pub fn override_callbacks(&mut self, overrides: CallbackOverrides) -> &mut Self {
        self.overrides = overrides;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn backend_handle(&self) -> BackendHandle {
        self.handle
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    pub fn addresses(&self) -> &[InterceptAddress] {
        &self.addresses
    }

    pub fn port_ranges(&self) -> &[PortRange] {
        &self.port_ranges
    }

    pub fn allowed_source_addresses(&self) -> &[InterceptAddress] {
        &self.allowed_source_addresses
    }

    pub(crate) fn overrides(&self) -> &CallbackOverrides {
        &self.overrides
    }

    /// Check whether a source address may reach this service. An empty
    /// allow-list admits every source.
    pub fn permits_source(&self, ip: &IpAddr) -> bool {
        self.allowed_source_addresses.is_empty()
            || self.allowed_source_addresses.iter().any(|a| a.contains(ip))
    }

    /// Check whether traffic to `ip:port` over `protocol` falls under this rule.
    pub fn matches(&self, protocol: Protocol, ip: &IpAddr, port: u16) -> bool {
        self.protocols.iter().any(|p| protocol.matches_name(p))
            && self.port_ranges.iter().any(|r| r.contains(port))
            && (self.addresses.iter().any(|a| a.contains(ip))
                || self
                    .match_addr
                    .as_ref()
                    .is_some_and(|pred| pred(ip, self.handle)))
    }
}

impl fmt::Debug for Intercept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intercept")
            .field("service_name", &self.service_name)
            .field("handle", &self.handle)
            .field("protocols", &self.protocols)
            .field("addresses", &self.addresses)
            .field("port_ranges", &self.port_ranges)
            .field("allowed_source_addresses", &self.allowed_source_addresses)
            .field("match_addr", &self.match_addr.is_some())
            .finish_non_exhaustive()
    }
}
