//! Ordered set of active intercepts with an address lookup cache.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use super::Intercept;
use crate::types::{BackendHandle, Protocol};

type CacheKey = (Protocol, IpAddr, u16);

/// Cached lookups kept before the cache is cleared and refilled.
pub(crate) const MAX_CACHED_LOOKUPS: usize = 4096;

/// Active rules, newest first.
///
/// Lookups scan in order and return the first match, so a rule registered
/// later takes precedence over an older rule with overlapping coverage.
/// Overlaps are not detected.
#[derive(Debug, Default)]
pub struct InterceptRegistry {
    rules: VecDeque<Intercept>,
    cache: HashMap<CacheKey, Option<BackendHandle>>,
}

impl InterceptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterate rules in lookup order.
    pub fn iter(&self) -> impl Iterator<Item = &Intercept> {
        self.rules.iter()
    }

    /// Insert ahead of every existing rule.
    pub fn insert(&mut self, rule: Intercept) {
        self.invalidate();
        self.rules.push_front(rule);
    }

    /// Remove the first rule bound to `handle`.
    pub fn remove(&mut self, handle: BackendHandle) -> Option<Intercept> {
        self.invalidate();
        let index = self.rules.iter().position(|r| r.backend_handle() == handle)?;
        self.rules.remove(index)
    }

    /// Remove the newest rule, if any.
    pub fn pop(&mut self) -> Option<Intercept> {
        self.invalidate();
        self.rules.pop_front()
    }

    pub fn find_by_handle(&self, handle: BackendHandle) -> Option<&Intercept> {
        self.rules.iter().find(|r| r.backend_handle() == handle)
    }

    /// Find the rule covering `ip:port` over `protocol`.
    pub fn lookup(&mut self, protocol: Protocol, ip: IpAddr, port: u16) -> Option<&Intercept> {
        let key = (protocol, ip, port);
        let handle = match self.cache.get(&key) {
            Some(cached) => *cached,
            None => {
                let found = self
                    .rules
                    .iter()
                    .find(|r| r.matches(protocol, &ip, port))
                    .map(Intercept::backend_handle);
                if self.cache.len() >= MAX_CACHED_LOOKUPS {
                    self.invalidate();
                }
                self.cache.insert(key, found);
                found
            }
        };
        handle.and_then(|h| self.find_by_handle(h))
    }

    /// Drop every cached lookup result.
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    pub(crate) fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, handle: u64, address: &str) -> Intercept {
        let mut rule = Intercept::new(name, BackendHandle(handle));
        rule.add_protocol("tcp");
        rule.add_address(address).unwrap();
        rule.add_port_range(1, 1024);
        rule
    }

    #[test]
    fn test_newest_rule_wins_on_overlap() {
        let mut registry = InterceptRegistry::new();
        registry.insert(rule("old", 1, "10.0.0.0/8"));
        registry.insert(rule("new", 2, "10.0.0.1"));

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let found = registry.lookup(Protocol::Tcp, ip, 80).unwrap();
        assert_eq!(found.service_name(), "new");

        let other: IpAddr = "10.9.9.9".parse().unwrap();
        let found = registry.lookup(Protocol::Tcp, other, 80).unwrap();
        assert_eq!(found.service_name(), "old");
    }

    #[test]
    fn test_cache_cleared_on_change() {
        let mut registry = InterceptRegistry::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(registry.lookup(Protocol::Tcp, ip, 80).is_none());
        assert_eq!(registry.cached_entries(), 1);

        registry.insert(rule("svc", 1, "10.0.0.1"));
        assert_eq!(registry.cached_entries(), 0);
        assert!(registry.lookup(Protocol::Tcp, ip, 80).is_some());

        registry.remove(BackendHandle(1));
        assert_eq!(registry.cached_entries(), 0);
        assert!(registry.lookup(Protocol::Tcp, ip, 80).is_none());
    }

    #[test]
    fn test_cache_bounded_under_scan() {
        let mut registry = InterceptRegistry::new();
        registry.insert(rule("svc", 1, "10.0.0.1"));

        for i in 0..3 * MAX_CACHED_LOOKUPS as u32 {
            let ip = IpAddr::from(std::net::Ipv4Addr::from(0x0a01_0000 + i));
            assert!(registry.lookup(Protocol::Tcp, ip, 80).is_none());
            assert!(registry.cached_entries() <= MAX_CACHED_LOOKUPS);
        }

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(registry.lookup(Protocol::Tcp, ip, 80).unwrap().service_name(), "svc");
    }

    #[test]
    fn test_remove_and_find() {
        let mut registry = InterceptRegistry::new();
        registry.insert(rule("a", 1, "10.0.0.1"));
        registry.insert(rule("b", 2, "10.0.0.2"));

        assert_eq!(registry.find_by_handle(BackendHandle(1)).unwrap().service_name(), "a");
        assert!(registry.remove(BackendHandle(3)).is_none());
        assert_eq!(registry.remove(BackendHandle(1)).unwrap().service_name(), "a");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pop().unwrap().service_name(), "b");
        assert!(registry.is_empty());
    }
}
