//! Policy targets and the atomically swapped target mapping
//!
//! A [`PolicyTarget`] binds one nft set (per address family) to the domain
//! patterns of every pbr policy routed through it. Discovery rebuilds the
//! whole mapping and publishes it through [`TargetRegistry::replace`]; readers
//! take a [`TargetSnapshot`] and keep using it for the whole cycle, so a
//! concurrent refresh is observed either fully or not at all.

use arc_swap::ArcSwap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::matcher::{DomainMatcher, DomainPattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "ipv4"),
            AddressFamily::V6 => write!(f, "ipv6"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTarget {
    /// pbr policies whose domains feed this set, in discovery order
    pub policies: Vec<String>,
    pub family: AddressFamily,
    pub set_name: String,
    /// Deduplicated, in declaration order
    pub patterns: Vec<DomainPattern>,
    /// Literal addresses pbr itself loads into the set on start
    pub seeded: Vec<String>,
}

impl PolicyTarget {
    pub fn new(family: AddressFamily, set_name: impl Into<String>) -> Self {
        Self {
            policies: Vec::new(),
            family,
            set_name: set_name.into(),
            patterns: Vec::new(),
            seeded: Vec::new(),
        }
    }

    pub fn with_patterns<I>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = DomainPattern>,
    {
        for pattern in patterns {
            self.add_pattern(pattern);
        }
        self
    }

    pub fn add_policy(&mut self, name: &str) {
        if !self.policies.iter().any(|p| p == name) {
            self.policies.push(name.to_string());
        }
    }

    pub fn add_pattern(&mut self, pattern: DomainPattern) {
        match self.patterns.iter_mut().find(|p| p.domain == pattern.domain) {
            // The broader pattern wins when the same domain is declared twice
            Some(existing) => existing.include_subdomains |= pattern.include_subdomains,
            None => self.patterns.push(pattern),
        }
    }

    pub fn add_seed(&mut self, address: &str) {
        if !self.seeded.iter().any(|a| a == address) {
            self.seeded.push(address.to_string());
        }
    }

    pub fn accepts(&self, ip: &IpAddr) -> bool {
        AddressFamily::of(ip) == self.family
    }
}

impl fmt::Display for PolicyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.set_name, self.family)
    }
}

/// One immutable generation of the target mapping.
#[derive(Debug, Default)]
pub struct TargetSnapshot {
    pub generation: u64,
    targets: Vec<Arc<PolicyTarget>>,
    matcher: DomainMatcher,
}

impl TargetSnapshot {
    pub fn new(generation: u64, targets: Vec<PolicyTarget>) -> Self {
        let targets: Vec<Arc<PolicyTarget>> = targets.into_iter().map(Arc::new).collect();
        let matcher = DomainMatcher::build(
            targets
                .iter()
                .enumerate()
                .flat_map(|(i, t)| t.patterns.iter().map(move |p| (i, p))),
        );
        Self {
            generation,
            targets,
            matcher,
        }
    }

    pub fn targets(&self) -> &[Arc<PolicyTarget>] {
        &self.targets
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Number of distinct tracked domains across all targets.
    pub fn domain_count(&self) -> usize {
        self.domains().len()
    }

    /// Every tracked domain, deduplicated across targets, in first-seen order.
    pub fn domains(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.targets
            .iter()
            .flat_map(|t| t.patterns.iter())
            .filter(|p| seen.insert(p.domain.clone()))
            .map(|p| p.domain.clone())
            .collect()
    }

    /// Targets tracking `name` that can hold `ip`.
    pub fn targets_for<'a>(
        &'a self,
        name: &str,
        ip: &'a IpAddr,
    ) -> impl Iterator<Item = &'a Arc<PolicyTarget>> + 'a {
        self.matcher
            .matching(name)
            .into_iter()
            .filter_map(move |i| self.targets.get(i))
            .filter(move |t| t.accepts(ip))
    }
}

/// Holder of the current [`TargetSnapshot`].
pub struct TargetRegistry {
    current: ArcSwap<TargetSnapshot>,
    next_generation: AtomicU64,
}

impl TargetRegistry {
    /// Start with an empty generation 0.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(TargetSnapshot::default()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Current snapshot; holders keep it alive across a later `replace`.
    pub fn load(&self) -> Arc<TargetSnapshot> {
        self.current.load_full()
    }

    /// Publish a freshly discovered mapping as the next generation.
    pub fn replace(&self, targets: Vec<PolicyTarget>) -> Arc<TargetSnapshot> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let snapshot = Arc::new(TargetSnapshot::new(generation, targets));
        self.current.store(snapshot.clone());
        snapshot
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}
