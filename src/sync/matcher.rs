//! Domain pattern normalization and label-aligned suffix matching
//!
//! Patterns come from pbr `dest_addr` tokens. A wildcard pattern
//! (`*.example.com` or `.example.com`) always covers the apex and every
//! subdomain. A plain pattern follows [`MatchMode`]: `Suffix` behaves like a
//! wildcard, `Exact` matches the apex only.
//!
//! ```
//! use pbr_sync::sync::{DomainPattern, MatchMode};
//!
//! let pattern = DomainPattern::parse("YouTube.com.", MatchMode::Suffix).unwrap();
//! assert!(pattern.matches("m.youtube.com"));
//! assert!(!pattern.matches("notyoutube.com"));
//! ```

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::PbrSyncError;

/// How a plain (non-wildcard) pattern matches query names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// `example.com` matches `example.com` and `*.example.com`
    Suffix,
    /// `example.com` matches only `example.com`
    Exact,
}

impl FromStr for MatchMode {
    type Err = PbrSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "suffix" => Ok(MatchMode::Suffix),
            "exact" => Ok(MatchMode::Exact),
            other => Err(PbrSyncError::Config(format!(
                "DOMAIN_MATCH must be 'suffix' or 'exact', got '{}'",
                other
            ))),
        }
    }
}

/// Lowercase a query or pattern name and strip the trailing root dot.
pub fn normalize_domain(name: &str) -> String {
    let name = name.trim();
    name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainPattern {
    /// Normalized domain without any wildcard prefix
    pub domain: String,
    pub include_subdomains: bool,
}

impl DomainPattern {
    /// Parse a raw pattern. Returns `None` when no usable domain remains.
    pub fn parse(raw: &str, mode: MatchMode) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        // The wildcard prefix goes first so `*.` is not mistaken for a root dot
        let (rest, wildcard) = if let Some(rest) = lowered.strip_prefix("*.") {
            (rest, true)
        } else if let Some(rest) = lowered.strip_prefix('.') {
            (rest, true)
        } else {
            (lowered.as_str(), false)
        };
        let domain = rest.strip_suffix('.').unwrap_or(rest);

        if domain.is_empty() || domain.contains('*') || domain.split('.').any(str::is_empty) {
            return None;
        }

        Some(Self {
            domain: domain.to_string(),
            include_subdomains: wildcard || mode == MatchMode::Suffix,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        let name = normalize_domain(name);
        if name == self.domain {
            return true;
        }
        self.include_subdomains
            && name.len() > self.domain.len()
            && name.ends_with(&self.domain)
            && name.as_bytes()[name.len() - self.domain.len() - 1] == b'.'
    }
}

/// Index from pattern domain to the targets that track it.
#[derive(Debug, Default)]
pub struct DomainMatcher {
    exact: HashMap<String, Vec<usize>>,
    suffix: HashMap<String, Vec<usize>>,
}

impl DomainMatcher {
    /// Build from `(target index, pattern)` pairs.
    pub fn build<'a, I>(patterns: I) -> Self
    where
        I: IntoIterator<Item = (usize, &'a DomainPattern)>,
    {
        let mut matcher = Self::default();
        for (index, pattern) in patterns {
            let map = if pattern.include_subdomains {
                &mut matcher.suffix
            } else {
                &mut matcher.exact
            };
            let entry = map.entry(pattern.domain.clone()).or_default();
            if !entry.contains(&index) {
                entry.push(index);
            }
        }
        matcher
    }

    /// Indices of every target with a pattern covering `name`, ascending.
    pub fn matching(&self, name: &str) -> Vec<usize> {
        let name = normalize_domain(name);
        let mut hits = Vec::new();

        if let Some(indices) = self.exact.get(&name) {
            hits.extend_from_slice(indices);
        }

        // Walk `a.b.c`, `b.c`, `c`
        let mut rest = name.as_str();
        loop {
            if let Some(indices) = self.suffix.get(rest) {
                hits.extend_from_slice(indices);
            }
            match rest.find('.') {
                Some(dot) => rest = &rest[dot + 1..],
                None => break,
            }
        }

        hits.sort_unstable();
        hits.dedup();
        hits
    }
}
