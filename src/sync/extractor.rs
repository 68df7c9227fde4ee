//! Query-log extraction
//!
//! Turns a snapshot of the resolver's recent query log into `(target, ip)`
//! tuples. The log has no cursor, so every poll re-reads an overlapping
//! window; extraction is a pure function of (entries, target snapshot) and the
//! synchronizer downstream is idempotent.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use super::address::is_valid_ip;
use super::targets::{PolicyTarget, TargetSnapshot};
use crate::error::Result;
use crate::services::{QueryLogEntry, QueryLogSource};

/// One resolved address destined for one set.
#[derive(Debug, Clone, PartialEq)]
pub struct SetTuple {
    /// Query name that produced the answer
    pub domain: String,
    pub target: Arc<PolicyTarget>,
    pub ip: IpAddr,
}

/// Fetches the recent log window from the resolver.
pub struct Extractor {
    source: Arc<dyn QueryLogSource>,
    limit: usize,
}

impl Extractor {
    pub fn new(source: Arc<dyn QueryLogSource>, limit: usize) -> Self {
        Self { source, limit }
    }

    pub async fn fetch(&self) -> Result<Vec<QueryLogEntry>> {
        self.source.recent_entries(self.limit).await
    }
}

/// Lazily yield the tuples of `entries` that belong to a tracked target.
///
/// Entries without answers and answers failing the address policy are
/// dropped. A name tracked by several targets yields a tuple for each one
/// whose family fits the address. Duplicate `(set, ip)` pairs are yielded
/// once, at their first occurrence.
pub fn extract<'a>(
    entries: &'a [QueryLogEntry],
    snapshot: &'a TargetSnapshot,
) -> impl Iterator<Item = SetTuple> + 'a {
    let mut seen: HashSet<(String, IpAddr)> = HashSet::new();

    entries
        .iter()
        .flat_map(|entry| entry.answers.iter().map(move |ip| (entry, ip)))
        .filter(|(entry, ip)| {
            let valid = is_valid_ip(ip);
            if !valid {
                log::debug!("Dropping {} -> {}: not a routable address", entry.domain, ip);
            }
            valid
        })
        .flat_map(move |(entry, ip)| {
            snapshot.targets_for(&entry.domain, ip).map(move |target| SetTuple {
                domain: entry.domain.clone(),
                target: target.clone(),
                ip: *ip,
            })
        })
        .filter(move |tuple| seen.insert((tuple.target.set_name.clone(), tuple.ip)))
}
