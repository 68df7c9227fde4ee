#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pbr_sync::error::{PbrSyncError, Result};
use pbr_sync::services::{
    MembershipSets, PageFetcher, PbrPolicy, PolicyConfigSource, QueryLogEntry, QueryLogSource,
    SetInfo,
};
use pbr_sync::sync::{AddressFamily, Collaborators, EngineSettings, MatchMode, SyncEngine, TargetRegistry};

/// nftables stand-in: declared sets with their members.
pub struct MemorySets {
    declared: Vec<(String, AddressFamily, Option<String>)>,
    members: Mutex<HashMap<String, HashSet<IpAddr>>>,
    seeds: Mutex<Vec<(String, IpAddr)>>,
    pub add_calls: AtomicUsize,
    pub restarts: AtomicUsize,
}

impl MemorySets {
    pub fn new(declared: &[(&str, AddressFamily, Option<&str>)]) -> Self {
        Self {
            declared: declared
                .iter()
                .map(|(name, family, comment)| {
                    (name.to_string(), *family, comment.map(str::to_string))
                })
                .collect(),
            members: Mutex::new(HashMap::new()),
            seeds: Mutex::new(Vec::new()),
            add_calls: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        }
    }

    pub fn contains(&self, set: &str, ip: &str) -> bool {
        let ip: IpAddr = ip.parse().unwrap();
        self.members
            .lock()
            .unwrap()
            .get(set)
            .is_some_and(|s| s.contains(&ip))
    }

    /// True when any set holds `ip`.
    pub fn any_contains(&self, ip: &str) -> bool {
        let ip: IpAddr = ip.parse().unwrap();
        self.members.lock().unwrap().values().any(|s| s.contains(&ip))
    }

    pub fn len(&self, set: &str) -> usize {
        self.members.lock().unwrap().get(set).map_or(0, HashSet::len)
    }

    pub fn insert(&self, set: &str, ip: &str) {
        self.members
            .lock()
            .unwrap()
            .entry(set.to_string())
            .or_default()
            .insert(ip.parse().unwrap());
    }

    /// A literal pbr loads into `set` on every start.
    pub fn seed(&self, set: &str, ip: &str) {
        self.seeds
            .lock()
            .unwrap()
            .push((set.to_string(), ip.parse().unwrap()));
        self.insert(set, ip);
    }

    pub fn flush(&self) {
        self.members.lock().unwrap().clear();
    }

    pub fn adds(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MembershipSets for MemorySets {
    async fn list_sets(&self) -> Result<Vec<SetInfo>> {
        Ok(self
            .declared
            .iter()
            .map(|(name, family, comment)| SetInfo {
                name: name.clone(),
                family: Some(*family),
                comment: comment.clone(),
                element_count: self.len(name),
            })
            .collect())
    }

    async fn exists(&self, set: &str, ip: &IpAddr) -> Result<bool> {
        Ok(self
            .members
            .lock()
            .unwrap()
            .get(set)
            .is_some_and(|s| s.contains(ip)))
    }

    async fn add(&self, set: &str, ip: &IpAddr) -> Result<()> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if !self.declared.iter().any(|(name, _, _)| name == set) {
            return Err(PbrSyncError::SetMutation(format!("set {} does not exist", set)));
        }
        self.members
            .lock()
            .unwrap()
            .entry(set.to_string())
            .or_default()
            .insert(*ip);
        Ok(())
    }

    async fn restart_policy_engine(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.flush();
        let mut members = self.members.lock().unwrap();
        for (set, ip) in self.seeds.lock().unwrap().iter() {
            members.entry(set.clone()).or_default().insert(*ip);
        }
        Ok(())
    }
}

/// pbr configuration that tests can swap or break.
#[derive(Default)]
pub struct StaticPolicySource {
    policies: Mutex<Vec<PbrPolicy>>,
    failing: Mutex<bool>,
}

impl StaticPolicySource {
    pub fn new(policies: Vec<PbrPolicy>) -> Self {
        Self {
            policies: Mutex::new(policies),
            failing: Mutex::new(false),
        }
    }

    pub fn set_policies(&self, policies: Vec<PbrPolicy>) {
        *self.policies.lock().unwrap() = policies;
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl PolicyConfigSource for StaticPolicySource {
    async fn read_policies(&self) -> Result<Vec<PbrPolicy>> {
        if *self.failing.lock().unwrap() {
            return Err(PbrSyncError::Discovery("uci: Entry not found".to_string()));
        }
        Ok(self.policies.lock().unwrap().clone())
    }
}

pub fn policy_with_addresses(name: &str, interface: &str, domains: &[&str], addresses: &[&str]) -> PbrPolicy {
    PbrPolicy {
        addresses: addresses.iter().map(|a| a.to_string()).collect(),
        ..policy(name, interface, domains)
    }
}

pub fn policy(name: &str, interface: &str, domains: &[&str]) -> PbrPolicy {
    PbrPolicy {
        name: name.to_string(),
        interface: interface.to_string(),
        enabled: true,
        domains: domains.iter().map(|d| d.to_string()).collect(),
        addresses: Vec::new(),
    }
}

/// Resolver query log held in memory; warm-start fetches append to it.
#[derive(Default)]
pub struct MemoryQueryLog {
    entries: Mutex<Vec<QueryLogEntry>>,
    failures: AtomicUsize,
}

impl MemoryQueryLog {
    /// The next `n` reads fail like an unreachable resolver.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn record(&self, domain: &str, answers: &[&str]) {
        self.entries.lock().unwrap().push(entry(domain, answers));
    }
}

#[async_trait]
impl QueryLogSource for MemoryQueryLog {
    async fn recent_entries(&self, limit: usize) -> Result<Vec<QueryLogEntry>> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PbrSyncError::Network("connection refused".to_string()));
        }
        let entries = self.entries.lock().unwrap();
        // newest first, like the resolver
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}

pub fn entry(domain: &str, answers: &[&str]) -> QueryLogEntry {
    QueryLogEntry {
        domain: domain.to_string(),
        answers: answers.iter().map(|a| a.parse().unwrap()).collect(),
        client: Some("192.168.1.20".to_string()),
        time: None,
    }
}

/// Wraps a real fetcher; every successful fetch resolves the host through
/// `dns` and lands in the query log, the way a browser behind the router would.
pub struct ResolvingFetcher<F> {
    pub inner: F,
    pub log: Arc<MemoryQueryLog>,
    pub dns: HashMap<String, String>,
    pub fetched: Mutex<Vec<String>>,
}

impl<F> ResolvingFetcher<F> {
    pub fn new(inner: F, log: Arc<MemoryQueryLog>, dns: &[(&str, &str)]) -> Self {
        Self {
            inner,
            log,
            dns: dns
                .iter()
                .map(|(d, ip)| (d.to_string(), ip.to_string()))
                .collect(),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn fetched(&self) -> Vec<String> {
        let mut fetched = self.fetched.lock().unwrap().clone();
        fetched.sort();
        fetched
    }
}

#[async_trait]
impl<F: PageFetcher> PageFetcher for ResolvingFetcher<F> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    async fn fetch(&self, url: &str) -> Result<()> {
        self.fetched.lock().unwrap().push(url.to_string());
        self.inner.fetch(url).await?;

        let host = url
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_string();
        if let Some(ip) = self.dns.get(&host) {
            self.log.record(&host, &[ip.as_str()]);
        }
        Ok(())
    }
}

/// Settings with no waits, so restart and warm-start tests run instantly.
pub fn settings(warm_start_enabled: bool) -> EngineSettings {
    EngineSettings {
        sync_interval: Duration::from_secs(120),
        discovery_interval: Duration::from_secs(3600),
        restart_at: None,
        restart_settle: Duration::ZERO,
        querylog_limit: 2000,
        domain_match: MatchMode::Suffix,
        warm_start_enabled,
        warm_concurrency: 4,
        warm_harvest_delay: Duration::ZERO,
    }
}

pub fn engine(
    query_log: Arc<dyn QueryLogSource>,
    policies: Arc<dyn PolicyConfigSource>,
    sets: Arc<dyn MembershipSets>,
    fetcher: Arc<dyn PageFetcher>,
    settings: EngineSettings,
) -> SyncEngine {
    SyncEngine::new(
        Arc::new(TargetRegistry::new()),
        Collaborators {
            query_log,
            policies,
            sets,
            fetcher,
        },
        settings,
    )
}

/// Serve `body` as the AdGuard Home query log, without authentication.
pub async fn mount_querylog(server: &MockServer, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/control/querylog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// One A-record log entry in AdGuard Home's wire format.
pub fn querylog_entry(name: &str, ips: &[&str]) -> serde_json::Value {
    let answers: Vec<serde_json::Value> = ips
        .iter()
        .map(|ip| serde_json::json!({"type": "A", "value": ip, "ttl": 300}))
        .collect();
    serde_json::json!({
        "answer": answers,
        "client": "192.168.1.20",
        "question": {"class": "IN", "name": name, "type": "A"},
        "status": "NOERROR",
        "time": "2026-01-18T15:55:15.062846123+03:00"
    })
}

/// FlareSolverr answering `ok` for every request.
pub async fn mount_flaresolverr_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "ok",
            "message": "Challenge not detected!",
            "solution": {"status": 200}
        })))
        .mount(server)
        .await;
}
