//! nftables membership sets maintained by pbr
//!
//! The engine never caches set contents: every membership check is a live
//! `nft get element`, because a pbr restart can flush the sets at any time.

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::{PbrSyncError, Result};
use crate::sync::AddressFamily;
use crate::utils::command;

/// pbr restarts re-download lists and rebuild the ruleset; allow them time
const RESTART_TIMEOUT: Duration = Duration::from_secs(180);

/// Only sets created by pbr are considered
const PBR_SET_PREFIX: &str = "pbr_";

/// Inventory entry for one nft set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetInfo {
    pub name: String,
    /// `None` for element types other than plain addresses
    pub family: Option<AddressFamily>,
    pub comment: Option<String>,
    pub element_count: usize,
}

/// Membership sets owned by the routing-policy engine.
#[async_trait]
pub trait MembershipSets: Send + Sync {
    /// Every pbr set currently present, with its element count.
    async fn list_sets(&self) -> Result<Vec<SetInfo>>;

    /// Live membership check.
    async fn exists(&self, set: &str, ip: &IpAddr) -> Result<bool>;

    /// Add `ip`; adding a present element succeeds.
    async fn add(&self, set: &str, ip: &IpAddr) -> Result<()>;

    /// Restart the policy engine. All sets are flushed as a side effect.
    async fn restart_policy_engine(&self) -> Result<()>;
}

/// [`MembershipSets`] backed by the `nft` CLI and the pbr init script.
pub struct NftSets {
    /// e.g. `["inet", "fw4"]`
    table: Vec<String>,
    init_script: String,
    timeout: Duration,
}

impl NftSets {
    pub fn new(table: &str, init_script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            table: table.split_whitespace().map(str::to_string).collect(),
            init_script: init_script.into(),
            timeout,
        }
    }

    async fn nft(&self, verb: &[&str], set: &str, ip: &IpAddr) -> Result<std::process::Output> {
        let element = format!("{{ {} }}", ip);
        let mut args: Vec<&str> = verb.to_vec();
        args.extend(self.table.iter().map(String::as_str));
        args.push(set);
        args.push(&element);
        command::run("nft", &args, self.timeout).await
    }
}

#[async_trait]
impl MembershipSets for NftSets {
    async fn list_sets(&self) -> Result<Vec<SetInfo>> {
        let mut args = vec!["list", "table"];
        args.extend(self.table.iter().map(String::as_str));

        let output = command::run("nft", &args, self.timeout)
            .await
            .map_err(|e| PbrSyncError::Discovery(e.to_string()))?;
        if !output.status.success() {
            return Err(PbrSyncError::Discovery(format!(
                "nft list table {} failed: {}",
                self.table.join(" "),
                command::error_text(&output)
            )));
        }

        Ok(parse_nft_sets(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn exists(&self, set: &str, ip: &IpAddr) -> Result<bool> {
        let output = self.nft(&["get", "element"], set, ip).await?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = command::error_text(&output);
        if stderr.contains("No such file or directory") || stderr.contains("does not exist") {
            Ok(false)
        } else {
            Err(PbrSyncError::Command(format!(
                "nft get element {} {}: {}",
                set, ip, stderr
            )))
        }
    }

    async fn add(&self, set: &str, ip: &IpAddr) -> Result<()> {
        let output = self
            .nft(&["add", "element"], set, ip)
            .await
            .map_err(|e| PbrSyncError::SetMutation(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(PbrSyncError::SetMutation(format!(
                "nft add element {} {}: {}",
                set,
                ip,
                command::error_text(&output)
            )))
        }
    }

    async fn restart_policy_engine(&self) -> Result<()> {
        let output = command::run(&self.init_script, &["restart"], RESTART_TIMEOUT).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(PbrSyncError::Command(format!(
                "{} restart: {}",
                self.init_script,
                command::error_text(&output)
            )))
        }
    }
}

/// Parse the pbr sets out of `nft list table` output.
pub fn parse_nft_sets(text: &str) -> Vec<SetInfo> {
    let mut sets = Vec::new();
    let mut current: Option<SetInfo> = None;
    let mut in_elements = false;

    for line in text.lines().map(str::trim) {
        if let Some(set) = current.as_mut() {
            if in_elements {
                let (chunk, done) = match line.find('}') {
                    Some(end) => (&line[..end], true),
                    None => (line, false),
                };
                set.element_count += count_elements(chunk);
                in_elements = !done;
                continue;
            }

            if line == "}" {
                sets.extend(current.take());
            } else if let Some(kind) = line.strip_prefix("type ") {
                set.family = match kind.trim() {
                    "ipv4_addr" => Some(AddressFamily::V4),
                    "ipv6_addr" => Some(AddressFamily::V6),
                    _ => None,
                };
            } else if let Some(comment) = line.strip_prefix("comment ") {
                set.comment = Some(comment.trim().trim_matches('"').to_string());
            } else if let Some(rest) = line.strip_prefix("elements = {") {
                match rest.find('}') {
                    Some(end) => set.element_count += count_elements(&rest[..end]),
                    None => {
                        set.element_count += count_elements(rest);
                        in_elements = true;
                    }
                }
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("set ") {
            let name = rest.trim_end_matches('{').trim();
            if name.starts_with(PBR_SET_PREFIX) {
                current = Some(SetInfo {
                    name: name.to_string(),
                    family: None,
                    comment: None,
                    element_count: 0,
                });
            }
        }
    }

    sets
}

fn count_elements(chunk: &str) -> usize {
    chunk.split(',').filter(|e| !e.trim().is_empty()).count()
}
