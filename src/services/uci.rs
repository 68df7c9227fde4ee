//! pbr policy configuration read through `uci show`

use async_trait::async_trait;
use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{PbrSyncError, Result};
use crate::sync::AddressFamily;
use crate::utils::command;

static DOMAIN_RE: OnceLock<Regex> = OnceLock::new();

fn domain_regex() -> &'static Regex {
    DOMAIN_RE.get_or_init(|| {
        Regex::new(
            r"^[a-z0-9]([a-z0-9\-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9\-]{0,61}[a-z0-9])?)+$",
        )
        .expect("domain regex is valid")
    })
}

/// One `config policy` section of the pbr package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbrPolicy {
    pub name: String,
    pub interface: String,
    pub enabled: bool,
    /// Domain tokens from `dest_addr`, wildcard prefixes preserved
    pub domains: Vec<String>,
    /// Literal IP and CIDR tokens from `dest_addr`; pbr seeds these into
    /// the policy's sets itself
    pub addresses: Vec<String>,
}

impl PbrPolicy {
    /// Literal `dest_addr` entries of one address family.
    pub fn addresses_of(&self, family: AddressFamily) -> impl Iterator<Item = &str> {
        self.addresses
            .iter()
            .filter(move |a| literal_address(a).is_some_and(|ip| AddressFamily::of(&ip) == family))
            .map(String::as_str)
    }
}

/// Read-only view of the routing-policy configuration.
#[async_trait]
pub trait PolicyConfigSource: Send + Sync {
    async fn read_policies(&self) -> Result<Vec<PbrPolicy>>;
}

pub struct UciPolicySource {
    package: String,
    timeout: Duration,
}

impl UciPolicySource {
    pub fn new(package: impl Into<String>, timeout: Duration) -> Self {
        Self {
            package: package.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PolicyConfigSource for UciPolicySource {
    async fn read_policies(&self) -> Result<Vec<PbrPolicy>> {
        let output = command::run("uci", &["show", &self.package], self.timeout)
            .await
            .map_err(|e| PbrSyncError::Discovery(e.to_string()))?;

        if !output.status.success() {
            return Err(PbrSyncError::Discovery(format!(
                "uci show {} failed: {}",
                self.package,
                command::error_text(&output)
            )));
        }

        Ok(parse_uci_policies(
            &self.package,
            &String::from_utf8_lossy(&output.stdout),
        ))
    }
}

/// True if `token` looks like a domain name (optionally `*.` or `.` prefixed).
pub fn is_domain(token: &str) -> bool {
    let name = token.trim().trim_end_matches('.').to_ascii_lowercase();
    let name = name
        .strip_prefix("*.")
        .or_else(|| name.strip_prefix('.'))
        .unwrap_or(name.as_str());

    if name.parse::<IpAddr>().is_ok() {
        return false;
    }
    // a numeric TLD means a dotted address or a malformed one
    let numeric_tld = name
        .rsplit('.')
        .next()
        .is_some_and(|tld| tld.chars().all(|c| c.is_ascii_digit()));

    !numeric_tld && domain_regex().is_match(name)
}

/// Address of a literal IP or CIDR token, prefix length dropped.
pub fn literal_address(token: &str) -> Option<IpAddr> {
    let address = token.split_once('/').map_or(token, |(address, _)| address);
    address.trim().parse().ok()
}

/// Parse `uci show <package>` output into policies, in declaration order.
pub fn parse_uci_policies(package: &str, text: &str) -> Vec<PbrPolicy> {
    struct Section {
        id: String,
        is_policy: bool,
        name: Option<String>,
        interface: String,
        enabled: bool,
        domains: Vec<String>,
        addresses: Vec<String>,
    }

    let prefix = format!("{}.", package);
    let mut sections: Vec<Section> = Vec::new();

    for line in text.lines().map(str::trim) {
        let Some(rest) = line.strip_prefix(&prefix) else {
            continue;
        };
        let Some((key, value)) = rest.split_once('=') else {
            continue;
        };
        let (section_id, option) = match key.split_once('.') {
            Some((section, option)) => (section, Some(option)),
            None => (key, None),
        };

        let index = match sections.iter().position(|s| s.id == section_id) {
            Some(index) => index,
            None => {
                sections.push(Section {
                    id: section_id.to_string(),
                    is_policy: false,
                    name: None,
                    interface: String::new(),
                    enabled: true,
                    domains: Vec::new(),
                    addresses: Vec::new(),
                });
                sections.len() - 1
            }
        };
        let section = &mut sections[index];

        // uci quotes every value; list options print several quoted items
        let value = value.replace('\'', "");
        match option {
            None => section.is_policy = value.trim() == "policy",
            Some("name") => section.name = Some(value.trim().to_string()),
            Some("interface") => section.interface = value.trim().to_string(),
            Some("enabled") => section.enabled = value.trim() != "0",
            Some("dest_addr") => {
                for token in value.split_whitespace() {
                    if is_domain(token) {
                        section.domains.push(token.to_string());
                    } else if literal_address(token).is_some() {
                        section.addresses.push(token.to_string());
                    }
                }
            }
            Some(_) => {}
        }
    }

    sections
        .into_iter()
        .filter(|s| s.is_policy)
        .map(|s| PbrPolicy {
            name: s.name.unwrap_or(s.id),
            interface: s.interface,
            enabled: s.enabled,
            domains: s.domains,
            addresses: s.addresses,
        })
        .collect()
}
