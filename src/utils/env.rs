use chrono::NaiveTime;
use std::time::Duration;

use crate::error::{PbrSyncError, Result};
use crate::sync::MatchMode;

/// Upper bound for second-valued waits and timeouts
const MAX_WAIT_SECS: u64 = 3600;

#[derive(Clone, Debug)]
pub struct EnvVars {
    pub adguard_url: String,
    pub adguard_user: Option<String>,
    pub adguard_pass: Option<String>,
    pub sync_interval_minutes: u64,
    pub discovery_interval_minutes: u64,
    pub restart_enabled: bool,
    pub restart_at: NaiveTime,
    pub restart_settle_secs: u64,
    pub querylog_limit: usize,
    pub domain_match: MatchMode,
    // Warm-start through FlareSolverr
    pub warm_start_enabled: bool,
    pub flaresolverr_url: String,
    pub flaresolverr_timeout_ms: u64,
    pub warm_concurrency: usize,
    pub warm_harvest_delay_secs: u64,
    // Timeouts for external calls
    pub http_timeout_secs: u64,
    pub command_timeout_secs: u64,
    // OpenWrt integration
    pub pbr_uci_package: String,
    pub nft_table: String,
    pub pbr_init_script: String,
    pub log_file: Option<String>,
}

impl EnvVars {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let adguard_user = get("ADGUARD_USER");
        let adguard_pass = get("ADGUARD_PASS");
        if adguard_user.is_some() != adguard_pass.is_some() {
            return Err(PbrSyncError::Config(
                "ADGUARD_USER and ADGUARD_PASS must be set together".to_string(),
            ));
        }

        let restart_at = match get("RESTART_AT") {
            Some(value) => NaiveTime::parse_from_str(&value, "%H:%M").map_err(|_| {
                PbrSyncError::Config(format!("RESTART_AT must be HH:MM, got '{}'", value))
            })?,
            None => NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
        };

        let domain_match = match get("DOMAIN_MATCH") {
            Some(value) => value.parse()?,
            None => MatchMode::Suffix,
        };

        Ok(Self {
            adguard_url: get("ADGUARD_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8070".to_string())
                .trim_end_matches('/')
                .to_string(),
            adguard_user,
            adguard_pass,
            sync_interval_minutes: parse_in_range(&get, "SYNC_INTERVAL", 2, 1, 24 * 60)?,
            discovery_interval_minutes: parse_in_range(&get, "DISCOVERY_INTERVAL", 60, 1, 7 * 24 * 60)?,
            restart_enabled: parse_bool(&get, "RESTART_ENABLED", true)?,
            restart_at,
            restart_settle_secs: parse_in_range(&get, "RESTART_SETTLE_SECS", 10, 0, MAX_WAIT_SECS)?,
            querylog_limit: parse_in_range(&get, "QUERYLOG_LIMIT", 2000, 1, 10_000)?,
            domain_match,
            warm_start_enabled: parse_bool(&get, "WARM_START_ENABLED", false)?,
            flaresolverr_url: get("FLARESOLVERR_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8191".to_string())
                .trim_end_matches('/')
                .to_string(),
            flaresolverr_timeout_ms: parse_in_range(&get, "FLARESOLVERR_TIMEOUT", 60_000, 1, 600_000)?,
            warm_concurrency: parse_in_range(&get, "WARM_CONCURRENCY", 4, 1, 64)?,
            warm_harvest_delay_secs: parse_in_range(&get, "WARM_HARVEST_DELAY_SECS", 5, 0, MAX_WAIT_SECS)?,
            http_timeout_secs: parse_in_range(&get, "HTTP_TIMEOUT_SECS", 10, 1, MAX_WAIT_SECS)?,
            command_timeout_secs: parse_in_range(&get, "COMMAND_TIMEOUT_SECS", 15, 1, MAX_WAIT_SECS)?,
            pbr_uci_package: get("PBR_UCI_PACKAGE").unwrap_or_else(|| "pbr".to_string()),
            nft_table: get("NFT_TABLE").unwrap_or_else(|| "inet fw4".to_string()),
            pbr_init_script: get("PBR_INIT_SCRIPT")
                .unwrap_or_else(|| "/etc/init.d/pbr".to_string()),
            log_file: get("LOG_FILE"),
        })
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes * 60)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_minutes * 60)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn parse_number<G, T>(get: &G, key: &str, default: T) -> Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        Some(value) => value
            .parse()
            .map_err(|_| PbrSyncError::Config(format!("{} is not a valid number: '{}'", key, value))),
        None => Ok(default),
    }
}

/// Parse `key` and require `min..=max`.
fn parse_in_range<G, T>(get: &G, key: &str, default: T, min: T, max: T) -> Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + std::fmt::Display,
{
    let value = parse_number(get, key, default)?;
    if value < min || value > max {
        return Err(PbrSyncError::Config(format!(
            "{} must be between {} and {}, got {}",
            key, min, max, value
        )));
    }
    Ok(value)
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(PbrSyncError::Config(format!(
            "{} must be a boolean, got '{}'",
            key, v
        ))),
    }
}
