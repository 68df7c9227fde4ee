//! Policy-set discovery
//!
//! Joins the pbr policies (from uci) with the pbr nft sets (from nftables) and
//! groups the declared domains per (address family, set). A set belongs to a
//! policy when its comment names the policy's interface or the policy itself,
//! or when its name follows pbr's `pbr_<interface>_<4|6>_...` convention.

use std::sync::Arc;

use super::matcher::{DomainPattern, MatchMode};
use super::targets::{AddressFamily, PolicyTarget, TargetRegistry, TargetSnapshot};
use crate::error::Result;
use crate::services::{MembershipSets, PbrPolicy, PolicyConfigSource, SetInfo};

pub struct Discoverer {
    policies: Arc<dyn PolicyConfigSource>,
    sets: Arc<dyn MembershipSets>,
    mode: MatchMode,
}

impl Discoverer {
    pub fn new(
        policies: Arc<dyn PolicyConfigSource>,
        sets: Arc<dyn MembershipSets>,
        mode: MatchMode,
    ) -> Self {
        Self {
            policies,
            sets,
            mode,
        }
    }

    /// Build a fresh target list. Empty when no domain policies exist.
    pub async fn discover(&self) -> Result<Vec<PolicyTarget>> {
        let policies = self.policies.read_policies().await?;
        let sets = self.sets.list_sets().await?;
        Ok(build_targets(&policies, &sets, self.mode))
    }

    /// Discover and publish a new generation.
    ///
    /// On failure the registry keeps serving the previous generation.
    pub async fn refresh(&self, registry: &TargetRegistry) -> Result<Arc<TargetSnapshot>> {
        match self.discover().await {
            Ok(targets) => {
                let snapshot = registry.replace(targets);
                log::info!(
                    "Discovered {} pbr targets tracking {} domains (generation {})",
                    snapshot.targets().len(),
                    snapshot.domain_count(),
                    snapshot.generation
                );
                for target in snapshot.targets() {
                    log::info!(
                        "  {} <- [{}]: {} domains",
                        target,
                        target.policies.join(", "),
                        target.patterns.len()
                    );
                }
                Ok(snapshot)
            }
            Err(e) => {
                log::warn!(
                    "Discovery failed, keeping generation {}: {}",
                    registry.load().generation,
                    e
                );
                Err(e)
            }
        }
    }
}

fn set_binds(set: &SetInfo, policy: &PbrPolicy) -> bool {
    if let Some(comment) = &set.comment
        && (comment == &policy.interface || comment == &policy.name)
    {
        return true;
    }

    let family_digit = match set.family {
        Some(AddressFamily::V4) => '4',
        Some(AddressFamily::V6) => '6',
        None => return false,
    };
    !policy.interface.is_empty()
        && set
            .name
            .starts_with(&format!("pbr_{}_{}_", policy.interface, family_digit))
}

/// Group policy domains by the sets they feed.
pub fn build_targets(policies: &[PbrPolicy], sets: &[SetInfo], mode: MatchMode) -> Vec<PolicyTarget> {
    let mut targets: Vec<PolicyTarget> = Vec::new();

    for policy in policies.iter().filter(|p| p.enabled) {
        let patterns: Vec<DomainPattern> = policy
            .domains
            .iter()
            .filter_map(|d| DomainPattern::parse(d, mode))
            .collect();
        if patterns.is_empty() {
            continue;
        }

        let mut bound = false;
        for set in sets.iter().filter(|s| set_binds(s, policy)) {
            let Some(family) = set.family else {
                continue;
            };
            bound = true;

            let index = match targets
                .iter()
                .position(|t| t.family == family && t.set_name == set.name)
            {
                Some(index) => index,
                None => {
                    targets.push(PolicyTarget::new(family, set.name.clone()));
                    targets.len() - 1
                }
            };

            let target = &mut targets[index];
            target.add_policy(&policy.name);
            for pattern in &patterns {
                target.add_pattern(pattern.clone());
            }
        }

        if !bound {
            log::warn!(
                "pbr policy '{}' (interface '{}') has {} domains but no matching nft set",
                policy.name,
                policy.interface,
                patterns.len()
            );
        }
    }

    // Any enabled policy bound to a tracked set seeds it, domains or not
    for policy in policies.iter().filter(|p| p.enabled && !p.addresses.is_empty()) {
        for set in sets.iter().filter(|s| set_binds(s, policy)) {
            let Some(target) = targets.iter_mut().find(|t| t.set_name == set.name) else {
                continue;
            };
            for address in policy.addresses_of(target.family) {
                target.add_seed(address);
            }
        }
    }

    targets
}
