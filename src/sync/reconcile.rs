//! Set synchronizer: converges nft set membership toward extracted tuples

use std::fmt;
use std::sync::Arc;

use super::extractor::SetTuple;
use crate::services::MembershipSets;

/// Outcome counts of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub seen: usize,
    pub already_member: usize,
    pub added: usize,
    pub add_failed: usize,
}

impl SyncReport {
    /// True when no tuple failed.
    pub fn is_clean(&self) -> bool {
        self.add_failed == 0
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seen={} already={} added={} failed={}",
            self.seen, self.already_member, self.added, self.add_failed
        )
    }
}

pub struct SetSynchronizer {
    sets: Arc<dyn MembershipSets>,
}

impl SetSynchronizer {
    pub fn new(sets: Arc<dyn MembershipSets>) -> Self {
        Self { sets }
    }

    /// Add every absent tuple to its set, in arrival order.
    ///
    /// Membership is checked live for each tuple. A failed add is retried
    /// once, then counted; it never stops the remaining tuples.
    pub async fn reconcile<I>(&self, tuples: I) -> SyncReport
    where
        I: IntoIterator<Item = SetTuple>,
    {
        let mut report = SyncReport::default();

        for tuple in tuples {
            report.seen += 1;
            let set = tuple.target.set_name.as_str();

            match self.sets.exists(set, &tuple.ip).await {
                Ok(true) => {
                    report.already_member += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    // nft add is idempotent, so fall through to it
                    log::debug!("Membership check for {} in {} failed: {}", tuple.ip, set, e);
                }
            }

            let result = match self.sets.add(set, &tuple.ip).await {
                Ok(()) => Ok(()),
                Err(first) => {
                    log::debug!("Retrying add of {} to {}: {}", tuple.ip, set, first);
                    self.sets.add(set, &tuple.ip).await
                }
            };

            match result {
                Ok(()) => {
                    report.added += 1;
                    log::info!("Added {} ({}) to {}", tuple.ip, tuple.domain, tuple.target);
                }
                Err(e) => {
                    report.add_failed += 1;
                    log::warn!("Failed to add {} ({}) to {}: {}", tuple.ip, tuple.domain, tuple.target, e);
                }
            }
        }

        report
    }
}
