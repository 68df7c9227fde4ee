//! Warm-start: pull every tracked domain through a headless browser so the
//! resolver logs fresh answers for them. Never touches sets directly; the
//! next sync cycle harvests whatever the browser resolved.

use futures::stream::{self, StreamExt};
use std::fmt;

use super::targets::TargetSnapshot;
use crate::services::PageFetcher;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WarmReport {
    pub domains: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl fmt::Display for WarmReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} domains, {} fetched, {} failed",
            self.domains, self.succeeded, self.failed
        )
    }
}

fn warm_url(domain: &str) -> String {
    format!("https://{}/", domain)
}

/// Fetch each tracked domain once, at most `concurrency` at a time.
pub async fn warm(fetcher: &dyn PageFetcher, snapshot: &TargetSnapshot, concurrency: usize) -> WarmReport {
    if !fetcher.is_enabled() {
        log::debug!("Warm-start skipped: fetcher '{}' is disabled", fetcher.name());
        return WarmReport::default();
    }

    let domains = snapshot.domains();
    if domains.is_empty() {
        return WarmReport::default();
    }

    log::info!(
        "Warm-start: fetching {} domains via {} (concurrency {})",
        domains.len(),
        fetcher.name(),
        concurrency
    );

    // Owned items: a future borrowing from the iterator is not `Send`
    let results: Vec<bool> = stream::iter(domains.clone())
        .map(move |domain| async move {
            let url = warm_url(&domain);
            match fetcher.fetch(&url).await {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Warm-start fetch of {} failed: {}", domain, e);
                    false
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let succeeded = results.iter().filter(|ok| **ok).count();
    let report = WarmReport {
        domains: domains.len(),
        succeeded,
        failed: results.len() - succeeded,
    };
    log::info!("Warm-start finished: {}", report);
    report
}
