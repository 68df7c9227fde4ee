mod common;

use common::*;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pbr_sync::PbrSyncError;
use pbr_sync::services::{AdGuardClient, DisabledFetcher, FlareSolverrClient};
use pbr_sync::sync::{AddressFamily, SyncReport};

fn youtube_sets() -> Arc<MemorySets> {
    Arc::new(MemorySets::new(&[
        ("pbr_v4", AddressFamily::V4, Some("wan_vpn")),
        ("pbr_v6", AddressFamily::V6, Some("wan_vpn")),
    ]))
}

fn youtube_policies() -> Arc<StaticPolicySource> {
    Arc::new(StaticPolicySource::new(vec![policy(
        "youtube",
        "wan_vpn",
        &["youtube.com", "googlevideo.com"],
    )]))
}

#[tokio::test]
async fn test_subdomain_answer_lands_in_tracked_set() {
    let adguard = MockServer::start().await;
    mount_querylog(
        &adguard,
        serde_json::json!({
            "data": [
                querylog_entry("m.youtube.com.", &["172.217.1.1"]),
                querylog_entry("ads.tracker.net", &["93.1.1.1"]),
            ]
        }),
    )
    .await;

    let sets = youtube_sets();
    let engine = engine(
        Arc::new(AdGuardClient::new(Client::new(), adguard.uri(), None)),
        youtube_policies(),
        sets.clone(),
        Arc::new(DisabledFetcher),
        settings(false),
    );

    engine.discover().await.unwrap();
    let report = engine.sync_cycle().await.unwrap();

    assert!(sets.contains("pbr_v4", "172.217.1.1"));
    assert!(!sets.any_contains("93.1.1.1"));
    assert_eq!(
        report,
        SyncReport {
            seen: 1,
            already_member: 0,
            added: 1,
            add_failed: 0
        }
    );
}

#[tokio::test]
async fn test_second_cycle_adds_nothing() {
    let log = Arc::new(MemoryQueryLog::default());
    log.record("youtube.com", &["172.217.1.1", "172.217.1.2"]);
    log.record("rr1.googlevideo.com", &["173.194.0.10"]);
    log.record("youtube.com", &["172.217.1.1"]);

    let sets = youtube_sets();
    let engine = engine(
        log,
        youtube_policies(),
        sets.clone(),
        Arc::new(DisabledFetcher),
        settings(false),
    );
    engine.discover().await.unwrap();

    let first = engine.sync_cycle().await.unwrap();
    assert_eq!(first.added, 3);
    let adds_after_first = sets.adds();

    let second = engine.sync_cycle().await.unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.already_member, 3);
    assert_eq!(sets.adds(), adds_after_first);
    assert_eq!(sets.len("pbr_v4"), 3);
}

#[tokio::test]
async fn test_blocked_and_loopback_answers_never_added() {
    let log = Arc::new(MemoryQueryLog::default());
    log.record("youtube.com", &["0.0.0.0"]);
    log.record("www.youtube.com", &["127.0.0.1"]);
    log.record("youtube.com", &["::"]);

    let sets = youtube_sets();
    let engine = engine(
        log,
        youtube_policies(),
        sets.clone(),
        Arc::new(DisabledFetcher),
        settings(false),
    );
    engine.discover().await.unwrap();

    let report = engine.sync_cycle().await.unwrap();
    assert_eq!(report.seen, 0);
    assert_eq!(sets.adds(), 0);
}

#[tokio::test]
async fn test_lookalike_domain_is_not_tracked() {
    let log = Arc::new(MemoryQueryLog::default());
    log.record("notyoutube.com", &["93.1.1.2"]);
    log.record("www.youtube.com", &["172.217.1.3"]);

    let sets = youtube_sets();
    let engine = engine(
        log,
        youtube_policies(),
        sets.clone(),
        Arc::new(DisabledFetcher),
        settings(false),
    );
    engine.discover().await.unwrap();
    engine.sync_cycle().await.unwrap();

    assert!(sets.contains("pbr_v4", "172.217.1.3"));
    assert!(!sets.any_contains("93.1.1.2"));
}

#[tokio::test]
async fn test_no_targets_skips_resolver() {
    let adguard = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/control/querylog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .expect(0)
        .mount(&adguard)
        .await;

    let engine = engine(
        Arc::new(AdGuardClient::new(Client::new(), adguard.uri(), None)),
        Arc::new(StaticPolicySource::default()),
        youtube_sets(),
        Arc::new(DisabledFetcher),
        settings(false),
    );

    let snapshot = engine.discover().await.unwrap();
    assert!(snapshot.is_empty());
    assert_eq!(engine.sync_cycle().await.unwrap(), SyncReport::default());
}

#[tokio::test]
async fn test_resolver_outage_fails_only_that_cycle() {
    let adguard = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/control/querylog"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .up_to_n_times(1)
        .mount(&adguard)
        .await;
    mount_querylog(
        &adguard,
        serde_json::json!({"data": [querylog_entry("youtube.com", &["172.217.1.1"])]}),
    )
    .await;

    let sets = youtube_sets();
    let engine = engine(
        Arc::new(AdGuardClient::new(Client::new(), adguard.uri(), None)),
        youtube_policies(),
        sets.clone(),
        Arc::new(DisabledFetcher),
        settings(false),
    );
    engine.discover().await.unwrap();

    let failed = engine.sync_cycle().await;
    assert!(matches!(failed, Err(PbrSyncError::Http { status: 503, .. })));
    assert!(failed.unwrap_err().is_transient());

    engine.sync_cycle().await.unwrap();
    assert!(sets.contains("pbr_v4", "172.217.1.1"));
}

#[tokio::test]
async fn test_flushed_sets_converge_after_warm_and_sync() {
    let flaresolverr = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1"))
        .and(body_partial_json(serde_json::json!({"url": "https://googlevideo.com/"})))
        .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
            "status": "error",
            "message": "Error: Error solving the challenge. Timeout after 30.0 seconds."
        })))
        .with_priority(1)
        .mount(&flaresolverr)
        .await;
    mount_flaresolverr_ok(&flaresolverr).await;

    let log = Arc::new(MemoryQueryLog::default());
    let fetcher = Arc::new(ResolvingFetcher::new(
        FlareSolverrClient::new(Client::new(), flaresolverr.uri(), Duration::from_secs(30)),
        log.clone(),
        &[("youtube.com", "172.217.1.1"), ("googlevideo.com", "173.194.0.1")],
    ));

    let sets = youtube_sets();
    sets.insert("pbr_v4", "172.217.9.9");
    let engine = engine(
        log,
        youtube_policies(),
        sets.clone(),
        fetcher.clone(),
        settings(true),
    );
    engine.discover().await.unwrap();

    sets.flush();
    assert!(engine.sets_flushed().await.unwrap());

    let report = engine.warm_and_harvest().await.unwrap();
    assert_eq!(
        fetcher.fetched(),
        vec!["https://googlevideo.com/", "https://youtube.com/"]
    );
    assert_eq!(report.added, 1);
    assert!(sets.contains("pbr_v4", "172.217.1.1"));
    // the failed fetch never resolved, so nothing to harvest for it
    assert!(!sets.any_contains("173.194.0.1"));
}

#[tokio::test]
async fn test_startup_warms_only_when_sets_are_empty() {
    let flaresolverr = MockServer::start().await;
    mount_flaresolverr_ok(&flaresolverr).await;

    let log = Arc::new(MemoryQueryLog::default());
    let fetcher = Arc::new(ResolvingFetcher::new(
        FlareSolverrClient::new(Client::new(), flaresolverr.uri(), Duration::from_secs(30)),
        log.clone(),
        &[("youtube.com", "172.217.1.1")],
    ));
    let sets = youtube_sets();
    let engine = engine(
        log,
        youtube_policies(),
        sets.clone(),
        fetcher.clone(),
        settings(true),
    );

    engine.startup().await;
    assert_eq!(fetcher.fetched().len(), 2);
    assert!(sets.contains("pbr_v4", "172.217.1.1"));

    // sets now hold elements, a second start must not warm again
    engine.startup().await;
    assert_eq!(fetcher.fetched().len(), 2);
}

#[tokio::test]
async fn test_startup_without_warm_start_leaves_flush_to_traffic() {
    let log = Arc::new(MemoryQueryLog::default());
    let fetcher = Arc::new(ResolvingFetcher::new(DisabledFetcher, log.clone(), &[]));
    let sets = youtube_sets();
    let engine = engine(
        log,
        youtube_policies(),
        sets.clone(),
        fetcher.clone(),
        settings(false),
    );

    engine.startup().await;
    assert!(fetcher.fetched().is_empty());
    assert_eq!(sets.len("pbr_v4"), 0);
}

#[tokio::test]
async fn test_restart_flushes_then_repopulates_from_log() {
    let log = Arc::new(MemoryQueryLog::default());
    log.record("youtube.com", &["172.217.1.1", "2a00:1450:4001:82b::200e"]);

    let sets = youtube_sets();
    let engine = engine(
        log,
        youtube_policies(),
        sets.clone(),
        Arc::new(DisabledFetcher),
        settings(false),
    );
    engine.discover().await.unwrap();
    sets.insert("pbr_v4", "10.9.9.9");

    engine.restart().await.unwrap();

    assert_eq!(sets.restarts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(!sets.contains("pbr_v4", "10.9.9.9"));
    assert!(sets.contains("pbr_v4", "172.217.1.1"));
    assert!(sets.contains("pbr_v6", "2a00:1450:4001:82b::200e"));
}

#[tokio::test]
async fn test_failed_discovery_keeps_previous_targets() {
    let log = Arc::new(MemoryQueryLog::default());
    log.record("youtube.com", &["172.217.1.1"]);

    let policies = youtube_policies();
    let sets = youtube_sets();
    let engine = engine(
        log,
        policies.clone(),
        sets.clone(),
        Arc::new(DisabledFetcher),
        settings(false),
    );
    let first = engine.discover().await.unwrap();

    policies.set_failing(true);
    assert!(engine.discover().await.is_err());
    assert_eq!(engine.registry().load().generation, first.generation);

    engine.sync_cycle().await.unwrap();
    assert!(sets.contains("pbr_v4", "172.217.1.1"));
}

#[tokio::test]
async fn test_startup_warms_when_only_literal_seeds_remain() {
    let flaresolverr = MockServer::start().await;
    mount_flaresolverr_ok(&flaresolverr).await;

    let log = Arc::new(MemoryQueryLog::default());
    let fetcher = Arc::new(ResolvingFetcher::new(
        FlareSolverrClient::new(Client::new(), flaresolverr.uri(), Duration::from_secs(30)),
        log.clone(),
        &[("youtube.com", "172.217.1.1")],
    ));
    let sets = youtube_sets();
    // pbr reloads the literal dest_addr entry right after a flush
    sets.seed("pbr_v4", "8.8.8.8");
    let policies = Arc::new(StaticPolicySource::new(vec![policy_with_addresses(
        "youtube",
        "wan_vpn",
        &["youtube.com", "googlevideo.com"],
        &["8.8.8.8"],
    )]));
    let engine = engine(log, policies, sets.clone(), fetcher.clone(), settings(true));

    engine.startup().await;

    assert_eq!(fetcher.fetched().len(), 2);
    assert!(sets.contains("pbr_v4", "172.217.1.1"));
    assert!(sets.contains("pbr_v4", "8.8.8.8"));
}

#[tokio::test]
async fn test_restart_with_warm_start_repopulates_through_proxy() {
    let flaresolverr = MockServer::start().await;
    mount_flaresolverr_ok(&flaresolverr).await;

    let log = Arc::new(MemoryQueryLog::default());
    let fetcher = Arc::new(ResolvingFetcher::new(
        FlareSolverrClient::new(Client::new(), flaresolverr.uri(), Duration::from_secs(30)),
        log.clone(),
        &[("youtube.com", "172.217.1.1"), ("googlevideo.com", "173.194.0.1")],
    ));
    let sets = youtube_sets();
    let engine = engine(
        log,
        youtube_policies(),
        sets.clone(),
        fetcher.clone(),
        settings(true),
    );
    engine.discover().await.unwrap();
    sets.insert("pbr_v4", "10.9.9.9");

    engine.restart().await.unwrap();

    assert_eq!(sets.restarts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(
        fetcher.fetched(),
        vec!["https://googlevideo.com/", "https://youtube.com/"]
    );
    assert!(!sets.contains("pbr_v4", "10.9.9.9"));
    assert!(sets.contains("pbr_v4", "172.217.1.1"));
    assert!(sets.contains("pbr_v4", "173.194.0.1"));
}
