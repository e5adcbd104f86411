//! Webhook delivery verification: signature, freshness window, replay
//! suppression under concurrency, and replay-store faults.
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use corpdir_authn::{
    DeliveryVerdict, InMemoryReplayGuard, ReplayGuard, ReplayStatus, StorageReplayGuard,
    WebhookConfig, WebhookError, WebhookVerifier, testutil::sign_webhook,
};
use corpdir_storage::{MemoryBackend, StorageError, StorageResult};
use rstest::rstest;
use serde_json::json;
use tokio::task::JoinSet;

const SECRET: &[u8] = b"primary-webhook-secret";
const ROTATED_SECRET: &[u8] = b"rotated-webhook-secret";

fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000, 0).unwrap()
}

fn config() -> WebhookConfig {
    let mut secrets = BTreeMap::new();
    secrets.insert("crm".to_owned(), vec![hex::encode(SECRET), hex::encode(ROTATED_SECRET)]);
    WebhookConfig::builder().secrets(secrets).build()
}

fn in_memory_verifier() -> WebhookVerifier {
    let config = config();
    let guard = Arc::new(InMemoryReplayGuard::new(config.replay_retention()));
    WebhookVerifier::new(&config, guard).unwrap()
}

fn body(nonce: &str, ts: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "source": "crm",
        "payload": {"contact": "c-1", "change": "updated"},
        "nonce": nonce,
        "ts": ts,
    }))
    .unwrap()
}

async fn deliver(verifier: &WebhookVerifier, secret: &[u8], nonce: &str, ts: i64) -> DeliveryVerdict {
    let raw = body(nonce, ts);
    let signature = sign_webhook(secret, &raw);
    let (_, verdict) = verifier.verify_request(&raw, Some(&signature), now()).await.unwrap();
    verdict
}

// ---------------------------------------------------------------------------
// Freshness
// ---------------------------------------------------------------------------

#[rstest]
#[case::exactly_one_window_old(-300, DeliveryVerdict::Accepted)]
#[case::one_second_past_window(-301, DeliveryVerdict::Expired)]
#[case::current(0, DeliveryVerdict::Accepted)]
#[case::just_inside_future_edge(299, DeliveryVerdict::Accepted)]
#[case::exactly_one_window_ahead(300, DeliveryVerdict::Expired)]
#[case::far_future(86_400, DeliveryVerdict::Expired)]
#[tokio::test]
async fn freshness_window_boundaries(#[case] offset: i64, #[case] expected: DeliveryVerdict) {
    let verifier = in_memory_verifier();
    let ts = now().timestamp() + offset;

    assert_eq!(deliver(&verifier, SECRET, "n-1", ts).await, expected);
}

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn any_configured_secret_verifies() {
    let verifier = in_memory_verifier();
    let ts = now().timestamp();

    assert_eq!(deliver(&verifier, SECRET, "n-old", ts).await, DeliveryVerdict::Accepted);
    assert_eq!(deliver(&verifier, ROTATED_SECRET, "n-new", ts).await, DeliveryVerdict::Accepted);
    assert_eq!(deliver(&verifier, b"retired-secret", "n-x", ts).await, DeliveryVerdict::SignatureInvalid);
}

#[tokio::test]
async fn unknown_source_is_signature_invalid() {
    let verifier = in_memory_verifier();
    let raw = serde_json::to_vec(&json!({
        "source": "billing",
        "nonce": "n-1",
        "ts": now().timestamp(),
    }))
    .unwrap();
    let signature = sign_webhook(SECRET, &raw);

    let (_, verdict) = verifier.verify_request(&raw, Some(&signature), now()).await.unwrap();
    assert_eq!(verdict, DeliveryVerdict::SignatureInvalid);
}

#[rstest]
#[case::missing(None)]
#[case::wrong_scheme(Some("sha1=abcdef"))]
#[case::not_hex(Some("sha256=zz"))]
#[case::truncated(Some("sha256=abcd"))]
#[tokio::test]
async fn malformed_signature_header_is_signature_invalid(#[case] header: Option<&str>) {
    let verifier = in_memory_verifier();
    let raw = body("n-1", now().timestamp());

    let (_, verdict) = verifier.verify_request(&raw, header, now()).await.unwrap();
    assert_eq!(verdict, DeliveryVerdict::SignatureInvalid);
}

#[tokio::test]
async fn body_modified_after_signing_is_signature_invalid() {
    let verifier = in_memory_verifier();
    let raw = body("n-1", now().timestamp());
    let signature = sign_webhook(SECRET, &raw);

    // Same JSON, different bytes: the MAC covers the raw body.
    let mut reformatted = raw.clone();
    reformatted.push(b' ');
    let (_, verdict) = verifier.verify_request(&reformatted, Some(&signature), now()).await.unwrap();
    assert_eq!(verdict, DeliveryVerdict::SignatureInvalid);
}

#[tokio::test]
async fn signature_checked_before_freshness_and_replay() {
    let guard = Arc::new(CountingGuard::default());
    let verifier = WebhookVerifier::new(&config(), guard.clone()).unwrap();

    // Stale and forged: reported as a signature failure, never reaches the store.
    let raw = body("n-1", now().timestamp() - 10_000);
    let signature = sign_webhook(b"forged", &raw);
    let (_, verdict) = verifier.verify_request(&raw, Some(&signature), now()).await.unwrap();

    assert_eq!(verdict, DeliveryVerdict::SignatureInvalid);
    assert_eq!(guard.calls(), 0);
}

#[tokio::test]
async fn expired_delivery_is_not_recorded() {
    let guard = Arc::new(CountingGuard::default());
    let verifier = WebhookVerifier::new(&config(), guard.clone()).unwrap();

    assert_eq!(
        deliver(&verifier, SECRET, "n-1", now().timestamp() - 1_000).await,
        DeliveryVerdict::Expired
    );
    assert_eq!(guard.calls(), 0);
}

#[tokio::test]
async fn malformed_body_is_an_error() {
    let verifier = in_memory_verifier();
    let raw = br#"{"source": "crm", "nonce": ""}"#;

    let result = verifier.verify_request(raw, Some("sha256=00"), now()).await;
    assert!(matches!(result, Err(WebhookError::MalformedDelivery { .. })));
}

// ---------------------------------------------------------------------------
// Replay suppression
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redelivery_is_duplicate() {
    let verifier = in_memory_verifier();
    let ts = now().timestamp();

    assert_eq!(deliver(&verifier, SECRET, "n-1", ts).await, DeliveryVerdict::Accepted);
    assert_eq!(deliver(&verifier, SECRET, "n-1", ts).await, DeliveryVerdict::Duplicate);
    // Re-signing with the other secret does not make it new.
    assert_eq!(deliver(&verifier, ROTATED_SECRET, "n-1", ts).await, DeliveryVerdict::Duplicate);
    assert_eq!(deliver(&verifier, SECRET, "n-2", ts).await, DeliveryVerdict::Accepted);
}

#[rstest]
#[case::in_memory(in_memory_verifier())]
#[case::storage({
    let config = config();
    let guard = Arc::new(StorageReplayGuard::new(MemoryBackend::new(), config.replay_retention()));
    WebhookVerifier::new(&config, guard).unwrap()
})]
#[tokio::test]
async fn released_delivery_is_accepted_again(#[case] verifier: WebhookVerifier) {
    let ts = now().timestamp();

    assert_eq!(deliver(&verifier, SECRET, "n-1", ts).await, DeliveryVerdict::Accepted);
    verifier.release("crm", "n-1").await.unwrap();
    assert_eq!(deliver(&verifier, SECRET, "n-1", ts).await, DeliveryVerdict::Accepted);
    assert_eq!(deliver(&verifier, SECRET, "n-1", ts).await, DeliveryVerdict::Duplicate);
}

async fn race_identical_deliveries(verifier: Arc<WebhookVerifier>, contenders: usize) -> Vec<DeliveryVerdict> {
    let raw = Arc::new(body("n-race", now().timestamp()));
    let signature = Arc::new(sign_webhook(SECRET, &raw));

    let mut tasks = JoinSet::new();
    for _ in 0..contenders {
        let verifier = Arc::clone(&verifier);
        let raw = Arc::clone(&raw);
        let signature = Arc::clone(&signature);
        tasks.spawn(async move {
            let (_, verdict) = verifier.verify_request(&raw, Some(&signature), now()).await.unwrap();
            verdict
        });
    }

    let mut verdicts = Vec::with_capacity(contenders);
    while let Some(joined) = tasks.join_next().await {
        verdicts.push(joined.unwrap());
    }
    verdicts
}

fn assert_exactly_one_accepted(verdicts: &[DeliveryVerdict]) {
    let accepted = verdicts.iter().filter(|v| **v == DeliveryVerdict::Accepted).count();
    let duplicates = verdicts.iter().filter(|v| **v == DeliveryVerdict::Duplicate).count();
    assert_eq!(accepted, 1, "verdicts: {verdicts:?}");
    assert_eq!(duplicates, verdicts.len() - 1, "verdicts: {verdicts:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redelivery_accepted_once_in_memory() {
    let verdicts = race_identical_deliveries(Arc::new(in_memory_verifier()), 32).await;
    assert_exactly_one_accepted(&verdicts);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redelivery_accepted_once_in_storage() {
    let config = config();
    let guard = Arc::new(StorageReplayGuard::new(MemoryBackend::new(), config.replay_retention()));
    let verifier = Arc::new(WebhookVerifier::new(&config, guard).unwrap());

    let verdicts = race_identical_deliveries(verifier, 32).await;
    assert_exactly_one_accepted(&verdicts);
}

// ---------------------------------------------------------------------------
// Replay-store faults
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CountingGuard {
    calls: std::sync::atomic::AtomicUsize,
}

impl CountingGuard {
    fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplayGuard for CountingGuard {
    async fn check_and_mark(
        &self,
        _source: &str,
        _nonce: &str,
        _declared_ts: i64,
        _now: DateTime<Utc>,
    ) -> StorageResult<ReplayStatus> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(ReplayStatus::Fresh)
    }

    async fn release(&self, _source: &str, _nonce: &str) -> StorageResult<()> {
        Ok(())
    }
}

struct FailingGuard;

#[async_trait]
impl ReplayGuard for FailingGuard {
    async fn check_and_mark(
        &self,
        _source: &str,
        _nonce: &str,
        _declared_ts: i64,
        _now: DateTime<Utc>,
    ) -> StorageResult<ReplayStatus> {
        Err(StorageError::connection("replay store unreachable"))
    }

    async fn release(&self, _source: &str, _nonce: &str) -> StorageResult<()> {
        Ok(())
    }
}

struct StalledGuard;

#[async_trait]
impl ReplayGuard for StalledGuard {
    async fn check_and_mark(
        &self,
        _source: &str,
        _nonce: &str,
        _declared_ts: i64,
        _now: DateTime<Utc>,
    ) -> StorageResult<ReplayStatus> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(ReplayStatus::Fresh)
    }

    async fn release(&self, _source: &str, _nonce: &str) -> StorageResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn replay_store_failure_is_an_error_not_a_verdict() {
    let verifier = WebhookVerifier::new(&config(), Arc::new(FailingGuard)).unwrap();
    let raw = body("n-1", now().timestamp());
    let signature = sign_webhook(SECRET, &raw);

    let result = verifier.verify_request(&raw, Some(&signature), now()).await;
    assert!(matches!(result, Err(WebhookError::ReplayStore(_))), "got {result:?}");
}

#[tokio::test]
async fn stalled_replay_store_times_out() {
    let config = WebhookConfig::builder()
        .secrets(config().secrets)
        .replay_timeout(Duration::from_millis(250))
        .build();
    let verifier = WebhookVerifier::new(&config, Arc::new(StalledGuard)).unwrap();
    let raw = body("n-1", now().timestamp());
    let signature = sign_webhook(SECRET, &raw);

    let result = verifier.verify_request(&raw, Some(&signature), now()).await;
    assert!(
        matches!(result, Err(WebhookError::ReplayTimeout { timeout }) if timeout == Duration::from_millis(250)),
        "got {result:?}"
    );
}
