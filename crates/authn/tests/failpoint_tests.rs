#![cfg(feature = "failpoints")]
#![allow(clippy::expect_used, clippy::panic)]
//! Fail-point injection for the key cache.
//!
//! ```bash
//! cargo test -p corpdir-authn --features failpoints --test failpoint_tests
//! ```

use chrono::{TimeDelta, Utc};
use corpdir_authn::{
    KeyCacheConfig, assert_auth_error,
    testutil::{TestIssuer, standard_claims, test_token_config},
};

#[tokio::test]
async fn fetch_failpoint_on_cold_cache_reports_unavailable() {
    let scenario = fail::FailScenario::setup();
    let issuer = TestIssuer::new("fp-key");
    let cache = issuer.key_cache(KeyCacheConfig::default());

    fail::cfg("key-cache-before-fetch", "return").expect("failed to configure fail point");

    assert_auth_error!(cache.get_keys(Utc::now()).await, KeysUnavailable);
    assert_eq!(issuer.source.fetch_count(), 0, "source must not be reached");

    scenario.teardown();
}

#[tokio::test]
async fn fetch_failpoint_on_warm_cache_serves_last_good_set() {
    let scenario = fail::FailScenario::setup();
    let issuer = TestIssuer::new("fp-key");
    let validator = issuer.validator(test_token_config());
    let t0 = Utc::now();
    validator.key_cache().get_keys(t0).await.expect("warm-up fetch");

    fail::cfg("key-cache-before-fetch", "return").expect("failed to configure fail point");

    // Past the freshness window: the refresh fails, the old set is served.
    let later = t0 + TimeDelta::seconds(600);
    let token = issuer.sign(&standard_claims(later.timestamp()));
    let claims = validator.validate(&token, later).await.expect("served from last good set");
    assert_eq!(claims.sub, "user-1");
    assert!(validator.key_cache().status().last_error.is_some());

    scenario.teardown();
}

#[tokio::test]
async fn fetch_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    let issuer = TestIssuer::new("fp-key");
    let cache = issuer.key_cache(KeyCacheConfig::default());

    let keys = cache.get_keys(Utc::now()).await.expect("fetch should succeed");
    assert_eq!(keys.kids(), vec!["fp-key"]);

    scenario.teardown();
}
