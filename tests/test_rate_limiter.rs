use mailqueue::database::establish_connection;
use mailqueue::ratelimit::{RateLimiter, Tier, TierCheck};
use std::sync::Arc;

async fn setup() -> RateLimiter {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    RateLimiter::new(db)
}

fn api_key_check(limit: i64) -> TierCheck {
    TierCheck {
        tier: Tier::ApiKey,
        id: "key-1".to_string(),
        limit: Some(limit),
    }
}

#[tokio::test]
async fn third_request_in_window_is_denied() {
    let limiter = setup().await;
    let checks = [api_key_check(2)];

    let first = limiter.acquire(&checks).await.unwrap();
    assert!(first.allowed);
    assert_eq!(first.decision_for(Tier::ApiKey).unwrap().remaining, 1);

    let second = limiter.acquire(&checks).await.unwrap();
    assert!(second.allowed);
    assert_eq!(second.decision_for(Tier::ApiKey).unwrap().remaining, 0);

    let third = limiter.acquire(&checks).await.unwrap();
    assert!(!third.allowed);
    assert_eq!(third.blocked_by, Some(Tier::ApiKey));

    let decision = third.decision_for(Tier::ApiKey).unwrap();
    assert_eq!(decision.remaining, 0);
    assert_eq!(decision.limit, 2);

    let retry_after = third.retry_after_seconds().unwrap();
    assert!(retry_after >= 1 && retry_after <= 60, "{retry_after}");
}

#[tokio::test]
async fn zero_limit_blocks_every_request() {
    let limiter = setup().await;
    let checks = [TierCheck {
        tier: Tier::Queue,
        id: "q-1".to_string(),
        limit: Some(0),
    }];

    let outcome = limiter.acquire(&checks).await.unwrap();
    assert!(!outcome.allowed);
    assert_eq!(outcome.blocked_by, Some(Tier::Queue));
}

#[tokio::test]
async fn null_limits_skip_the_tier() {
    let limiter = setup().await;
    let checks = [
        TierCheck {
            tier: Tier::ApiKey,
            id: "key-1".to_string(),
            limit: None,
        },
        TierCheck {
            tier: Tier::AppDaily,
            id: "app-1".to_string(),
            limit: None,
        },
    ];

    for _ in 0..50 {
        let outcome = limiter.acquire(&checks).await.unwrap();
        assert!(outcome.allowed);
        assert!(outcome.decisions.is_empty());
    }
}

#[tokio::test]
async fn check_does_not_consume_quota() {
    let limiter = setup().await;
    let checks = [api_key_check(1)];

    for _ in 0..5 {
        let outcome = limiter.check(&checks).await.unwrap();
        assert!(outcome.allowed);
    }

    // The read-only checks above must not have used the single slot.
    let acquired = limiter.acquire(&checks).await.unwrap();
    assert!(acquired.allowed);

    let denied = limiter.acquire(&checks).await.unwrap();
    assert!(!denied.allowed);
}

#[tokio::test]
async fn first_denying_tier_reports_blocked_by() {
    let limiter = setup().await;
    let checks = [
        api_key_check(100),
        TierCheck {
            tier: Tier::AppDaily,
            id: "app-1".to_string(),
            limit: Some(0),
        },
        TierCheck {
            tier: Tier::Queue,
            id: "q-1".to_string(),
            limit: Some(0),
        },
    ];

    let outcome = limiter.acquire(&checks).await.unwrap();
    assert!(!outcome.allowed);
    assert_eq!(outcome.blocked_by, Some(Tier::AppDaily));
}

#[tokio::test]
async fn denial_does_not_increment_counters() {
    let limiter = setup().await;
    let checks = [api_key_check(1)];

    assert!(limiter.acquire(&checks).await.unwrap().allowed);
    for _ in 0..3 {
        assert!(!limiter.acquire(&checks).await.unwrap().allowed);
    }

    // Only the single successful acquisition counted; a larger limit on
    // the same window would still see count == 1.
    let wider = [TierCheck {
        tier: Tier::ApiKey,
        id: "key-1".to_string(),
        limit: Some(2),
    }];
    let outcome = limiter.acquire(&wider).await.unwrap();
    assert!(outcome.allowed);
}
