use mailqueue::broker::{Broker, JobPayload, Lane};
use mailqueue::database::establish_connection;
use std::sync::Arc;

async fn setup() -> Broker {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    Broker::new(db)
}

fn payload(email_id: &str) -> JobPayload {
    JobPayload::SendEmail {
        email_id: email_id.to_string(),
        app_id: "app-1".to_string(),
        queue_id: "q-1".to_string(),
        priority: 5,
    }
}

#[tokio::test]
async fn higher_priority_jobs_are_leased_first() {
    let broker = setup().await;
    broker.enqueue(Lane::Email, 1, 0, &payload("low")).await.unwrap();
    broker.enqueue(Lane::Email, 9, 0, &payload("high")).await.unwrap();

    let job = broker.lease(Lane::Email, "w1").await.unwrap().unwrap();
    assert_eq!(job.payload.email_id(), Some("high"));

    let job = broker.lease(Lane::Email, "w1").await.unwrap().unwrap();
    assert_eq!(job.payload.email_id(), Some("low"));
}

#[tokio::test]
async fn delayed_jobs_are_invisible_until_due() {
    let broker = setup().await;
    broker
        .enqueue(Lane::Email, 5, 3600, &payload("later"))
        .await
        .unwrap();

    assert!(broker.lease(Lane::Email, "w1").await.unwrap().is_none());
    assert_eq!(broker.pending_count(Lane::Email).await.unwrap(), 1);
}

#[tokio::test]
async fn leased_jobs_are_not_visible_to_other_workers() {
    let broker = setup().await;
    broker.enqueue(Lane::Email, 5, 0, &payload("only")).await.unwrap();

    let job = broker.lease(Lane::Email, "w1").await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert!(broker.lease(Lane::Email, "w2").await.unwrap().is_none());
}

#[tokio::test]
async fn ack_removes_the_job() {
    let broker = setup().await;
    broker.enqueue(Lane::Email, 5, 0, &payload("done")).await.unwrap();

    let job = broker.lease(Lane::Email, "w1").await.unwrap().unwrap();
    broker.ack(&job.id).await.unwrap();

    assert!(broker.lease(Lane::Email, "w1").await.unwrap().is_none());
    assert_eq!(broker.pending_count(Lane::Email).await.unwrap(), 0);
}

#[tokio::test]
async fn nack_returns_the_job_to_the_lane() {
    let broker = setup().await;
    broker.enqueue(Lane::Email, 5, 0, &payload("again")).await.unwrap();

    let job = broker.lease(Lane::Email, "w1").await.unwrap().unwrap();
    broker.nack(&job.id, 0).await.unwrap();

    let job = broker.lease(Lane::Email, "w2").await.unwrap().unwrap();
    assert_eq!(job.payload.email_id(), Some("again"));
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
async fn expired_leases_are_reclaimed() {
    let broker = setup().await;
    broker.enqueue(Lane::Email, 5, 0, &payload("stuck")).await.unwrap();

    let _job = broker.lease(Lane::Email, "w1").await.unwrap().unwrap();
    assert!(broker.lease(Lane::Email, "w2").await.unwrap().is_none());

    // Zero visibility makes the claim instantly stale.
    let reclaimed = broker.reclaim_expired(0).await.unwrap();
    assert_eq!(reclaimed, 1);

    let job = broker.lease(Lane::Email, "w2").await.unwrap().unwrap();
    assert_eq!(job.payload.email_id(), Some("stuck"));
}

#[tokio::test]
async fn lanes_are_isolated() {
    let broker = setup().await;
    broker.enqueue(Lane::Email, 5, 0, &payload("mail")).await.unwrap();

    assert!(broker.lease(Lane::Webhook, "w1").await.unwrap().is_none());
    assert!(broker.lease(Lane::Tracking, "w1").await.unwrap().is_none());
    assert!(broker.lease(Lane::Email, "w1").await.unwrap().is_some());
}

#[tokio::test]
async fn live_job_lookup_sees_pending_and_claimed() {
    let broker = setup().await;
    broker.enqueue(Lane::Email, 5, 0, &payload("e-77")).await.unwrap();

    assert!(broker.has_live_job(Lane::Email, "e-77").await.unwrap());

    let job = broker.lease(Lane::Email, "w1").await.unwrap().unwrap();
    assert!(broker.has_live_job(Lane::Email, "e-77").await.unwrap());

    broker.ack(&job.id).await.unwrap();
    assert!(!broker.has_live_job(Lane::Email, "e-77").await.unwrap());
}
