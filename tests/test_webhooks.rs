use mailqueue::broker::Broker;
use mailqueue::database::{apps, establish_connection, jobs, webhook_deliveries};
use mailqueue::webhook::{WebhookService, MAX_ATTEMPTS};
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set,
};
use std::sync::Arc;

async fn setup() -> (Arc<DatabaseConnection>, Broker, WebhookService) {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    let broker = Broker::new(db.clone());
    let webhook = WebhookService::new(db.clone(), broker.clone(), 2);
    (db, broker, webhook)
}

async fn create_app(db: &DatabaseConnection, url: Option<&str>) -> apps::Model {
    apps::ActiveModel {
        name: Set("Test App".to_string()),
        webhook_url: Set(url.map(|u| u.to_string())),
        webhook_secret: Set(url.map(|_| "whsec_test".to_string())),
        ..apps::ActiveModel::new()
    }
    .insert(db)
    .await
    .unwrap()
}

#[tokio::test]
async fn publish_snapshots_payload_and_enqueues_job() {
    let (db, _broker, webhook) = setup().await;
    // Port 1 on loopback: connection refused, nothing listens there.
    let app = create_app(&db, Some("http://127.0.0.1:1/hooks")).await;

    webhook
        .publish(&app, None, Some("tx"), "email.sent", None)
        .await
        .unwrap();

    let delivery = webhook_deliveries::Entity::find()
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.status, "pending");
    assert_eq!(delivery.attempts, 0);
    assert_eq!(delivery.event_type, "email.sent");

    let payload: serde_json::Value = serde_json::from_str(&delivery.payload).unwrap();
    assert_eq!(payload["type"], "email.sent");
    assert!(payload["id"].as_str().is_some());
    assert!(payload["timestamp"].as_str().is_some());
    assert_eq!(payload["data"]["appId"], serde_json::json!(app.id));
    assert_eq!(payload["data"]["queueName"], serde_json::json!("tx"));

    let job_count = jobs::Entity::find()
        .filter(jobs::Column::Lane.eq("webhook"))
        .count(&*db)
        .await
        .unwrap();
    assert_eq!(job_count, 1);
}

#[tokio::test]
async fn apps_without_subscriber_are_skipped() {
    let (db, _broker, webhook) = setup().await;
    let app = create_app(&db, None).await;

    webhook
        .publish(&app, None, Some("tx"), "email.sent", None)
        .await
        .unwrap();

    let count = webhook_deliveries::Entity::find().count(&*db).await.unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn failed_post_walks_the_retry_curve_to_terminal() {
    let (db, _broker, webhook) = setup().await;
    let app = create_app(&db, Some("http://127.0.0.1:1/hooks")).await;

    webhook
        .publish(&app, None, Some("tx"), "email.sent", None)
        .await
        .unwrap();
    let delivery = webhook_deliveries::Entity::find()
        .one(&*db)
        .await
        .unwrap()
        .unwrap();

    // First failed attempt schedules a retry.
    webhook.deliver(&delivery.id).await.unwrap();
    let after_first = webhook_deliveries::Entity::find_by_id(delivery.id.clone())
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after_first.status, "pending");
    assert_eq!(after_first.attempts, 1);
    assert!(after_first.next_retry_at.is_some());
    assert!(after_first.last_error.is_some());

    // Exhaust the remaining attempts.
    for _ in 1..MAX_ATTEMPTS {
        webhook.deliver(&delivery.id).await.unwrap();
    }

    let terminal = webhook_deliveries::Entity::find_by_id(delivery.id.clone())
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(terminal.status, "failed");
    assert_eq!(terminal.attempts, MAX_ATTEMPTS);
    assert_eq!(terminal.next_retry_at, None);
    assert_eq!(terminal.delivered_at, None);

    // Terminal deliveries are not retried further.
    webhook.deliver(&delivery.id).await.unwrap();
    let still_terminal = webhook_deliveries::Entity::find_by_id(delivery.id)
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still_terminal.attempts, MAX_ATTEMPTS);
}

#[tokio::test]
async fn sweeper_requeues_due_deliveries_without_live_jobs() {
    let (db, broker, webhook) = setup().await;
    let app = create_app(&db, Some("http://127.0.0.1:1/hooks")).await;

    webhook
        .publish(&app, None, Some("tx"), "email.sent", None)
        .await
        .unwrap();

    // Crash scenario: the delivery row exists but its job vanished.
    jobs::Entity::delete_many().exec(&*db).await.unwrap();

    let requeued = webhook.sweep_due(10).await.unwrap();
    assert_eq!(requeued, 1);

    // A live job now exists, so the next sweep is a no-op.
    let requeued = webhook.sweep_due(10).await.unwrap();
    assert_eq!(requeued, 0);

    let pending = broker
        .pending_count(mailqueue::broker::Lane::Webhook)
        .await
        .unwrap();
    assert_eq!(pending, 1);
}
