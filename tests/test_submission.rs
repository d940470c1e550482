use mailqueue::config::{Config, WorkerConfig};
use mailqueue::database::emails::Recipient;
use mailqueue::database::suppression_list::SuppressionReason;
use mailqueue::database::{apps, email_events, emails, establish_connection, jobs, queues};
use mailqueue::error::ErrorCode;
use mailqueue::submission::EmailInput;
use mailqueue::AppState;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter,
    Set,
};
use std::sync::Arc;

fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        port: 8080,
        metrics_port: 9090,
        tracking_base_url: "http://localhost:8080".to_string(),
        worker: WorkerConfig::default(),
        default_key_rate_limit: None,
        smtp_timeout_ms: 1000,
        webhook_timeout_seconds: 2,
        reconcile_interval_seconds: 60,
        reputation_interval_seconds: 60,
        scheduler_interval_seconds: 60,
    }
}

async fn setup() -> AppState {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    AppState::build(db, test_config()).unwrap()
}

async fn create_app(state: &AppState) -> apps::Model {
    apps::ActiveModel {
        name: Set("Test App".to_string()),
        ..apps::ActiveModel::new()
    }
    .insert(&*state.db)
    .await
    .unwrap()
}

async fn create_queue(state: &AppState, app_id: &str, name: &str) -> queues::Model {
    queues::ActiveModel {
        app_id: Set(app_id.to_string()),
        name: Set(name.to_string()),
        ..queues::ActiveModel::new()
    }
    .insert(&*state.db)
    .await
    .unwrap()
}

fn input(queue: &str, to: &str) -> EmailInput {
    EmailInput {
        queue: queue.to_string(),
        from: Recipient {
            email: "n@a.io".to_string(),
            name: None,
        },
        to: vec![Recipient {
            email: to.to_string(),
            name: None,
        }],
        cc: vec![],
        bcc: vec![],
        reply_to: None,
        subject: "Hi".to_string(),
        html: None,
        text: Some("Hi".to_string()),
        headers: None,
        personalization: None,
        metadata: None,
        scheduled_at: None,
    }
}

#[tokio::test]
async fn submit_creates_queued_email_with_event_and_job() {
    let state = setup().await;
    let app = create_app(&state).await;
    let queue = create_queue(&state, &app.id, "tx").await;

    let email = state
        .submission
        .submit(&app.id, &queue, input("tx", "u@b.io"), None)
        .await
        .unwrap();

    assert_eq!(email.status, "queued");
    assert_eq!(email.app_id, app.id);

    let events = email_events::Entity::find()
        .filter(email_events::Column::EmailId.eq(&email.id))
        .all(&*state.db)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "queued");

    let job_count = jobs::Entity::find()
        .filter(jobs::Column::Lane.eq("email"))
        .filter(jobs::Column::Status.eq("pending"))
        .count(&*state.db)
        .await
        .unwrap();
    assert_eq!(job_count, 1);
}

#[tokio::test]
async fn zero_recipients_fail_validation() {
    let state = setup().await;
    let mut bad = input("tx", "u@b.io");
    bad.to.clear();

    let err = state.submission.validate(&bad).unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
}

#[tokio::test]
async fn invalid_address_fails_validation_with_path_details() {
    let state = setup().await;
    let bad = input("tx", "not-an-address");

    let err = state.submission.validate(&bad).unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
    let details = err.details.unwrap();
    assert!(details.to_string().contains("to[0].email"));
}

#[tokio::test]
async fn unknown_queue_and_paused_queue_are_rejected() {
    let state = setup().await;
    let app = create_app(&state).await;

    let err = state
        .submission
        .resolve_queue(&app.id, "missing")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::QueueNotFound);

    let queue = create_queue(&state, &app.id, "tx").await;
    let mut active: queues::ActiveModel = queue.into();
    active.paused = Set(true);
    active.update(&*state.db).await.unwrap();

    let err = state
        .submission
        .resolve_queue(&app.id, "tx")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::QueuePaused);
}

#[tokio::test]
async fn suppressed_recipient_rejects_whole_submission() {
    let state = setup().await;
    let app = create_app(&state).await;
    let queue = create_queue(&state, &app.id, "tx").await;

    state
        .suppression
        .add(Some(app.id.as_str()), "x@b.io", SuppressionReason::Manual, None, None)
        .await
        .unwrap();

    let err = state
        .submission
        .submit(&app.id, &queue, input("tx", "x@b.io"), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SuppressedEmail);

    // No email row was created.
    let count = emails::Entity::find().count(&*state.db).await.unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn idempotency_key_returns_original_id_without_second_row() {
    let state = setup().await;
    let app = create_app(&state).await;
    let queue = create_queue(&state, &app.id, "tx").await;

    let first = state
        .submission
        .submit(&app.id, &queue, input("tx", "u@b.io"), Some("abc".to_string()))
        .await
        .unwrap();

    let err = state
        .submission
        .submit(&app.id, &queue, input("tx", "u@b.io"), Some("abc".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::IdempotencyConflict);
    let details = err.details.unwrap();
    assert_eq!(details["emailId"], serde_json::json!(first.id));

    let count = emails::Entity::find().count(&*state.db).await.unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn past_schedule_enqueues_immediately() {
    let state = setup().await;
    let app = create_app(&state).await;
    let queue = create_queue(&state, &app.id, "tx").await;

    let mut scheduled = input("tx", "u@b.io");
    scheduled.scheduled_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));

    state
        .submission
        .submit(&app.id, &queue, scheduled, None)
        .await
        .unwrap();

    let job = jobs::Entity::find().one(&*state.db).await.unwrap().unwrap();
    assert!(job.scheduled_at <= chrono::Utc::now().timestamp_micros());
}

#[tokio::test]
async fn future_schedule_delays_job_and_can_be_cancelled() {
    let state = setup().await;
    let app = create_app(&state).await;
    let queue = create_queue(&state, &app.id, "tx").await;

    let mut scheduled = input("tx", "u@b.io");
    scheduled.scheduled_at = Some(chrono::Utc::now() + chrono::Duration::days(365));

    let email = state
        .submission
        .submit(&app.id, &queue, scheduled, None)
        .await
        .unwrap();
    assert_eq!(email.status, "queued");

    let job = jobs::Entity::find().one(&*state.db).await.unwrap().unwrap();
    assert!(job.scheduled_at > chrono::Utc::now().timestamp_micros());

    state.submission.cancel(&app.id, &email.id).await.unwrap();
    let email = emails::Entity::find_by_id(email.id)
        .one(&*state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(email.status, "cancelled");
}

#[tokio::test]
async fn cancel_requires_queued_status() {
    let state = setup().await;
    let app = create_app(&state).await;
    let queue = create_queue(&state, &app.id, "tx").await;

    let email = state
        .submission
        .submit(&app.id, &queue, input("tx", "u@b.io"), None)
        .await
        .unwrap();

    let mut active: emails::ActiveModel = email.clone().into();
    active.status = Set("sent".to_string());
    active.update(&*state.db).await.unwrap();

    let err = state
        .submission
        .cancel(&app.id, &email.id)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
}

#[tokio::test]
async fn retry_requires_failed_status_and_requeues() {
    let state = setup().await;
    let app = create_app(&state).await;
    let queue = create_queue(&state, &app.id, "tx").await;

    let email = state
        .submission
        .submit(&app.id, &queue, input("tx", "u@b.io"), None)
        .await
        .unwrap();

    // Retrying a queued email is a validation error.
    let err = state
        .submission
        .retry(&app.id, &email.id)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);

    let mut active: emails::ActiveModel = email.clone().into();
    active.status = Set("failed".to_string());
    active.last_error = Set(Some("550 boom".to_string()));
    active.retry_count = Set(3);
    active.update(&*state.db).await.unwrap();

    let retried = state.submission.retry(&app.id, &email.id).await.unwrap();
    assert_eq!(retried.status, "queued");
    assert_eq!(retried.last_error, None);

    let events = email_events::Entity::find()
        .filter(email_events::Column::EmailId.eq(&email.id))
        .all(&*state.db)
        .await
        .unwrap();
    let retry_event = events
        .iter()
        .find(|e| e.event_data.contains("previousAttempts"))
        .expect("retry event present");
    assert!(retry_event.event_data.contains("\"retry\":true"));
}

#[tokio::test]
async fn reconcile_requeues_stranded_queued_email() {
    let state = setup().await;
    let app = create_app(&state).await;
    let queue = create_queue(&state, &app.id, "tx").await;

    let email = state
        .submission
        .submit(&app.id, &queue, input("tx", "u@b.io"), None)
        .await
        .unwrap();

    // Simulate the crash window: the email row exists but its job is gone.
    jobs::Entity::delete_many()
        .exec(&*state.db)
        .await
        .unwrap();

    let recovered = state.submission.reconcile(300).await.unwrap();
    assert_eq!(recovered, 1);

    let job = jobs::Entity::find().one(&*state.db).await.unwrap().unwrap();
    assert!(job.payload.contains(&email.id));

    // A second sweep sees the live job and does nothing.
    let recovered = state.submission.reconcile(300).await.unwrap();
    assert_eq!(recovered, 0);
}
