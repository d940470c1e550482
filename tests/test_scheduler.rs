use mailqueue::config::{Config, WorkerConfig};
use mailqueue::database::{apps, emails, establish_connection, queues, scheduled_jobs};
use mailqueue::schedule::SchedulerService;
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

async fn setup() -> (AppState, SchedulerService) {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    let state = AppState::build(db, test_config()).unwrap();
    let scheduler = SchedulerService::new(state.db.clone(), state.submission.clone());
    (state, scheduler)
}

async fn create_fixtures(state: &AppState) -> (apps::Model, queues::Model) {
    let app = apps::ActiveModel {
        name: Set("Test App".to_string()),
        ..apps::ActiveModel::new()
    }
    .insert(&*state.db)
    .await
    .unwrap();
    let queue = queues::ActiveModel {
        app_id: Set(app.id.clone()),
        name: Set("digest".to_string()),
        ..queues::ActiveModel::new()
    }
    .insert(&*state.db)
    .await
    .unwrap();
    (app, queue)
}

const TEMPLATE: &str = r#"{
    "from": {"email": "digest@a.io"},
    "to": [{"email": "u@b.io"}],
    "subject": "Daily digest for {{name}}",
    "text": "Hello {{name}}, here is your digest.",
    "variables": {"name": "Ada"}
}"#;

async fn create_schedule(
    state: &AppState,
    app_id: &str,
    queue_id: &str,
    next_run_at: Option<i64>,
) -> scheduled_jobs::Model {
    scheduled_jobs::ActiveModel {
        app_id: Set(app_id.to_string()),
        queue_id: Set(queue_id.to_string()),
        name: Set("daily-digest".to_string()),
        cron_expression: Set("0 0 9 * * *".to_string()),
        timezone: Set("UTC".to_string()),
        template: Set(TEMPLATE.to_string()),
        next_run_at: Set(next_run_at),
        ..scheduled_jobs::ActiveModel::new()
    }
    .insert(&*state.db)
    .await
    .unwrap()
}

#[tokio::test]
async fn due_schedule_fires_rendered_template() {
    let (state, scheduler) = setup().await;
    let (app, queue) = create_fixtures(&state).await;
    let past = chrono::Utc::now().timestamp_micros() - 1_000_000;
    let schedule = create_schedule(&state, &app.id, &queue.id, Some(past)).await;

    let fired = scheduler.tick().await.unwrap();
    assert_eq!(fired, 1);

    let email = emails::Entity::find()
        .filter(emails::Column::AppId.eq(&app.id))
        .one(&*state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(email.subject, "Daily digest for Ada");
    assert_eq!(email.queue_id, queue.id);
    assert_eq!(email.status, "queued");
    assert!(email.text_body.unwrap().contains("Hello Ada"));

    let schedule = scheduled_jobs::Entity::find_by_id(schedule.id)
        .one(&*state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(schedule.last_run_at.is_some());
    assert!(schedule.next_run_at.unwrap() > chrono::Utc::now().timestamp_micros());
}

#[tokio::test]
async fn unseeded_schedule_is_primed_without_firing() {
    let (state, scheduler) = setup().await;
    let (app, queue) = create_fixtures(&state).await;
    let schedule = create_schedule(&state, &app.id, &queue.id, None).await;

    let fired = scheduler.tick().await.unwrap();
    assert_eq!(fired, 0);

    let count = emails::Entity::find().count(&*state.db).await.unwrap();
    assert_eq!(count, 0);

    let schedule = scheduled_jobs::Entity::find_by_id(schedule.id)
        .one(&*state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(schedule.next_run_at.is_some());
    assert!(schedule.last_run_at.is_none());
}

#[tokio::test]
async fn inactive_schedules_do_not_fire() {
    let (state, scheduler) = setup().await;
    let (app, queue) = create_fixtures(&state).await;
    let past = chrono::Utc::now().timestamp_micros() - 1_000_000;
    let schedule = create_schedule(&state, &app.id, &queue.id, Some(past)).await;

    let mut active: scheduled_jobs::ActiveModel = schedule.into();
    active.active = Set(false);
    active.update(&*state.db).await.unwrap();

    let fired = scheduler.tick().await.unwrap();
    assert_eq!(fired, 0);
    assert_eq!(emails::Entity::find().count(&*state.db).await.unwrap(), 0);
}

#[tokio::test]
async fn paused_queue_skips_the_fire_but_advances_the_schedule() {
    let (state, scheduler) = setup().await;
    let (app, queue) = create_fixtures(&state).await;
    let mut active: queues::ActiveModel = queue.clone().into();
    active.paused = Set(true);
    active.update(&*state.db).await.unwrap();

    let past = chrono::Utc::now().timestamp_micros() - 1_000_000;
    let schedule = create_schedule(&state, &app.id, &queue.id, Some(past)).await;

    scheduler.tick().await.unwrap();

    assert_eq!(emails::Entity::find().count(&*state.db).await.unwrap(), 0);
    let schedule = scheduled_jobs::Entity::find_by_id(schedule.id)
        .one(&*state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(schedule.next_run_at.unwrap() > chrono::Utc::now().timestamp_micros());
}
