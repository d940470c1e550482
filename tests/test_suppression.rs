use mailqueue::database::suppression_list::SuppressionReason;
use mailqueue::database::{email_events, emails, establish_connection};
use mailqueue::suppression::SuppressionService;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, Set,
};
use std::sync::Arc;

async fn setup() -> (Arc<DatabaseConnection>, SuppressionService) {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    let service = SuppressionService::new(db.clone());
    (db, service)
}

#[tokio::test]
async fn addresses_are_normalized_before_storage_and_lookup() {
    let (_db, service) = setup().await;

    assert!(service
        .add(Some("app-1"), "  User@Example.COM ", SuppressionReason::Manual, None, None)
        .await
        .unwrap());

    let check = service.check("app-1", "user@example.com").await.unwrap();
    assert!(check.is_suppressed);
    assert_eq!(check.reason, Some(SuppressionReason::Manual));

    // Lookup normalises too.
    let check = service.check("app-1", "USER@EXAMPLE.COM").await.unwrap();
    assert!(check.is_suppressed);
}

#[tokio::test]
async fn global_entries_apply_to_every_tenant() {
    let (_db, service) = setup().await;

    service
        .add(None, "spam@example.com", SuppressionReason::Manual, None, None)
        .await
        .unwrap();

    for app in ["app-1", "app-2", "app-3"] {
        let check = service.check(app, "spam@example.com").await.unwrap();
        assert!(check.is_suppressed, "global entry must apply to {app}");
    }
}

#[tokio::test]
async fn complaint_upgrades_and_clears_expiry() {
    let (_db, service) = setup().await;
    let expires = chrono::Utc::now().timestamp_micros() + 1_000_000_000;

    service
        .add(
            Some("app-1"),
            "flaky@example.com",
            SuppressionReason::SoftBounce,
            None,
            Some(expires),
        )
        .await
        .unwrap();

    let check = service.check("app-1", "flaky@example.com").await.unwrap();
    assert_eq!(check.reason, Some(SuppressionReason::SoftBounce));
    assert!(check.expires_at.is_some());

    // Complaint upgrades the reason and makes the entry permanent.
    assert!(service
        .add(
            Some("app-1"),
            "flaky@example.com",
            SuppressionReason::Complaint,
            Some("email-9"),
            None,
        )
        .await
        .unwrap());

    let check = service.check("app-1", "flaky@example.com").await.unwrap();
    assert_eq!(check.reason, Some(SuppressionReason::Complaint));
    assert_eq!(check.expires_at, None);

    // Nothing outranks a complaint.
    assert!(!service
        .add(
            Some("app-1"),
            "flaky@example.com",
            SuppressionReason::HardBounce,
            None,
            None,
        )
        .await
        .unwrap());
    let check = service.check("app-1", "flaky@example.com").await.unwrap();
    assert_eq!(check.reason, Some(SuppressionReason::Complaint));
}

#[tokio::test]
async fn soft_bounces_default_to_seven_day_expiry() {
    let (_db, service) = setup().await;
    let before = chrono::Utc::now().timestamp_micros();

    service
        .add(
            Some("app-1"),
            "full@example.com",
            SuppressionReason::SoftBounce,
            None,
            None,
        )
        .await
        .unwrap();

    let check = service.check("app-1", "full@example.com").await.unwrap();
    let expires = check.expires_at.unwrap();
    let seven_days = 7 * 24 * 60 * 60 * 1_000_000;
    assert!(expires >= before + seven_days);
    assert!(expires <= before + seven_days + 10_000_000);
}

#[tokio::test]
async fn expired_entries_do_not_suppress() {
    let (_db, service) = setup().await;
    let past = chrono::Utc::now().timestamp_micros() - 1_000_000;

    service
        .add(
            Some("app-1"),
            "old@example.com",
            SuppressionReason::Manual,
            None,
            Some(past),
        )
        .await
        .unwrap();

    let check = service.check("app-1", "old@example.com").await.unwrap();
    assert!(!check.is_suppressed);
}

#[tokio::test]
async fn remove_deletes_the_entry() {
    let (_db, service) = setup().await;

    service
        .add(Some("app-1"), "gone@example.com", SuppressionReason::Manual, None, None)
        .await
        .unwrap();
    assert!(service.remove(Some("app-1"), "gone@example.com").await.unwrap());
    assert!(!service.remove(Some("app-1"), "gone@example.com").await.unwrap());

    let check = service.check("app-1", "gone@example.com").await.unwrap();
    assert!(!check.is_suppressed);
}

#[tokio::test]
async fn bulk_add_reports_added_and_skipped() {
    let (_db, service) = setup().await;

    service
        .add(Some("app-1"), "dup@example.com", SuppressionReason::Manual, None, None)
        .await
        .unwrap();

    let entries = vec![
        ("dup@example.com".to_string(), SuppressionReason::Manual, None),
        ("new1@example.com".to_string(), SuppressionReason::Manual, None),
        ("new2@example.com".to_string(), SuppressionReason::HardBounce, None),
    ];
    let result = service.add_bulk(Some("app-1"), &entries).await.unwrap();
    assert_eq!(result.added, 2);
    assert_eq!(result.skipped, 1);
}

#[tokio::test]
async fn csv_round_trip_preserves_address_reason_pairs() {
    let (_db, exporter) = setup().await;
    let expires = chrono::Utc::now().timestamp_micros() + 86_400_000_000;

    exporter
        .add(Some("app-1"), "a@example.com", SuppressionReason::Manual, None, None)
        .await
        .unwrap();
    exporter
        .add(Some("app-1"), "b@example.com", SuppressionReason::HardBounce, None, None)
        .await
        .unwrap();
    exporter
        .add(
            Some("app-1"),
            "c@example.com",
            SuppressionReason::SoftBounce,
            None,
            Some(expires),
        )
        .await
        .unwrap();

    let csv = exporter.export_csv(Some("app-1")).await.unwrap();
    assert!(csv.starts_with("email_address,reason,expires_at,created_at"));

    // Import into an empty tenant store.
    let (_db2, importer) = setup().await;
    let result = importer.import_csv(Some("app-2"), &csv).await.unwrap();
    assert_eq!(result.imported, 3);
    assert!(result.errors.is_empty());

    let (entries, total) = importer.list(Some("app-2"), 100, 0).await.unwrap();
    assert_eq!(total, 3);

    let mut pairs: Vec<(String, String)> = entries
        .iter()
        .map(|e| (e.email_address.clone(), e.reason.clone()))
        .collect();
    pairs.sort();
    assert_eq!(
        pairs,
        vec![
            ("a@example.com".to_string(), "manual".to_string()),
            ("b@example.com".to_string(), "hard_bounce".to_string()),
            ("c@example.com".to_string(), "soft_bounce".to_string()),
        ]
    );

    // expires_at preserved (second precision or better).
    let soft = entries
        .iter()
        .find(|e| e.email_address == "c@example.com")
        .unwrap();
    let diff = (soft.expires_at.unwrap() - expires).abs();
    assert!(diff < 1_000_000, "expiry drifted by {diff} micros");
}

#[tokio::test]
async fn csv_import_reports_invalid_rows_without_aborting() {
    let (_db, service) = setup().await;

    let mut csv = String::from("email_address,reason,expires_at,created_at\n");
    for i in 0..100 {
        csv.push_str(&format!("user{i}@example.com,manual,,\n"));
    }
    csv.push_str("not-an-address,manual,,\n");
    csv.push_str("bad-reason@example.com,whatever,,\n");

    let result = service.import_csv(Some("app-1"), &csv).await.unwrap();
    assert_eq!(result.imported, 100);
    assert_eq!(result.errors.len(), 2);
    assert!(result.errors[0].contains("line 102"));
    assert!(result.errors[1].contains("line 103"));
}

async fn create_email(db: &DatabaseConnection, to: &str) -> emails::Model {
    emails::ActiveModel {
        app_id: Set("app-1".to_string()),
        queue_id: Set("q-1".to_string()),
        from_email: Set("n@a.io".to_string()),
        to_recipients: Set(format!(r#"[{{"email":"{to}"}}]"#)),
        subject: Set("Hi".to_string()),
        text_body: Set(Some("Hi".to_string())),
        status: Set("sent".to_string()),
        ..emails::ActiveModel::new()
    }
    .insert(db)
    .await
    .unwrap()
}

#[tokio::test]
async fn unsubscribe_with_source_email_appends_event() {
    let (db, service) = setup().await;
    let email = create_email(&db, "done@example.com").await;

    assert!(service
        .add(
            Some("app-1"),
            "done@example.com",
            SuppressionReason::Unsubscribe,
            Some(&email.id),
            None,
        )
        .await
        .unwrap());

    let events = email_events::Entity::find()
        .filter(email_events::Column::EmailId.eq(&email.id))
        .all(&*db)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "unsubscribed");
    assert!(events[0].event_data.contains("done@example.com"));

    let check = service.check("app-1", "done@example.com").await.unwrap();
    assert!(check.is_suppressed);
    assert_eq!(check.reason, Some(SuppressionReason::Unsubscribe));

    // A repeat unsubscribe through the same email still records the action
    // even though the entry already exists.
    assert!(!service
        .add(
            Some("app-1"),
            "done@example.com",
            SuppressionReason::Unsubscribe,
            Some(&email.id),
            None,
        )
        .await
        .unwrap());
    let count = email_events::Entity::find()
        .filter(email_events::Column::EmailId.eq(&email.id))
        .all(&*db)
        .await
        .unwrap()
        .len();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn unsubscribe_without_source_email_skips_event() {
    let (db, service) = setup().await;

    assert!(service
        .add(
            Some("app-1"),
            "quiet@example.com",
            SuppressionReason::Unsubscribe,
            None,
            None,
        )
        .await
        .unwrap());

    let events = email_events::Entity::find().all(&*db).await.unwrap();
    assert!(events.is_empty());
}
