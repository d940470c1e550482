use mailqueue::database::{emails, establish_connection, tracking_links};
use mailqueue::tracking::TrackingService;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, Set,
};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

async fn setup() -> (Arc<DatabaseConnection>, TrackingService) {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    let tracking = TrackingService::new(db.clone(), "https://track.example.com/");
    (db, tracking)
}

async fn create_email(db: &DatabaseConnection) -> emails::Model {
    emails::ActiveModel {
        app_id: Set("app-1".to_string()),
        queue_id: Set("q-1".to_string()),
        from_email: Set("n@a.io".to_string()),
        to_recipients: Set(r#"[{"email":"u@b.io"}]"#.to_string()),
        subject: Set("Hi".to_string()),
        html_body: Set(Some("<p>Hi</p>".to_string())),
        ..emails::ActiveModel::new()
    }
    .insert(db)
    .await
    .unwrap()
}

#[tokio::test]
async fn rewrites_http_links_and_injects_pixel() {
    let (db, tracking) = setup().await;
    let email = create_email(&db).await;

    let html = concat!(
        "<html><body>",
        r#"<a href="https://example.com/buy">Buy</a>"#,
        r#"<a href="http://example.com/docs">Docs</a>"#,
        r#"<a href="mailto:support@example.com">Mail us</a>"#,
        r##"<a href="#top">Top</a>"##,
        "</body></html>",
    );

    let prepared = tracking.prepare_html(&email.id, html).await.unwrap();

    // Both web links rewritten to short-code redirects.
    assert_eq!(prepared.matches("https://track.example.com/c/").count(), 2);
    assert!(!prepared.contains(r#"href="https://example.com/buy""#));
    assert!(!prepared.contains(r#"href="http://example.com/docs""#));
    // Non-web schemes untouched.
    assert!(prepared.contains(r#"href="mailto:support@example.com""#));
    assert!(prepared.contains(r##"href="#top""##));

    // Pixel injected before the closing body tag.
    let pixel_pos = prepared.find("/t/").unwrap();
    let body_pos = prepared.find("</body>").unwrap();
    assert!(pixel_pos < body_pos);
    assert!(prepared.contains("open.gif"));

    let links = tracking_links::Entity::find()
        .filter(tracking_links::Column::EmailId.eq(&email.id))
        .all(&*db)
        .await
        .unwrap();
    assert_eq!(links.len(), 2);
    let urls: HashSet<&str> = links.iter().map(|l| l.original_url.as_str()).collect();
    assert!(urls.contains("https://example.com/buy"));
    assert!(urls.contains("http://example.com/docs"));
}

#[tokio::test]
async fn pixel_is_appended_when_no_body_tag() {
    let (db, tracking) = setup().await;
    let email = create_email(&db).await;

    let prepared = tracking.prepare_html(&email.id, "<p>Hello</p>").await.unwrap();
    assert!(prepared.starts_with("<p>Hello</p>"));
    assert!(prepared.contains("open.gif"));
}

#[tokio::test]
async fn short_codes_are_unique_across_emails() {
    let (db, tracking) = setup().await;

    let mut codes = HashSet::new();
    for _ in 0..5 {
        let email = create_email(&db).await;
        let html = r#"<body><a href="https://example.com/a">A</a><a href="https://example.com/b">B</a></body>"#;
        tracking.prepare_html(&email.id, html).await.unwrap();
    }

    let links = tracking_links::Entity::find().all(&*db).await.unwrap();
    assert_eq!(links.len(), 10);
    for link in &links {
        assert_eq!(link.short_code.len(), 10);
        assert!(
            codes.insert(link.short_code.clone()),
            "duplicate short code {}",
            link.short_code
        );
    }
}

#[tokio::test]
async fn click_lookup_and_counter() {
    let (db, tracking) = setup().await;
    let email = create_email(&db).await;

    tracking
        .prepare_html(
            &email.id,
            r#"<body><a href="https://example.com/x">X</a></body>"#,
        )
        .await
        .unwrap();

    let link = tracking_links::Entity::find()
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.click_count, 0);

    let found = tracking.find_link(&link.short_code).await.unwrap().unwrap();
    assert_eq!(found.original_url, "https://example.com/x");

    tracking.increment_click(&link.short_code).await.unwrap();
    tracking.increment_click(&link.short_code).await.unwrap();

    let link = tracking.find_link(&link.short_code).await.unwrap().unwrap();
    assert_eq!(link.click_count, 2);

    assert!(tracking.find_link("ZZZZZZZZZZ").await.unwrap().is_none());
}

#[tokio::test]
async fn open_token_round_trips_through_decode() {
    let id = Uuid::now_v7().to_string();
    let token = mailqueue::tracking::open_token(&id).unwrap();
    assert_eq!(mailqueue::tracking::decode_open_token(&token).unwrap(), id);
    assert!(mailqueue::tracking::decode_open_token("!!!").is_err());
}
