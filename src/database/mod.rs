pub mod analytics_counters;
pub mod api_keys;
pub mod app_reputation;
pub mod apps;
pub mod email_events;
pub mod emails;
pub mod jobs;
pub mod queues;
pub mod rate_counters;
pub mod scheduled_jobs;
pub mod smtp_configs;
pub mod suppression_list;
pub mod tracking_links;
pub mod webhook_deliveries;

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};

pub async fn establish_connection(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(database_url).await?;
    create_tables(&db).await?;
    Ok(db)
}

/// Idempotent schema bootstrap. Timestamps are epoch microseconds (BIGINT),
/// identifiers are UUID strings.
pub async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();

    let sql_statements = vec![
        r#"CREATE TABLE IF NOT EXISTS apps (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sandbox BOOLEAN NOT NULL DEFAULT FALSE,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            webhook_url TEXT,
            webhook_secret TEXT,
            daily_limit BIGINT,
            monthly_limit BIGINT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY,
            app_id TEXT NOT NULL,
            name TEXT NOT NULL,
            prefix TEXT NOT NULL,
            key_hash TEXT NOT NULL,
            scopes TEXT NOT NULL,
            rate_limit BIGINT,
            ip_allowlist TEXT,
            expires_at BIGINT,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            last_used_at BIGINT,
            created_at BIGINT NOT NULL,
            FOREIGN KEY (app_id) REFERENCES apps(id) ON DELETE CASCADE
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys(prefix)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_api_keys_app_id ON api_keys(app_id)"#,
        r#"CREATE TABLE IF NOT EXISTS queues (
            id TEXT PRIMARY KEY,
            app_id TEXT NOT NULL,
            name TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 5,
            rate_limit BIGINT,
            max_retries INTEGER NOT NULL DEFAULT 5,
            retry_delays TEXT NOT NULL DEFAULT '[30,120,600,3600,86400]',
            smtp_config_id TEXT,
            paused BOOLEAN NOT NULL DEFAULT FALSE,
            settings TEXT NOT NULL DEFAULT '{}',
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            FOREIGN KEY (app_id) REFERENCES apps(id) ON DELETE CASCADE,
            UNIQUE(app_id, name)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS smtp_configs (
            id TEXT PRIMARY KEY,
            app_id TEXT NOT NULL,
            name TEXT NOT NULL,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            username TEXT,
            password TEXT,
            encryption TEXT NOT NULL DEFAULT 'tls',
            pool_size INTEGER NOT NULL DEFAULT 5,
            timeout_ms BIGINT NOT NULL DEFAULT 30000,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at BIGINT NOT NULL,
            FOREIGN KEY (app_id) REFERENCES apps(id) ON DELETE CASCADE
        )"#,
        r#"CREATE TABLE IF NOT EXISTS emails (
            id TEXT PRIMARY KEY,
            app_id TEXT NOT NULL,
            queue_id TEXT NOT NULL,
            idempotency_key TEXT,
            message_id TEXT,
            from_email TEXT NOT NULL,
            from_name TEXT,
            to_recipients TEXT NOT NULL,
            cc_recipients TEXT,
            bcc_recipients TEXT,
            reply_to TEXT,
            subject TEXT NOT NULL,
            html_body TEXT,
            text_body TEXT,
            headers TEXT,
            personalization TEXT,
            metadata TEXT,
            status TEXT NOT NULL DEFAULT 'queued',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            scheduled_at BIGINT,
            sent_at BIGINT,
            delivered_at BIGINT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            FOREIGN KEY (app_id) REFERENCES apps(id) ON DELETE CASCADE,
            UNIQUE(app_id, idempotency_key)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_emails_app_id ON emails(app_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_emails_queue_id ON emails(queue_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_emails_status ON emails(status)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_emails_scheduled_at ON emails(scheduled_at)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_emails_message_id ON emails(message_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_emails_created_at ON emails(created_at)"#,
        r#"CREATE TABLE IF NOT EXISTS email_events (
            id TEXT PRIMARY KEY,
            email_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            event_data TEXT NOT NULL DEFAULT '{}',
            created_at BIGINT NOT NULL,
            FOREIGN KEY (email_id) REFERENCES emails(id) ON DELETE CASCADE
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_email_events_email_id ON email_events(email_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_email_events_email_id_created_at ON email_events(email_id, created_at)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_email_events_event_type ON email_events(event_type)"#,
        r#"CREATE TABLE IF NOT EXISTS suppression_list (
            id TEXT PRIMARY KEY,
            app_id TEXT,
            email_address TEXT NOT NULL,
            reason TEXT NOT NULL,
            source_email_id TEXT,
            expires_at BIGINT,
            created_at BIGINT NOT NULL,
            UNIQUE(app_id, email_address)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_suppression_email_address ON suppression_list(email_address)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_suppression_expires_at ON suppression_list(expires_at)"#,
        r#"CREATE TABLE IF NOT EXISTS tracking_links (
            id TEXT PRIMARY KEY,
            email_id TEXT NOT NULL,
            short_code TEXT NOT NULL UNIQUE,
            original_url TEXT NOT NULL,
            click_count BIGINT NOT NULL DEFAULT 0,
            created_at BIGINT NOT NULL,
            FOREIGN KEY (email_id) REFERENCES emails(id) ON DELETE CASCADE
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_tracking_links_email_id ON tracking_links(email_id)"#,
        r#"CREATE TABLE IF NOT EXISTS webhook_deliveries (
            id TEXT PRIMARY KEY,
            app_id TEXT NOT NULL,
            email_id TEXT,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            next_retry_at BIGINT,
            delivered_at BIGINT,
            created_at BIGINT NOT NULL,
            FOREIGN KEY (app_id) REFERENCES apps(id) ON DELETE CASCADE
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_app_id ON webhook_deliveries(app_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_status ON webhook_deliveries(status)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_next_retry_at ON webhook_deliveries(next_retry_at)"#,
        r#"CREATE TABLE IF NOT EXISTS app_reputation (
            app_id TEXT PRIMARY KEY,
            bounce_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
            complaint_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
            score DOUBLE PRECISION NOT NULL DEFAULT 100,
            throttled BOOLEAN NOT NULL DEFAULT FALSE,
            throttle_reason TEXT,
            updated_at BIGINT NOT NULL,
            FOREIGN KEY (app_id) REFERENCES apps(id) ON DELETE CASCADE
        )"#,
        r#"CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id TEXT PRIMARY KEY,
            app_id TEXT NOT NULL,
            queue_id TEXT NOT NULL,
            name TEXT NOT NULL,
            cron_expression TEXT NOT NULL,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            template TEXT NOT NULL,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            last_run_at BIGINT,
            next_run_at BIGINT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            FOREIGN KEY (app_id) REFERENCES apps(id) ON DELETE CASCADE
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_next_run_at ON scheduled_jobs(next_run_at)"#,
        r#"CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            lane TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 5,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            scheduled_at BIGINT NOT NULL,
            claimed_at BIGINT,
            claimed_by TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_jobs_lane_status_scheduled ON jobs(lane, status, scheduled_at)"#,
        r#"CREATE TABLE IF NOT EXISTS rate_counters (
            counter_key TEXT PRIMARY KEY,
            window_start BIGINT NOT NULL,
            count BIGINT NOT NULL DEFAULT 0
        )"#,
        r#"CREATE TABLE IF NOT EXISTS analytics_counters (
            id TEXT PRIMARY KEY,
            app_id TEXT NOT NULL,
            bucket_start BIGINT NOT NULL,
            event_type TEXT NOT NULL,
            count BIGINT NOT NULL DEFAULT 0,
            UNIQUE(app_id, bucket_start, event_type)
        )"#,
    ];

    for sql in sql_statements {
        let statement = Statement::from_string(backend, sql);
        db.execute(statement).await?;
    }

    Ok(())
}
