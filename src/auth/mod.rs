use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use rand::{distributions::Alphanumeric, Rng};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::database::api_keys;
use crate::error::ApiError;
use crate::AppState;

/// Length of the lookup prefix stored in plain text, e.g. `mq_live_a1b2`.
const PREFIX_LEN: usize = 12;
const SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    EmailSend,
    EmailRead,
    QueueManage,
    SmtpManage,
    SuppressionManage,
    AnalyticsRead,
    Admin,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::EmailSend => "email:send",
            Scope::EmailRead => "email:read",
            Scope::QueueManage => "queue:manage",
            Scope::SmtpManage => "smtp:manage",
            Scope::SuppressionManage => "suppression:manage",
            Scope::AnalyticsRead => "analytics:read",
            Scope::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email:send" => Some(Scope::EmailSend),
            "email:read" => Some(Scope::EmailRead),
            "queue:manage" => Some(Scope::QueueManage),
            "smtp:manage" => Some(Scope::SmtpManage),
            "suppression:manage" => Some(Scope::SuppressionManage),
            "analytics:read" => Some(Scope::AnalyticsRead),
            "admin" => Some(Scope::Admin),
            _ => None,
        }
    }
}

/// Tenant-scoped request context resolved from the bearer credential.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub app_id: String,
    pub key_id: String,
    pub scopes: HashSet<Scope>,
    pub rate_limit: Option<i64>,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.scopes.contains(&Scope::Admin)
    }

    pub fn has_scope(&self, scope: Scope) -> bool {
        self.is_admin() || self.scopes.contains(&scope)
    }

    pub fn require(&self, scope: Scope) -> Result<(), ApiError> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "Missing required scope: {}",
                scope.as_str()
            )))
        }
    }
}

/// A freshly minted credential. The plaintext key leaves the process
/// exactly once, inside the create/rotate response.
pub struct MintedKey {
    pub prefix: String,
    pub plaintext: String,
    pub key_hash: String,
}

pub fn mint_key(sandbox: bool) -> MintedKey {
    let env_tag = if sandbox { "test" } else { "live" };
    let secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect();

    let plaintext = format!("mq_{env_tag}_{secret}");
    let prefix = plaintext.chars().take(PREFIX_LEN).collect();
    let key_hash = hash_key(&plaintext);

    MintedKey {
        prefix,
        plaintext,
        key_hash,
    }
}

pub fn hash_key(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time byte comparison. Any length mismatch rejects without
/// shortcutting on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn parse_scopes(raw: &str) -> HashSet<Scope> {
    serde_json::from_str::<Vec<String>>(raw)
        .unwrap_or_default()
        .iter()
        .filter_map(|s| Scope::parse(s))
        .collect()
}

fn client_ip(request: &Request) -> Option<String> {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .or_else(|| {
            request
                .headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
}

/// Bearer-token middleware for the `/v1` surface. Tracking redirects,
/// the open pixel and health checks are public and bypass it.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path();

    if path == "/health" || path.starts_with("/t/") || path.starts_with("/c/") {
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?
        .to_string();

    if token.len() < PREFIX_LEN {
        return Err(ApiError::unauthorized("Invalid API key"));
    }
    let prefix: String = token.chars().take(PREFIX_LEN).collect();

    let key = api_keys::Entity::find()
        .filter(api_keys::Column::Prefix.eq(&prefix))
        .filter(api_keys::Column::Active.eq(true))
        .one(&*state.db)
        .await
        .map_err(|e| {
            tracing::error!("Credential lookup failed: {}", e);
            ApiError::internal("An internal error occurred")
        })?
        .ok_or_else(|| ApiError::unauthorized("Invalid API key"))?;

    let presented_hash = hash_key(&token);
    if !constant_time_eq(presented_hash.as_bytes(), key.key_hash.as_bytes()) {
        return Err(ApiError::unauthorized("Invalid API key"));
    }

    let now = chrono::Utc::now().timestamp_micros();
    if let Some(expires_at) = key.expires_at {
        if expires_at < now {
            return Err(ApiError::unauthorized("API key expired"));
        }
    }

    if let Some(allowlist) = key.ip_allowlist.as_deref() {
        let allowed: Vec<String> = serde_json::from_str(allowlist).unwrap_or_default();
        if !allowed.is_empty() {
            match client_ip(&request) {
                Some(ip) if allowed.iter().any(|a| a == &ip) => {}
                _ => return Err(ApiError::forbidden("IP address not allowed")),
            }
        }
    }

    let context = AuthContext {
        app_id: key.app_id.clone(),
        key_id: key.id.clone(),
        scopes: parse_scopes(&key.scopes),
        rate_limit: key.rate_limit,
    };
    request.extensions_mut().insert(context);

    // Best-effort; a failed timestamp update must not fail the request.
    let db = state.db.clone();
    let key_id = key.id;
    tokio::spawn(async move {
        let result = api_keys::Entity::update_many()
            .col_expr(api_keys::Column::LastUsedAt, Expr::value(Some(now)))
            .filter(api_keys::Column::Id.eq(&key_id))
            .exec(&*db)
            .await;
        if let Err(e) = result {
            tracing::warn!("Failed to update last_used_at for key {}: {}", key_id, e);
        }
    });

    Ok(next.run(request).await)
}
