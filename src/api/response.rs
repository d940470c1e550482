use axum::http::{header, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::ratelimit::{RateLimitOutcome, Tier};

/// Standard success envelope: `{success: true, data}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> ApiResponse<T> {
    ApiResponse {
        success: true,
        data,
    }
}

pub const MAX_PAGE_SIZE: u64 = 100;
const DEFAULT_PAGE_SIZE: u64 = 50;

#[derive(Debug, Clone, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl PageQuery {
    pub fn limit(&self) -> u64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> u64 {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct Paginated<T: Serialize> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

pub fn paginated<T: Serialize>(data: Vec<T>, total: u64, page: &PageQuery) -> Paginated<T> {
    let limit = page.limit();
    let offset = page.offset();
    Paginated {
        pagination: Pagination {
            total,
            limit,
            offset,
            has_more: offset + (data.len() as u64) < total,
        },
        data,
    }
}

/// `X-RateLimit-*` headers from the apiKey tier decision.
pub fn rate_limit_headers(outcome: &RateLimitOutcome) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(decision) = outcome.decision_for(Tier::ApiKey) {
        let set = |headers: &mut HeaderMap, name: &'static str, value: i64| {
            if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
                headers.insert(header::HeaderName::from_static(name), value);
            }
        };
        set(&mut headers, "x-ratelimit-limit", decision.limit);
        set(&mut headers, "x-ratelimit-remaining", decision.remaining);
        set(&mut headers, "x-ratelimit-reset", decision.reset_at);
    }
    headers
}
