//! Engagement tracking: click-through link rewriting and the open pixel.

use crate::database::tracking_links;
use crate::error::{MailQueueError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use regex::Regex;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, Set,
};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

const SHORT_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const SHORT_CODE_LEN: usize = 10;
const SHORT_CODE_RETRY_CAP: usize = 10;

/// 1x1 transparent GIF served for every open-pixel request.
pub const TRACKING_PIXEL: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xFF, 0xFF, 0xFF,
    0x00, 0x00, 0x00, 0x21, 0xF9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3B,
];

fn href_regex() -> &'static Regex {
    static HREF: OnceLock<Regex> = OnceLock::new();
    HREF.get_or_init(|| Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).expect("static regex"))
}

pub fn generate_short_code() -> String {
    let mut rng = rand::thread_rng();
    (0..SHORT_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..SHORT_CODE_ALPHABET.len());
            SHORT_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Open-tracking token: base64url of the email id's 16 raw bytes.
pub fn open_token(email_id: &str) -> Result<String> {
    let uuid = Uuid::parse_str(email_id)
        .map_err(|e| MailQueueError::InvalidInput(format!("Invalid email id: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(uuid.as_bytes()))
}

pub fn decode_open_token(token: &str) -> Result<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| MailQueueError::InvalidInput(format!("Invalid tracking token: {e}")))?;
    let bytes: [u8; 16] = bytes
        .try_into()
        .map_err(|_| MailQueueError::InvalidInput("Invalid tracking token length".to_string()))?;
    Ok(Uuid::from_bytes(bytes).to_string())
}

/// Whether a link target is eligible for redirect rewriting.
fn is_trackable(url: &str, tracking_base: &str) -> bool {
    let lower = url.to_lowercase();
    (lower.starts_with("http://") || lower.starts_with("https://"))
        && !url.starts_with(tracking_base)
}

#[derive(Clone)]
pub struct TrackingService {
    db: Arc<DatabaseConnection>,
    base_url: String,
}

impl TrackingService {
    pub fn new(db: Arc<DatabaseConnection>, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { db, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Rewrite every trackable href to a short-code redirect and append the
    /// open pixel. `mailto:`, `tel:`, fragment links and links already
    /// pointing at the tracking host are left alone.
    pub async fn prepare_html(&self, email_id: &str, html: &str) -> Result<String> {
        let mut rewritten = String::with_capacity(html.len());
        let mut last_end = 0;

        for captures in href_regex().captures_iter(html) {
            let whole = captures.get(0).expect("capture 0 always present");
            let url = &captures[1];

            if !is_trackable(url, &self.base_url) {
                continue;
            }

            let code = self.create_link(email_id, url).await?;
            rewritten.push_str(&html[last_end..whole.start()]);
            rewritten.push_str(&format!(r#"href="{}/c/{}""#, self.base_url, code));
            last_end = whole.end();
        }
        rewritten.push_str(&html[last_end..]);

        Ok(self.inject_open_pixel(email_id, &rewritten)?)
    }

    fn inject_open_pixel(&self, email_id: &str, html: &str) -> Result<String> {
        let token = open_token(email_id)?;
        let pixel_html = format!(
            r#"<img src="{}/t/{}/open.gif" width="1" height="1" style="display:none;" alt="" />"#,
            self.base_url, token
        );

        let lower = html.to_lowercase();
        Ok(match lower.rfind("</body>") {
            Some(pos) => {
                let mut out = String::with_capacity(html.len() + pixel_html.len());
                out.push_str(&html[..pos]);
                out.push_str(&pixel_html);
                out.push_str(&html[pos..]);
                out
            }
            None => format!("{html}{pixel_html}"),
        })
    }

    /// Insert a tracking link, re-rolling the short code on collision.
    async fn create_link(&self, email_id: &str, original_url: &str) -> Result<String> {
        for _ in 0..SHORT_CODE_RETRY_CAP {
            let code = generate_short_code();
            let model = tracking_links::ActiveModel {
                email_id: Set(email_id.to_string()),
                short_code: Set(code.clone()),
                original_url: Set(original_url.to_string()),
                ..tracking_links::ActiveModel::new()
            };
            match model.insert(&*self.db).await {
                Ok(_) => return Ok(code),
                Err(e) if e.to_string().to_lowercase().contains("unique") => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(MailQueueError::InvalidInput(
            "Exhausted short-code retries".to_string(),
        ))
    }

    pub async fn find_link(&self, code: &str) -> Result<Option<tracking_links::Model>> {
        Ok(tracking_links::Entity::find()
            .filter(tracking_links::Column::ShortCode.eq(code))
            .one(&*self.db)
            .await?)
    }

    pub async fn increment_click(&self, code: &str) -> Result<()> {
        tracking_links::Entity::update_many()
            .col_expr(
                tracking_links::Column::ClickCount,
                Expr::col(tracking_links::Column::ClickCount).add(1),
            )
            .filter(tracking_links::Column::ShortCode.eq(code))
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_codes_are_ten_base62_chars() {
        for _ in 0..100 {
            let code = generate_short_code();
            assert_eq!(code.len(), SHORT_CODE_LEN);
            assert!(code.bytes().all(|b| SHORT_CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn open_token_round_trips() {
        let id = Uuid::now_v7().to_string();
        let token = open_token(&id).unwrap();
        assert!(!token.contains('='));
        assert_eq!(decode_open_token(&token).unwrap(), id);
    }

    #[test]
    fn trackable_urls_exclude_mailto_tel_and_fragments() {
        let base = "https://track.example.com";
        assert!(is_trackable("https://example.com/page", base));
        assert!(is_trackable("http://example.com", base));
        assert!(!is_trackable("mailto:user@example.com", base));
        assert!(!is_trackable("tel:+15551234567", base));
        assert!(!is_trackable("#section", base));
        assert!(!is_trackable("https://track.example.com/c/abc", base));
    }

    #[test]
    fn pixel_is_the_fixed_gif() {
        assert_eq!(TRACKING_PIXEL.len(), 43);
        assert_eq!(&TRACKING_PIXEL[..6], b"GIF89a");
        assert_eq!(TRACKING_PIXEL[42], 0x3B);
    }
}
