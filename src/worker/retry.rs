//! SMTP failure classification and inline DSN extraction.

use crate::smtp::SmtpError;
use regex::{Regex, RegexSet};
use std::sync::OnceLock;

/// Classification input is truncated to this many bytes before any regex
/// is applied.
const MAX_CLASSIFY_INPUT: usize = 50 * 1024;
const MAX_DSN_RECIPIENTS: usize = 100;
const MAX_DSN_EXCERPT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Permanent,
    Transient,
}

fn hard_patterns() -> &'static RegexSet {
    static HARD: OnceLock<RegexSet> = OnceLock::new();
    HARD.get_or_init(|| {
        RegexSet::new([
            r"(?i)user unknown",
            r"(?i)mailbox not found",
            r"(?i)no such user",
            r"(?i)address rejected",
            r"(?i)invalid recipient",
            r"(?i)does not exist",
            r"(?i)550\s+5\.1\.1",
        ])
        .expect("static regex set")
    })
}

fn soft_patterns() -> &'static RegexSet {
    static SOFT: OnceLock<RegexSet> = OnceLock::new();
    SOFT.get_or_init(|| {
        RegexSet::new([
            r"(?i)mailbox full",
            r"(?i)quota exceeded",
            r"(?i)temporarily",
            r"(?i)try again",
            r"451\s+",
            r"452\s+",
        ])
        .expect("static regex set")
    })
}

fn status_code_regex() -> &'static Regex {
    static CODE: OnceLock<Regex> = OnceLock::new();
    CODE.get_or_init(|| Regex::new(r"\b([245]\d{2})\b").expect("static regex"))
}

fn address_in_text_regex() -> &'static Regex {
    static ADDRESS: OnceLock<Regex> = OnceLock::new();
    ADDRESS.get_or_init(|| {
        Regex::new(r"[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9-]+(?:\.[a-zA-Z0-9-]+)+")
            .expect("static regex")
    })
}

fn truncate(input: &str, max: usize) -> &str {
    if input.len() <= max {
        return input;
    }
    let mut end = max;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

/// Classify an SMTP reply or transport failure.
///
/// Hard-bounce phrases force a permanent verdict; soft phrases keep the
/// failure transient. Otherwise 5xx replies are permanent while 4xx,
/// socket errors and timeouts are transient.
pub fn classify_message(message: &str) -> Option<Classification> {
    let message = truncate(message, MAX_CLASSIFY_INPUT);

    if hard_patterns().is_match(message) {
        return Some(Classification::Permanent);
    }
    if soft_patterns().is_match(message) {
        return Some(Classification::Transient);
    }

    if let Some(captures) = status_code_regex().captures(message) {
        let code: u16 = captures[1].parse().ok()?;
        return Some(match code {
            421 | 451 | 452 => Classification::Transient,
            500..=599 => Classification::Permanent,
            400..=499 => Classification::Transient,
            _ => return None,
        });
    }
    None
}

pub fn classify_error(error: &SmtpError) -> Classification {
    match error {
        SmtpError::Timeout { .. } | SmtpError::Connection { .. } => Classification::Transient,
        SmtpError::Config { .. } | SmtpError::Build { .. } => Classification::Permanent,
        SmtpError::Send {
            message,
            permanent,
            transient,
        } => {
            if let Some(classification) = classify_message(message) {
                return classification;
            }
            if *permanent {
                Classification::Permanent
            } else if *transient {
                Classification::Transient
            } else {
                // Unclassifiable transport errors retry.
                Classification::Transient
            }
        }
    }
}

/// Bounce details recovered from an inline DSN reply.
#[derive(Debug, Clone, PartialEq)]
pub struct DsnInfo {
    pub bounce_type: String,
    pub bounce_sub_type: String,
    /// Up to 100 distinct addresses named in the reply; falls back to the
    /// email's own recipients when the reply names none.
    pub recipients: Vec<String>,
    /// Reply excerpt kept for storage, capped at 500 chars.
    pub excerpt: String,
}

pub fn extract_dsn(message: &str, fallback_recipients: &[String]) -> DsnInfo {
    let message = truncate(message, MAX_CLASSIFY_INPUT);

    let classification = classify_message(message).unwrap_or(Classification::Transient);
    let (bounce_type, bounce_sub_type) = match classification {
        Classification::Permanent => ("hard", "permanent_failure"),
        Classification::Transient => ("soft", "temporary_failure"),
    };

    let mut recipients: Vec<String> = Vec::new();
    for found in address_in_text_regex().find_iter(message) {
        let address = found.as_str().to_lowercase();
        if !recipients.contains(&address) {
            recipients.push(address);
        }
        if recipients.len() >= MAX_DSN_RECIPIENTS {
            break;
        }
    }
    if recipients.is_empty() {
        recipients = fallback_recipients
            .iter()
            .take(MAX_DSN_RECIPIENTS)
            .map(|a| a.to_lowercase())
            .collect();
    }

    let excerpt: String = message.chars().take(MAX_DSN_EXCERPT).collect();

    DsnInfo {
        bounce_type: bounce_type.to_string(),
        bounce_sub_type: bounce_sub_type.to_string(),
        recipients,
        excerpt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_bounce_phrases_are_permanent() {
        for message in [
            "550 5.1.1 user unknown",
            "550 Mailbox not found",
            "No such user here",
            "554 address rejected by policy",
            "553 Invalid Recipient",
            "recipient does not exist",
        ] {
            assert_eq!(
                classify_message(message),
                Some(Classification::Permanent),
                "{message}"
            );
        }
    }

    #[test]
    fn soft_phrases_stay_transient_even_with_5xx_code() {
        assert_eq!(
            classify_message("552 mailbox full"),
            Some(Classification::Transient)
        );
        assert_eq!(
            classify_message("quota exceeded, try later"),
            Some(Classification::Transient)
        );
        assert_eq!(
            classify_message("421 try again later"),
            Some(Classification::Transient)
        );
    }

    #[test]
    fn codes_decide_when_no_phrase_matches() {
        assert_eq!(
            classify_message("550 policy violation"),
            Some(Classification::Permanent)
        );
        assert_eq!(
            classify_message("450 greylisted"),
            Some(Classification::Transient)
        );
        assert_eq!(
            classify_message("452 too many recipients"),
            Some(Classification::Transient)
        );
        assert_eq!(classify_message("totally opaque"), None);
    }

    #[test]
    fn timeouts_and_connection_errors_are_transient() {
        assert_eq!(
            classify_error(&SmtpError::Timeout { timeout_ms: 30000 }),
            Classification::Transient
        );
        assert_eq!(
            classify_error(&SmtpError::Connection {
                message: "connection refused".to_string()
            }),
            Classification::Transient
        );
    }

    #[test]
    fn dsn_extraction_names_recipients_and_caps_excerpt() {
        let message = "550 5.1.1 <bad@example.com>: user unknown; also Bad@example.com failed";
        let info = extract_dsn(message, &[]);
        assert_eq!(info.bounce_type, "hard");
        assert_eq!(info.bounce_sub_type, "permanent_failure");
        assert_eq!(info.recipients, vec!["bad@example.com".to_string()]);
        assert!(info.excerpt.len() <= 500);
    }

    #[test]
    fn dsn_extraction_falls_back_to_known_recipients() {
        let info = extract_dsn("550 5.1.1 user unknown", &["u@b.io".to_string()]);
        assert_eq!(info.recipients, vec!["u@b.io".to_string()]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(40 * 1024);
        let _ = classify_message(&long);
    }
}
