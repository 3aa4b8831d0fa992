//! Identity extraction: maps a raw provider message to the normalized
//! identifier tuple used for correlation and dedup.
//!
//! Pure data-structure logic, no I/O. Every header-derived field is optional;
//! only the provider-assigned message id is guaranteed, since the provider
//! always supplies one even when the MIME payload is malformed.
//!
//! Normalization: values are trimmed, surrounding angle brackets removed, and
//! NUL bytes dropped (PostgreSQL cannot store them). Message-IDs are
//! case-sensitive per RFC 5322, so no case folding is applied.

use chrono::{DateTime, Utc};
use mailparse::{MailHeaderMap, parse_mail};
use thiserror::Error;

use crate::correlate::subject::normalize_subject;
use crate::ingest::provider::RawMessage;

/// The stable identifiers of one mailbox message, across identifier spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIdentity {
    /// Provider-internal id; always present.
    pub provider_message_id: String,
    /// RFC 5322 Message-ID, without angle brackets.
    pub message_id: Option<String>,
    /// Provider conversation id.
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    /// Ancestor chain, oldest to newest.
    pub references: Vec<String>,
}

/// A fully extracted inbound candidate: identity plus the content fields the
/// pipeline persists.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub identity: MessageIdentity,
    pub subject: String,
    pub normalized_subject: String,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to parse MIME structure: {0}")]
    MimeParse(#[from] mailparse::MailParseError),
}

/// Sanitize text by removing NUL bytes that PostgreSQL cannot store
fn sanitize_text(text: &str) -> String {
    text.replace('\0', "").trim().to_string()
}

/// Clean and normalize message IDs by removing angle brackets and whitespace
fn normalize_message_id(msg_id: Option<String>) -> Option<String> {
    msg_id.and_then(|id| {
        let cleaned = id.trim().trim_matches(&['<', '>'][..]).trim();
        if cleaned.is_empty() {
            None
        } else {
            Some(sanitize_text(cleaned))
        }
    })
}

/// Extract message IDs from a References header, oldest to newest.
/// Uses whitespace-based splitting for better compatibility.
fn extract_references(header_value: &str) -> Vec<String> {
    header_value
        .split_whitespace()
        .map(|id| {
            let cleaned = id.trim().trim_matches(&['<', '>'][..]);
            sanitize_text(cleaned)
        })
        .filter(|id| !id.is_empty())
        .collect()
}

/// Extract an inbound candidate from a raw provider message.
///
/// Tolerates missing headers throughout: a message with no Message-ID, no
/// References, and no parseable Date still yields a usable candidate keyed by
/// the provider id. The received timestamp prefers the Date header, then the
/// provider's internal date, then now.
pub fn extract(raw: &RawMessage) -> Result<InboundMessage, ExtractError> {
    let parsed = parse_mail(&raw.raw)?;

    let message_id = normalize_message_id(parsed.headers.get_first_value("Message-ID"));
    let in_reply_to = normalize_message_id(parsed.headers.get_first_value("In-Reply-To"));
    let references = parsed
        .headers
        .get_first_value("References")
        .map(|v| extract_references(&v))
        .unwrap_or_default();

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .map(|s| sanitize_text(&s))
        .unwrap_or_default();

    let (sender_name, sender_email) = parsed
        .headers
        .get_first_value("From")
        .and_then(|from| parse_sender(&from))
        .map(|(name, email)| (name, Some(email)))
        .unwrap_or((None, None));

    let received_at = parsed
        .headers
        .get_first_value("Date")
        .and_then(|raw_date| dateparser::parse(&raw_date).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .or(raw.internal_date)
        .unwrap_or_else(Utc::now);

    let body = extract_body(&parsed);

    Ok(InboundMessage {
        identity: MessageIdentity {
            provider_message_id: raw.provider_message_id.clone(),
            message_id,
            thread_id: raw.thread_id.clone(),
            in_reply_to,
            references,
        },
        normalized_subject: normalize_subject(&subject),
        subject,
        sender_name,
        sender_email,
        body,
        received_at,
    })
}

fn parse_sender(from: &str) -> Option<(Option<String>, String)> {
    let addrs = mailparse::addrparse(from).ok()?;
    match addrs.iter().next() {
        Some(mailparse::MailAddr::Single(info)) => {
            let name = info
                .display_name
                .as_deref()
                .map(sanitize_text)
                .filter(|n| !n.is_empty());
            Some((name, info.addr.to_lowercase()))
        }
        _ => None,
    }
}

fn extract_body(parsed: &mailparse::ParsedMail<'_>) -> String {
    let body = if parsed.subparts.is_empty() {
        parsed.get_body().unwrap_or_default()
    } else {
        // Multipart message - find text/plain part
        let mut body_text = String::new();
        for part in &parsed.subparts {
            if part.ctype.mimetype.as_str() == "text/plain" {
                body_text = part.get_body().unwrap_or_default();
                break;
            }
        }
        if body_text.is_empty() {
            parsed.get_body().unwrap_or_default()
        } else {
            body_text
        }
    };

    sanitize_text(&body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_message(payload: &str) -> RawMessage {
        RawMessage {
            provider_message_id: "prov-1".to_string(),
            thread_id: Some("thread-1".to_string()),
            internal_date: None,
            raw: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_extract_full_headers() {
        let raw = raw_message(concat!(
            "Message-ID: <reply@vendor.example>\r\n",
            "In-Reply-To: <rfp@buyer.example>\r\n",
            "References: <rfp@buyer.example> <mid@buyer.example>\r\n",
            "Subject: Re: RFP for catering\r\n",
            "From: Vendor One <sales@vendor.example>\r\n",
            "Date: Mon, 12 Jan 2026 10:00:00 +0000\r\n",
            "\r\n",
            "Our proposal is attached.\r\n"
        ));

        let msg = extract(&raw).unwrap();
        assert_eq!(msg.identity.message_id.as_deref(), Some("reply@vendor.example"));
        assert_eq!(msg.identity.in_reply_to.as_deref(), Some("rfp@buyer.example"));
        assert_eq!(
            msg.identity.references,
            vec!["rfp@buyer.example".to_string(), "mid@buyer.example".to_string()]
        );
        assert_eq!(msg.identity.thread_id.as_deref(), Some("thread-1"));
        assert_eq!(msg.sender_email.as_deref(), Some("sales@vendor.example"));
        assert_eq!(msg.normalized_subject, "rfp for catering");
        assert_eq!(msg.body, "Our proposal is attached.");
    }

    #[test]
    fn test_extract_tolerates_missing_headers() {
        let raw = raw_message("Subject: hello\r\n\r\nbody\r\n");

        let msg = extract(&raw).unwrap();
        assert_eq!(msg.identity.provider_message_id, "prov-1");
        assert!(msg.identity.message_id.is_none());
        assert!(msg.identity.in_reply_to.is_none());
        assert!(msg.identity.references.is_empty());
        assert!(msg.sender_email.is_none());
    }

    #[test]
    fn test_message_id_case_preserved() {
        let raw = raw_message("Message-ID: <CAse.SENSitive@Example>\r\n\r\n\r\n");
        let msg = extract(&raw).unwrap();
        assert_eq!(msg.identity.message_id.as_deref(), Some("CAse.SENSitive@Example"));
    }

    #[test]
    fn test_date_falls_back_to_internal_date() {
        let internal = "2026-02-01T09:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let raw = RawMessage {
            provider_message_id: "prov-2".to_string(),
            thread_id: None,
            internal_date: Some(internal),
            raw: b"Subject: no date\r\n\r\nbody\r\n".to_vec(),
        };

        let msg = extract(&raw).unwrap();
        assert_eq!(msg.received_at, internal);
    }
}
