//! Subject normalization for correlation fallback and provider queries.
//!
//! When an inbound message carries no usable In-Reply-To/References headers
//! and no matching thread id, the subject line is the only remaining signal.
//! Normalization strips reply prefixes and noise so `"Re: RFP: Office fitout"`
//! and `"RFP: Office fitout"` compare equal. This is inherently best-effort:
//! subject reuse and localized reply prefixes can produce false matches, which
//! is why the correlator consults it last (and can be configured not to).

/// Normalize an email subject for comparison.
///
/// Repeatedly strips `Re:`, `Fwd:`, `Fw:`, `Aw:` prefixes and leading
/// bracketed tags (`[EXTERNAL]`, `[SPAM?]`, ...), lowercases, and collapses
/// whitespace.
pub fn normalize_subject(subject: &str) -> String {
    let mut normalized = subject.trim().to_lowercase();

    // Keep removing prefixes until none match
    loop {
        let before = normalized.clone();

        for prefix in &["re:", "fwd:", "fw:", "aw:"] {
            if normalized.starts_with(prefix) {
                normalized = normalized[prefix.len()..].trim_start().to_string();
            }
        }

        // Remove bracketed tags like [EXTERNAL], [SPAM?], etc.
        if normalized.starts_with('[') {
            if let Some(end_bracket) = normalized.find(']') {
                normalized = normalized[end_bracket + 1..].trim_start().to_string();
            }
        }

        if before == normalized {
            break;
        }
    }

    let words: Vec<&str> = normalized.split_whitespace().collect();
    words.join(" ")
}

/// Build the provider search term for replies to an outbound email without a
/// known thread id: `subject:"Re: <subject>"`.
pub fn reply_search_term(original_subject: &str) -> String {
    format!("subject:\"Re: {}\"", original_subject.trim().replace('"', ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_basic_reply() {
        assert_eq!(
            normalize_subject("Re: RFP: Office fitout 2026"),
            "rfp: office fitout 2026"
        );
    }

    #[test]
    fn test_normalize_nested_re() {
        assert_eq!(normalize_subject("Re: Re: Proposal request"), "proposal request");
    }

    #[test]
    fn test_normalize_bracketed_tag() {
        assert_eq!(
            normalize_subject("[EXTERNAL] Re: Proposal request"),
            "proposal request"
        );
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(
            normalize_subject("  Re:   Multiple    spaces  "),
            "multiple spaces"
        );
    }

    #[test]
    fn test_reply_search_term_strips_quotes() {
        assert_eq!(
            reply_search_term("Bids for \"phase 2\""),
            "subject:\"Re: Bids for phase 2\""
        );
    }
}
