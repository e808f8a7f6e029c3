use regex::Regex;
use std::sync::LazyLock;

/// PII sensitivity of a prompt. Anything above `Public` restricts routing to
/// secure upstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrivacyLevel {
    Public,
    Sensitive,
    Critical,
}

impl PrivacyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyLevel::Public => "PUBLIC",
            PrivacyLevel::Sensitive => "SENSITIVE",
            PrivacyLevel::Critical => "CRITICAL",
        }
    }
}

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern")
});

static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?\d{1,3}[-. ]?)?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}\b").expect("phone pattern")
});

/// US Social Security number, 3-2-4 grouped.
static SSN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn pattern"));

/// Credit card, four groups of four.
static CREDIT_CARD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b").expect("credit card pattern")
});

static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ipv4 pattern")
});

/// Classify a prompt's PII level. SSN or credit-card matches dominate; any
/// other pattern yields `Sensitive`.
pub fn classify_privacy(text: &str) -> PrivacyLevel {
    if SSN.is_match(text) || CREDIT_CARD.is_match(text) {
        return PrivacyLevel::Critical;
    }
    if EMAIL.is_match(text) || PHONE.is_match(text) || IPV4.is_match(text) {
        return PrivacyLevel::Sensitive;
    }
    PrivacyLevel::Public
}

/// Replace each PII match with its tag. IP addresses are detected for
/// classification but left in place; they are routinely load-bearing in
/// operational prompts.
pub fn redact(text: &str) -> String {
    let redacted = SSN.replace_all(text, "[REDACTED_SSN]");
    let redacted = CREDIT_CARD.replace_all(&redacted, "[REDACTED_CARD]");
    let redacted = EMAIL.replace_all(&redacted, "[REDACTED_EMAIL]");
    let redacted = PHONE.replace_all(&redacted, "[REDACTED_PHONE]");
    redacted.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public() {
        assert_eq!(classify_privacy("write a haiku about rust"), PrivacyLevel::Public);
    }

    #[test]
    fn test_email_is_sensitive() {
        assert_eq!(
            classify_privacy("Email me at a@b.com when done"),
            PrivacyLevel::Sensitive
        );
    }

    #[test]
    fn test_phone_is_sensitive() {
        assert_eq!(
            classify_privacy("call 555-867-5309 tomorrow"),
            PrivacyLevel::Sensitive
        );
    }

    #[test]
    fn test_ip_is_sensitive() {
        assert_eq!(
            classify_privacy("ssh into 192.168.1.10 and check"),
            PrivacyLevel::Sensitive
        );
    }

    #[test]
    fn test_ssn_is_critical() {
        assert_eq!(
            classify_privacy("my ssn is 123-45-6789"),
            PrivacyLevel::Critical
        );
    }

    #[test]
    fn test_credit_card_is_critical() {
        assert_eq!(
            classify_privacy("card: 4111 1111 1111 1111"),
            PrivacyLevel::Critical
        );
        assert_eq!(
            classify_privacy("card: 4111-1111-1111-1111"),
            PrivacyLevel::Critical
        );
    }

    #[test]
    fn test_redact_tags() {
        let out = redact("reach a@b.com or 555-867-5309, ssn 123-45-6789");
        assert!(out.contains("[REDACTED_EMAIL]"));
        assert!(out.contains("[REDACTED_PHONE]"));
        assert!(out.contains("[REDACTED_SSN]"));
        assert!(!out.contains("a@b.com"));
    }

    #[test]
    fn test_redact_keeps_ips() {
        let out = redact("ping 10.0.0.1");
        assert!(out.contains("10.0.0.1"));
    }
}
