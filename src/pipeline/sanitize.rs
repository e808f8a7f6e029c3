use regex::Regex;
use std::sync::LazyLock;

/// Patterns that reject the prompt outright (400, PROMPT_INJECTION_BLOCKED).
static BLOCKED: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        (
            "ignore_previous_instructions",
            r"(?i)ignore\s+(?:all\s+)?(?:previous|prior|above)\s+instructions",
        ),
        (
            "disregard_instructions",
            r"(?i)disregard\s+(?:all\s+)?(?:previous|prior|your)\s+instructions",
        ),
        (
            "override_system_prompt",
            r"(?i)(?:override|replace|forget)\s+(?:the\s+)?system\s+prompt",
        ),
        (
            "reveal_system_prompt",
            r"(?i)(?:reveal|print|repeat|show)\s+(?:the\s+|your\s+)?system\s+prompt",
        ),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("blocked pattern")))
    .collect()
});

/// Patterns that flag the prompt but let it through.
static SUSPICIOUS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("jailbreak", r"(?i)jailbreak"),
        ("impersonation", r"(?i)pretend\s+(?:you\s+are|to\s+be)"),
        ("developer_mode", r"(?i)developer\s+mode"),
        (
            "guardrail_removal",
            r"(?i)(?:no|without)\s+(?:ethical|safety)\s+(?:guidelines|restrictions|filters)",
        ),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("suspicious pattern")))
    .collect()
});

#[derive(Debug, Clone)]
pub struct SanitizeOutcome {
    pub text: String,
    /// First BLOCKED pattern hit, if any. The request must be rejected.
    pub blocked: Option<&'static str>,
    /// SUSPICIOUS pattern names; the request proceeds flagged.
    pub suspicious: Vec<&'static str>,
}

/// Strip control characters (0x00–0x1F except `\t` `\n` `\r`, plus 0x7F) and
/// screen the result against the injection pattern tables. Idempotent.
pub fn sanitize(input: &str) -> SanitizeOutcome {
    let text: String = input
        .chars()
        .filter(|&c| {
            let code = c as u32;
            !((code < 0x20 && c != '\t' && c != '\n' && c != '\r') || code == 0x7F)
        })
        .collect();

    let blocked = BLOCKED
        .iter()
        .find(|(_, re)| re.is_match(&text))
        .map(|(name, _)| *name);

    let suspicious = SUSPICIOUS
        .iter()
        .filter(|(_, re)| re.is_match(&text))
        .map(|(name, _)| *name)
        .collect();

    SanitizeOutcome {
        text,
        blocked,
        suspicious,
    }
}
