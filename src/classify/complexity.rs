use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "SIMPLE",
            Complexity::Moderate => "MODERATE",
            Complexity::Complex => "COMPLEX",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComplexityReport {
    pub score: f64,
    pub category: Complexity,
}

/// LaTeX-style commands plus structural math tokens: `\frac`, `^`, `{`, `}`.
static MATH_SIGNALS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\[A-Za-z]+|\^|\{|\}").expect("math signal pattern"));

static REASONING_VERBS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(reason|step|explain|analyze|compare)").expect("reasoning verb pattern")
});

/// Score a prompt's complexity in [0, 100]:
/// length (≤30) + fenced code blocks (20 each) + math signals (2 each, ≤20)
/// + 15 when reasoning verbs appear.
pub fn score_complexity(text: &str) -> ComplexityReport {
    let length_score = (text.len() as f64 / 50.0).min(30.0);

    let fence_count = text.matches("```").count();
    let code_blocks = (fence_count / 2) as f64;
    let code_score = 20.0 * code_blocks;

    let math_signals = MATH_SIGNALS.find_iter(text).count() as f64;
    let math_score = (2.0 * math_signals).min(20.0);

    let reasoning_score = if REASONING_VERBS.is_match(text) { 15.0 } else { 0.0 };

    let score = (length_score + code_score + math_score + reasoning_score).min(100.0);

    let category = if score < 30.0 {
        Complexity::Simple
    } else if score < 70.0 {
        Complexity::Moderate
    } else {
        Complexity::Complex
    };

    ComplexityReport { score, category }
}
