use super::collector::{Datum, MetricsCollector};
use super::shadow::{ShadowComparison, ShadowRouter};
use crate::config::JudgeConfig;
use crate::observe::{Inspector, TraceStage};
use crate::upstream::{CallOptions, UpstreamSet};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Winner {
    A,
    B,
    Tie,
    Error,
}

impl Winner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Winner::A => "A",
            Winner::B => "B",
            Winner::Tie => "TIE",
            Winner::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, Deserialize)]
#[serde(default)]
pub struct CriteriaScores {
    pub correctness: f64,
    pub relevance: f64,
    pub clarity: f64,
    pub completeness: f64,
    pub conciseness: f64,
    pub total: f64,
}

impl CriteriaScores {
    fn computed_total(&self) -> f64 {
        self.correctness + self.relevance + self.clarity + self.completeness + self.conciseness
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JudgeVerdict {
    pub winner: Winner,
    pub scores_a: CriteriaScores,
    pub scores_b: CriteriaScores,
    pub reasoning: String,
}

impl JudgeVerdict {
    pub fn error(reasoning: impl Into<String>) -> Self {
        Self {
            winner: Winner::Error,
            scores_a: CriteriaScores::default(),
            scores_b: CriteriaScores::default(),
            reasoning: reasoning.into(),
        }
    }
}

/// Raw JSON shape the judge model is instructed to reply with.
#[derive(Deserialize)]
struct RawVerdict {
    winner: String,
    #[serde(default)]
    scores: RawScores,
    #[serde(default)]
    reasoning: String,
}

#[derive(Default, Deserialize)]
struct RawScores {
    #[serde(default, alias = "A")]
    a: CriteriaScores,
    #[serde(default, alias = "B")]
    b: CriteriaScores,
}

/// Scores shadow comparison pairs with a designated LLM upstream and feeds
/// the verdicts into the metrics collector.
pub struct Judge {
    config: JudgeConfig,
    upstreams: UpstreamSet,
}

impl Judge {
    pub fn new(config: JudgeConfig, upstreams: UpstreamSet) -> Self {
        Self { config, upstreams }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Drain one batch from the shadow queue, judge each pair, record both
    /// sides. Judge failures produce ERROR verdicts that are still recorded
    /// as zero-score ties for neither side.
    pub async fn run_once(
        &self,
        shadow: &ShadowRouter,
        collector: &MetricsCollector,
        inspector: Option<&Inspector>,
    ) -> usize {
        let batch = shadow.drain(self.config.drain_limit);
        let judged = batch.len();

        for (i, comparison) in batch.iter().enumerate() {
            let verdict = self.judge_pair(comparison).await;

            if let Some(ins) = inspector {
                ins.record(
                    &comparison.request_id,
                    TraceStage::JudgeVerdict,
                    serde_json::json!({
                        "winner": verdict.winner.as_str(),
                        "primary": comparison.primary.provider,
                        "shadow": comparison.shadow.provider,
                    }),
                );
            }
            metrics::counter!(
                "gateway_judge_verdicts_total",
                "winner" => verdict.winner.as_str(),
            )
            .increment(1);

            record_verdict(collector, comparison, &verdict);

            // Pace judge calls to stay under the judge provider's own limits.
            if i + 1 < batch.len() {
                tokio::time::sleep(std::time::Duration::from_millis(self.config.pause_ms)).await;
            }
        }

        judged
    }

    pub async fn judge_pair(&self, comparison: &ShadowComparison) -> JudgeVerdict {
        let provider_name = match &self.config.provider {
            Some(p) => p.clone(),
            None => return JudgeVerdict::error("no judge provider configured"),
        };
        let Some(handle) = self.upstreams.get(&provider_name) else {
            return JudgeVerdict::error(format!("judge provider {} not found", provider_name));
        };

        let prompt = build_rubric_prompt(comparison);
        let opts = CallOptions {
            model: self.config.model.clone(),
            temperature: Some(0.0),
            ..CallOptions::default()
        };

        match handle.call(&prompt, &opts).await {
            Ok(completion) => parse_verdict(&completion.text),
            Err(err) => {
                tracing::warn!("judge: call failed, provider={}, error={}", provider_name, err);
                JudgeVerdict::error(format!("judge call failed: {}", err))
            }
        }
    }
}

fn record_verdict(
    collector: &MetricsCollector,
    comparison: &ShadowComparison,
    verdict: &JudgeVerdict,
) {
    let (a_won, b_won, tied) = match verdict.winner {
        Winner::A => (true, false, false),
        Winner::B => (false, true, false),
        Winner::Tie => (false, false, true),
        Winner::Error => (false, false, false),
    };
    collector.record(
        &comparison.primary.provider,
        comparison.task_type,
        Datum {
            won: a_won,
            tied,
            score: verdict.scores_a.total,
            latency_ms: comparison.primary.duration_ms,
        },
    );
    collector.record(
        &comparison.shadow.provider,
        comparison.task_type,
        Datum {
            won: b_won,
            tied,
            score: verdict.scores_b.total,
            latency_ms: comparison.shadow.duration_ms,
        },
    );
}

/// Rubric prompt with the two responses labeled A and B and a strict JSON
/// reply contract.
pub fn build_rubric_prompt(comparison: &ShadowComparison) -> String {
    format!(
        "You are an impartial evaluator comparing two AI responses to the same prompt.\n\
         Score each response 0-10 on correctness, relevance, clarity, completeness, \
         and conciseness.\n\n\
         PROMPT:\n{prompt}\n\n\
         RESPONSE A:\n{a}\n\n\
         RESPONSE B:\n{b}\n\n\
         Reply with ONLY a JSON object, no prose, in exactly this shape:\n\
         {{\"winner\": \"A\" | \"B\" | \"TIE\", \
         \"scores\": {{\"a\": {{\"correctness\": 0, \"relevance\": 0, \"clarity\": 0, \
         \"completeness\": 0, \"conciseness\": 0}}, \
         \"b\": {{\"correctness\": 0, \"relevance\": 0, \"clarity\": 0, \
         \"completeness\": 0, \"conciseness\": 0}}}}, \
         \"reasoning\": \"one sentence\"}}",
        prompt = comparison.prompt,
        a = comparison.primary.response,
        b = comparison.shadow.response,
    )
}

/// Extract the first balanced `{…}` from the reply and parse it. Anything
/// unparseable produces an ERROR verdict with zero scores.
pub fn parse_verdict(reply: &str) -> JudgeVerdict {
    let Some(json) = first_balanced_object(reply) else {
        return JudgeVerdict::error("no JSON object in judge reply");
    };

    let raw: RawVerdict = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => return JudgeVerdict::error(format!("malformed judge JSON: {}", e)),
    };

    let winner = match raw.winner.trim().to_ascii_uppercase().as_str() {
        "A" => Winner::A,
        "B" => Winner::B,
        "TIE" => Winner::Tie,
        other => return JudgeVerdict::error(format!("unknown winner: {}", other)),
    };

    let mut scores_a = raw.scores.a;
    let mut scores_b = raw.scores.b;
    for s in [&mut scores_a, &mut scores_b] {
        clamp_scores(s);
        if s.total == 0.0 {
            s.total = s.computed_total();
        }
    }

    JudgeVerdict {
        winner,
        scores_a,
        scores_b,
        reasoning: raw.reasoning,
    }
}

fn clamp_scores(s: &mut CriteriaScores) {
    for v in [
        &mut s.correctness,
        &mut s.relevance,
        &mut s.clarity,
        &mut s.completeness,
        &mut s.conciseness,
    ] {
        *v = v.clamp(0.0, 10.0);
    }
}

/// First balanced top-level `{…}` span, tracking JSON string literals.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
