/// Task category a prompt falls into, used to pick routing preference orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Code,
    Math,
    Creative,
    Analysis,
    Chat,
    Summarization,
    Translation,
    General,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Code => "CODE",
            TaskType::Math => "MATH",
            TaskType::Creative => "CREATIVE",
            TaskType::Analysis => "ANALYSIS",
            TaskType::Chat => "CHAT",
            TaskType::Summarization => "SUMMARIZATION",
            TaskType::Translation => "TRANSLATION",
            TaskType::General => "GENERAL",
        }
    }

    pub fn parse(s: &str) -> Option<TaskType> {
        match s.to_ascii_uppercase().as_str() {
            "CODE" => Some(TaskType::Code),
            "MATH" => Some(TaskType::Math),
            "CREATIVE" => Some(TaskType::Creative),
            "ANALYSIS" => Some(TaskType::Analysis),
            "CHAT" => Some(TaskType::Chat),
            "SUMMARIZATION" => Some(TaskType::Summarization),
            "TRANSLATION" => Some(TaskType::Translation),
            "GENERAL" => Some(TaskType::General),
            _ => None,
        }
    }
}

/// Ordered keyword tables. Earlier categories win on the first hit, so a
/// prompt asking to "write a function to summarize" still classifies as CODE.
const KEYWORD_TABLES: &[(TaskType, &[&str])] = &[
    (
        TaskType::Code,
        &[
            "code", "function", "bug", "debug", "compile", "refactor", "implement", "script",
            "regex", "sql", "api", "class ", "stack trace", "unit test",
        ],
    ),
    (
        TaskType::Math,
        &[
            "calculate", "solve", "equation", "integral", "derivative", "probability", "theorem",
            "proof", "matrix", "algebra",
        ],
    ),
    (
        TaskType::Creative,
        &[
            "story", "poem", "haiku", "fiction", "lyrics", "creative", "imagine", "character",
            "plot", "novel",
        ],
    ),
    (
        TaskType::Analysis,
        &[
            "analyze", "analysis", "compare", "evaluate", "assess", "pros and cons", "tradeoff",
            "review this", "critique",
        ],
    ),
    (
        TaskType::Summarization,
        &["summarize", "summary", "tl;dr", "condense", "shorten"],
    ),
    (
        TaskType::Translation,
        &["translate", "translation", "in french", "in spanish", "in german", "in japanese"],
    ),
];

/// Case-insensitive first-match keyword detection; `General` when nothing hits.
pub fn detect_task_type(prompt: &str) -> TaskType {
    let lower = prompt.to_lowercase();
    for (task, keywords) in KEYWORD_TABLES {
        if keywords.iter().any(|k| lower.contains(k)) {
            return *task;
        }
    }
    TaskType::General
}
