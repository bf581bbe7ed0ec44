//! Content screening applied to campaign HTML before sending.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Outcome of screening one HTML body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyReport {
    pub is_safe: bool,
    pub spam_score: f64,
    pub message: String,
    pub suspicious_patterns: Vec<String>,
}

pub trait ContentAnalyzer: Send + Sync {
    fn analyze(&self, html: &str) -> SafetyReport;
}

struct Rule {
    label: &'static str,
    pattern: Regex,
    weight: f64,
}

fn rule(label: &'static str, pattern: &str, weight: f64) -> Rule {
    Rule {
        label,
        pattern: Regex::new(pattern).expect("safety rule compiles"),
        weight,
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule("script tag", r"(?i)<\s*script\b", 10.0),
        rule("javascript url", r"(?i)javascript\s*:", 10.0),
        rule("inline event handler", r#"(?i)<[^>]+\son[a-z]+\s*="#, 6.0),
        rule("embedded frame", r"(?i)<\s*(iframe|object|embed)\b", 6.0),
        rule("form element", r"(?i)<\s*form\b", 3.0),
        rule("credential request", r"(?i)\b(verify|confirm|update)\s+your\s+(password|account|bank)", 4.0),
        rule("money bait", r"(?i)\b(free money|cash bonus|you('ve| have) won|winner|prize)\b", 2.5),
        rule("urgency", r"(?i)\b(act now|urgent|limited time|expires today)\b", 1.5),
        rule("pharma or gambling", r"(?i)\b(viagra|cialis|casino|lottery)\b", 3.0),
        rule("link shortener", r"(?i)\b(bit\.ly|tinyurl\.com|goo\.gl|t\.co)/", 2.0),
        rule("repeated exclamation", r"!{3,}", 1.0),
        rule("all-caps run", r"\b[A-Z]{3,}(?:\s+[A-Z]{3,}){3,}\b", 1.5),
    ]
});

/// Weighted regex rules; content scoring at or above `threshold` is refused.
#[derive(Debug, Clone)]
pub struct HeuristicContentAnalyzer {
    threshold: f64,
}

impl HeuristicContentAnalyzer {
    pub const DEFAULT_THRESHOLD: f64 = 5.0;

    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Default for HeuristicContentAnalyzer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl ContentAnalyzer for HeuristicContentAnalyzer {
    fn analyze(&self, html: &str) -> SafetyReport {
        let mut spam_score = 0.0;
        let mut suspicious_patterns = Vec::new();
        for rule in RULES.iter() {
            if rule.pattern.is_match(html) {
                spam_score += rule.weight;
                suspicious_patterns.push(rule.label.to_string());
            }
        }

        let is_safe = spam_score < self.threshold;
        let message = if suspicious_patterns.is_empty() {
            "no suspicious content".to_string()
        } else if is_safe {
            format!("minor findings: {}", suspicious_patterns.join(", "))
        } else {
            format!(
                "content refused (score {spam_score:.1}): {}",
                suspicious_patterns.join(", ")
            )
        };

        SafetyReport {
            is_safe,
            spam_score,
            message,
            suspicious_patterns,
        }
    }
}
