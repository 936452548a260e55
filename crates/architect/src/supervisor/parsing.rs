//! Output parsing: plan steps, review severities, coverage percentages.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const MAX_PLAN_STEPS: usize = 24;
const MAX_SENTENCE_STEPS: usize = 6;

fn step_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(?:[-*]|\d+[.)])\s+(.+)$").expect("step pattern"))
}

fn severity_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(BLOCKER|MAJOR|MINOR|SUGGESTION)\b").expect("severity pattern")
    })
}

fn percent_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b(\d{1,3})%").expect("percent pattern"))
}

/// Extract bullet/numbered list items from planner output, capped at 24
/// steps. Falls back to sentence splitting when no list markers are present.
pub fn extract_plan_steps(content: &str) -> Vec<String> {
    let mut steps: Vec<String> = Vec::new();
    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(captures) = step_pattern().captures(line) {
            steps.push(captures[1].trim().to_string());
        }
    }
    if steps.is_empty() && !content.trim().is_empty() {
        steps = content
            .split(['\n', '.'])
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .take(MAX_SENTENCE_STEPS)
            .map(str::to_string)
            .collect();
    }
    steps.truncate(MAX_PLAN_STEPS);
    steps
}

/// Severity counts parsed from critic output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReviewFindings {
    pub blocker: u32,
    pub major: u32,
    pub minor: u32,
    pub suggestion: u32,
}

impl ReviewFindings {
    fn bump(&mut self, severity: &str, by: u32) {
        match severity.to_ascii_uppercase().as_str() {
            "BLOCKER" => self.blocker += by,
            "MAJOR" => self.major += by,
            "MINOR" => self.minor += by,
            "SUGGESTION" => self.suggestion += by,
            _ => {}
        }
    }

    pub fn as_artifact(&self) -> Value {
        serde_json::json!({
            "BLOCKER": self.blocker,
            "MAJOR": self.major,
            "MINOR": self.minor,
            "SUGGESTION": self.suggestion,
        })
    }
}

/// Parse review findings, preferring structured JSON objects on output lines
/// (`{"counts": {...}}`, `{"severity": "MAJOR"}`, `{"findings": [...]}`) and
/// falling back to a bare-word severity scan.
pub fn parse_review_findings(content: &str) -> ReviewFindings {
    let mut findings = ReviewFindings::default();
    let mut structured = false;

    for line in content.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(counts) = value.get("counts").and_then(Value::as_object) {
            for (severity, count) in counts {
                findings.bump(severity, count.as_u64().unwrap_or(0) as u32);
            }
            structured = true;
            continue;
        }
        if let Some(severity) = value.get("severity").and_then(Value::as_str) {
            findings.bump(severity, 1);
            structured = true;
            continue;
        }
        if let Some(items) = value.get("findings").and_then(Value::as_array) {
            for item in items {
                if let Some(severity) = item.get("severity").and_then(Value::as_str) {
                    findings.bump(severity, 1);
                }
            }
            structured = true;
        }
    }

    if structured {
        return findings;
    }
    for captures in severity_pattern().captures_iter(content) {
        findings.bump(&captures[1], 1);
    }
    findings
}

/// Extract a coverage percentage from command output tails, preferring
/// JSON-Lines records and falling back to the maximum `NN%` match. Clamped to
/// `[0, 100]`.
pub fn extract_coverage_percent(stdout_tail: &str, stderr_tail: &str) -> Option<u32> {
    let combined = format!("{stdout_tail}\n{stderr_tail}");

    let mut json_values: Vec<f64> = Vec::new();
    for line in combined.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(percent) = value.get("coverage_percent").and_then(Value::as_f64) {
            json_values.push(percent);
        } else if let Some(percent) = value.get("coverage").and_then(Value::as_f64) {
            json_values.push(percent);
        } else if let Some(percent) = value
            .get("coverage")
            .and_then(|c| c.get("percent"))
            .and_then(Value::as_f64)
        {
            json_values.push(percent);
        }
    }
    if let Some(best) = json_values.into_iter().fold(None::<f64>, |acc, v| {
        Some(acc.map_or(v, |a| a.max(v)))
    }) {
        return Some(best.clamp(0.0, 100.0).round() as u32);
    }

    percent_pattern()
        .captures_iter(&combined)
        .filter_map(|captures| captures[1].parse::<u32>().ok())
        .max()
        .map(|percent| percent.min(100))
}
