//! Decision Maker: one adjudication agent fed the code (or a file summary)
//! plus every reviewer's output, with a defensive JSON-extraction pipeline.

use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::agent::AgentRuntime;
use crate::config::{CouncilConfig, DEFAULT_DECISION_TIMEOUT_MS};
use crate::error::Result;
use crate::events::EventSink;
use crate::prompt::truncate_chars;
use crate::retry::retry_with_backoff;
use crate::review::{
    AdditionalFinding, CheckCategory, DecisionVerdict, ReviewDecision, ReviewDecisionItem,
    Severity,
};

pub const MAX_DECISIONS: usize = 15;
pub const MAX_ADDITIONAL_FINDINGS: usize = 3;

/// Chars of the raw reply preserved in a parse-failure assessment.
const PARSE_FAILED_PREVIEW: usize = 200;

/// Run the decision maker once and parse its reply. A reply that defeats
/// every parse strategy still yields a decision (with a `[PARSE_FAILED]`
/// assessment); only a prompt failure is an error.
pub async fn run_decision_maker(
    runtime: &AgentRuntime,
    config: &CouncilConfig,
    prompt: &str,
    sink: &dyn EventSink,
) -> Result<ReviewDecision> {
    let spec = &config.decision_maker;
    let timeout = Duration::from_millis(spec.effective_timeout_ms(DEFAULT_DECISION_TIMEOUT_MS));

    let handle_slot = tokio::sync::Mutex::new(runtime.spawn(spec).await?);
    let slot = &handle_slot;
    let result = retry_with_backoff(
        spec.effective_max_retries(),
        &spec.name,
        || async move {
            let handle = slot.lock().await.clone();
            handle.prompt(prompt, timeout, sink).await
        },
        || async move {
            let old = slot.lock().await.clone();
            if let Err(e) = runtime.stop(&old).await {
                warn!(reviewer = %spec.name, error = %e, "failed to stop decision maker before respawn");
            }
            let fresh = runtime.spawn(spec).await?;
            *slot.lock().await = fresh;
            Ok(())
        },
    )
    .await;

    let handle = handle_slot.lock().await.clone();
    if let Err(e) = runtime.stop(&handle).await {
        warn!(reviewer = %spec.name, error = %e, "failed to stop decision maker");
    }

    let raw = result?;
    info!(reviewer = %spec.name, chars = raw.chars().count(), "decision maker replied");
    Ok(parse_decision(&raw, &spec.name))
}

/// Parse a raw decision reply, falling back to a `[PARSE_FAILED]` decision
/// when no strategy yields a JSON object.
pub fn parse_decision(raw: &str, dm_name: &str) -> ReviewDecision {
    let reviewer = format!("{dm_name} (Decision Maker)");
    match extract_json_object(raw) {
        Some(value) => validate_decision(&value, reviewer),
        None => ReviewDecision {
            reviewer,
            overall_assessment: format!(
                "[PARSE_FAILED] {}",
                truncate_chars(raw.trim(), PARSE_FAILED_PREVIEW)
            ),
            decisions: vec![],
            additional_findings: vec![],
        },
    }
}

/// Try, in order: the raw trimmed text, the text with markdown fences
/// stripped, the first balanced `{...}` substring, and that substring with
/// JS-style comments and trailing commas removed. First object wins.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Some(v) = parse_object(trimmed) {
        return Some(v);
    }
    if let Some(v) = parse_object(&strip_markdown_fences(trimmed)) {
        return Some(v);
    }
    let balanced = extract_balanced_object(trimmed)?;
    if let Some(v) = parse_object(balanced) {
        return Some(v);
    }
    parse_object(&strip_json_relaxations(balanced))
}

fn parse_object(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text).ok().filter(Value::is_object)
}

/// Strip markdown code fences (```json ... ```) around the reply.
fn strip_markdown_fences(input: &str) -> String {
    let trimmed = input.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after_fence = &trimmed[start + 3..];
    // skip an optional language tag on the fence line
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim().to_string(),
        None => body.trim().to_string(),
    }
}

/// Return the first balanced `{...}` substring, tracking string and escape
/// state so braces inside string literals do not count.
fn extract_balanced_object(input: &str) -> Option<&str> {
    let bytes = input.as_bytes();
    let start = input.find('{')?;
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
                    return Some(&input[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove `//` and `/* */` comments and commas that immediately precede a
/// closing brace or bracket, respecting string context.
fn strip_json_relaxations(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_string = false;
    let mut escaped = false;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            out.push(b);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' => {
                in_string = true;
                out.push(b);
                i += 1;
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            b',' => {
                // Trailing comma if the next non-whitespace byte closes a
                // container. Comments were already dropped above.
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                    j += 1;
                }
                if j < bytes.len() && (bytes[j] == b'}' || bytes[j] == b']') {
                    i += 1;
                } else {
                    out.push(b);
                    i += 1;
                }
            }
            _ => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).unwrap_or_else(|_| input.to_string())
}

fn str_field(obj: &serde_json::Map<String, Value>, key: &str) -> String {
    obj.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn opt_str_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// `line` is kept only when it is a positive integer.
fn line_field(obj: &serde_json::Map<String, Value>) -> Option<u64> {
    obj.get("line").and_then(Value::as_u64).filter(|n| *n > 0)
}

/// Coerce a free-form JSON value into the canonical decision shape. Unknown
/// enum strings degrade (`medium`/`other`/`modified`), malformed entries are
/// dropped, and the lists are truncated to their caps.
pub fn validate_decision(value: &Value, reviewer: String) -> ReviewDecision {
    let obj = value.as_object();
    let overall_assessment = obj
        .and_then(|o| o.get("overallAssessment"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let decisions = obj
        .and_then(|o| o.get("decisions"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .map(|item| ReviewDecisionItem {
                    severity: Severity::from_loose(&str_field(item, "severity")),
                    category: CheckCategory::from_loose(&str_field(item, "category")),
                    description: str_field(item, "description"),
                    file: opt_str_field(item, "file"),
                    line: line_field(item),
                    raised_by: item
                        .get("raisedBy")
                        .and_then(Value::as_array)
                        .map(|names| {
                            names
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                    verdict: DecisionVerdict::from_loose(&str_field(item, "verdict")),
                    reasoning: str_field(item, "reasoning"),
                    suggestion: str_field(item, "suggestion"),
                })
                .take(MAX_DECISIONS)
                .collect()
        })
        .unwrap_or_default();

    let additional_findings = obj
        .and_then(|o| o.get("additionalFindings"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .map(|item| AdditionalFinding {
                    severity: Severity::from_loose(&str_field(item, "severity")),
                    category: CheckCategory::from_loose(&str_field(item, "category")),
                    description: str_field(item, "description"),
                    file: opt_str_field(item, "file"),
                    line: line_field(item),
                    suggestion: str_field(item, "suggestion"),
                })
                .take(MAX_ADDITIONAL_FINDINGS)
                .collect()
        })
        .unwrap_or_default();

    ReviewDecision { reviewer, overall_assessment, decisions, additional_findings }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let raw = r#"{"overallAssessment":"Good","decisions":[],"additionalFindings":[]}"#;
        let decision = parse_decision(raw, "judge");
        assert_eq!(decision.overall_assessment, "Good");
        assert_eq!(decision.reviewer, "judge (Decision Maker)");
        assert!(decision.decisions.is_empty());
    }

    #[test]
    fn test_parse_fenced_json_with_commentary() {
        let raw = "Here is my verdict:\n```json\n{\"overallAssessment\":\"Good\",\"decisions\":[],\"additionalFindings\":[]}\n```\nLet me know if you need more.";
        let decision = parse_decision(raw, "judge");
        assert_eq!(decision.overall_assessment, "Good");
    }

    #[test]
    fn test_parse_embedded_object() {
        let raw = "Sure! The answer is {\"overallAssessment\":\"Fine\",\"decisions\":[]} as requested.";
        let decision = parse_decision(raw, "judge");
        assert_eq!(decision.overall_assessment, "Fine");
    }

    #[test]
    fn test_parse_braces_inside_strings() {
        let raw = r#"note {"overallAssessment":"uses {braces} and \"quotes\"","decisions":[]} end"#;
        let decision = parse_decision(raw, "judge");
        assert_eq!(decision.overall_assessment, "uses {braces} and \"quotes\"");
    }

    #[test]
    fn test_parse_comments_and_trailing_commas() {
        let raw = r#"{
            // summary first
            "overallAssessment": "Solid", /* inline */
            "decisions": [
                {"severity": "high", "category": "security", "description": "d",
                 "raisedBy": ["alpha"], "verdict": "accepted", "reasoning": "r",
                 "suggestion": "s",},
            ],
            "additionalFindings": [],
        }"#;
        let decision = parse_decision(raw, "judge");
        assert_eq!(decision.overall_assessment, "Solid");
        assert_eq!(decision.decisions.len(), 1);
        assert_eq!(decision.decisions[0].severity, Severity::High);
    }

    #[test]
    fn test_comment_slashes_inside_strings_survive() {
        let raw = r#"{"overallAssessment": "see https://example.com/path", "decisions": []}"#;
        let decision = parse_decision(raw, "judge");
        assert_eq!(decision.overall_assessment, "see https://example.com/path");
    }

    #[test]
    fn test_parse_failed_fallback() {
        let raw = "I refuse to answer in JSON. The code is mostly fine though.";
        let decision = parse_decision(raw, "judge");
        assert!(decision.overall_assessment.starts_with("[PARSE_FAILED] I refuse"));
        assert!(decision.decisions.is_empty());
        assert!(decision.additional_findings.is_empty());
    }

    #[test]
    fn test_parse_failed_preview_capped_at_200() {
        let raw = "x".repeat(500);
        let decision = parse_decision(&raw, "judge");
        assert_eq!(
            decision.overall_assessment.chars().count(),
            "[PARSE_FAILED] ".chars().count() + 200
        );
    }

    #[test]
    fn test_non_object_json_is_parse_failure() {
        let decision = parse_decision("\"just a string\"", "judge");
        assert!(decision.overall_assessment.starts_with("[PARSE_FAILED]"));
        let decision = parse_decision("[1, 2, 3]", "judge");
        assert!(decision.overall_assessment.starts_with("[PARSE_FAILED]"));
    }

    #[test]
    fn test_validate_coerces_unknown_enums() {
        let raw = r#"{"overallAssessment":"ok","decisions":[
            {"severity":"catastrophic","category":"style","description":"d",
             "verdict":"escalated","reasoning":"","suggestion":""}
        ]}"#;
        let decision = parse_decision(raw, "judge");
        let item = &decision.decisions[0];
        assert_eq!(item.severity, Severity::Medium);
        assert_eq!(item.category, CheckCategory::Other);
        assert_eq!(item.verdict, DecisionVerdict::Modified);
        assert!(item.raised_by.is_empty());
    }

    #[test]
    fn test_validate_line_must_be_positive_integer() {
        for (line_json, expected) in [
            ("5", Some(5)),
            ("0", None),
            ("-3", None),
            ("2.5", None),
            ("\"7\"", None),
        ] {
            let raw = format!(
                r#"{{"overallAssessment":"","decisions":[{{"severity":"low","category":"other","description":"d","line":{line_json},"verdict":"accepted","reasoning":"","suggestion":""}}]}}"#
            );
            let decision = parse_decision(&raw, "judge");
            assert_eq!(decision.decisions[0].line, expected, "line={line_json}");
        }
    }

    #[test]
    fn test_validate_truncates_lists() {
        let items: Vec<String> = (0..20)
            .map(|i| format!(r#"{{"severity":"low","category":"other","description":"d{i}","verdict":"accepted","reasoning":"","suggestion":""}}"#))
            .collect();
        let findings: Vec<String> = (0..5)
            .map(|i| format!(r#"{{"severity":"low","category":"other","description":"f{i}","suggestion":""}}"#))
            .collect();
        let raw = format!(
            r#"{{"overallAssessment":"ok","decisions":[{}],"additionalFindings":[{}]}}"#,
            items.join(","),
            findings.join(",")
        );
        let decision = parse_decision(&raw, "judge");
        assert_eq!(decision.decisions.len(), MAX_DECISIONS);
        assert_eq!(decision.additional_findings.len(), MAX_ADDITIONAL_FINDINGS);
    }

    #[test]
    fn test_missing_arrays_default_to_empty() {
        let decision = parse_decision(r#"{"overallAssessment":"ok"}"#, "judge");
        assert!(decision.decisions.is_empty());
        assert!(decision.additional_findings.is_empty());
    }

    #[test]
    fn test_extract_balanced_ignores_unbalanced_prefix() {
        let input = "} noise { \"a\": {\"b\": 1} } trailing";
        let extracted = extract_balanced_object(input).unwrap();
        assert_eq!(extracted, "{ \"a\": {\"b\": 1} }");
    }

    #[test]
    fn test_strip_fences_without_language_tag() {
        let input = "```\n{\"a\":1}\n```";
        assert_eq!(strip_markdown_fences(input), "{\"a\":1}");
    }
}
