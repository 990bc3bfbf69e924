use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::review::{CheckCategory, DEFAULT_CHECKS};
use crate::session::Protocol;

pub const DEFAULT_CONFIG_FILE: &str = "review-council.config.json";

pub const DEFAULT_REVIEWER_TIMEOUT_MS: u64 = 180_000;
pub const DEFAULT_DECISION_TIMEOUT_MS: u64 = 300_000;
pub const MAX_RETRIES_CAP: u32 = 5;
pub const DEFAULT_LANGUAGE: &str = "English";

pub const DEFAULT_MAX_CODE_LENGTH: usize = 80_000;
pub const DEFAULT_MAX_REVIEWS_LENGTH: usize = 50_000;
pub const DEFAULT_MAX_SUMMARY_LENGTH: usize = 20_000;

/// One configured agent: how to launch it and how patient to be with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReviewerSpec {
    pub name: String,
    pub cli_path: String,
    #[serde(default)]
    pub cli_args: Vec<String>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
}

impl ReviewerSpec {
    pub fn effective_timeout_ms(&self, default: u64) -> u64 {
        self.timeout_ms.unwrap_or(default)
    }

    pub fn effective_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(0).min(MAX_RETRIES_CAP)
    }
}

/// Prompt-packaging mode: code in the prompt, character-budgeted batches, or
/// the agent exploring a path list with its own tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    #[default]
    Inline,
    Batch,
    Explore,
}

impl std::str::FromStr for AnalysisMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(AnalysisMode::Inline),
            "batch" => Ok(AnalysisMode::Batch),
            "explore" => Ok(AnalysisMode::Explore),
            other => Err(Error::Validation(format!(
                "unknown analysis mode: {other} (expected: inline, batch, explore)"
            ))),
        }
    }
}

impl std::fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisMode::Inline => write!(f, "inline"),
            AnalysisMode::Batch => write!(f, "batch"),
            AnalysisMode::Explore => write!(f, "explore"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReviewParams {
    #[serde(default = "default_checks")]
    pub checks: Vec<CheckCategory>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub analysis_mode: AnalysisMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitive_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_code_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reviews_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_summary_length: Option<usize>,
}

fn default_checks() -> Vec<CheckCategory> {
    DEFAULT_CHECKS.to_vec()
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

impl Default for ReviewParams {
    fn default() -> Self {
        Self {
            checks: default_checks(),
            language: default_language(),
            analysis_mode: AnalysisMode::default(),
            extensions: None,
            sensitive_patterns: None,
            max_code_length: None,
            max_reviews_length: None,
            max_summary_length: None,
        }
    }
}

impl ReviewParams {
    pub fn code_cap(&self) -> usize {
        self.max_code_length.unwrap_or(DEFAULT_MAX_CODE_LENGTH)
    }

    pub fn reviews_cap(&self) -> usize {
        self.max_reviews_length.unwrap_or(DEFAULT_MAX_REVIEWS_LENGTH)
    }

    pub fn summary_cap(&self) -> usize {
        self.max_summary_length.unwrap_or(DEFAULT_MAX_SUMMARY_LENGTH)
    }
}

/// The whole council: ordered reviewers, one decision maker, review params.
/// Immutable for the duration of one review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CouncilConfig {
    pub reviewers: Vec<ReviewerSpec>,
    pub decision_maker: ReviewerSpec,
    #[serde(default)]
    pub review: ReviewParams,
}

impl CouncilConfig {
    /// Load the effective config: `--config` path wins over inline
    /// `CONFIG_JSON`, which wins over `review-council.config.json` in the
    /// project directory. Environment overrides are applied afterwards.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        Self::load_from(explicit_path, Path::new("."))
    }

    pub fn load_from(explicit_path: Option<&Path>, project_dir: &Path) -> Result<Self> {
        let mut config = match explicit_path {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                parse_config(&std::fs::read_to_string(path)?)?
            }
            None => {
                if let Some(inline) = non_empty_env("CONFIG_JSON") {
                    parse_config(&inline)?
                } else {
                    let path = project_dir.join(DEFAULT_CONFIG_FILE);
                    if !path.exists() {
                        return Err(Error::ConfigValidation(format!(
                            "no configuration found: pass --config, set CONFIG_JSON, or create {DEFAULT_CONFIG_FILE}"
                        )));
                    }
                    parse_config(&std::fs::read_to_string(&path)?)?
                }
            }
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides. Empty values never override.
    pub fn apply_env(&mut self) {
        if let Some(model) = non_empty_env("DECISION_MAKER_MODEL") {
            self.decision_maker.model = Some(model);
        }
        if let Some(raw) = non_empty_env("DECISION_MAKER_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.decision_maker.timeout_ms = Some(ms),
                Err(_) => warn!(value = %raw, "ignoring unparseable DECISION_MAKER_TIMEOUT_MS"),
            }
        }
        if let Some(raw) = non_empty_env("REVIEWER_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => {
                    for reviewer in &mut self.reviewers {
                        if reviewer.timeout_ms.is_none() {
                            reviewer.timeout_ms = Some(ms);
                        }
                    }
                }
                Err(_) => warn!(value = %raw, "ignoring unparseable REVIEWER_TIMEOUT_MS"),
            }
        }
        if let Some(language) = non_empty_env("REVIEW_LANGUAGE") {
            self.review.language = language;
        }
        if let Some(raw) = non_empty_env("REVIEWER_EXPLORE_LOCAL")
            && matches!(raw.trim(), "true" | "1")
        {
            self.review.analysis_mode = AnalysisMode::Explore;
        }
    }

    /// Minimal shape validation; command safety is enforced again at spawn.
    pub fn validate(&mut self) -> Result<()> {
        if self.reviewers.is_empty() {
            return Err(Error::ConfigValidation("at least one reviewer is required".to_string()));
        }
        for spec in self.reviewers.iter_mut().chain(std::iter::once(&mut self.decision_maker)) {
            if spec.name.trim().is_empty() {
                return Err(Error::ConfigValidation("reviewer name must not be empty".to_string()));
            }
            if spec.cli_path.trim().is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "reviewer '{}' has an empty cliPath",
                    spec.name
                )));
            }
            if spec.timeout_ms == Some(0) {
                return Err(Error::ConfigValidation(format!(
                    "reviewer '{}' has timeoutMs = 0",
                    spec.name
                )));
            }
            if let Some(retries) = spec.max_retries
                && retries > MAX_RETRIES_CAP
            {
                warn!(reviewer = %spec.name, retries, "capping maxRetries at {MAX_RETRIES_CAP}");
                spec.max_retries = Some(MAX_RETRIES_CAP);
            }
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<CouncilConfig> {
    let config: CouncilConfig = serde_json::from_str(content)?;
    Ok(config)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
