use serde::{Deserialize, Serialize};

/// Check categories the council knows how to ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckCategory {
    Security,
    Performance,
    Readability,
    CodeQuality,
    BestPractices,
    Other,
}

impl CheckCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckCategory::Security => "security",
            CheckCategory::Performance => "performance",
            CheckCategory::Readability => "readability",
            CheckCategory::CodeQuality => "code-quality",
            CheckCategory::BestPractices => "best-practices",
            CheckCategory::Other => "other",
        }
    }

    /// Parse a free-form category string; anything unrecognized becomes `Other`.
    pub fn from_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "security" => CheckCategory::Security,
            "performance" => CheckCategory::Performance,
            "readability" => CheckCategory::Readability,
            "code-quality" | "code quality" => CheckCategory::CodeQuality,
            "best-practices" | "best practices" => CheckCategory::BestPractices,
            _ => CheckCategory::Other,
        }
    }
}

pub const DEFAULT_CHECKS: &[CheckCategory] = &[
    CheckCategory::Security,
    CheckCategory::Performance,
    CheckCategory::Readability,
    CheckCategory::CodeQuality,
    CheckCategory::BestPractices,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    /// Parse a free-form severity string; anything unrecognized becomes `Medium`.
    pub fn from_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Severity::High,
            "low" => Severity::Low,
            _ => Severity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionVerdict {
    Accepted,
    Rejected,
    Modified,
}

impl DecisionVerdict {
    /// Parse a free-form verdict string; anything unrecognized becomes `Modified`.
    pub fn from_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "accepted" => DecisionVerdict::Accepted,
            "rejected" => DecisionVerdict::Rejected,
            _ => DecisionVerdict::Modified,
        }
    }
}

/// An adjudicated finding in the decision maker's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewDecisionItem {
    pub severity: Severity,
    pub category: CheckCategory,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    pub raised_by: Vec<String>,
    pub verdict: DecisionVerdict,
    pub reasoning: String,
    pub suggestion: String,
}

/// A finding the decision maker raised on its own, beyond the council's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalFinding {
    pub severity: Severity,
    pub category: CheckCategory,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    pub suggestion: String,
}

/// The decision maker's structured adjudication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewDecision {
    pub reviewer: String,
    pub overall_assessment: String,
    pub decisions: Vec<ReviewDecisionItem>,
    pub additional_findings: Vec<AdditionalFinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Success,
    Error,
}

/// One reviewer's verdict, error-contained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndividualReview {
    pub reviewer: String,
    pub review: String,
    pub status: ReviewStatus,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Failed,
    Partial,
}

/// The final outcome of one review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResult {
    pub id: String,
    pub status: ResultStatus,
    pub individual_reviews: Vec<IndividualReview>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<ReviewDecision>,
    pub duration_ms: u64,
}

/// A file gathered for review: repo-relative path plus UTF-8 content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub path: String,
    pub content: String,
}

impl FileContent {
    /// Char count the batcher budgets against.
    pub fn char_size(&self) -> usize {
        self.path.chars().count() + self.content.chars().count()
    }
}

/// Review ids are the first 8 hex chars of a v4 UUID.
pub fn new_review_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
