//! Review Pipeline: chooses between diff / files / codebase flows and
//! inline / batch / explore modes, batches by char budget, aggregates
//! partial failures, and invokes the decision maker.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Instant;

use futures::future::join_all;
use regex::Regex;
use tracing::{info, warn};

use crate::agent::AgentRuntime;
use crate::config::{AnalysisMode, CouncilConfig};
use crate::council::run_council;
use crate::decision::run_decision_maker;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::prompt::PromptBuilder;
use crate::retry::sanitize_error_message;
use crate::review::{FileContent, IndividualReview, ResultStatus, ReviewResult, ReviewStatus};
use crate::source;

/// At most this many batches run concurrently.
pub const BATCH_CONCURRENCY: usize = 2;

/// Default char budget per batch (path + content chars).
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100_000;

/// Caller-supplied review parameters shared by all entry points.
#[derive(Debug, Clone, Default)]
pub struct ReviewRequest {
    /// Inline code wins over every other packaging mode when present.
    pub code: Option<String>,
    pub checks: Vec<String>,
    pub extra_instructions: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CodebaseOptions {
    pub extensions: Option<Vec<String>>,
    pub batch_size: Option<usize>,
}

static BRANCH_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._\-/]+$").unwrap());

/// Base branch names come from the caller; allow only plain ref characters
/// and never a leading `-` (flag injection).
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.starts_with('-') || !BRANCH_NAME_RE.is_match(name) {
        return Err(Error::Validation(format!("invalid base branch name: {name}")));
    }
    Ok(())
}

/// Greedy packing of files into char-budgeted batches, preserving order. A
/// file over the cap becomes its own singleton batch.
pub fn batch_files(files: Vec<FileContent>, max_batch_size: usize) -> Vec<Vec<FileContent>> {
    let mut batches = Vec::new();
    let mut current: Vec<FileContent> = Vec::new();
    let mut current_size = 0usize;
    for file in files {
        let size = file.char_size();
        if size > max_batch_size {
            if !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_size = 0;
            }
            batches.push(vec![file]);
            continue;
        }
        if current_size + size > max_batch_size && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size;
        current.push(file);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn render_batch_code(files: &[FileContent]) -> String {
    files
        .iter()
        .map(|f| format!("--- {} ---\n{}", f.path, f.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fall back to the default extension list; ensure a leading dot on each.
fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    if extensions.is_empty() {
        return source::DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect();
    }
    extensions
        .iter()
        .map(|e| {
            let e = e.trim();
            if e.starts_with('.') { e.to_string() } else { format!(".{e}") }
        })
        .collect()
}

fn file_summary<'a>(files: impl Iterator<Item = &'a FileContent>) -> String {
    files
        .map(|f| format!("{} ({} lines)", f.path, f.content.lines().count()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct ReviewPipeline {
    runtime: AgentRuntime,
    config: CouncilConfig,
}

impl ReviewPipeline {
    pub fn new(runtime: AgentRuntime, config: CouncilConfig) -> Self {
        Self { runtime, config }
    }

    pub fn config(&self) -> &CouncilConfig {
        &self.config
    }

    fn mode(&self) -> AnalysisMode {
        self.config.review.analysis_mode
    }

    fn builder(&self, request: &ReviewRequest) -> PromptBuilder {
        PromptBuilder::new(
            &self.config.review,
            &request.checks,
            request.language.as_deref(),
            request.extra_instructions.as_deref(),
        )
    }

    fn sensitive_patterns(&self) -> Vec<Regex> {
        source::compile_sensitive_patterns(
            self.config.review.sensitive_patterns.as_deref().unwrap_or(&[]),
        )
    }

    /// Review the diff of a repository's working tree against a base branch
    /// (staged changes as fallback).
    pub async fn review_diff(
        &self,
        review_id: &str,
        repo: &Path,
        base_branch: &str,
        request: &ReviewRequest,
        sink: &dyn EventSink,
    ) -> Result<ReviewResult> {
        validate_branch_name(base_branch)?;
        let code = match &request.code {
            Some(code) if !code.trim().is_empty() => code.clone(),
            _ => source::git_diff(repo, base_branch).await?,
        };
        let repo_root = if self.mode() == AnalysisMode::Explore {
            Some(repo.canonicalize().map_err(|e| {
                Error::Validation(format!("cannot resolve repository {}: {e}", repo.display()))
            })?)
        } else {
            None
        };
        info!(review_id, base_branch, chars = code.chars().count(), "reviewing diff");
        self.run_inline(review_id, &code, repo_root, request, sink).await
    }

    /// Review an explicit list of files: explore sends repo-relative paths,
    /// every other mode reads and batches their contents.
    pub async fn review_files(
        &self,
        review_id: &str,
        paths: &[PathBuf],
        request: &ReviewRequest,
        sink: &dyn EventSink,
    ) -> Result<ReviewResult> {
        if paths.is_empty() {
            return Err(Error::Validation("no file paths provided".to_string()));
        }
        if let Some(code) = &request.code
            && !code.trim().is_empty()
        {
            // Inline code wins over exploration.
            let code = code.clone();
            return self.run_inline(review_id, &code, None, request, sink).await;
        }

        let extra_patterns = self.sensitive_patterns();
        if self.mode() == AnalysisMode::Explore {
            let cwd = std::env::current_dir()?;
            let root = match source::git_toplevel(&cwd).await {
                Some(top) => top,
                None => cwd,
            };
            let root = root.canonicalize()?;
            let mut rel_paths = Vec::new();
            for path in paths {
                let real = match path.canonicalize() {
                    Ok(real) => real,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "dropping unresolvable path");
                        continue;
                    }
                };
                if !source::is_contained(&root, &real) {
                    return Err(Error::Validation(format!(
                        "path outside repository root: {}",
                        path.display()
                    )));
                }
                let rel = real
                    .strip_prefix(&root)
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_else(|_| real.to_string_lossy().into_owned());
                if source::is_sensitive_path(&rel, &extra_patterns) {
                    warn!(path = %rel, "rejecting sensitive file");
                    continue;
                }
                rel_paths.push(rel);
            }
            if rel_paths.is_empty() {
                return Err(Error::Validation(
                    "no reviewable files remain after filtering".to_string(),
                ));
            }
            return self.run_explore(review_id, root, rel_paths, request, sink).await;
        }

        let mut listed = Vec::new();
        for path in paths {
            let display_path = path.to_string_lossy().replace('\\', "/");
            if source::is_sensitive_path(&display_path, &extra_patterns) {
                warn!(path = %display_path, "rejecting sensitive file");
                continue;
            }
            listed.push(display_path);
        }
        if listed.is_empty() {
            return Err(Error::Validation(
                "no reviewable files remain after filtering".to_string(),
            ));
        }
        let files = source::read_files(Path::new(""), &listed).await;
        if files.is_empty() {
            return Err(Error::Source("none of the requested files could be read".to_string()));
        }
        let batches = batch_files(files, DEFAULT_MAX_BATCH_SIZE);
        self.run_batches(review_id, batches, request, sink).await
    }

    /// Review a whole repository: enumerate, filter, then explore or batch.
    pub async fn review_codebase(
        &self,
        review_id: &str,
        dir: &Path,
        options: &CodebaseOptions,
        request: &ReviewRequest,
        sink: &dyn EventSink,
    ) -> Result<ReviewResult> {
        if options.batch_size == Some(0) {
            return Err(Error::Validation("batch size must be greater than zero".to_string()));
        }
        let dir_real = dir.canonicalize().map_err(|e| {
            Error::Validation(format!("cannot resolve directory {}: {e}", dir.display()))
        })?;
        let listed = source::list_repo_files(&dir_real).await?;

        let extensions = normalize_extensions(
            options
                .extensions
                .as_ref()
                .or(self.config.review.extensions.as_ref())
                .map(|v| v.as_slice())
                .unwrap_or(&[]),
        );
        let extra_patterns = self.sensitive_patterns();

        let mut filtered = Vec::new();
        for rel in listed {
            if !source::has_extension(&rel, &extensions) {
                continue;
            }
            if source::is_sensitive_path(&rel, &extra_patterns) {
                continue;
            }
            match dir_real.join(&rel).canonicalize() {
                Ok(real) if source::is_contained(&dir_real, &real) => filtered.push(rel),
                Ok(real) => {
                    warn!(path = %real.display(), "dropping file resolving outside the directory")
                }
                Err(e) => warn!(path = %rel, error = %e, "dropping unresolvable file"),
            }
        }
        if filtered.is_empty() {
            return Err(Error::Source("no matching files to review".to_string()));
        }
        info!(review_id, files = filtered.len(), "reviewing codebase");

        if self.mode() == AnalysisMode::Explore {
            return self.run_explore(review_id, dir_real, filtered, request, sink).await;
        }

        let files = source::read_files(&dir_real, &filtered).await;
        if files.is_empty() {
            return Err(Error::Source("none of the matching files could be read".to_string()));
        }
        let batches = batch_files(files, options.batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE));
        self.run_batches(review_id, batches, request, sink).await
    }

    async fn run_inline(
        &self,
        review_id: &str,
        code: &str,
        repo_root: Option<PathBuf>,
        request: &ReviewRequest,
        sink: &dyn EventSink,
    ) -> Result<ReviewResult> {
        let started = Instant::now();
        let builder = self.builder(request);
        let root = repo_root.map(|p| p.display().to_string());
        let prompt = builder.reviewer_inline(code, root.as_deref())?;
        let reviews = run_council(&self.runtime, &self.config.reviewers, &prompt, false, sink).await;
        self.finish(review_id, started, reviews, &builder, AnalysisMode::Inline, Some(code), None, sink)
            .await
    }

    async fn run_explore(
        &self,
        review_id: &str,
        root: PathBuf,
        rel_paths: Vec<String>,
        request: &ReviewRequest,
        sink: &dyn EventSink,
    ) -> Result<ReviewResult> {
        let started = Instant::now();
        let builder = self.builder(request);
        let root_str = root.display().to_string();
        let prompt = builder.reviewer_explore(&rel_paths, Some(&root_str))?;
        // Exploration needs tool round-trips; the per-reviewer timeout doubles.
        let reviews = run_council(&self.runtime, &self.config.reviewers, &prompt, true, sink).await;
        let summary = rel_paths.join("\n");
        self.finish(
            review_id,
            started,
            reviews,
            &builder,
            AnalysisMode::Explore,
            None,
            Some(&summary),
            sink,
        )
        .await
    }

    async fn run_batches(
        &self,
        review_id: &str,
        batches: Vec<Vec<FileContent>>,
        request: &ReviewRequest,
        sink: &dyn EventSink,
    ) -> Result<ReviewResult> {
        let started = Instant::now();
        let builder = self.builder(request);
        let total = batches.len();

        let mut prompts = Vec::with_capacity(total);
        for (index, batch) in batches.iter().enumerate() {
            let code = render_batch_code(batch);
            let prompt = builder.reviewer_inline(&code, None)?;
            if total > 1 {
                prompts.push(format!("[Batch {}/{}]\n{}", index + 1, total, prompt));
            } else {
                prompts.push(prompt);
            }
        }

        let mut reviews = Vec::new();
        for chunk in prompts.chunks(BATCH_CONCURRENCY) {
            let runs = chunk
                .iter()
                .map(|prompt| run_council(&self.runtime, &self.config.reviewers, prompt, false, sink));
            for batch_reviews in join_all(runs).await {
                reviews.extend(batch_reviews);
            }
        }

        if total == 1 {
            let code = render_batch_code(&batches[0]);
            self.finish(
                review_id,
                started,
                reviews,
                &builder,
                AnalysisMode::Inline,
                Some(&code),
                None,
                sink,
            )
            .await
        } else {
            let summary = file_summary(batches.iter().flatten());
            self.finish(
                review_id,
                started,
                reviews,
                &builder,
                AnalysisMode::Batch,
                None,
                Some(&summary),
                sink,
            )
            .await
        }
    }

    /// Status mapping: every reviewer errored means `failed` and the decision
    /// maker is skipped; a decision-maker failure downgrades to `partial`
    /// but individual reviews are still returned.
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        review_id: &str,
        started: Instant,
        reviews: Vec<IndividualReview>,
        builder: &PromptBuilder,
        mode: AnalysisMode,
        code: Option<&str>,
        summary: Option<&str>,
        sink: &dyn EventSink,
    ) -> Result<ReviewResult> {
        let all_failed =
            !reviews.is_empty() && reviews.iter().all(|r| r.status == ReviewStatus::Error);
        let any_failed = reviews.iter().any(|r| r.status == ReviewStatus::Error);

        let (status, decision) = if all_failed {
            warn!(review_id, "every reviewer failed, skipping decision maker");
            (ResultStatus::Failed, None)
        } else {
            let dm_prompt = builder.decision_maker(
                &self.config.decision_maker.name,
                mode,
                code,
                summary,
                &reviews,
            )?;
            match run_decision_maker(&self.runtime, &self.config, &dm_prompt, sink).await {
                Ok(decision) => {
                    let status =
                        if any_failed { ResultStatus::Partial } else { ResultStatus::Completed };
                    (status, Some(decision))
                }
                Err(e) => {
                    warn!(
                        review_id,
                        error = %sanitize_error_message(&e.to_string()),
                        "decision maker failed"
                    );
                    (ResultStatus::Partial, None)
                }
            }
        };

        let result = ReviewResult {
            id: review_id.to_string(),
            status,
            individual_reviews: reviews,
            decision,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(review_id, status = ?result.status, duration_ms = result.duration_ms, "review finished");
        sink.result(&result);
        Ok(result)
    }
}
