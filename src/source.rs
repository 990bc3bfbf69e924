//! Source Reader: git diffs, file reads with byte caps, repository
//! enumeration, sensitive-path filtering, and realpath containment.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use futures::future::join_all;
use regex::Regex;
use tokio::process::Command;
use tracing::warn;

use crate::error::{Error, Result};
use crate::review::FileContent;

/// Files larger than this are skipped with a warning.
pub const MAX_FILE_SIZE: u64 = 1024 * 1024;

/// Once this much content has been gathered, reading stops.
pub const MAX_TOTAL_SIZE: u64 = 200 * 1024 * 1024;

/// Concurrent file reads per chunk.
pub const READ_CONCURRENCY: usize = 16;

/// Extensions enumerated by default in codebase reviews.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    ".ts", ".js", ".tsx", ".jsx", ".py", ".go", ".java", ".kt", ".rs", ".rb", ".php", ".cs",
    ".swift", ".c", ".cpp", ".h", ".vue", ".svelte", ".html", ".css", ".scss", ".json", ".yaml",
    ".yml",
];

static DEFAULT_SENSITIVE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^\.env($|\.)",
        r"(?i)\.pem$",
        r"(?i)\.key$",
        r"(?i)\.p12$",
        r"(?i)\.pfx$",
        r"(?i)\.keystore$",
        r"(?i)\bsecrets?\b",
        r"(?i)\bcredentials?\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("default sensitive pattern"))
    .collect()
});

/// Compile user-supplied sensitive patterns; invalid ones are skipped with a
/// warning.
pub fn compile_sensitive_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %p, error = %e, "ignoring invalid sensitive pattern");
                None
            }
        })
        .collect()
}

/// True when any path segment matches a sensitive pattern (defaults plus
/// `extra`). Backslashes are normalized before segment matching.
pub fn is_sensitive_path(path: &str, extra: &[Regex]) -> bool {
    let normalized = path.replace('\\', "/");
    normalized.split('/').filter(|s| !s.is_empty()).any(|segment| {
        DEFAULT_SENSITIVE_RES.iter().chain(extra.iter()).any(|re| re.is_match(segment))
    })
}

/// Containment by relative-path test on canonicalized paths, never by string
/// prefix.
pub fn is_contained(root: &Path, target: &Path) -> bool {
    target.strip_prefix(root).is_ok()
}

async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| Error::Source(format!("failed to run git {}: {e}", args.join(" "))))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Source(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Diff of the working tree against `base`; falls back to the staged diff,
/// and errors when both are empty.
pub async fn git_diff(repo: &Path, base: &str) -> Result<String> {
    let diff = git(repo, &["diff", base]).await?;
    if !diff.trim().is_empty() {
        return Ok(diff);
    }
    let staged = git(repo, &["diff", "--staged"]).await?;
    if !staged.trim().is_empty() {
        return Ok(staged);
    }
    Err(Error::Source(format!("no changes found against '{base}' and nothing staged")))
}

/// The repository root containing `dir`, when there is one.
pub async fn git_toplevel(dir: &Path) -> Option<PathBuf> {
    git(dir, &["rev-parse", "--show-toplevel"])
        .await
        .ok()
        .map(|out| PathBuf::from(out.trim()))
}

/// Tracked plus untracked-not-ignored files, deduplicated, repo-relative.
pub async fn list_repo_files(dir: &Path) -> Result<Vec<String>> {
    let out = git(dir, &["ls-files", "-z", "--cached", "--others", "--exclude-standard"]).await?;
    let mut seen = std::collections::HashSet::new();
    Ok(out
        .split('\0')
        .filter(|p| !p.is_empty())
        .filter(|p| seen.insert(p.to_string()))
        .map(str::to_string)
        .collect())
}

/// True when `path` ends with one of `extensions` (case-insensitive).
pub fn has_extension(path: &str, extensions: &[String]) -> bool {
    let lower = path.to_lowercase();
    extensions.iter().any(|ext| lower.ends_with(&ext.to_lowercase()))
}

async fn read_one(root: &Path, rel_path: &str) -> Option<FileContent> {
    if rel_path.contains('\0') || rel_path.chars().any(char::is_control) {
        warn!(path = %rel_path.escape_debug(), "skipping file with control characters in path");
        return None;
    }
    let full = root.join(rel_path);
    let metadata = match tokio::fs::metadata(&full).await {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %rel_path, error = %e, "skipping unreadable file");
            return None;
        }
    };
    if !metadata.is_file() {
        return None;
    }
    if metadata.len() > MAX_FILE_SIZE {
        warn!(path = %rel_path, size = metadata.len(), "skipping file over {MAX_FILE_SIZE} bytes");
        return None;
    }
    match tokio::fs::read_to_string(&full).await {
        Ok(content) => Some(FileContent { path: rel_path.replace('\\', "/"), content }),
        Err(e) => {
            warn!(path = %rel_path, error = %e, "skipping non-UTF-8 or unreadable file");
            None
        }
    }
}

/// Read `rel_paths` under `root` with bounded concurrency, per-file and
/// cumulative caps. When the total cap is reached, reading stops and what
/// was gathered so far is returned.
pub async fn read_files(root: &Path, rel_paths: &[String]) -> Vec<FileContent> {
    let mut gathered = Vec::new();
    let mut total: u64 = 0;
    for chunk in rel_paths.chunks(READ_CONCURRENCY) {
        let results = join_all(chunk.iter().map(|p| read_one(root, p))).await;
        for file in results.into_iter().flatten() {
            total += file.content.len() as u64;
            gathered.push(file);
        }
        if total >= MAX_TOTAL_SIZE {
            warn!(total, "cumulative read cap reached, returning partial file set");
            break;
        }
    }
    gathered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_git(dir: &Path, args: &[&str]) {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn setup_repo() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        run_git(tmp.path(), &["init"]);
        run_git(tmp.path(), &["config", "user.email", "test@test.com"]);
        run_git(tmp.path(), &["config", "user.name", "Test"]);
        std::fs::write(tmp.path().join("a.rs"), "fn main() {}\n").unwrap();
        run_git(tmp.path(), &["add", "."]);
        run_git(tmp.path(), &["commit", "-m", "init"]);
        run_git(tmp.path(), &["branch", "-M", "main"]);
        tmp
    }

    #[test]
    fn test_sensitive_default_patterns() {
        let extra = [];
        assert!(is_sensitive_path(".env", &extra));
        assert!(is_sensitive_path(".env.local", &extra));
        assert!(is_sensitive_path("certs/server.pem", &extra));
        assert!(is_sensitive_path("keys/id_rsa.key", &extra));
        assert!(is_sensitive_path("app.p12", &extra));
        assert!(is_sensitive_path("store.PFX", &extra));
        assert!(is_sensitive_path("release.keystore", &extra));
        assert!(is_sensitive_path("config/secrets/prod.json", &extra));
        assert!(is_sensitive_path("my-secret-config.json", &extra));
        assert!(is_sensitive_path(".aws/credentials", &extra));
        assert!(is_sensitive_path("win\\path\\secrets\\x.txt", &extra));

        assert!(!is_sensitive_path("src/environment.rs", &extra));
        assert!(!is_sensitive_path("src/main.rs", &extra));
        assert!(!is_sensitive_path("keyboard.rs", &extra));
        assert!(!is_sensitive_path("secretary.md", &extra));
    }

    #[test]
    fn test_sensitive_extra_patterns() {
        let extra = compile_sensitive_patterns(&["(?i)internal".to_string(), "[".to_string()]);
        assert_eq!(extra.len(), 1);
        assert!(is_sensitive_path("docs/INTERNAL-notes.md", &extra));
        assert!(!is_sensitive_path("docs/public.md", &extra));
    }

    #[test]
    fn test_containment_is_path_wise_not_prefix() {
        let root = Path::new("/srv/repo");
        assert!(is_contained(root, Path::new("/srv/repo/src/a.rs")));
        assert!(is_contained(root, Path::new("/srv/repo")));
        assert!(!is_contained(root, Path::new("/srv/repo-evil/src/a.rs")));
        assert!(!is_contained(root, Path::new("/srv/other")));
    }

    #[test]
    fn test_has_extension() {
        let exts = vec![".rs".to_string(), ".ts".to_string()];
        assert!(has_extension("src/main.rs", &exts));
        assert!(has_extension("SRC/MAIN.RS", &exts));
        assert!(!has_extension("src/main.go", &exts));
        assert!(!has_extension("rs", &exts));
    }

    #[tokio::test]
    async fn test_git_diff_worktree_changes() {
        let tmp = setup_repo();
        std::fs::write(tmp.path().join("a.rs"), "fn main() { panic!(); }\n").unwrap();
        let diff = git_diff(tmp.path(), "main").await.unwrap();
        assert!(diff.contains("panic!"));
    }

    #[tokio::test]
    async fn test_git_diff_falls_back_to_staged() {
        let tmp = setup_repo();
        // `git diff main` sees worktree changes too, so commit-equal worktree
        // plus a staged-only change exercises the fallback differently: make
        // the worktree match HEAD and stage a new file.
        std::fs::write(tmp.path().join("b.rs"), "pub fn b() {}\n").unwrap();
        run_git(tmp.path(), &["add", "b.rs"]);
        let diff = git_diff(tmp.path(), "main").await.unwrap();
        assert!(diff.contains("b.rs"));
    }

    #[tokio::test]
    async fn test_git_diff_empty_errors() {
        let tmp = setup_repo();
        let err = git_diff(tmp.path(), "main").await.unwrap_err();
        assert!(err.to_string().contains("no changes found"));
    }

    #[tokio::test]
    async fn test_list_repo_files_includes_untracked() {
        let tmp = setup_repo();
        std::fs::write(tmp.path().join("new.ts"), "export {};\n").unwrap();
        std::fs::write(tmp.path().join(".gitignore"), "ignored.ts\n").unwrap();
        std::fs::write(tmp.path().join("ignored.ts"), "nope\n").unwrap();
        let files = list_repo_files(tmp.path()).await.unwrap();
        assert!(files.contains(&"a.rs".to_string()));
        assert!(files.contains(&"new.ts".to_string()));
        assert!(!files.contains(&"ignored.ts".to_string()));
    }

    #[tokio::test]
    async fn test_read_files_skips_oversize() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("small.rs"), "ok").unwrap();
        std::fs::write(tmp.path().join("big.rs"), "x".repeat((MAX_FILE_SIZE + 1) as usize))
            .unwrap();
        let files =
            read_files(tmp.path(), &["small.rs".to_string(), "big.rs".to_string()]).await;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "small.rs");
    }

    #[tokio::test]
    async fn test_read_files_skips_missing_and_non_utf8() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("good.rs"), "ok").unwrap();
        std::fs::write(tmp.path().join("bin.dat"), [0xff_u8, 0xfe, 0x00, 0x01]).unwrap();
        let files = read_files(
            tmp.path(),
            &["good.rs".to_string(), "bin.dat".to_string(), "absent.rs".to_string()],
        )
        .await;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "good.rs");
    }

    #[tokio::test]
    async fn test_read_files_preserves_order() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["one.rs", "two.rs", "three.rs"] {
            std::fs::write(tmp.path().join(name), name).unwrap();
        }
        let files = read_files(
            tmp.path(),
            &["one.rs".to_string(), "two.rs".to_string(), "three.rs".to_string()],
        )
        .await;
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["one.rs", "two.rs", "three.rs"]);
    }
}
