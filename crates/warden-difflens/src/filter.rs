//! Noise filtering before review.
//!
//! Lock files, vendored dependencies, generated and minified code, oversized
//! files and anything matching the configured skip patterns never reach the
//! reviewer. Skipped files are reported with their reason.

use std::fmt;
use std::path::Path;

use warden_core::{FileSkip, ReviewConfig};

use crate::parser::FileDiff;

const LOCK_FILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "Cargo.lock",
    "pnpm-lock.yaml",
    "poetry.lock",
    "Gemfile.lock",
    "composer.lock",
    "go.sum",
];

const VENDOR_DIRS: &[&str] = &["vendor", "third_party", "node_modules"];

const GENERATED_SUFFIXES: &[&str] = &[".g.dart", ".pb.go", ".pb.rs", "_pb2.py"];

const GENERATED_MARKERS: &[&str] = &["// Code generated", "# AUTO-GENERATED", "@generated"];

/// Any line longer than this marks the file as minified.
const MINIFIED_LINE_LEN: usize = 500;

/// Why a file was kept out of review.
///
/// # Examples
///
/// ```
/// use warden_difflens::filter::SkipReason;
///
/// assert_eq!(SkipReason::LockFile.to_string(), "lock file");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Package manager lock file.
    LockFile,
    /// Auto-generated code.
    GeneratedFile,
    /// Third-party vendored code.
    VendoredCode,
    /// Minified or bundled file.
    MinifiedFile,
    /// More changed lines than the configured maximum.
    TooLarge(usize),
    /// Matched a configured pattern or extension.
    PatternMatch(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::LockFile => write!(f, "lock file"),
            SkipReason::GeneratedFile => write!(f, "generated file"),
            SkipReason::VendoredCode => write!(f, "vendored code"),
            SkipReason::MinifiedFile => write!(f, "minified file"),
            SkipReason::TooLarge(lines) => write!(f, "too large ({lines} changed lines)"),
            SkipReason::PatternMatch(pat) => write!(f, "pattern: {pat}"),
        }
    }
}

/// Files kept for review and files dropped, in diff order.
#[derive(Debug)]
pub struct FilterResult {
    /// Diffs that passed the filter.
    pub kept: Vec<FileDiff>,
    /// Files that were skipped, with reasons.
    pub skipped: Vec<FileSkip>,
}

/// Decides which files are worth sending to the reviewer.
///
/// # Examples
///
/// ```
/// use warden_difflens::filter::DiffFilter;
///
/// let filter = DiffFilter::default();
/// assert!(filter.should_skip("package-lock.json"));
/// assert!(filter.should_skip("vendor/lib.js"));
/// assert!(!filter.should_skip("src/main.rs"));
/// ```
pub struct DiffFilter {
    patterns: Vec<glob::Pattern>,
    extensions: Vec<String>,
    max_file_lines: usize,
}

impl Default for DiffFilter {
    fn default() -> Self {
        Self::from_config(&ReviewConfig::default())
    }
}

impl DiffFilter {
    /// Build a filter from the `[review]` table. Invalid glob patterns are
    /// logged and ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use warden_core::ReviewConfig;
    /// use warden_difflens::filter::DiffFilter;
    ///
    /// let config = ReviewConfig {
    ///     skip_patterns: vec!["docs/**".into()],
    ///     ..ReviewConfig::default()
    /// };
    /// let filter = DiffFilter::from_config(&config);
    /// assert!(filter.should_skip("docs/intro.md"));
    /// ```
    pub fn from_config(config: &ReviewConfig) -> Self {
        let patterns = config
            .skip_patterns
            .iter()
            .filter_map(|pat| match glob::Pattern::new(pat) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(pattern = %pat, error = %e, "ignoring invalid skip pattern");
                    None
                }
            })
            .collect();

        Self {
            patterns,
            extensions: config
                .skip_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect(),
            max_file_lines: config.max_file_lines,
        }
    }

    /// Check a bare path against the name-based rules.
    pub fn should_skip(&self, path: &str) -> bool {
        self.classify(Path::new(path), "", 0).is_some()
    }

    /// Split `diffs` into reviewable files and skipped ones.
    pub fn filter(&self, diffs: Vec<FileDiff>) -> FilterResult {
        let mut kept = Vec::new();
        let mut skipped = Vec::new();

        for diff in diffs {
            let content: String = diff.hunks.iter().map(|h| h.content.as_str()).collect();
            let path = diff.display_path().to_path_buf();

            match self.classify(&path, &content, diff.changed_lines()) {
                Some(reason) => {
                    tracing::debug!(path = %path.display(), %reason, "skipping file");
                    skipped.push(FileSkip {
                        path,
                        reason: reason.to_string(),
                    });
                }
                None => kept.push(diff),
            }
        }

        FilterResult { kept, skipped }
    }

    fn classify(&self, path: &Path, content: &str, changed_lines: usize) -> Option<SkipReason> {
        let path_str = path.to_string_lossy();
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();

        if LOCK_FILES.contains(&file_name.as_str()) {
            return Some(SkipReason::LockFile);
        }
        if path_str.split('/').any(|part| VENDOR_DIRS.contains(&part)) {
            return Some(SkipReason::VendoredCode);
        }
        if is_minified(&file_name, content) {
            return Some(SkipReason::MinifiedFile);
        }
        if is_generated(&file_name, content) {
            return Some(SkipReason::GeneratedFile);
        }
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if self.extensions.iter().any(|skip| skip == ext) {
                return Some(SkipReason::PatternMatch(format!("*.{ext}")));
            }
        }
        if let Some(pat) = self.patterns.iter().find(|p| p.matches(&path_str)) {
            return Some(SkipReason::PatternMatch(pat.to_string()));
        }
        if changed_lines > self.max_file_lines {
            return Some(SkipReason::TooLarge(changed_lines));
        }
        None
    }
}

fn is_minified(file_name: &str, content: &str) -> bool {
    file_name.ends_with(".min.js")
        || file_name.ends_with(".min.css")
        || content.lines().any(|l| l.len() > MINIFIED_LINE_LEN)
}

fn is_generated(file_name: &str, content: &str) -> bool {
    if file_name.contains(".generated.") || GENERATED_SUFFIXES.iter().any(|s| file_name.ends_with(s)) {
        return true;
    }
    // headers sit at the top of the file, so only the first few lines count
    content
        .lines()
        .take(5)
        .map(|l| l.get(1..).unwrap_or(""))
        .any(|l| GENERATED_MARKERS.iter().any(|m| l.contains(m)))
}
