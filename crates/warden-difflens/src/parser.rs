use std::fmt;
use std::path::{Path, PathBuf};

use warden_core::{ChangeType, DiffHunk, WardenError};

/// All hunks touching one file.
///
/// # Examples
///
/// ```
/// use warden_difflens::parser::parse_unified_diff;
///
/// let diff = "diff --git a/hello.rs b/hello.rs\n\
///             --- a/hello.rs\n\
///             +++ b/hello.rs\n\
///             @@ -1,3 +1,4 @@\n\
///              fn main() {\n\
///             +    println!(\"hello\");\n\
///              }\n";
/// let files = parse_unified_diff(diff).unwrap();
/// assert_eq!(files.len(), 1);
/// assert_eq!(files[0].hunks.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct FileDiff {
    /// Path in the old version (`/dev/null` for new files).
    pub old_path: PathBuf,
    /// Path in the new version (`/dev/null` for deleted files).
    pub new_path: PathBuf,
    /// Parsed hunks for this file.
    pub hunks: Vec<DiffHunk>,
    /// Newly created file.
    pub is_new_file: bool,
    /// Deleted file.
    pub is_deleted_file: bool,
    /// Renamed file.
    pub is_rename: bool,
}

impl FileDiff {
    fn empty() -> Self {
        Self {
            old_path: PathBuf::new(),
            new_path: PathBuf::new(),
            hunks: Vec::new(),
            is_new_file: false,
            is_deleted_file: false,
            is_rename: false,
        }
    }

    /// The path that identifies this file in review output: the old path for
    /// deletions, the new path otherwise.
    pub fn display_path(&self) -> &Path {
        if self.is_deleted_file {
            &self.old_path
        } else {
            &self.new_path
        }
    }

    /// Number of added plus removed lines.
    pub fn changed_lines(&self) -> usize {
        self.hunks
            .iter()
            .flat_map(|h| h.content.lines())
            .filter(|l| l.starts_with('+') || l.starts_with('-'))
            .count()
    }

    /// `diff --git` / `---` / `+++` header lines for this file.
    pub fn header(&self) -> String {
        let old = self.old_path.to_string_lossy();
        let new = self.new_path.to_string_lossy();
        let a = if old == "/dev/null" { new.clone() } else { old.clone() };
        let b = if new == "/dev/null" { old.clone() } else { new.clone() };
        let minus = if old == "/dev/null" { "/dev/null".to_string() } else { format!("a/{old}") };
        let plus = if new == "/dev/null" { "/dev/null".to_string() } else { format!("b/{new}") };
        format!("diff --git a/{a} b/{b}\n--- {minus}\n+++ {plus}\n")
    }
}

impl fmt::Display for FileDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} hunks)",
            self.display_path().display(),
            self.hunks.len()
        )
    }
}

/// Accumulates files and hunks while walking diff lines.
#[derive(Default)]
struct DiffParser {
    files: Vec<FileDiff>,
    file: Option<FileDiff>,
    hunk: Option<DiffHunk>,
    old_remaining: u32,
    new_remaining: u32,
    binary: bool,
}

impl DiffParser {
    fn close_hunk(&mut self) {
        if let (Some(hunk), Some(file)) = (self.hunk.take(), self.file.as_mut()) {
            file.hunks.push(hunk);
        }
    }

    fn close_file(&mut self) {
        self.close_hunk();
        if let Some(file) = self.file.take() {
            if !self.binary {
                self.files.push(file);
            }
        }
        self.binary = false;
    }

    fn start_file(&mut self) {
        self.close_file();
        self.file = Some(FileDiff::empty());
    }

    fn line(&mut self, line: &str) -> Result<(), WardenError> {
        if line.starts_with("diff --git ") {
            self.start_file();
            return Ok(());
        }

        if self.hunk.is_some() && self.hunk_line(line) {
            return Ok(());
        }

        // Plain patches have no `diff --git` line; a `---` header opens the file.
        let file_has_hunks = self.file.as_ref().is_some_and(|f| !f.hunks.is_empty());
        if line.starts_with("--- ") && (self.file.is_none() || file_has_hunks) {
            self.start_file();
        }

        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        if line.starts_with("@@ ") {
            let (old_start, old_lines, new_start, new_lines) = parse_hunk_header(line)?;
            let change_type = if file.is_new_file || old_lines == 0 {
                ChangeType::Add
            } else if file.is_deleted_file || new_lines == 0 {
                ChangeType::Delete
            } else if file.is_rename {
                ChangeType::Move
            } else {
                ChangeType::Modify
            };
            let hunk = DiffHunk {
                file_path: file.display_path().to_path_buf(),
                old_start,
                old_lines,
                new_start,
                new_lines,
                content: String::new(),
                change_type,
            };
            self.hunk = Some(hunk);
            self.old_remaining = old_lines;
            self.new_remaining = new_lines;
            if old_lines == 0 && new_lines == 0 {
                self.close_hunk();
            }
            return Ok(());
        }

        if line.starts_with("Binary files ") && line.ends_with(" differ") {
            self.binary = true;
        } else if line.starts_with("new file mode") {
            file.is_new_file = true;
        } else if line.starts_with("deleted file mode") {
            file.is_deleted_file = true;
        } else if let Some(path) = line.strip_prefix("rename from ") {
            file.is_rename = true;
            file.old_path = PathBuf::from(path.trim_matches('"'));
        } else if let Some(path) = line.strip_prefix("rename to ") {
            file.is_rename = true;
            file.new_path = PathBuf::from(path.trim_matches('"'));
        } else if let Some(path) = line.strip_prefix("--- ") {
            file.old_path = parse_path(path);
            if file.old_path == Path::new("/dev/null") {
                file.is_new_file = true;
            }
        } else if let Some(path) = line.strip_prefix("+++ ") {
            file.new_path = parse_path(path);
            if file.new_path == Path::new("/dev/null") {
                file.is_deleted_file = true;
            }
        }
        Ok(())
    }

    /// Append a body line, closing the hunk once its line counts are used up.
    /// Returns `false` when `line` is not hunk content; the hunk is then
    /// closed and the caller handles the line as a header.
    fn hunk_line(&mut self, line: &str) -> bool {
        let Some(hunk) = self.hunk.as_mut() else {
            return false;
        };
        match line.as_bytes().first() {
            Some(b'+') => self.new_remaining = self.new_remaining.saturating_sub(1),
            Some(b'-') => self.old_remaining = self.old_remaining.saturating_sub(1),
            // some tools strip the trailing space of blank context lines
            Some(b' ') | None => {
                self.old_remaining = self.old_remaining.saturating_sub(1);
                self.new_remaining = self.new_remaining.saturating_sub(1);
            }
            Some(_) => {
                self.close_hunk();
                return false;
            }
        }
        if line.is_empty() {
            hunk.content.push(' ');
        } else {
            hunk.content.push_str(line);
        }
        hunk.content.push('\n');
        if self.old_remaining == 0 && self.new_remaining == 0 {
            self.close_hunk();
        }
        true
    }

    fn finish(mut self) -> Vec<FileDiff> {
        self.close_file();
        self.files
    }
}

/// Parse a unified diff (as produced by `git diff` or the GitHub compare API)
/// into per-file entries.
///
/// New, deleted and renamed files are recognised; binary files are dropped.
///
/// # Errors
///
/// Returns [`WardenError::Parse`] if a hunk header is malformed.
///
/// # Examples
///
/// ```
/// use warden_difflens::parser::parse_unified_diff;
///
/// assert!(parse_unified_diff("").unwrap().is_empty());
/// ```
pub fn parse_unified_diff(input: &str) -> Result<Vec<FileDiff>, WardenError> {
    let mut parser = DiffParser::default();
    for line in input.lines() {
        if line.starts_with('\\') {
            // "\ No newline at end of file"
            continue;
        }
        parser.line(line)?;
    }
    Ok(parser.finish())
}

fn parse_path(raw: &str) -> PathBuf {
    // git appends a tab and timestamp in some modes
    let raw = raw.split('\t').next().unwrap_or(raw);
    let normalized = raw.trim_matches('"');
    if normalized == "/dev/null" {
        return PathBuf::from(normalized);
    }
    let stripped = normalized
        .strip_prefix("a/")
        .or_else(|| normalized.strip_prefix("b/"))
        .unwrap_or(normalized);
    PathBuf::from(stripped)
}

fn parse_hunk_header(line: &str) -> Result<(u32, u32, u32, u32), WardenError> {
    let invalid = || WardenError::Parse(format!("invalid hunk header: {line}"));

    let inner = line
        .strip_prefix("@@ ")
        .and_then(|s| s.find(" @@").map(|end| &s[..end]))
        .ok_or_else(invalid)?;
    let (old, new) = inner.split_once(' ').ok_or_else(invalid)?;
    let old = old.strip_prefix('-').ok_or_else(invalid)?;
    let new = new.strip_prefix('+').ok_or_else(invalid)?;

    let (old_start, old_lines) = parse_range(old, line)?;
    let (new_start, new_lines) = parse_range(new, line)?;
    Ok((old_start, old_lines, new_start, new_lines))
}

fn parse_range(range: &str, context: &str) -> Result<(u32, u32), WardenError> {
    let number = |s: &str| {
        s.parse::<u32>()
            .map_err(|_| WardenError::Parse(format!("invalid range in hunk header: {context}")))
    };
    match range.split_once(',') {
        Some((start, count)) => Ok((number(start)?, number(count)?)),
        None => Ok((number(range)?, 1)),
    }
}
