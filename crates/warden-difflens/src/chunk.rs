//! Deterministic, size-bounded splitting of a diff into review chunks.

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use warden_core::{Chunk, DiffHunk};

use crate::parser::FileDiff;

/// Splits parsed diffs into chunks of at most `limit` characters.
///
/// Files and hunks keep their diff order. A chunk only ever holds whole
/// hunks, each run of hunks preceded by its file header, so every chunk is a
/// valid diff on its own. A single hunk larger than the limit becomes a chunk
/// by itself. The same input always yields the same chunks.
///
/// # Examples
///
/// ```
/// use warden_difflens::chunk::Chunker;
/// use warden_difflens::parser::parse_unified_diff;
///
/// let diff = "diff --git a/a.rs b/a.rs\n--- a/a.rs\n+++ b/a.rs\n@@ -1 +1,2 @@\n x\n+y\n";
/// let files = parse_unified_diff(diff).unwrap();
/// let chunks = Chunker::new(10_000).split(&files);
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(chunks[0].index, 0);
/// assert_eq!(chunks[0].hunk_count, 1);
/// assert_eq!(chunks[0].fingerprint.len(), 64);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    limit: usize,
}

#[derive(Default)]
struct Pending {
    text: String,
    files: Vec<PathBuf>,
    hunks: usize,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.hunks == 0
    }

    fn push(&mut self, file: &FileDiff, hunk_text: &str) {
        let path = file.display_path().to_path_buf();
        if self.files.last() != Some(&path) {
            self.text.push_str(&file.header());
            self.files.push(path);
        }
        self.text.push_str(hunk_text);
        self.hunks += 1;
    }

    /// Size after adding `hunk_text` from `file`.
    fn size_with(&self, file: &FileDiff, hunk_text: &str) -> usize {
        let header = if self.files.last().map(PathBuf::as_path) == Some(file.display_path()) {
            0
        } else {
            file.header().len()
        };
        self.text.len() + header + hunk_text.len()
    }
}

impl Chunker {
    /// Create a chunker; a zero limit is treated as one character, which
    /// yields one chunk per hunk.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    /// Split `files` into chunks. Files without hunks (pure renames, mode
    /// changes) contribute nothing.
    pub fn split(&self, files: &[FileDiff]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut pending = Pending::default();

        for file in files {
            for hunk in &file.hunks {
                let text = render_hunk(hunk);
                if !pending.is_empty() && pending.size_with(file, &text) > self.limit {
                    chunks.push(finish(chunks.len(), std::mem::take(&mut pending)));
                }
                pending.push(file, &text);
            }
        }
        if !pending.is_empty() {
            chunks.push(finish(chunks.len(), pending));
        }
        chunks
    }
}

fn render_hunk(hunk: &DiffHunk) -> String {
    format!(
        "@@ -{},{} +{},{} @@\n{}",
        hunk.old_start, hunk.old_lines, hunk.new_start, hunk.new_lines, hunk.content
    )
}

fn finish(index: usize, pending: Pending) -> Chunk {
    let fingerprint = format!("{:x}", Sha256::digest(pending.text.as_bytes()));
    Chunk {
        index,
        files: pending.files,
        hunk_count: pending.hunks,
        text: pending.text,
        fingerprint,
    }
}
