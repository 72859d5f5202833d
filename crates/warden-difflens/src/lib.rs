//! Diff parsing, noise filtering and chunking.
//!
//! Turns the raw unified diff returned by a Git provider into the ordered,
//! size-bounded [`Chunk`]s that the executor hands to the reviewer, one
//! reviewer call per chunk.

pub mod chunk;
pub mod filter;
pub mod parser;

use warden_core::{Chunk, FileSkip, ReviewConfig, WardenError};

use crate::chunk::Chunker;
use crate::filter::DiffFilter;
use crate::parser::parse_unified_diff;

/// A diff ready for review.
#[derive(Debug)]
pub struct PreparedDiff {
    /// Chunks in diff order, indexed from 0.
    pub chunks: Vec<Chunk>,
    /// Files that survived the filter.
    pub files_reviewed: usize,
    /// Files the filter dropped.
    pub skipped: Vec<FileSkip>,
    /// Hunks across all chunks.
    pub hunks: usize,
}

/// Parse, filter and chunk `raw_diff`.
///
/// # Errors
///
/// Returns [`WardenError::Parse`] if the diff is malformed.
///
/// # Examples
///
/// ```
/// use warden_core::ReviewConfig;
/// use warden_difflens::prepare_diff;
///
/// let diff = "diff --git a/Cargo.lock b/Cargo.lock\n--- a/Cargo.lock\n+++ b/Cargo.lock\n@@ -1 +1 @@\n-a\n+b\n\
///             diff --git a/src/lib.rs b/src/lib.rs\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1,2 @@\n x\n+y\n";
/// let prepared = prepare_diff(diff, &ReviewConfig::default(), 12_000).unwrap();
/// assert_eq!(prepared.files_reviewed, 1);
/// assert_eq!(prepared.skipped.len(), 1);
/// assert_eq!(prepared.chunks.len(), 1);
/// ```
pub fn prepare_diff(
    raw_diff: &str,
    review: &ReviewConfig,
    chunk_size_limit: usize,
) -> Result<PreparedDiff, WardenError> {
    let files = parse_unified_diff(raw_diff)?;
    let filtered = DiffFilter::from_config(review).filter(files);
    let chunks = Chunker::new(chunk_size_limit).split(&filtered.kept);
    let hunks = chunks.iter().map(|c| c.hunk_count).sum();

    tracing::debug!(
        files = filtered.kept.len(),
        skipped = filtered.skipped.len(),
        chunks = chunks.len(),
        hunks,
        "prepared diff"
    );

    Ok(PreparedDiff {
        chunks,
        files_reviewed: filtered.kept.len(),
        skipped: filtered.skipped,
        hunks,
    })
}
