// Errors raised while planning a block image update.
//
// Every error is fatal for the run: nothing is retried and no partial
// output is considered valid.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::image::ImageError;
use crate::plan::DiffTool;
use crate::rangeset::RangeSetError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a transfer sequence failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceViolation {
    /// A source block is read from the device after it was overwritten.
    ReadAfterWrite,
    /// A target block is written by more than one transfer.
    DoubleWrite,
    /// A care-map block is never written.
    Unwritten,
}

impl std::fmt::Display for SequenceViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ReadAfterWrite => "read after it was already written",
            Self::DoubleWrite => "written more than once",
            Self::Unwritten => "never written",
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed ranges: {0}")]
    RangeSet(#[from] RangeSetError),

    #[error("image error: {0}")]
    Image(#[from] ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported transfer list version {0} (expected 1-4)")]
    UnsupportedVersion(u32),

    #[error("stash threshold must be a fraction in (0, 1], got {0}")]
    InvalidStashThreshold(f64),

    #[error("{image} image uses {found}-byte blocks; only {expected} is supported")]
    BlockSize {
        image: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("bad partition of {what}: {detail}")]
    Partition { what: String, detail: String },

    #[error("block {block} {violation} (transfer {transfer})")]
    Sequence {
        transfer: String,
        block: u64,
        violation: SequenceViolation,
    },

    #[error("stash {key} is used by transfer {transfer} before it was stored")]
    StashMissing { key: String, transfer: String },

    #[error("transfer {0} was written before its patch style was chosen")]
    UnresolvedDiff(String),

    #[error("transfer ordering failed: {placed} of {total} transfers placed; the graph has a cycle")]
    Cycle { placed: usize, total: usize },

    #[error(
        "stash size {stash_bytes} ({stash_blocks} * {block_size}) exceeds the limit {limit_bytes} \
         ({cache_size} * {threshold:.2})"
    )]
    StashBudgetExceeded {
        stash_blocks: u64,
        stash_bytes: u64,
        block_size: usize,
        limit_bytes: u64,
        cache_size: u64,
        threshold: f64,
    },

    #[error("failed to launch {tool} ({}): {source}", path.display())]
    ToolLaunch {
        tool: DiffTool,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{tool} failed for {target} (source: {source_name}), exit code {code:?}: {stderr}")]
    ToolFailed {
        tool: DiffTool,
        target: String,
        source_name: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("patch worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
