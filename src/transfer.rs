// Transfers: one scheduled write against a set of target blocks.
//
// Transfers are created once while the plan is built and then only
// mutated in place. Adjacency to other transfers is kept as id-keyed maps
// so the whole graph lives in a single arena without shared ownership.

use std::collections::BTreeMap;
use std::fmt;

use crate::rangeset::RangeSet;

// ---------------------------------------------------------------------------
// Style
// ---------------------------------------------------------------------------

/// How a transfer produces its target blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Style {
    /// Raw target bytes shipped in the new-data blob.
    New,
    /// Blocks filled with zeros.
    Zero,
    /// Source blocks copied unchanged.
    Move,
    /// Source and target differ; the concrete patch style is not chosen yet.
    Diff,
    Bsdiff,
    Imgdiff,
}

impl Style {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Zero => "zero",
            Self::Move => "move",
            Self::Diff => "diff",
            Self::Bsdiff => "bsdiff",
            Self::Imgdiff => "imgdiff",
        }
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stash entries
// ---------------------------------------------------------------------------

/// Key a stash is stored under on the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StashKey {
    /// Sequential id (transfer list version 2).
    Id(usize),
    /// SHA-1 of the stashed content (version 3 and later). Identical
    /// content shares one stash slot.
    Hash(String),
}

impl fmt::Display for StashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Hash(hash) => f.write_str(hash),
        }
    }
}

/// One side of a stash: the producer's `stash_before` entry or the
/// consumer's `use_stash` entry. Both sides carry the same `id`, which is
/// unique per producer/consumer pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stash {
    pub id: usize,
    pub key: StashKey,
    pub ranges: RangeSet,
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Transfer {
    /// Index in the transfer arena; stable for the life of the plan.
    pub id: usize,
    /// Position in the execution order.
    pub order: usize,
    pub tgt_name: String,
    pub src_name: Option<String>,
    pub tgt_ranges: RangeSet,
    pub src_ranges: RangeSet,
    pub style: Style,
    /// Both range sets were given in increasing order, so the source and
    /// target byte streams line up with the region's file contents.
    pub intact: bool,
    /// Transfers that must run after this one, with the overlap weight.
    pub goes_before: BTreeMap<usize, u64>,
    /// Transfers that must run before this one, with the overlap weight.
    pub goes_after: BTreeMap<usize, u64>,
    pub stash_before: Vec<Stash>,
    pub use_stash: Vec<Stash>,
    pub patch_start: u64,
    pub patch_len: u64,
}

impl Transfer {
    pub fn new(
        id: usize,
        tgt_name: impl Into<String>,
        src_name: Option<String>,
        tgt_ranges: RangeSet,
        src_ranges: RangeSet,
        style: Style,
    ) -> Self {
        let intact = tgt_ranges.is_monotonic() && src_ranges.is_monotonic();
        Self {
            id,
            order: id,
            tgt_name: tgt_name.into(),
            src_name,
            tgt_ranges,
            src_ranges,
            style,
            intact,
            goes_before: BTreeMap::new(),
            goes_after: BTreeMap::new(),
            stash_before: Vec::new(),
            use_stash: Vec::new(),
            patch_start: 0,
            patch_len: 0,
        }
    }

    /// Blocks stashed by this transfer minus blocks it takes out of stash.
    pub fn net_stash_change(&self) -> i64 {
        let stashed: u64 = self.stash_before.iter().map(|s| s.ranges.size()).sum();
        let used: u64 = self.use_stash.iter().map(|s| s.ranges.size()).sum();
        stashed as i64 - used as i64
    }

    /// Ship the target blocks verbatim, dropping all source and consumed
    /// stash information.
    pub fn convert_to_new(&mut self) {
        debug_assert_ne!(self.style, Style::New);
        self.use_stash.clear();
        self.src_ranges = RangeSet::new();
        self.style = Style::New;
    }

    /// Source blocks read from the device rather than from stash.
    pub fn unstashed_src_ranges(&self) -> RangeSet {
        self.use_stash
            .iter()
            .fold(self.src_ranges.clone(), |acc, s| acc.subtract(&s.ranges))
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: <{} {} to {}> (tgt: {}, src: {})",
            self.id,
            self.src_ranges,
            self.style,
            self.tgt_ranges,
            self.tgt_name,
            self.src_name.as_deref().unwrap_or("N/A")
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
