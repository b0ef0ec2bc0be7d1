// Block image diff planner.
//
// `BlockImageDiff` turns a source image into a target image as an ordered
// list of transfers. The pipeline runs in a fixed order:
//
//   1. names   : index source region basenames and digit patterns
//   2. names   : build one transfer per target region (split when large)
//   3. graph   : dependency edges: readers of a block go before its writer
//   4. graph   : greedy linearization with lazy-invalidation heap
//   5. stash   : resolve backward edges (trim in v1, stash in v2+)
//   6. stash   : re-order to reduce peak stash (v2+)
//   7. stash   : enforce the stash budget (v2+, cache size given)
//   8. verify  : simulate the sequence against a written-block map
//   9. patch   : classify diffs, run bsdiff/imgdiff on a worker pool
//  10. writer  : emit the transfer list
//
// All transfers live in one arena indexed by id; `sequence` holds the
// execution order.

mod graph;
mod names;
mod patch;
mod stash;
mod verify;
mod writer;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::image::{self, BLOCK_SIZE, EmptyImage, Image};
use crate::rangeset::RangeSet;
use crate::transfer::{Style, Transfer};

pub use patch::{DiffTool, PathResolver, ToolResolver};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Newest transfer list version.
pub const MAX_VERSION: u32 = 4;
/// Fraction of the cache that stashes may occupy.
pub const DEFAULT_STASH_THRESHOLD: f64 = 0.8;

/// Planner configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffOptions {
    /// Transfer list version (1-4).
    pub version: u32,
    /// Patch worker count. `None` uses half the available CPUs.
    pub threads: Option<usize>,
    /// Never choose imgdiff, even for intact archives.
    pub disable_imgdiff: bool,
    /// Size of the device cache that holds stashes, in bytes.
    pub cache_size: Option<u64>,
    /// Fraction of `cache_size` stashes may use.
    pub stash_threshold: f64,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            version: MAX_VERSION,
            threads: None,
            disable_imgdiff: false,
            cache_size: None,
            stash_threshold: DEFAULT_STASH_THRESHOLD,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Summary of a finished computation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeStats {
    pub version: u32,
    pub transfers: usize,
    /// Target blocks written by the transfer list (header line 2).
    pub blocks_written: u64,
    /// Stash slots allocated (header line 3, version 2+).
    pub next_stash_id: usize,
    /// Peak simultaneously stashed blocks (header line 4, version 2+).
    pub max_stashed_blocks: u64,
    pub max_stashed_bytes: u64,
    pub new_blocks: u64,
    pub new_data_bytes: u64,
    pub patch_bytes: u64,
    pub zero_transfers: usize,
    pub move_transfers: usize,
    pub bsdiff_transfers: usize,
    pub imgdiff_transfers: usize,
    /// SHA-1 of every source block the update reads (version 3+).
    pub touched_src_sha1: Option<String>,
}

// ---------------------------------------------------------------------------
// BlockImageDiff
// ---------------------------------------------------------------------------

static EMPTY_IMAGE: EmptyImage = EmptyImage;

pub struct BlockImageDiff<'a> {
    tgt: &'a dyn Image,
    src: &'a dyn Image,
    options: DiffOptions,
    threads: usize,
    resolver: Arc<dyn ToolResolver>,

    transfers: Vec<Transfer>,
    sequence: Vec<usize>,
    src_basenames: BTreeMap<String, String>,
    src_numpatterns: BTreeMap<String, String>,
    /// Stash id to (producer, consumer) transfer ids.
    stash_pairs: BTreeMap<usize, (usize, usize)>,
    touched_src_ranges: RangeSet,
}

impl<'a> BlockImageDiff<'a> {
    /// Prepare a plan from `src` (or nothing, for a full update) to `tgt`.
    ///
    /// Both images must use 4096-byte blocks and their region maps must
    /// partition their care maps.
    pub fn new(tgt: &'a dyn Image, src: Option<&'a dyn Image>, options: DiffOptions) -> Result<Self> {
        let src: &'a dyn Image = match src {
            Some(src) => src,
            None => &EMPTY_IMAGE,
        };

        if !(1..=MAX_VERSION).contains(&options.version) {
            return Err(Error::UnsupportedVersion(options.version));
        }
        // Rejects NaN too.
        let threshold = options.stash_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::InvalidStashThreshold(threshold));
        }
        for (label, image) in [("target", tgt), ("source", src)] {
            if image.block_size() != BLOCK_SIZE {
                return Err(Error::BlockSize {
                    image: label,
                    found: image.block_size(),
                    expected: BLOCK_SIZE,
                });
            }
        }

        let threads = match options.threads {
            None => default_threads(),
            Some(0) => {
                warn!("invalid thread count (0), using 1");
                1
            }
            Some(n) => n,
        };

        assert_partition(src.care_map(), src.file_map().values(), "source care map")?;
        assert_partition(tgt.care_map(), tgt.file_map().values(), "target care map")?;

        Ok(Self {
            tgt,
            src,
            options,
            threads,
            resolver: Arc::new(PathResolver),
            transfers: Vec::new(),
            sequence: Vec::new(),
            src_basenames: BTreeMap::new(),
            src_numpatterns: BTreeMap::new(),
            stash_pairs: BTreeMap::new(),
            touched_src_ranges: RangeSet::new(),
        })
    }

    /// Use `resolver` to locate the bsdiff/imgdiff executables.
    pub fn with_tool_resolver(mut self, resolver: impl ToolResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn options(&self) -> &DiffOptions {
        &self.options
    }

    pub fn version(&self) -> u32 {
        self.options.version
    }

    /// Patch worker count.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// All transfers, indexed by id.
    pub fn transfers(&self) -> &[Transfer] {
        &self.transfers
    }

    /// Source blocks the update reads, known after `compute()`.
    pub fn touched_src_ranges(&self) -> &RangeSet {
        &self.touched_src_ranges
    }

    /// Transfers in execution order.
    pub fn ordered_transfers(&self) -> impl Iterator<Item = &Transfer> + '_ {
        self.sequence.iter().map(|&id| &self.transfers[id])
    }

    /// Run the scheduling stages (1-8): build, order and verify the
    /// transfers without touching any block data beyond stash hashing.
    pub fn plan(&mut self) -> Result<()> {
        self.reset();
        self.abbreviate_source_names();
        self.find_transfers();
        self.generate_digraph();
        self.find_vertex_sequence();

        if self.options.version == 1 {
            self.remove_backward_edges();
        } else {
            self.reverse_backward_edges()?;
            self.improve_vertex_sequence()?;
        }

        if self.options.version >= 2 && self.options.cache_size.is_some() {
            self.revise_stash_size();
        }

        self.assert_sequence_good()
    }

    /// Plan the update and write the transfer list, the new-data blob and
    /// the patch blob.
    pub fn compute<L, N, P>(
        &mut self,
        transfer_list: &mut L,
        new_data: &mut N,
        patch_data: &mut P,
    ) -> Result<ComputeStats>
    where
        L: Write + ?Sized,
        N: Write + ?Sized,
        P: Write + ?Sized,
    {
        self.plan()?;
        let (new_data_bytes, patch_bytes) = self.compute_patches(new_data, patch_data)?;
        let mut stats = self.write_transfers(transfer_list)?;
        stats.new_data_bytes = new_data_bytes;
        stats.patch_bytes = patch_bytes;

        info!(
            "{} transfers: {} blocks written, {} zero, {} move, {} bsdiff, {} imgdiff, {} new blocks",
            stats.transfers,
            stats.blocks_written,
            stats.zero_transfers,
            stats.move_transfers,
            stats.bsdiff_transfers,
            stats.imgdiff_transfers,
            stats.new_blocks
        );
        Ok(stats)
    }

    fn reset(&mut self) {
        self.transfers.clear();
        self.sequence.clear();
        self.src_basenames.clear();
        self.src_numpatterns.clear();
        self.stash_pairs.clear();
        self.touched_src_ranges = RangeSet::new();
    }

    /// Adopt `sequence` as the execution order.
    fn set_sequence(&mut self, sequence: Vec<usize>) {
        for (order, &id) in sequence.iter().enumerate() {
            self.transfers[id].order = order;
        }
        self.sequence = sequence;
    }

    fn hash_src(&self, ranges: &RangeSet) -> Result<String> {
        Ok(image::range_sha1(self.src, ranges)?)
    }

    fn hash_tgt(&self, ranges: &RangeSet) -> Result<String> {
        Ok(image::range_sha1(self.tgt, ranges)?)
    }

    fn count_style(&self, style: Style) -> usize {
        self.transfers.iter().filter(|xf| xf.style == style).count()
    }
}

/// Half the available CPUs, at least one.
pub fn default_threads() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    (cpus / 2).max(1)
}

/// Check that `parts` are pairwise disjoint and together equal `total`.
pub(crate) fn assert_partition<'r>(
    total: &RangeSet,
    parts: impl IntoIterator<Item = &'r RangeSet>,
    what: &str,
) -> Result<()> {
    let mut seen = RangeSet::new();
    for part in parts {
        if seen.overlaps(part) {
            return Err(Error::Partition {
                what: what.to_string(),
                detail: format!("\"{part}\" overlaps earlier ranges \"{seen}\""),
            });
        }
        seen = seen.union(part);
    }
    if seen != *total {
        return Err(Error::Partition {
            what: what.to_string(),
            detail: format!("union \"{seen}\" does not equal \"{total}\""),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::image::{Alignment, DataImage, FileMap};

    pub(crate) fn rs(text: &str) -> RangeSet {
        RangeSet::parse(text).unwrap()
    }

    /// Blocks filled with the given byte values.
    pub(crate) fn blocks(fill: &[u8]) -> Vec<u8> {
        fill.iter()
            .flat_map(|&b| std::iter::repeat_n(b, BLOCK_SIZE))
            .collect()
    }

    /// An in-memory image with an explicit region map.
    pub(crate) fn mapped(fill: &[u8], regions: &[(&str, &str)]) -> DataImage {
        let map: FileMap = regions
            .iter()
            .map(|(name, ranges)| (name.to_string(), rs(ranges)))
            .collect();
        DataImage::new(blocks(fill), Alignment::Exact)
            .unwrap()
            .with_file_map(map)
    }

    #[test]
    fn rejects_unsupported_version() {
        let tgt = mapped(&[1], &[("a", "0")]);
        for version in [0, 5] {
            let opts = DiffOptions {
                version,
                ..Default::default()
            };
            assert!(matches!(
                BlockImageDiff::new(&tgt, None, opts),
                Err(Error::UnsupportedVersion(v)) if v == version
            ));
        }
    }

    #[test]
    fn rejects_stash_threshold_outside_unit_interval() {
        let tgt = mapped(&[1], &[("a", "0")]);
        for threshold in [-0.5, 0.0, 1.5, f64::NAN, f64::INFINITY] {
            let opts = DiffOptions {
                cache_size: Some(10 * 4096),
                stash_threshold: threshold,
                ..Default::default()
            };
            assert!(
                matches!(
                    BlockImageDiff::new(&tgt, None, opts),
                    Err(Error::InvalidStashThreshold(_))
                ),
                "threshold {threshold} accepted"
            );
        }

        let opts = DiffOptions {
            stash_threshold: 1.0,
            ..Default::default()
        };
        assert!(BlockImageDiff::new(&tgt, None, opts).is_ok());
    }

    #[test]
    fn rejects_bad_partition() {
        let tgt = mapped(&[1, 2, 3], &[("a", "0-1"), ("b", "1-2")]);
        let err = BlockImageDiff::new(&tgt, None, DiffOptions::default())
            .err()
            .expect("overlapping regions accepted");
        assert!(matches!(err, Error::Partition { .. }));

        let tgt = mapped(&[1, 2, 3], &[("a", "0")]);
        assert!(matches!(
            BlockImageDiff::new(&tgt, None, DiffOptions::default()),
            Err(Error::Partition { .. })
        ));
    }

    #[test]
    fn thread_count_defaults_and_clamps() {
        let tgt = mapped(&[1], &[("a", "0")]);
        let auto = BlockImageDiff::new(&tgt, None, DiffOptions::default()).unwrap();
        assert!(auto.threads() >= 1);

        let zero = BlockImageDiff::new(
            &tgt,
            None,
            DiffOptions {
                threads: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(zero.threads(), 1);
    }

    #[test]
    fn partition_check_accepts_exact_cover() {
        let parts = [rs("0-4"), rs("10-14"), rs("5-9")];
        assert!(assert_partition(&rs("0-14"), parts.iter(), "test").is_ok());
        assert!(assert_partition(&RangeSet::new(), std::iter::empty(), "test").is_ok());
    }
}
