// Block device images.
//
// The planner only needs two capabilities from an image: reading the bytes
// behind a RangeSet and describing which blocks matter (care map, region
// map, clobbered and extended blocks). Filesystem-aware images live with
// the callers; this module provides the empty image and an in-memory image.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io;

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::rangeset::RangeSet;

/// Fixed block size of every image, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Region of blocks that are entirely zero.
pub const ZERO_REGION: &str = "__ZERO";
/// Region of blocks with content but no owning file.
pub const NONZERO_REGION: &str = "__NONZERO";
/// Region of blocks that are always written in full.
pub const COPY_REGION: &str = "__COPY";

/// Region name to the blocks it occupies.
pub type FileMap = BTreeMap<String, RangeSet>;

/// Lazy, one-shot sequence of byte chunks covering a RangeSet in order.
pub type BlockChunks<'a> = Box<dyn Iterator<Item = Result<Cow<'a, [u8]>, ImageError>> + Send + 'a>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("image data is {len} bytes, not a multiple of the {block_size}-byte block size")]
    Unaligned { len: usize, block_size: usize },
    #[error("blocks \"{ranges}\" lie outside the {total_blocks}-block image")]
    OutOfRange { ranges: String, total_blocks: u64 },
}

// ---------------------------------------------------------------------------
// Image trait
// ---------------------------------------------------------------------------

/// A block device image as seen by the planner.
///
/// `file_map` must partition `care_map`. Implementations must be shareable
/// across the patch worker threads.
pub trait Image: Send + Sync {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn total_blocks(&self) -> u64;

    /// Blocks whose content matters.
    fn care_map(&self) -> &RangeSet;

    /// Blocks that are always rewritten in full, whatever a diff says.
    fn clobbered_blocks(&self) -> &RangeSet;

    /// Blocks that are new relative to the previous image.
    fn extended(&self) -> &RangeSet;

    fn file_map(&self) -> &FileMap;

    /// Read the bytes behind `ranges`, interval by interval.
    fn read_range_set(&self, ranges: &RangeSet) -> BlockChunks<'_>;

    /// SHA-1 (hex) of the care map, excluding clobbered blocks unless asked.
    fn total_sha1(&self, include_clobbered_blocks: bool) -> Result<String, ImageError> {
        let ranges = if include_clobbered_blocks {
            self.care_map().clone()
        } else {
            self.care_map().subtract(self.clobbered_blocks())
        };
        range_sha1(self, &ranges)
    }
}

/// SHA-1 (hex) of the bytes behind `ranges`.
pub fn range_sha1<I: Image + ?Sized>(image: &I, ranges: &RangeSet) -> Result<String, ImageError> {
    let mut hasher = Sha1::new();
    for chunk in image.read_range_set(ranges) {
        hasher.update(&chunk?);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// EmptyImage
// ---------------------------------------------------------------------------

static EMPTY_RANGES: RangeSet = RangeSet::new();
static EMPTY_FILE_MAP: FileMap = BTreeMap::new();

/// A zero-length image, used as the source of a full (non-incremental) update.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyImage;

impl Image for EmptyImage {
    fn total_blocks(&self) -> u64 {
        0
    }

    fn care_map(&self) -> &RangeSet {
        &EMPTY_RANGES
    }

    fn clobbered_blocks(&self) -> &RangeSet {
        &EMPTY_RANGES
    }

    fn extended(&self) -> &RangeSet {
        &EMPTY_RANGES
    }

    fn file_map(&self) -> &FileMap {
        &EMPTY_FILE_MAP
    }

    fn read_range_set(&self, ranges: &RangeSet) -> BlockChunks<'_> {
        if ranges.is_empty() {
            return Box::new(std::iter::empty());
        }
        Box::new(std::iter::once(Err(ImageError::OutOfRange {
            ranges: ranges.to_string(),
            total_blocks: 0,
        })))
    }
}

// ---------------------------------------------------------------------------
// DataImage
// ---------------------------------------------------------------------------

/// How `DataImage` treats a trailing partial block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Alignment {
    /// Reject data that is not block aligned.
    #[default]
    Exact,
    /// Drop the trailing partial block.
    Trim,
    /// Zero-fill the trailing partial block and mark it clobbered.
    Pad,
}

/// An image backed by an in-memory byte buffer.
///
/// Every full block is classified into `__ZERO` or `__NONZERO`; a padded
/// final block goes to `__COPY` instead.
#[derive(Debug, Clone)]
pub struct DataImage {
    data: Vec<u8>,
    total_blocks: u64,
    care_map: RangeSet,
    clobbered_blocks: RangeSet,
    extended: RangeSet,
    file_map: FileMap,
}

impl DataImage {
    pub fn new(mut data: Vec<u8>, alignment: Alignment) -> Result<Self, ImageError> {
        let partial = data.len() % BLOCK_SIZE;
        let mut padded = false;
        if partial > 0 {
            match alignment {
                Alignment::Exact => {
                    return Err(ImageError::Unaligned {
                        len: data.len(),
                        block_size: BLOCK_SIZE,
                    });
                }
                Alignment::Trim => data.truncate(data.len() - partial),
                Alignment::Pad => {
                    data.resize(data.len() + BLOCK_SIZE - partial, 0);
                    padded = true;
                }
            }
        }

        let total_blocks = (data.len() / BLOCK_SIZE) as u64;
        let care_map = RangeSet::from_range(0, total_blocks);
        let clobbered_blocks = if padded {
            RangeSet::from_range(total_blocks - 1, total_blocks)
        } else {
            RangeSet::new()
        };

        let classified = if padded { total_blocks - 1 } else { total_blocks };
        let mut zero = Vec::new();
        let mut nonzero = Vec::new();
        for (i, block) in data.chunks_exact(BLOCK_SIZE).take(classified as usize).enumerate() {
            let i = i as u64;
            let runs: &mut Vec<(u64, u64)> = if block.iter().all(|&b| b == 0) {
                &mut zero
            } else {
                &mut nonzero
            };
            match runs.last_mut() {
                Some((_, end)) if *end == i => *end = i + 1,
                _ => runs.push((i, i + 1)),
            }
        }

        let mut file_map = FileMap::new();
        if !zero.is_empty() {
            file_map.insert(ZERO_REGION.to_string(), zero.into_iter().collect());
        }
        if !nonzero.is_empty() {
            file_map.insert(NONZERO_REGION.to_string(), nonzero.into_iter().collect());
        }
        if !clobbered_blocks.is_empty() {
            file_map.insert(COPY_REGION.to_string(), clobbered_blocks.clone());
        }

        Ok(Self {
            data,
            total_blocks,
            care_map,
            clobbered_blocks,
            extended: RangeSet::new(),
            file_map,
        })
    }

    /// Replace the zero/non-zero classification with a caller-supplied
    /// region map. It must still partition the care map.
    pub fn with_file_map(mut self, file_map: FileMap) -> Self {
        self.file_map = file_map;
        self
    }

    pub fn with_extended(mut self, extended: RangeSet) -> Self {
        self.extended = extended;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Image for DataImage {
    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn care_map(&self) -> &RangeSet {
        &self.care_map
    }

    fn clobbered_blocks(&self) -> &RangeSet {
        &self.clobbered_blocks
    }

    fn extended(&self) -> &RangeSet {
        &self.extended
    }

    fn file_map(&self) -> &FileMap {
        &self.file_map
    }

    fn read_range_set(&self, ranges: &RangeSet) -> BlockChunks<'_> {
        if ranges.end() > self.total_blocks {
            return Box::new(std::iter::once(Err(ImageError::OutOfRange {
                ranges: ranges.to_string(),
                total_blocks: self.total_blocks,
            })));
        }
        let data = &self.data;
        let pieces: Vec<(u64, u64)> = ranges.iter().collect();
        Box::new(pieces.into_iter().map(move |(s, e)| {
            let (s, e) = (s as usize * BLOCK_SIZE, e as usize * BLOCK_SIZE);
            Ok(Cow::Borrowed(&data[s..e]))
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SHA1_EMPTY: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

    fn blocks(fill: &[u8]) -> Vec<u8> {
        fill.iter()
            .flat_map(|&b| std::iter::repeat_n(b, BLOCK_SIZE))
            .collect()
    }

    fn read_all(image: &dyn Image, ranges: &RangeSet) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in image.read_range_set(ranges) {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[test]
    fn classifies_zero_and_nonzero_blocks() {
        let image = DataImage::new(blocks(&[0, 1, 1, 0, 2]), Alignment::Exact).unwrap();
        assert_eq!(image.total_blocks(), 5);
        assert_eq!(image.care_map().to_string(), "0-4");
        let map = image.file_map();
        assert_eq!(map[ZERO_REGION].to_string(), "0 3");
        assert_eq!(map[NONZERO_REGION].to_string(), "1-2 4");
        assert!(!map.contains_key(COPY_REGION));
        assert!(image.clobbered_blocks().is_empty());
    }

    #[test]
    fn unaligned_data_is_rejected() {
        let err = DataImage::new(vec![1; BLOCK_SIZE + 10], Alignment::Exact).unwrap_err();
        assert!(matches!(
            err,
            ImageError::Unaligned {
                len,
                block_size: BLOCK_SIZE
            } if len == BLOCK_SIZE + 10
        ));
    }

    #[test]
    fn trim_drops_partial_block() {
        let image = DataImage::new(vec![1; BLOCK_SIZE + 10], Alignment::Trim).unwrap();
        assert_eq!(image.total_blocks(), 1);
        assert_eq!(image.data().len(), BLOCK_SIZE);
        assert!(image.clobbered_blocks().is_empty());
    }

    #[test]
    fn pad_marks_last_block_clobbered() {
        let image = DataImage::new(vec![1; BLOCK_SIZE + 10], Alignment::Pad).unwrap();
        assert_eq!(image.total_blocks(), 2);
        assert_eq!(image.clobbered_blocks().to_string(), "1");
        assert_eq!(image.file_map()[COPY_REGION].to_string(), "1");
        assert_eq!(image.file_map()[NONZERO_REGION].to_string(), "0");
        assert!(image.data()[BLOCK_SIZE + 10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn reads_requested_blocks_in_order() {
        let image = DataImage::new(blocks(&[0, 1, 2, 3]), Alignment::Exact).unwrap();
        let bytes = read_all(&image, &RangeSet::parse("1 3").unwrap());
        assert_eq!(bytes.len(), 2 * BLOCK_SIZE);
        assert!(bytes[..BLOCK_SIZE].iter().all(|&b| b == 1));
        assert!(bytes[BLOCK_SIZE..].iter().all(|&b| b == 3));
    }

    #[test]
    fn out_of_range_read_fails() {
        let image = DataImage::new(blocks(&[1]), Alignment::Exact).unwrap();
        let mut chunks = image.read_range_set(&RangeSet::parse("0-1").unwrap());
        assert!(matches!(
            chunks.next(),
            Some(Err(ImageError::OutOfRange { total_blocks: 1, .. }))
        ));
    }

    #[test]
    fn digest_skips_clobbered_blocks_by_default() {
        let mut data = blocks(&[7]);
        data.extend_from_slice(&[9; 100]);
        let image = DataImage::new(data, Alignment::Pad).unwrap();

        let only_first = range_sha1(&image, &RangeSet::from_range(0, 1)).unwrap();
        assert_eq!(image.total_sha1(false).unwrap(), only_first);

        let mut whole = Sha1::new();
        whole.update(image.data());
        assert_eq!(image.total_sha1(true).unwrap(), hex::encode(whole.finalize()));
    }

    #[test]
    fn empty_image_is_trivial() {
        let image = EmptyImage;
        assert_eq!(image.total_blocks(), 0);
        assert!(image.file_map().is_empty());
        assert_eq!(image.total_sha1(false).unwrap(), SHA1_EMPTY);
        assert!(image.read_range_set(&RangeSet::from_range(0, 1)).next().unwrap().is_err());
    }
}
