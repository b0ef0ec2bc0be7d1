// Stages 1-2: match target regions to source regions and create transfers.
//
// A target region takes its source from, in order of preference: the
// source region with the same name, the first source region with the same
// basename, the first source region whose basename matches once digit runs
// are normalized (so "libfoo-12.so" finds "libfoo-11.so"). Unmatched
// regions are shipped as new data.

use std::sync::LazyLock;

use log::{debug, info};
use regex::Regex;

use super::BlockImageDiff;
use crate::image::{COPY_REGION, ZERO_REGION};
use crate::rangeset::RangeSet;
use crate::transfer::{Style, Transfer};

static DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[0-9]+").unwrap_or_else(|e| panic!("digit pattern: {e}")));

/// The last path component (`"a/b/c.apk"` → `"c.apk"`).
pub(crate) fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// The basename with every digit run replaced by `#`.
pub(crate) fn digit_pattern(name: &str) -> String {
    DIGITS.replace_all(basename(name), "#").into_owned()
}

impl BlockImageDiff<'_> {
    /// Stage 1: index source region names for fuzzy matching. The first
    /// region in map order wins each key.
    pub(super) fn abbreviate_source_names(&mut self) {
        for name in self.src.file_map().keys() {
            if name.starts_with("__") {
                continue;
            }
            self.src_basenames
                .entry(basename(name).to_string())
                .or_insert_with(|| name.clone());
            self.src_numpatterns
                .entry(digit_pattern(name))
                .or_insert_with(|| name.clone());
        }
    }

    /// Stage 2: one transfer per target region.
    pub(super) fn find_transfers(&mut self) {
        let tgt = self.tgt;
        let src = self.src;

        // Diff pieces larger than an eighth of the cache are split so a
        // single piece never needs more stash than the cache can hold.
        let split_blocks = match self.options.cache_size {
            Some(cache) if self.options.version >= 3 => {
                (cache as f64 * 0.125 / tgt.block_size() as f64) as u64
            }
            _ => 0,
        };

        for (tgt_name, tgt_ranges) in tgt.file_map() {
            if tgt_name == ZERO_REGION {
                let src_ranges = src
                    .file_map()
                    .get(ZERO_REGION)
                    .cloned()
                    .unwrap_or_default();
                self.add_transfer(
                    tgt_name,
                    Some(ZERO_REGION.to_string()),
                    tgt_ranges.clone(),
                    src_ranges,
                    Style::Zero,
                    split_blocks,
                );
                continue;
            }
            if tgt_name == COPY_REGION {
                self.add_transfer(
                    tgt_name,
                    None,
                    tgt_ranges.clone(),
                    RangeSet::new(),
                    Style::New,
                    split_blocks,
                );
                continue;
            }

            let matched = self.match_source(tgt_name);
            match matched.and_then(|name| {
                let ranges = src.file_map().get(&name)?;
                (!ranges.is_empty()).then(|| (name, ranges.clone()))
            }) {
                Some((src_name, src_ranges)) => {
                    debug!("{tgt_name}: diff against {src_name}");
                    self.add_transfer(
                        tgt_name,
                        Some(src_name),
                        tgt_ranges.clone(),
                        src_ranges,
                        Style::Diff,
                        split_blocks,
                    );
                }
                None => {
                    self.add_transfer(
                        tgt_name,
                        None,
                        tgt_ranges.clone(),
                        RangeSet::new(),
                        Style::New,
                        split_blocks,
                    );
                }
            }
        }

        info!("found {} transfers", self.transfers.len());
    }

    /// Exact name, then basename, then digit pattern.
    fn match_source(&self, tgt_name: &str) -> Option<String> {
        if self.src.file_map().contains_key(tgt_name) {
            return Some(tgt_name.to_string());
        }
        if let Some(name) = self.src_basenames.get(basename(tgt_name)) {
            return Some(name.clone());
        }
        self.src_numpatterns.get(&digit_pattern(tgt_name)).cloned()
    }

    /// Append a transfer, splitting diff candidates that exceed
    /// `split_blocks` on either side into `-p<k>` pieces.
    fn add_transfer(
        &mut self,
        tgt_name: &str,
        src_name: Option<String>,
        tgt_ranges: RangeSet,
        src_ranges: RangeSet,
        style: Style,
        split_blocks: u64,
    ) {
        let split = style == Style::Diff
            && self.options.version >= 3
            && split_blocks > 0
            && (tgt_ranges.size() > split_blocks || src_ranges.size() > split_blocks);

        if !split {
            let id = self.transfers.len();
            self.transfers.push(Transfer::new(
                id, tgt_name, src_name, tgt_ranges, src_ranges, style,
            ));
            return;
        }

        let piece_name = |base: &str, piece: usize| format!("{base}-p{piece}");
        let mut tgt_left = tgt_ranges;
        let mut src_left = src_ranges;
        let mut piece = 0;
        loop {
            let last = tgt_left.size() <= split_blocks || src_left.size() <= split_blocks;
            let (tgt_piece, src_piece) = if last {
                (tgt_left.clone(), src_left.clone())
            } else {
                (tgt_left.first(split_blocks), src_left.first(split_blocks))
            };

            let id = self.transfers.len();
            self.transfers.push(Transfer::new(
                id,
                piece_name(tgt_name, piece),
                src_name.as_deref().map(|s| piece_name(s, piece)),
                tgt_piece.clone(),
                src_piece.clone(),
                style,
            ));

            if last {
                break;
            }
            tgt_left = tgt_left.subtract(&tgt_piece);
            src_left = src_left.subtract(&src_piece);
            piece += 1;
        }
        debug!("{tgt_name}: split into {} pieces", piece + 1);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
