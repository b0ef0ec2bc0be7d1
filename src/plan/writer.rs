// Stage 10: serialize the ordered transfers as a transfer list.
//
//   <version>
//   <blocks written>
//   <stash slots>          version 2+
//   <peak stashed blocks>  version 2+
//   erase / zero / new / move / bsdiff / imgdiff / stash / free ...
//
// Version 2 stashes live in numbered slots that are reused after `free`.
// Version 3+ stashes are keyed by content hash and reference counted, so
// identical content is stored once.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::io::Write;

use log::info;

use super::{BlockImageDiff, ComputeStats, assert_partition};
use crate::error::{Error, Result};
use crate::rangeset::RangeSet;
use crate::transfer::{Stash, StashKey, Style, Transfer};

/// Largest range a single `zero` command may cover.
const ZERO_BLOCKS_PER_COMMAND: u64 = 1024;

/// Append `zero` commands covering `ranges`; returns the block count.
fn zero_commands(out: &mut Vec<String>, ranges: &RangeSet) -> u64 {
    let mut left = ranges.clone();
    let mut written = 0;
    while !left.is_empty() {
        let chunk = left.first(ZERO_BLOCKS_PER_COMMAND);
        out.push(format!("zero {}", chunk.to_string_raw()));
        written += chunk.size();
        left = left.subtract(&chunk);
    }
    written
}

/// The `<src-spec>` of a version 2+ command. `labels` name the stash of
/// each `use_stash` entry.
fn source_spec(xf: &Transfer, labels: &[String]) -> Result<String> {
    let size = xf.src_ranges.size();
    let mut parts = vec![size.to_string()];
    let mut stash_parts = Vec::with_capacity(labels.len());
    let mut mapped = Vec::with_capacity(labels.len() + 1);

    for (stash, label) in xf.use_stash.iter().zip(labels) {
        let within = xf.src_ranges.map_within(&stash.ranges)?;
        stash_parts.push(format!("{label}:{}", within.to_string_raw()));
        mapped.push(within);
    }

    let unstashed = xf.unstashed_src_ranges();
    if !unstashed.is_empty() {
        parts.push(unstashed.to_string_raw());
        if !xf.use_stash.is_empty() {
            let within = xf.src_ranges.map_within(&unstashed)?;
            parts.push(within.to_string_raw());
            mapped.push(within);
        }
    } else if size > 0 {
        parts.push("-".to_string());
    }

    if !mapped.is_empty() {
        assert_partition(
            &RangeSet::from_range(0, size),
            mapped.iter(),
            &format!("source of transfer {}", xf.id),
        )?;
    }
    parts.extend(stash_parts);
    Ok(parts.join(" "))
}

/// Live stash bookkeeping while commands are emitted.
#[derive(Default)]
struct StashState {
    /// Version 2: stash id to slot.
    slots: BTreeMap<usize, usize>,
    free_slots: BinaryHeap<Reverse<usize>>,
    next_slot: usize,
    /// Version 3+: content key to reference count.
    refs: BTreeMap<StashKey, usize>,
    stashed: u64,
    max_stashed: u64,
}

impl StashState {
    fn missing(stash: &Stash, xf: &Transfer) -> Error {
        Error::StashMissing {
            key: stash.key.to_string(),
            transfer: xf.to_string(),
        }
    }
}

impl BlockImageDiff<'_> {
    /// Write the transfer list and report what it contains.
    pub(super) fn write_transfers<W: Write + ?Sized>(&mut self, out: &mut W) -> Result<ComputeStats> {
        let version = self.options.version;
        let block_size = self.tgt.block_size() as u64;
        let mut lines: Vec<String> = Vec::new();
        let mut state = StashState::default();
        let mut total = 0u64;
        let mut touched = RangeSet::new();

        for &id in &self.sequence {
            let xf = &self.transfers[id];

            for stash in &xf.stash_before {
                if version == 2 {
                    let slot = match state.free_slots.pop() {
                        Some(Reverse(slot)) => slot,
                        None => {
                            state.next_slot += 1;
                            state.next_slot - 1
                        }
                    };
                    state.slots.insert(stash.id, slot);
                    state.stashed += stash.ranges.size();
                    touched = touched.union(&stash.ranges);
                    lines.push(format!("stash {slot} {}", stash.ranges.to_string_raw()));
                } else {
                    let count = state.refs.entry(stash.key.clone()).or_insert(0);
                    if *count == 0 {
                        state.stashed += stash.ranges.size();
                        touched = touched.union(&stash.ranges);
                        lines.push(format!("stash {} {}", stash.key, stash.ranges.to_string_raw()));
                    }
                    *count += 1;
                }
            }
            state.max_stashed = state.max_stashed.max(state.stashed);

            let mut labels = Vec::with_capacity(xf.use_stash.len());
            let mut frees = Vec::new();
            let mut freed = 0u64;
            for stash in &xf.use_stash {
                if version == 2 {
                    let slot = state
                        .slots
                        .remove(&stash.id)
                        .ok_or_else(|| StashState::missing(stash, xf))?;
                    state.free_slots.push(Reverse(slot));
                    labels.push(slot.to_string());
                    frees.push(format!("free {slot}"));
                    freed += stash.ranges.size();
                } else {
                    let count = state
                        .refs
                        .get_mut(&stash.key)
                        .ok_or_else(|| StashState::missing(stash, xf))?;
                    *count -= 1;
                    if *count == 0 {
                        state.refs.remove(&stash.key);
                        frees.push(format!("free {}", stash.key));
                        freed += stash.ranges.size();
                    }
                    labels.push(stash.key.to_string());
                }
            }

            let tgt_raw = xf.tgt_ranges.to_string_raw();
            match xf.style {
                Style::New => {
                    lines.push(format!("new {tgt_raw}"));
                    total += xf.tgt_ranges.size();
                }
                Style::Move => {
                    if xf.src_ranges != xf.tgt_ranges || !xf.use_stash.is_empty() {
                        touched = touched.union(&xf.src_ranges);
                        let line = match version {
                            1 => format!("move {} {tgt_raw}", xf.src_ranges.to_string_raw()),
                            2 => format!("move {tgt_raw} {}", source_spec(xf, &labels)?),
                            _ => {
                                if xf.src_ranges.overlaps(&xf.tgt_ranges) {
                                    state.max_stashed =
                                        state.max_stashed.max(state.stashed + xf.src_ranges.size());
                                }
                                format!(
                                    "move {} {tgt_raw} {}",
                                    self.hash_tgt(&xf.tgt_ranges)?,
                                    source_spec(xf, &labels)?
                                )
                            }
                        };
                        lines.push(line);
                        total += xf.tgt_ranges.size();
                    }
                }
                Style::Bsdiff | Style::Imgdiff => {
                    touched = touched.union(&xf.src_ranges);
                    let head = format!("{} {} {}", xf.style, xf.patch_start, xf.patch_len);
                    let line = match version {
                        1 => format!("{head} {} {tgt_raw}", xf.src_ranges.to_string_raw()),
                        2 => format!("{head} {tgt_raw} {}", source_spec(xf, &labels)?),
                        _ => {
                            if xf.src_ranges.overlaps(&xf.tgt_ranges) {
                                state.max_stashed =
                                    state.max_stashed.max(state.stashed + xf.src_ranges.size());
                            }
                            format!(
                                "{head} {} {} {tgt_raw} {}",
                                self.hash_src(&xf.src_ranges)?,
                                self.hash_tgt(&xf.tgt_ranges)?,
                                source_spec(xf, &labels)?
                            )
                        }
                    };
                    lines.push(line);
                    total += xf.tgt_ranges.size();
                }
                Style::Zero => {
                    total += zero_commands(&mut lines, &xf.tgt_ranges);
                }
                Style::Diff => return Err(Error::UnresolvedDiff(xf.to_string())),
            }

            lines.extend(frees);
            state.stashed -= freed;

            if let Some(cache_size) = self.options.cache_size
                && version >= 2
            {
                let limit = cache_size as f64 * self.options.stash_threshold;
                let stash_bytes = state.max_stashed * block_size;
                if stash_bytes as f64 > limit {
                    return Err(Error::StashBudgetExceeded {
                        stash_blocks: state.max_stashed,
                        stash_bytes,
                        block_size: block_size as usize,
                        limit_bytes: limit as u64,
                        cache_size,
                        threshold: self.options.stash_threshold,
                    });
                }
            }
        }

        let touched_src_sha1 = if version >= 3 {
            Some(self.hash_src(&touched)?)
        } else {
            None
        };

        let extended = self.tgt.extended();
        if !extended.is_empty() {
            total += zero_commands(&mut lines, extended);
        }

        // Blocks outside the care map are erased: up front when the update
        // never reads them, at the end otherwise.
        let dont_care = RangeSet::from_range(0, self.tgt.total_blocks())
            .subtract(extended)
            .subtract(self.tgt.care_map());
        let erase_first = dont_care.subtract(&touched);
        let erase_last = dont_care.subtract(&erase_first);
        if !erase_last.is_empty() {
            lines.push(format!("erase {}", erase_last.to_string_raw()));
        }

        let next_slot = if version == 2 { state.next_slot } else { 0 };
        let mut header = vec![version.to_string(), total.to_string()];
        if version >= 2 {
            header.push(next_slot.to_string());
            header.push(state.max_stashed.to_string());
        }
        if !erase_first.is_empty() {
            header.push(format!("erase {}", erase_first.to_string_raw()));
        }

        for line in header.iter().chain(&lines) {
            writeln!(out, "{line}")?;
        }
        out.flush()?;

        let max_stashed_bytes = state.max_stashed * block_size;
        match self.options.cache_size {
            Some(cache_size) => {
                let limit = cache_size as f64 * self.options.stash_threshold;
                let pct = if limit > 0.0 {
                    max_stashed_bytes as f64 * 100.0 / limit
                } else {
                    0.0
                };
                info!(
                    "max stashed blocks: {} ({max_stashed_bytes} bytes), limit: {} bytes ({pct:.2}%)",
                    state.max_stashed, limit as u64
                );
            }
            None => info!(
                "max stashed blocks: {} ({max_stashed_bytes} bytes), limit: <unknown>",
                state.max_stashed
            ),
        }

        self.touched_src_ranges = touched;
        Ok(ComputeStats {
            version,
            transfers: self.transfers.len(),
            blocks_written: total,
            next_stash_id: next_slot,
            max_stashed_blocks: state.max_stashed,
            max_stashed_bytes,
            new_blocks: self
                .transfers
                .iter()
                .filter(|xf| xf.style == Style::New)
                .map(|xf| xf.tgt_ranges.size())
                .sum(),
            zero_transfers: self.count_style(Style::Zero),
            move_transfers: self.count_style(Style::Move),
            bsdiff_transfers: self.count_style(Style::Bsdiff),
            imgdiff_transfers: self.count_style(Style::Imgdiff),
            touched_src_sha1,
            ..Default::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
