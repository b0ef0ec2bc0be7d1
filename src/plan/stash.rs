// Stages 5-7: backward edges, stash-aware ordering and the stash budget.
//
// After linearization some edges point backwards: a transfer reads blocks
// that an earlier transfer already overwrote. Version 1 lists cannot stash,
// so the reader loses those source blocks. Later versions save the blocks
// before they are overwritten and hand them to the reader from stash.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use log::{debug, info};

use super::BlockImageDiff;
use crate::error::{Error, Result};
use crate::transfer::{Stash, StashKey, Style};

impl BlockImageDiff<'_> {
    /// Largest number of blocks that may sit in stash at once, when a
    /// cache budget is configured.
    pub(super) fn max_stash_blocks(&self) -> Option<u64> {
        let cache = self.options.cache_size?;
        let block_size = self.tgt.block_size() as f64;
        Some((cache as f64 * self.options.stash_threshold / block_size) as u64)
    }

    /// Stage 5, version 1: drop the blocks a backward edge would read after
    /// they were overwritten.
    pub(super) fn remove_backward_edges(&mut self) {
        let mut in_order = 0usize;
        let mut out_of_order = 0usize;
        let mut lost_blocks = 0u64;

        for pos in 0..self.sequence.len() {
            let id = self.sequence[pos];
            let before = self.transfers[id].src_ranges.size();
            let targets: Vec<usize> = self.transfers[id].goes_before.keys().copied().collect();

            for u in targets {
                if self.transfers[id].order < self.transfers[u].order {
                    in_order += 1;
                    continue;
                }
                out_of_order += 1;
                let trimmed = self.transfers[id]
                    .src_ranges
                    .subtract(&self.transfers[u].tgt_ranges);
                let xf = &mut self.transfers[id];
                xf.src_ranges = trimmed;
                xf.intact = false;
            }

            let xf = &mut self.transfers[id];
            if xf.style == Style::Diff && xf.src_ranges.is_empty() {
                xf.style = Style::New;
            }
            lost_blocks += before - xf.src_ranges.size();
        }

        info!(
            "{out_of_order}/{} dependencies ({:.2}%) were violated; {lost_blocks} source blocks removed",
            in_order + out_of_order,
            percent(out_of_order, in_order + out_of_order)
        );
    }

    /// Stage 5, version 2+: turn each backward edge into a stash. The
    /// writer stashes the shared blocks first and the edge is reversed.
    pub(super) fn reverse_backward_edges(&mut self) -> Result<()> {
        let mut in_order = 0usize;
        let mut out_of_order = 0usize;
        let mut stashed_blocks = 0u64;
        let mut next_stash_id = 0usize;

        for pos in 0..self.sequence.len() {
            let id = self.sequence[pos];
            let targets: Vec<usize> = self.transfers[id].goes_before.keys().copied().collect();

            for u in targets {
                if self.transfers[id].order < self.transfers[u].order {
                    in_order += 1;
                    continue;
                }
                out_of_order += 1;

                let overlap = self.transfers[id]
                    .src_ranges
                    .intersect(&self.transfers[u].tgt_ranges);
                let stash_id = next_stash_id;
                next_stash_id += 1;
                let key = if self.options.version == 2 {
                    StashKey::Id(stash_id)
                } else {
                    StashKey::Hash(self.hash_src(&overlap)?)
                };
                stashed_blocks += overlap.size();
                debug!("stash {key} ({overlap}): {u} -> {id}");

                let stash = Stash {
                    id: stash_id,
                    key,
                    ranges: overlap,
                };
                self.transfers[u].stash_before.push(stash.clone());
                self.transfers[id].use_stash.push(stash);
                self.stash_pairs.insert(stash_id, (u, id));

                let weight = self.transfers[id].goes_before.remove(&u).unwrap_or(0);
                self.transfers[u].goes_after.remove(&id);
                self.transfers[u].goes_before.insert(id, weight);
                self.transfers[id].goes_after.insert(u, weight);
            }
        }

        info!(
            "{out_of_order}/{} dependencies ({:.2}%) were violated; {stashed_blocks} source blocks stashed",
            in_order + out_of_order,
            percent(out_of_order, in_order + out_of_order)
        );
        Ok(())
    }

    /// Stage 6: topological re-ordering that prefers transfers freeing
    /// stash over those filling it, breaking ties by previous order.
    pub(super) fn improve_vertex_sequence(&mut self) -> Result<()> {
        let total = self.transfers.len();
        let mut incoming: Vec<BTreeSet<usize>> = self
            .transfers
            .iter()
            .map(|xf| xf.goes_after.keys().copied().collect())
            .collect();

        let key = |xf: &crate::transfer::Transfer| Reverse((xf.net_stash_change(), xf.order, xf.id));
        let mut ready: BinaryHeap<_> = self
            .transfers
            .iter()
            .filter(|xf| xf.goes_after.is_empty())
            .map(key)
            .collect();

        let mut sequence = Vec::with_capacity(total);
        while let Some(Reverse((_, _, id))) = ready.pop() {
            sequence.push(id);
            for &succ in self.transfers[id].goes_before.keys() {
                if incoming[succ].remove(&id) && incoming[succ].is_empty() {
                    ready.push(key(&self.transfers[succ]));
                }
            }
        }

        if sequence.len() != total {
            return Err(Error::Cycle {
                placed: sequence.len(),
                total,
            });
        }
        self.set_sequence(sequence);
        info!("improved vertex sequence");
        Ok(())
    }

    /// Stage 7: walk the sequence tracking live stash and convert
    /// transfers to `new` wherever the budget would be exceeded.
    pub(super) fn revise_stash_size(&mut self) {
        let Some(max_allowed) = self.max_stash_blocks() else {
            return;
        };

        // Identical content shares a slot in version 3+.
        let mut live: BTreeMap<StashKey, usize> = BTreeMap::new();
        let mut stashed = 0u64;
        let mut new_blocks = 0u64;

        for pos in 0..self.sequence.len() {
            let id = self.sequence[pos];
            let mut replaced = Vec::new();

            for stash in &self.transfers[id].stash_before {
                let after = if live.contains_key(&stash.key) {
                    stashed
                } else {
                    stashed + stash.ranges.size()
                };
                if after > max_allowed {
                    if let Some(&(_, consumer)) = self.stash_pairs.get(&stash.id) {
                        debug!(
                            "{:>10} explicit {}",
                            stash.ranges.size(),
                            self.transfers[consumer]
                        );
                        replaced.push(consumer);
                    }
                } else {
                    *live.entry(stash.key.clone()).or_insert(0) += 1;
                    stashed = after;
                }
            }

            // Diffs reading their own target blocks stash the whole source
            // on the device.
            let xf = &self.transfers[id];
            if self.options.version >= 3
                && xf.style == Style::Diff
                && xf.src_ranges.overlaps(&xf.tgt_ranges)
                && stashed + xf.src_ranges.size() > max_allowed
            {
                debug!("{:>10} implicit {xf}", xf.src_ranges.size());
                replaced.push(id);
            }

            for cmd in replaced {
                if self.transfers[cmd].style == Style::New {
                    continue;
                }
                let used = std::mem::take(&mut self.transfers[cmd].use_stash);
                for stash in &used {
                    if let Some((producer, _)) = self.stash_pairs.remove(&stash.id) {
                        self.transfers[producer]
                            .stash_before
                            .retain(|s| s.id != stash.id);
                    }
                }
                new_blocks += self.transfers[cmd].tgt_ranges.size();
                self.transfers[cmd].convert_to_new();
            }

            for stash in &self.transfers[id].use_stash {
                if let Some(count) = live.get_mut(&stash.key) {
                    *count -= 1;
                    if *count == 0 {
                        live.remove(&stash.key);
                        stashed -= stash.ranges.size();
                    }
                }
            }
        }

        if new_blocks > 0 {
            info!(
                "{new_blocks} blocks ({} bytes) packed as new due to insufficient cache size",
                new_blocks * self.tgt.block_size() as u64
            );
        }
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::DataImage;
    use crate::plan::DiffOptions;
    use crate::plan::tests::{mapped, rs};
    use crate::transfer::Transfer;

    /// Regions "a" and "b" trade places.
    fn swap() -> (DataImage, DataImage) {
        let src = mapped(&[1, 2, 3, 4], &[("a", "2-3"), ("b", "0-1")]);
        let tgt = mapped(&[3, 4, 1, 2], &[("a", "0-1"), ("b", "2-3")]);
        (src, tgt)
    }

    fn opts(version: u32, cache_size: Option<u64>) -> DiffOptions {
        DiffOptions {
            version,
            cache_size,
            ..Default::default()
        }
    }

    fn linearize(diff: &mut BlockImageDiff<'_>) {
        diff.abbreviate_source_names();
        diff.find_transfers();
        diff.generate_digraph();
        diff.find_vertex_sequence();
    }

    #[test]
    fn version_one_trims_sources() {
        let (src, tgt) = swap();
        let mut diff = BlockImageDiff::new(&tgt, Some(&src), opts(1, None)).unwrap();
        linearize(&mut diff);
        diff.remove_backward_edges();

        let first = &diff.transfers[diff.sequence[0]];
        let second = &diff.transfers[diff.sequence[1]];
        assert_eq!(first.style, Style::Diff);
        // The second transfer's whole source was overwritten by the first.
        assert_eq!(second.style, Style::New);
        assert!(second.src_ranges.is_empty());
        assert!(!second.intact);
        assert!(diff.transfers.iter().all(|xf| xf.use_stash.is_empty()));
    }

    #[test]
    fn version_two_stashes_with_sequential_ids() {
        let (src, tgt) = swap();
        let mut diff = BlockImageDiff::new(&tgt, Some(&src), opts(2, None)).unwrap();
        linearize(&mut diff);
        diff.reverse_backward_edges().unwrap();

        let producer = &diff.transfers[diff.sequence[0]];
        let consumer = &diff.transfers[diff.sequence[1]];
        assert_eq!(producer.stash_before.len(), 1);
        assert_eq!(producer.stash_before[0].key, StashKey::Id(0));
        assert_eq!(consumer.use_stash, producer.stash_before);
        assert_eq!(consumer.use_stash[0].ranges, producer.tgt_ranges.intersect(&consumer.src_ranges));

        // The edge now points forward.
        assert!(producer.goes_before.contains_key(&consumer.id));
        assert!(!consumer.goes_before.contains_key(&producer.id));
        assert_eq!(diff.stash_pairs.get(&0), Some(&(producer.id, consumer.id)));
    }

    #[test]
    fn version_three_keys_stash_by_content() {
        let (src, tgt) = swap();
        let mut diff = BlockImageDiff::new(&tgt, Some(&src), opts(3, None)).unwrap();
        linearize(&mut diff);
        diff.reverse_backward_edges().unwrap();

        let consumer = &diff.transfers[diff.sequence[1]];
        let StashKey::Hash(hash) = &consumer.use_stash[0].key else {
            panic!("expected a content key");
        };
        assert_eq!(hash.len(), 40);
        assert_eq!(*hash, diff.hash_src(&consumer.use_stash[0].ranges).unwrap());
    }

    #[test]
    fn improved_order_respects_edges() {
        let (src, tgt) = swap();
        let mut diff = BlockImageDiff::new(&tgt, Some(&src), opts(4, None)).unwrap();
        linearize(&mut diff);
        diff.reverse_backward_edges().unwrap();
        diff.improve_vertex_sequence().unwrap();

        for xf in diff.transfers() {
            for &after in xf.goes_before.keys() {
                assert!(xf.order < diff.transfers[after].order);
            }
            for stash in &xf.use_stash {
                let (producer, _) = diff.stash_pairs[&stash.id];
                assert!(diff.transfers[producer].order < xf.order);
            }
        }
    }

    #[test]
    fn cycle_is_reported() {
        let img = mapped(&[1, 2], &[("a", "0"), ("b", "1")]);
        let mut diff = BlockImageDiff::new(&img, Some(&img), DiffOptions::default()).unwrap();
        let mut a = Transfer::new(0, "a", None, rs("0"), rs("1"), Style::Diff);
        let mut b = Transfer::new(1, "b", None, rs("1"), rs("0"), Style::Diff);
        a.goes_before.insert(1, 1);
        b.goes_after.insert(0, 1);
        b.goes_before.insert(0, 1);
        a.goes_after.insert(1, 1);
        diff.transfers = vec![a, b];

        assert!(matches!(
            diff.improve_vertex_sequence(),
            Err(Error::Cycle { placed: 0, total: 2 })
        ));
    }

    #[test]
    fn budget_converts_consumer_to_new() {
        let (src, tgt) = swap();
        let mut diff = BlockImageDiff::new(&tgt, Some(&src), opts(4, Some(4096))).unwrap();
        assert_eq!(diff.max_stash_blocks(), Some(0));
        linearize(&mut diff);
        diff.reverse_backward_edges().unwrap();
        diff.improve_vertex_sequence().unwrap();
        diff.revise_stash_size();

        let producer = &diff.transfers[diff.sequence[0]];
        let consumer = &diff.transfers[diff.sequence[1]];
        assert_eq!(producer.style, Style::Diff);
        assert!(producer.stash_before.is_empty());
        assert_eq!(consumer.style, Style::New);
        assert!(consumer.use_stash.is_empty());
        assert!(diff.stash_pairs.is_empty());
    }

    #[test]
    fn generous_budget_keeps_stash() {
        let (src, tgt) = swap();
        let mut diff = BlockImageDiff::new(&tgt, Some(&src), opts(4, Some(1 << 20))).unwrap();
        linearize(&mut diff);
        diff.reverse_backward_edges().unwrap();
        diff.improve_vertex_sequence().unwrap();
        diff.revise_stash_size();

        assert!(diff.transfers.iter().all(|xf| xf.style == Style::Diff));
        assert_eq!(diff.stash_pairs.len(), 1);
    }

    #[test]
    fn implicit_stash_over_budget_becomes_new() {
        // Blocks shift by one: the diff reads its own target.
        let src = mapped(&[1, 2, 3, 9], &[("f", "0-2"), ("g", "3")]);
        let tgt = mapped(&[9, 1, 2, 3], &[("f", "1-3"), ("g", "0")]);
        let mut diff = BlockImageDiff::new(&tgt, Some(&src), opts(3, Some(2 * 4096))).unwrap();
        linearize(&mut diff);
        diff.reverse_backward_edges().unwrap();
        diff.improve_vertex_sequence().unwrap();
        diff.revise_stash_size();

        let f = diff.transfers.iter().find(|xf| xf.tgt_name == "f").unwrap();
        assert_eq!(f.style, Style::New);
    }
}
