// Stages 3-4: dependency graph and initial ordering.
//
// An edge B -> A means B reads source blocks that A overwrites, so B should
// run first. The weight is the number of shared blocks; when the graph has
// cycles the linearization tries to keep heavy edges pointing forward so
// fewer blocks need stashing later.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use log::{debug, info};

use super::BlockImageDiff;
use crate::image::ZERO_REGION;
use crate::transfer::Transfer;

/// `(writer, reader)` pairs where the reader's source intersects the
/// writer's target. Self pairs are skipped.
fn overlapping_pairs(transfers: &[Transfer]) -> BTreeSet<(usize, usize)> {
    // (start, end, id, writes)
    let mut intervals: Vec<(u64, u64, usize, bool)> = Vec::new();
    for xf in transfers {
        intervals.extend(xf.tgt_ranges.iter().map(|(s, e)| (s, e, xf.id, true)));
        intervals.extend(xf.src_ranges.iter().map(|(s, e)| (s, e, xf.id, false)));
    }
    intervals.sort_unstable_by_key(|&(start, ..)| start);

    let mut pairs = BTreeSet::new();
    let mut writers: Vec<(u64, usize)> = Vec::new();
    let mut readers: Vec<(u64, usize)> = Vec::new();
    for (start, end, id, writes) in intervals {
        writers.retain(|&(e, _)| e > start);
        readers.retain(|&(e, _)| e > start);
        if writes {
            pairs.extend(
                readers
                    .iter()
                    .filter(|&&(_, reader)| reader != id)
                    .map(|&(_, reader)| (id, reader)),
            );
            writers.push((end, id));
        } else {
            pairs.extend(
                writers
                    .iter()
                    .filter(|&&(_, writer)| writer != id)
                    .map(|&(_, writer)| (writer, id)),
            );
            readers.push((end, id));
        }
    }
    pairs
}

// ---------------------------------------------------------------------------
// Linearization state
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
struct Candidate {
    score: i64,
    id: usize,
    generation: u64,
}

impl Ord for Candidate {
    // Highest score first, then lowest id.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Working copy of the graph while vertices are peeled off. Heap entries
/// whose generation no longer matches the node's are stale.
struct Linearizer {
    outgoing: Vec<BTreeMap<usize, u64>>,
    incoming: Vec<BTreeMap<usize, u64>>,
    score: Vec<i64>,
    generation: Vec<u64>,
    placed: Vec<bool>,
    heap: BinaryHeap<Candidate>,
    sinks: BTreeSet<usize>,
    sources: BTreeSet<usize>,
}

impl Linearizer {
    fn new(transfers: &[Transfer]) -> Self {
        let outgoing: Vec<_> = transfers.iter().map(|xf| xf.goes_before.clone()).collect();
        let incoming: Vec<_> = transfers.iter().map(|xf| xf.goes_after.clone()).collect();
        let score: Vec<i64> = outgoing
            .iter()
            .zip(&incoming)
            .map(|(out, inc)| weight_sum(out) - weight_sum(inc))
            .collect();
        let heap = score
            .iter()
            .enumerate()
            .map(|(id, &score)| Candidate {
                score,
                id,
                generation: 0,
            })
            .collect();
        let sinks = (0..transfers.len()).filter(|&i| outgoing[i].is_empty()).collect();
        let sources = (0..transfers.len()).filter(|&i| incoming[i].is_empty()).collect();

        Self {
            generation: vec![0; transfers.len()],
            placed: vec![false; transfers.len()],
            outgoing,
            incoming,
            score,
            heap,
            sinks,
            sources,
        }
    }

    fn adjust(&mut self, id: usize, delta: i64) {
        self.score[id] += delta;
        self.generation[id] += 1;
        self.heap.push(Candidate {
            score: self.score[id],
            id,
            generation: self.generation[id],
        });
    }

    /// Remove `id` from the graph. Losing an outgoing edge lowers a
    /// node's score; losing an incoming edge raises it.
    fn place(&mut self, id: usize) {
        self.placed[id] = true;

        for (succ, _) in std::mem::take(&mut self.outgoing[id]) {
            if let Some(weight) = self.incoming[succ].remove(&id) {
                self.adjust(succ, weight as i64);
                if self.incoming[succ].is_empty() {
                    self.sources.insert(succ);
                }
            }
        }
        for (pred, _) in std::mem::take(&mut self.incoming[id]) {
            if let Some(weight) = self.outgoing[pred].remove(&id) {
                self.adjust(pred, -(weight as i64));
                if self.outgoing[pred].is_empty() {
                    self.sinks.insert(pred);
                }
            }
        }
    }

    fn pop_sink(&mut self) -> Option<usize> {
        while let Some(id) = self.sinks.pop_first() {
            if !self.placed[id] {
                return Some(id);
            }
        }
        None
    }

    fn pop_source(&mut self) -> Option<usize> {
        while let Some(id) = self.sources.pop_first() {
            if !self.placed[id] {
                return Some(id);
            }
        }
        None
    }

    fn pop_best(&mut self) -> Option<usize> {
        while let Some(c) = self.heap.pop() {
            if !self.placed[c.id] && self.generation[c.id] == c.generation {
                return Some(c.id);
            }
        }
        None
    }
}

fn weight_sum(edges: &BTreeMap<usize, u64>) -> i64 {
    edges.values().map(|&w| w as i64).sum()
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

impl BlockImageDiff<'_> {
    /// Stage 3: add an edge B -> A for every transfer B reading blocks
    /// that A writes.
    pub(super) fn generate_digraph(&mut self) {
        let pairs = overlapping_pairs(&self.transfers);
        for &(writer, reader) in &pairs {
            let overlap = self.transfers[writer]
                .tgt_ranges
                .intersect(&self.transfers[reader].src_ranges);
            // Zero blocks can be regenerated for free.
            let weight = if self.transfers[reader].src_name.as_deref() == Some(ZERO_REGION) {
                0
            } else {
                overlap.size()
            };
            self.transfers[reader].goes_before.insert(writer, weight);
            self.transfers[writer].goes_after.insert(reader, weight);
        }
        info!("generated digraph: {} edges", pairs.len());
    }

    /// Stage 4: order transfers so that as much edge weight as possible
    /// points forward. Sinks are peeled into the tail, sources into the
    /// head; when neither exists the highest-scoring node joins the head.
    pub(super) fn find_vertex_sequence(&mut self) {
        let total = self.transfers.len();
        let mut lin = Linearizer::new(&self.transfers);
        let mut head = Vec::with_capacity(total);
        let mut tail = Vec::new();
        let mut remaining = total;
        let mut forced = 0usize;

        while remaining > 0 {
            while let Some(id) = lin.pop_sink() {
                tail.push(id);
                lin.place(id);
                remaining -= 1;
            }
            while let Some(id) = lin.pop_source() {
                head.push(id);
                lin.place(id);
                remaining -= 1;
            }
            if remaining == 0 {
                break;
            }
            let Some(id) = lin.pop_best() else {
                break;
            };
            head.push(id);
            lin.place(id);
            remaining -= 1;
            forced += 1;
        }

        head.extend(tail.into_iter().rev());
        self.set_sequence(head);
        debug!("{forced} transfers placed by score");
        info!("found vertex sequence for {total} transfers");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::DiffOptions;
    use crate::plan::tests::{mapped, rs};
    use crate::transfer::Style;

    fn xf(id: usize, tgt: &str, src: &str) -> Transfer {
        let style = if src.is_empty() { Style::New } else { Style::Diff };
        Transfer::new(id, format!("t{id}"), Some(format!("s{id}")), rs(tgt), rs(src), style)
    }

    fn order_of(diff: &BlockImageDiff<'_>, id: usize) -> usize {
        diff.transfers()[id].order
    }

    #[test]
    fn pairs_from_interval_sweep() {
        let transfers = vec![xf(0, "0-3", "4-5"), xf(1, "4-7", "2-3 6"), xf(2, "8-9", "0 9")];
        let pairs = overlapping_pairs(&transfers);
        let expected: BTreeSet<_> = [(0, 1), (0, 2), (1, 0)].into_iter().collect();
        assert_eq!(pairs, expected);
    }

    #[test]
    fn swap_creates_two_way_edges() {
        let img = mapped(&[1, 2, 3, 4], &[("a", "0-1"), ("b", "2-3")]);
        let mut diff = BlockImageDiff::new(&img, Some(&img), DiffOptions::default()).unwrap();
        diff.transfers = vec![xf(0, "0-1", "2-3"), xf(1, "2-3", "0-1")];
        diff.generate_digraph();

        let (a, b) = (&diff.transfers[0], &diff.transfers[1]);
        assert_eq!(a.goes_before.get(&1), Some(&2));
        assert_eq!(a.goes_after.get(&1), Some(&2));
        assert_eq!(b.goes_before.get(&0), Some(&2));
        assert_eq!(b.goes_after.get(&0), Some(&2));
    }

    #[test]
    fn zero_source_edges_weigh_nothing() {
        let img = mapped(&[1, 2, 3, 4], &[("a", "0-1"), ("b", "2-3")]);
        let mut diff = BlockImageDiff::new(&img, Some(&img), DiffOptions::default()).unwrap();
        let zero = Transfer::new(1, ZERO_REGION, Some(ZERO_REGION.into()), rs("2-3"), rs("0-1"), Style::Zero);
        diff.transfers = vec![xf(0, "0-1", ""), zero];
        diff.generate_digraph();
        assert_eq!(diff.transfers[1].goes_before.get(&0), Some(&0));
    }

    #[test]
    fn acyclic_graph_is_topologically_ordered() {
        let img = mapped(&[1, 2, 3, 4], &[("a", "0-3")]);
        let mut diff = BlockImageDiff::new(&img, Some(&img), DiffOptions::default()).unwrap();
        // 2 reads what 1 writes, 1 reads what 0 writes: 2, 1, 0.
        diff.transfers = vec![xf(0, "0", ""), xf(1, "1", "0"), xf(2, "2-3", "1")];
        diff.generate_digraph();
        diff.find_vertex_sequence();

        assert!(order_of(&diff, 2) < order_of(&diff, 1));
        assert!(order_of(&diff, 1) < order_of(&diff, 0));
        let seq: Vec<_> = diff.ordered_transfers().map(|xf| xf.id).collect();
        assert_eq!(seq, [2, 1, 0]);
    }

    #[test]
    fn cycle_keeps_heavier_edge_forward() {
        let img = mapped(&[1; 8], &[("a", "0-7")]);
        let mut diff = BlockImageDiff::new(&img, Some(&img), DiffOptions::default()).unwrap();
        // 0 reads 3 blocks of 1's target; 1 reads 1 block of 0's target.
        diff.transfers = vec![xf(0, "0-3", "4-6"), xf(1, "4-7", "0")];
        diff.generate_digraph();
        diff.find_vertex_sequence();

        assert!(order_of(&diff, 0) < order_of(&diff, 1));
        let mut orders: Vec<_> = diff.transfers().iter().map(|xf| xf.order).collect();
        orders.sort_unstable();
        assert_eq!(orders, [0, 1]);
    }

    #[test]
    fn heap_prefers_high_score_then_low_id() {
        let mut heap = BinaryHeap::new();
        heap.push(Candidate { score: 5, id: 3, generation: 0 });
        heap.push(Candidate { score: 5, id: 1, generation: 0 });
        heap.push(Candidate { score: 9, id: 2, generation: 0 });
        assert_eq!(heap.pop().map(|c| c.id), Some(2));
        assert_eq!(heap.pop().map(|c| c.id), Some(1));
    }
}
