// Block range sets.
//
// A `RangeSet` is a normalized set of half-open block intervals stored as a
// flat boundary list `[s0, e0, s1, e1, ...]`: strictly increasing, with
// overlapping and adjacent intervals merged. All set operations are a single
// sweep over the merged boundary events of both operands.
//
// Two text encodings are supported:
//   - human: "10-19 30"  (inclusive bounds, single blocks bare)
//   - raw:   "4,10,20,30,31"  (boundary count followed by the boundaries)

use std::fmt;
use std::iter::Peekable;
use std::str::FromStr;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Malformed range set input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeSetError {
    #[error("invalid range token '{0}'")]
    InvalidToken(String),
    #[error("range start {start} is greater than end {end}")]
    Reversed { start: u64, end: u64 },
    #[error("boundary list has odd length {0}")]
    OddLength(usize),
    #[error("raw range set declares {declared} boundaries but carries {actual}")]
    RawCount { declared: usize, actual: usize },
    #[error("ranges \"{sub}\" are not contained in \"{container}\"")]
    NotSubset { container: String, sub: String },
}

// ---------------------------------------------------------------------------
// RangeSet
// ---------------------------------------------------------------------------

/// A normalized set of non-overlapping half-open block intervals.
///
/// Equality and hashing only consider the blocks in the set; the
/// `monotonic` flag records whether the set was parsed from text whose
/// tokens were already in strictly increasing order.
#[derive(Clone)]
pub struct RangeSet {
    data: Vec<u64>,
    monotonic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetOp {
    Union,
    Intersect,
    Subtract,
}

impl RangeSet {
    /// The empty set. An empty set counts as monotonic.
    pub const fn new() -> Self {
        Self {
            data: Vec::new(),
            monotonic: true,
        }
    }

    /// The single interval `[start, end)`. Empty when `start >= end`.
    pub fn from_range(start: u64, end: u64) -> Self {
        if start >= end {
            return Self::new();
        }
        Self {
            data: vec![start, end],
            monotonic: false,
        }
    }

    /// Build from `[s0, e0, s1, e1, ...]` boundaries in any order.
    ///
    /// Overlapping and adjacent pairs are merged; empty pairs are dropped.
    pub fn from_pairs(boundaries: &[u64]) -> Result<Self, RangeSetError> {
        if boundaries.len() % 2 != 0 {
            return Err(RangeSetError::OddLength(boundaries.len()));
        }
        let mut pairs = Vec::with_capacity(boundaries.len() / 2);
        for pair in boundaries.chunks_exact(2) {
            let (start, end) = (pair[0], pair[1]);
            if start > end {
                return Err(RangeSetError::Reversed { start, end });
            }
            pairs.push((start, end));
        }
        Ok(Self {
            data: normalize(pairs),
            monotonic: false,
        })
    }

    /// Parse the human form ("10-19 30 35-40", inclusive bounds).
    ///
    /// The result is monotonic when every token starts after the end of
    /// the previous one.
    pub fn parse(text: &str) -> Result<Self, RangeSetError> {
        let mut pairs = Vec::new();
        let mut monotonic = true;
        let mut last: Option<u64> = None;

        for token in text.split_whitespace() {
            let (start, end) = match token.split_once('-') {
                Some((s, e)) => (parse_block(s, token)?, parse_block(e, token)?),
                None => {
                    let b = parse_block(token, token)?;
                    (b, b)
                }
            };
            if start > end {
                return Err(RangeSetError::Reversed { start, end });
            }
            if last.is_some_and(|l| start <= l) {
                monotonic = false;
            }
            last = Some(end);
            let end = end
                .checked_add(1)
                .ok_or_else(|| RangeSetError::InvalidToken(token.to_string()))?;
            pairs.push((start, end));
        }

        Ok(Self {
            data: normalize(pairs),
            monotonic,
        })
    }

    /// Parse the raw form ("<count>,<b0>,...,<bN>"). `"0,"` is the empty set.
    pub fn parse_raw(text: &str) -> Result<Self, RangeSetError> {
        let text = text.trim();
        let mut parts = text.split(',');
        let head = parts.next().unwrap_or_default();
        let declared: usize = head
            .trim()
            .parse()
            .map_err(|_| RangeSetError::InvalidToken(head.to_string()))?;
        let values = parts
            .filter(|p| !p.is_empty())
            .map(|p| parse_block(p.trim(), text))
            .collect::<Result<Vec<_>, _>>()?;
        if values.len() != declared {
            return Err(RangeSetError::RawCount {
                declared,
                actual: values.len(),
            });
        }
        Self::from_pairs(&values)
    }

    /// Collapse sweep output, cancelling a boundary that immediately repeats
    /// (`[10, 20, 20, 30]` becomes `[10, 30]`).
    fn from_sweep(points: Vec<u64>) -> Self {
        let mut data: Vec<u64> = Vec::with_capacity(points.len());
        for p in points {
            if data.last() == Some(&p) {
                data.pop();
            } else {
                data.push(p);
            }
        }
        Self {
            data,
            monotonic: false,
        }
    }

    /// The boundary list.
    pub fn as_slice(&self) -> &[u64] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the set was parsed from strictly increasing text.
    pub fn is_monotonic(&self) -> bool {
        self.monotonic
    }

    /// Iterate the `[start, end)` intervals in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.data.chunks_exact(2).map(|p| (p[0], p[1]))
    }

    /// Total number of blocks in the set.
    pub fn size(&self) -> u64 {
        self.iter().map(|(s, e)| e - s).sum()
    }

    /// One past the highest block, or 0 for the empty set.
    pub fn end(&self) -> u64 {
        self.data.last().copied().unwrap_or(0)
    }

    pub fn union(&self, other: &RangeSet) -> RangeSet {
        self.combine(other, SetOp::Union)
    }

    pub fn intersect(&self, other: &RangeSet) -> RangeSet {
        self.combine(other, SetOp::Intersect)
    }

    pub fn subtract(&self, other: &RangeSet) -> RangeSet {
        self.combine(other, SetOp::Subtract)
    }

    /// Whether the two sets share at least one block.
    pub fn overlaps(&self, other: &RangeSet) -> bool {
        let mut z = 0i32;
        for (_, delta) in merge_events(&self.data, 1, &other.data, 1) {
            z += delta;
            if z == 2 {
                return true;
            }
        }
        false
    }

    /// Whether every block of `other` is also in `self`.
    pub fn contains_set(&self, other: &RangeSet) -> bool {
        self.intersect(other) == *other
    }

    /// Sweep both operands' boundaries, emitting a boundary whenever the
    /// activation counter crosses the operation's threshold. For subtraction
    /// the right operand's deltas are inverted so its presence suppresses
    /// output.
    fn combine(&self, other: &RangeSet, op: SetOp) -> RangeSet {
        let (other_start, open) = match op {
            SetOp::Union => (1, 0),
            SetOp::Intersect => (1, 1),
            SetOp::Subtract => (-1, 0),
        };
        let close = open + 1;

        let mut out = Vec::with_capacity(self.data.len() + other.data.len());
        let mut z = 0i32;
        for (point, delta) in merge_events(&self.data, 1, &other.data, other_start) {
            if (z == open && delta == 1) || (z == close && delta == -1) {
                out.push(point);
            }
            z += delta;
        }
        RangeSet::from_sweep(out)
    }

    /// Re-express `sub` (which must be contained in `self`) in 0-based
    /// coordinates, as if the intervals of `self` were laid out back to back
    /// starting at zero.
    ///
    /// `"10-19 30-39".map_within("17-19 30-32")` is `"7-12"`.
    pub fn map_within(&self, sub: &RangeSet) -> Result<RangeSet, RangeSetError> {
        if !self.contains_set(sub) {
            return Err(RangeSetError::NotSubset {
                container: self.to_string(),
                sub: sub.to_string(),
            });
        }

        // Container starts sort before sub starts, sub ends before
        // container ends, at any shared point.
        const OUTER: i32 = 5;
        let mut out = Vec::with_capacity(sub.data.len());
        let mut offset = 0u64;
        let mut active_start = 0u64;
        for (point, event) in merge_events(&self.data, -OUTER, &sub.data, -1) {
            match event {
                e if e == -OUTER => active_start = point,
                OUTER => offset += point - active_start,
                _ => out.push(offset + (point - active_start)),
            }
        }
        Ok(RangeSet::from_sweep(out))
    }

    /// Grow every interval by `n` blocks on both sides (clamped at 0),
    /// merging intervals that meet.
    pub fn extend(&self, n: u64) -> RangeSet {
        if n == 0 || self.is_empty() {
            return self.clone();
        }
        let pairs = self
            .iter()
            .map(|(s, e)| (s.saturating_sub(n), e.saturating_add(n)))
            .collect();
        RangeSet {
            data: normalize(pairs),
            monotonic: false,
        }
    }

    /// The prefix of the set holding at most `n` blocks.
    pub fn first(&self, n: u64) -> RangeSet {
        if n == 0 {
            return RangeSet::from_sweep(Vec::new());
        }
        if self.size() <= n {
            return RangeSet {
                data: self.data.clone(),
                monotonic: false,
            };
        }

        let mut out = Vec::new();
        let mut count = 0u64;
        for (s, e) in self.iter() {
            let len = e - s;
            if count + len >= n {
                out.extend([s, s + (n - count)]);
                break;
            }
            out.extend([s, e]);
            count += len;
        }
        RangeSet {
            data: out,
            monotonic: false,
        }
    }

    /// The raw wire form, `"<count>,<b0>,...,<bN>"`.
    pub fn to_string_raw(&self) -> String {
        if self.data.is_empty() {
            return "0,".to_string();
        }
        let mut out = self.data.len().to_string();
        for b in &self.data {
            out.push(',');
            out.push_str(&b.to_string());
        }
        out
    }
}

fn parse_block(s: &str, token: &str) -> Result<u64, RangeSetError> {
    s.parse()
        .map_err(|_| RangeSetError::InvalidToken(token.to_string()))
}

/// Sort `(start, end)` pairs and merge overlapping or adjacent ones into a
/// boundary list.
fn normalize(mut pairs: Vec<(u64, u64)>) -> Vec<u64> {
    pairs.retain(|(s, e)| s < e);
    pairs.sort_unstable();

    let mut data: Vec<u64> = Vec::with_capacity(pairs.len() * 2);
    for (start, end) in pairs {
        match data.last_mut() {
            Some(last) if start <= *last => *last = (*last).max(end),
            _ => data.extend([start, end]),
        }
    }
    data
}

// ---------------------------------------------------------------------------
// Boundary event sweep
// ---------------------------------------------------------------------------

/// Boundaries tagged with `start_delta` for interval starts and its
/// negation for interval ends.
fn events(data: &[u64], start_delta: i32) -> impl Iterator<Item = (u64, i32)> + '_ {
    data.iter().enumerate().map(move |(i, &p)| {
        let delta = if i % 2 == 0 { start_delta } else { -start_delta };
        (p, delta)
    })
}

/// Merge two event streams ordered by `(point, delta)`; on exact ties the
/// left stream goes first.
fn merge_events<'a>(
    left: &'a [u64],
    left_start: i32,
    right: &'a [u64],
    right_start: i32,
) -> impl Iterator<Item = (u64, i32)> + 'a {
    MergeEvents {
        left: events(left, left_start).peekable(),
        right: events(right, right_start).peekable(),
    }
}

struct MergeEvents<L: Iterator, R: Iterator> {
    left: Peekable<L>,
    right: Peekable<R>,
}

impl<L, R> Iterator for MergeEvents<L, R>
where
    L: Iterator<Item = (u64, i32)>,
    R: Iterator<Item = (u64, i32)>,
{
    type Item = (u64, i32);

    fn next(&mut self) -> Option<Self::Item> {
        let take_right = match (self.left.peek(), self.right.peek()) {
            (Some(l), Some(r)) => r < l,
            (Some(_), None) => false,
            (None, _) => true,
        };
        if take_right {
            self.right.next()
        } else {
            self.left.next()
        }
    }
}

// ---------------------------------------------------------------------------
// Trait impls
// ---------------------------------------------------------------------------

impl Default for RangeSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for RangeSet {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for RangeSet {}

impl std::hash::Hash for RangeSet {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.data.hash(state);
    }
}

/// Human form; the empty set renders as an empty string.
impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (s, e)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if e == s + 1 {
                write!(f, "{s}")?;
            } else {
                write!(f, "{s}-{}", e - 1)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RangeSet(\"{self}\")")
    }
}

/// Collect `(start, end)` intervals in any order; empty and reversed pairs
/// are dropped.
impl FromIterator<(u64, u64)> for RangeSet {
    fn from_iter<T: IntoIterator<Item = (u64, u64)>>(iter: T) -> Self {
        Self {
            data: normalize(iter.into_iter().collect()),
            monotonic: false,
        }
    }
}

impl FromStr for RangeSet {
    type Err = RangeSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
