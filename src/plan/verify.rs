// Stage 8: replay the sequence against a map of written target blocks.

use log::debug;

use super::BlockImageDiff;
use crate::error::{Error, Result, SequenceViolation};
use crate::transfer::Transfer;

fn violation(xf: &Transfer, block: u64, violation: SequenceViolation) -> Error {
    Error::Sequence {
        transfer: xf.to_string(),
        block,
        violation,
    }
}

impl BlockImageDiff<'_> {
    /// Every device read happens before the block is overwritten, every
    /// target block is written at most once, and the whole target care map
    /// is written.
    pub(super) fn assert_sequence_good(&self) -> Result<()> {
        let total = self.tgt.total_blocks();
        let len = total.max(self.tgt.care_map().end()) as usize;
        let mut touched = vec![false; len];

        for xf in self.ordered_transfers() {
            let reads = if self.options.version >= 2 {
                xf.unstashed_src_ranges()
            } else {
                xf.src_ranges.clone()
            };
            // Source blocks past the end of the target are never written.
            for (s, e) in reads.iter() {
                let (s, e) = (s.min(total), e.min(total));
                if let Some(i) = touched[s as usize..e as usize].iter().position(|&t| t) {
                    return Err(violation(xf, s + i as u64, SequenceViolation::ReadAfterWrite));
                }
            }

            for (s, e) in xf.tgt_ranges.iter() {
                if e as usize > touched.len() {
                    touched.resize(e as usize, false);
                }
                let span = &mut touched[s as usize..e as usize];
                if let Some(i) = span.iter().position(|&t| t) {
                    return Err(violation(xf, s + i as u64, SequenceViolation::DoubleWrite));
                }
                span.fill(true);
            }
        }

        for (s, e) in self.tgt.care_map().iter() {
            if let Some(i) = touched[s as usize..e as usize].iter().position(|&t| !t) {
                return Err(Error::Sequence {
                    transfer: "<care map>".to_string(),
                    block: s + i as u64,
                    violation: SequenceViolation::Unwritten,
                });
            }
        }

        debug!("transfer sequence verified");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
