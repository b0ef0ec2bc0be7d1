use blockdelta::RangeSet;
use blockdelta::image::{Alignment, BLOCK_SIZE, DataImage};
use blockdelta::plan::{BlockImageDiff, DiffOptions};
use proptest::prelude::*;

fn ranges() -> impl Strategy<Value = RangeSet> {
    proptest::collection::vec((0u64..200, 1u64..20), 0..8)
        .prop_map(|pairs| pairs.into_iter().map(|(s, len)| (s, s + len)).collect())
}

fn blocks_of(set: &RangeSet) -> Vec<u64> {
    set.iter().flat_map(|(s, e)| s..e).collect()
}

proptest! {
    #[test]
    fn prop_boundaries_are_strictly_increasing(set in ranges()) {
        let raw = set.as_slice();
        prop_assert_eq!(raw.len() % 2, 0);
        prop_assert!(raw.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn prop_text_forms_roundtrip(set in ranges()) {
        prop_assert_eq!(RangeSet::parse(&set.to_string()).unwrap(), set.clone());
        prop_assert_eq!(RangeSet::parse_raw(&set.to_string_raw()).unwrap(), set);
    }

    #[test]
    fn prop_union_and_intersect_sizes(a in ranges(), b in ranges()) {
        let union = a.union(&b);
        let inter = a.intersect(&b);
        prop_assert_eq!(union.size() + inter.size(), a.size() + b.size());
        prop_assert_eq!(a.overlaps(&b), !inter.is_empty());
    }

    #[test]
    fn prop_subtract_partitions(a in ranges(), b in ranges()) {
        let rest = a.subtract(&b);
        prop_assert!(!rest.overlaps(&b));
        prop_assert_eq!(rest.union(&a.intersect(&b)), a.clone());
        prop_assert!(a.contains_set(&rest));
    }

    #[test]
    fn prop_first_takes_a_prefix(set in ranges(), n in 0u64..100) {
        let head = set.first(n);
        prop_assert_eq!(head.size(), n.min(set.size()));
        let expected: Vec<u64> = blocks_of(&set).into_iter().take(n as usize).collect();
        prop_assert_eq!(blocks_of(&head), expected);
    }

    #[test]
    fn prop_extend_covers_original(set in ranges(), n in 0u64..5) {
        let grown = set.extend(n);
        prop_assert!(grown.contains_set(&set));
        prop_assert!(grown.size() <= set.size() + 2 * n * set.iter().count() as u64);
    }

    #[test]
    fn prop_map_within_preserves_positions(set in ranges(), picks in proptest::collection::vec(any::<bool>(), 0..400)) {
        let all = blocks_of(&set);
        let sub: RangeSet = all
            .iter()
            .zip(picks.iter().chain(std::iter::repeat(&false)))
            .filter(|&(_, &keep)| keep)
            .map(|(&b, _)| (b, b + 1))
            .collect();
        let mapped = set.map_within(&sub).unwrap();
        prop_assert_eq!(mapped.size(), sub.size());
        let positions: Vec<u64> = all
            .iter()
            .enumerate()
            .filter(|&(_, b)| sub.contains_set(&RangeSet::from_range(*b, b + 1)))
            .map(|(i, _)| i as u64)
            .collect();
        prop_assert_eq!(blocks_of(&mapped), positions);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_full_update_writes_every_block(fill in proptest::collection::vec(prop_oneof![Just(0u8), any::<u8>()], 1..24)) {
        let data: Vec<u8> = fill
            .iter()
            .flat_map(|&b| std::iter::repeat_n(b, BLOCK_SIZE))
            .collect();
        let tgt = DataImage::new(data, Alignment::Exact).unwrap();
        let mut diff = BlockImageDiff::new(&tgt, None, DiffOptions::default()).unwrap();
        let (mut list, mut new_data, mut patches) = (Vec::<u8>::new(), Vec::<u8>::new(), Vec::<u8>::new());
        let stats = diff.compute(&mut list, &mut new_data, &mut patches).unwrap();

        let nonzero = fill.iter().filter(|&&b| b != 0).count();
        prop_assert_eq!(stats.blocks_written, fill.len() as u64);
        prop_assert_eq!(new_data.len(), nonzero * BLOCK_SIZE);
        prop_assert!(patches.is_empty());
    }
}
