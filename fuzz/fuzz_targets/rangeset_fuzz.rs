#![no_main]
use blockdelta::RangeSet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);

    if let Ok(set) = RangeSet::parse(&text) {
        let again = RangeSet::parse(&set.to_string()).expect("display form must parse");
        assert_eq!(again, set);
        let raw = RangeSet::parse_raw(&set.to_string_raw()).expect("raw form must parse");
        assert_eq!(raw, set);
        assert!(set.as_slice().windows(2).all(|w| w[0] < w[1]));
    }

    if let Ok(set) = RangeSet::parse_raw(&text) {
        let half = set.first(set.size() / 2);
        let mapped = set.map_within(&half).expect("prefix is a subset");
        assert_eq!(mapped.size(), half.size());
        assert!(set.subtract(&half).union(&half) == set);
    }
});
