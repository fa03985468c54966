use proptest::prelude::*;
use unlock_vba::{compute_checksum, is_consistent, restamp, restamp_in_place, ChecksumError};

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_restamp_writes_payload_sum(buf in proptest::collection::vec(any::<u8>(), 8..=4096)) {
        let out = restamp(&buf).expect("buffer is large enough");

        let expected = buf[8..]
            .iter()
            .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));
        prop_assert_eq!(&out[4..8], &expected.to_le_bytes());
        prop_assert_eq!(&out[..4], &buf[..4]);
        prop_assert_eq!(&out[8..], &buf[8..]);
        prop_assert!(is_consistent(&out));
        prop_assert_eq!(compute_checksum(&out).unwrap(), expected);
    }

    #[test]
    fn prop_short_buffers_are_left_untouched(buf in proptest::collection::vec(any::<u8>(), 0..8)) {
        let mut copy = buf.clone();
        prop_assert_eq!(
            restamp_in_place(&mut copy),
            Err(ChecksumError::TooSmall { len: buf.len() })
        );
        prop_assert_eq!(copy, buf);
    }
}
