use kiln_proto::{decode_framed_message, decode_message};
use proptest::prelude::*;

const MAX_FUZZ_INPUT_LEN: usize = 16 * 1024;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn decode_message_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..MAX_FUZZ_INPUT_LEN)) {
        let _ = decode_message(&bytes);
        let _ = decode_framed_message(&bytes);
    }
}
