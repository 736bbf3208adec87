use bytes::Bytes;
use murmur_crypto::EmailIdentity;
use proptest::prelude::*;

use crate::budget::{max_fragment_size, max_hops};
use crate::fragment::{create_fragments, reassemble, split_content};
use crate::packet::{UnencryptedFragment, MAX_DATAGRAM_SIZE};
use crate::types::{extract_destination, is_external_address, Email};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn budget_shrinks_with_hops(hops in 0..max_hops()) {
        let here = max_fragment_size(hops).unwrap();
        let next = max_fragment_size(hops + 1).unwrap();
        prop_assert!(next < here);
        prop_assert!(here <= MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn split_covers_input(data in proptest::collection::vec(any::<u8>(), 0..4096), size in 1usize..600) {
        let pieces = split_content(&data, size);
        let expected = if data.is_empty() { 1 } else { data.len().div_ceil(size) };
        prop_assert_eq!(pieces.len(), expected);
        prop_assert!(pieces.iter().all(|p| p.len() <= size));
        prop_assert_eq!(pieces.concat(), data);
    }

    #[test]
    fn fragments_reassemble(
        content in proptest::collection::vec(any::<u8>(), 0..20_000),
        extra in 1usize..2000,
    ) {
        let email = Email::anonymous(vec!["r".into()], Bytes::from(content.clone()));
        let max = UnencryptedFragment::HEADER_SIZE + extra;
        let fragments = create_fragments(&email, None, "r", max).unwrap();
        prop_assert!(fragments.iter().all(|f| f.encoded_len() <= max));
        let back = reassemble(&fragments).unwrap();
        prop_assert_eq!(back.content().as_ref(), content.as_slice());
    }

    #[test]
    fn signed_fragments_verify(content in proptest::collection::vec(any::<u8>(), 0..5000)) {
        let alice = EmailIdentity::generate();
        let email = Email::new(
            Some(alice.destination().to_base64()),
            vec!["r".into()],
            Bytes::from(content),
        );
        let fragments = create_fragments(&email, Some(&alice), "r", 700).unwrap();
        let back = reassemble(&fragments).unwrap();
        prop_assert!(back.verify("r", &alice.destination()).is_ok());
    }

    #[test]
    fn address_helpers_never_panic(text in ".{0,80}") {
        let extracted = extract_destination(&text);
        let _ = is_external_address(extracted);
        prop_assert!(text.contains(extracted));
    }
}
