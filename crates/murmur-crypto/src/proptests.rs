use proptest::prelude::*;

use crate::identity::{verify_signature, EmailDestination, EmailIdentity};
use crate::sealed::{open, seal, SEAL_OVERHEAD};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sealed_overhead_is_constant(plaintext in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let bob = EmailIdentity::generate();
        let sealed = seal(bob.destination().kex_pub(), "prop", &plaintext).unwrap();
        prop_assert_eq!(sealed.encoded_len(), plaintext.len() + SEAL_OVERHEAD);
        prop_assert_eq!(open(&sealed, bob.kex_secret(), "prop").unwrap(), plaintext);
    }

    #[test]
    fn destination_text_parses_back(seed in any::<[u8; 32]>(), kex in any::<[u8; 32]>()) {
        let identity = EmailIdentity::from_bytes(&seed, &kex);
        let dest = identity.destination();
        prop_assert_eq!(dest.to_base64().parse::<EmailDestination>().unwrap(), dest);
    }

    #[test]
    fn signatures_bind_message(seed in any::<[u8; 32]>(), message in any::<Vec<u8>>(), flip in any::<usize>()) {
        let identity = EmailIdentity::from_bytes(&seed, &[1u8; 32]);
        let sig = identity.sign(&message);
        prop_assert!(verify_signature(&identity.destination(), &message, &sig).is_ok());

        if !message.is_empty() {
            let mut tampered = message.clone();
            let idx = flip % tampered.len();
            tampered[idx] ^= 0x80;
            prop_assert!(verify_signature(&identity.destination(), &tampered, &sig).is_err());
        }
    }

    #[test]
    fn arbitrary_text_never_panics(text in ".{0,120}") {
        let _ = text.parse::<EmailDestination>();
    }
}
