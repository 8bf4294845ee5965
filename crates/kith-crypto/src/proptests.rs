#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use proptest::prelude::*;

    use crate::envelope::{open, seal, sign, verify, EnvelopeError};
    use crate::identity::Identity;

    fn identity_from(seed: [u8; 32]) -> Identity {
        let mut kex = seed;
        kex[0] ^= 0x5A;
        Identity::from_bytes(&seed, &kex)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn sealed_data_opens_unchanged(
            a in any::<[u8; 32]>(),
            b in any::<[u8; 32]>(),
            data in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            prop_assume!(a != b);
            let alice = identity_from(a);
            let bob = identity_from(b);

            let env = seal(&alice, bob.public_key(), data.clone()).unwrap();
            let opened = open(&bob, &env).unwrap();

            prop_assert_eq!(opened.message.data.as_ref(), data.as_slice());
            prop_assert_eq!(opened.message.from, *alice.public_key());
        }

        #[test]
        fn any_single_byte_mutation_of_data_breaks_verify(
            data in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let alice = identity_from([1; 32]);
            let bob = identity_from([2; 32]);
            let msg = sign(&alice, bob.public_key(), data.clone());
            prop_assert!(verify(&bob, &msg).is_ok());

            let mut tampered = data;
            let i = index.index(tampered.len());
            tampered[i] ^= flip;
            let mut bad = msg.clone();
            bad.data = Bytes::from(tampered);
            prop_assert_eq!(verify(&bob, &bad).unwrap_err(), EnvelopeError::InvalidSignature);
        }

        #[test]
        fn any_single_byte_mutation_of_signature_breaks_verify(
            index in 0usize..64,
            flip in 1u8..=255,
        ) {
            let alice = identity_from([3; 32]);
            let bob = identity_from([4; 32]);
            let mut msg = sign(&alice, bob.public_key(), Bytes::from_static(b"payload"));
            msg.signed_hash[index] ^= flip;
            prop_assert_eq!(verify(&bob, &msg).unwrap_err(), EnvelopeError::InvalidSignature);
        }

        #[test]
        fn corrupted_envelopes_never_open(
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
            in_key in any::<bool>(),
        ) {
            let alice = identity_from([5; 32]);
            let bob = identity_from([6; 32]);
            let mut env = seal(&alice, bob.public_key(), Bytes::from_static(b"sealed")).unwrap();

            let target = if in_key { &mut env.encrypted_session_key } else { &mut env.encrypted_message };
            let i = index.index(target.len());
            target[i] ^= flip;

            prop_assert_eq!(open(&bob, &env).unwrap_err(), EnvelopeError::DecryptionFailed);
        }
    }
}
