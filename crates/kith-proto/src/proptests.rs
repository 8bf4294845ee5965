#[cfg(test)]
mod tests {
    use prost::Message;
    use proptest::prelude::*;

    use crate::v1::{EnvelopeV1, PacketV1, SignalV1, SignedMessageV1};

    proptest! {
        // Untrusted bytes from the relay or a peer must never panic the decoder.
        #[test]
        fn decoding_arbitrary_bytes_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = EnvelopeV1::decode(bytes.as_slice());
            let _ = SignedMessageV1::decode(bytes.as_slice());
            let _ = PacketV1::decode(bytes.as_slice());
            let _ = SignalV1::decode(bytes.as_slice());
        }

        #[test]
        fn decoded_envelopes_validate_without_panicking(
            version in any::<u32>(),
            key in proptest::collection::vec(any::<u8>(), 0..96),
            msg in proptest::collection::vec(any::<u8>(), 0..96),
        ) {
            let env = EnvelopeV1 { version, encrypted_session_key: key.clone(), encrypted_message: msg.clone() };
            let decoded = EnvelopeV1::decode(env.encode_to_vec().as_slice()).unwrap();
            let ok = decoded.validate().is_ok();
            prop_assert_eq!(ok, version == 1 && !key.is_empty() && !msg.is_empty());
        }
    }
}
