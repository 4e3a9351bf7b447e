#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntlm::target_info::AvPair;
    use proptest::prelude::*;

    fn flags() -> impl Strategy<Value = NegotiateFlags> {
        any::<u32>().prop_map(NegotiateFlags::from_bits_retain)
    }

    fn version() -> impl Strategy<Value = Version> {
        (any::<u8>(), any::<u8>(), any::<u16>(), any::<u8>())
            .prop_map(|(major, minor, build, revision)| Version { major, minor, build, revision })
    }

    /// A version block exactly when the flags ask for one.
    fn version_for(flags: NegotiateFlags) -> impl Strategy<Value = Option<Version>> {
        let wanted = flags.contains(NegotiateFlags::NEGOTIATE_VERSION);
        version().prop_map(move |version| wanted.then_some(version))
    }

    fn name() -> impl Strategy<Value = String> {
        "[A-Za-z0-9 .-]{0,20}"
    }

    fn target_info() -> impl Strategy<Value = TargetInfo> {
        let pair = prop_oneof![
            name().prop_map(AvPair::NbDomainName),
            name().prop_map(AvPair::NbComputerName),
            any::<u64>().prop_map(AvPair::Timestamp),
            any::<u32>().prop_map(AvPair::Flags),
        ];
        proptest::collection::vec(pair, 0..5).prop_map(TargetInfo)
    }

    fn negotiate() -> impl Strategy<Value = NegotiateMessage> {
        flags().prop_flat_map(|flags| {
            (name(), name(), version_for(flags)).prop_map(move |(domain_name, workstation, version)| {
                NegotiateMessage { flags, domain_name, workstation, version }
            })
        })
    }

    fn challenge() -> impl Strategy<Value = ChallengeMessage> {
        flags().prop_flat_map(|flags| {
            (name(), any::<[u8; 8]>(), target_info(), version_for(flags)).prop_map(
                move |(target_name, server_challenge, target_info, version)| ChallengeMessage {
                    flags,
                    target_name,
                    server_challenge,
                    target_info,
                    version,
                },
            )
        })
    }

    fn authenticate() -> impl Strategy<Value = AuthenticateMessage> {
        let bytes = || proptest::collection::vec(any::<u8>(), 0..64);
        flags().prop_flat_map(move |flags| {
            (
                (bytes(), bytes(), bytes()),
                (name(), name(), name()),
                version_for(flags),
                proptest::option::of(any::<[u8; MIC_LEN]>()),
            )
                .prop_map(move |((lm, nt, key), (domain_name, user_name, workstation), version, mic)| {
                    AuthenticateMessage {
                        flags,
                        lm_challenge_response: lm,
                        nt_challenge_response: nt,
                        domain_name,
                        user_name,
                        workstation,
                        encrypted_random_session_key: key,
                        version,
                        mic,
                    }
                })
        })
    }

    proptest! {
        #[test]
        fn negotiate_messages_round_trip(message in negotiate()) {
            let encoded = message.encode().unwrap();
            prop_assert_eq!(NegotiateMessage::decode(&encoded).unwrap(), message);
        }

        #[test]
        fn challenge_messages_round_trip(message in challenge()) {
            let encoded = message.encode().unwrap();
            prop_assert_eq!(ChallengeMessage::decode(&encoded).unwrap(), message);
        }

        #[test]
        fn authenticate_messages_round_trip(message in authenticate()) {
            let encoded = message.encode().unwrap();
            prop_assert_eq!(AuthenticateMessage::decode(&encoded).unwrap(), message);
        }
    }

    fn bare_authenticate(flags: NegotiateFlags) -> AuthenticateMessage {
        AuthenticateMessage {
            flags,
            lm_challenge_response: vec![0; 24],
            nt_challenge_response: vec![1; 48],
            domain_name: "Domain".into(),
            user_name: "User".into(),
            workstation: String::new(),
            encrypted_random_session_key: Vec::new(),
            version: None,
            mic: Some([7; MIC_LEN]),
        }
    }

    #[test]
    fn mic_without_version_keeps_version_absent() {
        let message = bare_authenticate(NegotiateFlags::NEGOTIATE_UNICODE);
        let encoded = message.encode().unwrap();
        assert_eq!(encoded[MIC_OFFSET - VERSION_LEN..MIC_OFFSET], [0u8; VERSION_LEN]);
        assert_eq!(AuthenticateMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn version_block_must_follow_the_flag() {
        let message = bare_authenticate(NegotiateFlags::NEGOTIATE_UNICODE | NegotiateFlags::NEGOTIATE_VERSION);
        assert!(matches!(message.encode(), Err(Error::MalformedToken(_))));

        let negotiate = NegotiateMessage {
            flags: NegotiateFlags::NEGOTIATE_UNICODE,
            domain_name: String::new(),
            workstation: String::new(),
            version: Some(Version::default()),
        };
        assert!(matches!(negotiate.encode(), Err(Error::MalformedToken(_))));
    }

    #[test]
    fn empty_names_stay_empty() {
        let challenge = ChallengeMessage {
            flags: NegotiateFlags::NEGOTIATE_UNICODE | NegotiateFlags::REQUEST_TARGET,
            target_name: String::new(),
            server_challenge: [9; 8],
            target_info: TargetInfo::default(),
            version: None,
        };
        let decoded = ChallengeMessage::decode(&challenge.encode().unwrap()).unwrap();
        assert_eq!(decoded.target_name, "");
        assert_eq!(decoded, challenge);
    }

    #[test]
    fn truncated_messages_are_malformed() {
        let encoded = bare_authenticate(NegotiateFlags::NEGOTIATE_UNICODE).encode().unwrap();
        for len in [0, 8, 12, 40, MIC_OFFSET, encoded.len() - 1] {
            assert!(
                matches!(NtlmMessage::decode(&encoded[..len]), Err(Error::MalformedToken(_))),
                "prefix of length {len} decoded"
            );
        }
    }
}
