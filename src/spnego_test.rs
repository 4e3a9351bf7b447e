#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use proptest::prelude::*;

    const NTLM_INIT: [u8; 42] = hex!(
        "6028 0606 2b0601050502"
        "a01e 301c"
        "a00e 300c 060a 2b0601040182370202 0a"
        "a20a 0408 4e544c4d53535000"
    );

    #[test]
    fn decodes_wrapped_init_token() {
        let token = NegotiationToken::decode(&NTLM_INIT).unwrap();
        let NegotiationToken::Init(init) = &token else {
            panic!("expected NegTokenInit, got {token:?}");
        };
        assert_eq!(init.mech_types, vec![MechanismIdentifier::NTLM]);
        assert_eq!(init.mech_token.as_deref(), Some(&b"NTLMSSP\0"[..]));
        assert_eq!(token.encode().unwrap(), NTLM_INIT);
    }

    #[test]
    fn decodes_accept_completed_response() {
        let token = NegotiationToken::decode(&hex!("a107 3005 a003 0a01 00")).unwrap();
        assert_eq!(
            token,
            NegotiationToken::Response(NegTokenResp {
                neg_state: Some(NegState::AcceptCompleted),
                ..Default::default()
            })
        );
    }

    #[test]
    fn decodes_windows_neg_token_init2_hints() {
        let token = NegotiationToken::decode(&hex!(
            "a03e 303c"
            "a00e 300c 060a 2b06010401823702020a"
            "a32a 3028 a026 1b24"
            "6e6f745f646566696e65645f696e5f5246433431373840706c656173655f69676e6f7265"
        ))
        .unwrap();
        let NegotiationToken::Init(init) = token else {
            panic!("expected NegTokenInit, got {token:?}");
        };
        assert_eq!(init.mech_types, vec![MechanismIdentifier::NTLM]);
        let hints = init.neg_hints.unwrap();
        assert_eq!(hints.hint_name.as_deref(), Some("not_defined_in_RFC4178@please_ignore"));
        assert_eq!(hints.hint_address, None);
        assert_eq!(init.mech_list_mic, None);
    }

    #[test]
    fn field_three_octets_are_a_plain_mech_list_mic() {
        let token = NegotiationToken::decode(&hex!(
            "a01a 3018"
            "a00e 300c 060a 2b06010401823702020a"
            "a306 0404 01020304"
        ))
        .unwrap();
        let NegotiationToken::Init(init) = token else {
            panic!("expected NegTokenInit, got {token:?}");
        };
        assert_eq!(init.neg_hints, None);
        assert_eq!(init.mech_list_mic.as_deref(), Some(&[1, 2, 3, 4][..]));
    }

    #[test]
    fn hints_move_the_mic_to_field_four() {
        let init = NegTokenInit {
            mech_types: vec![MechanismIdentifier::KERBEROS, MechanismIdentifier::NTLM],
            mech_token: None,
            neg_hints: Some(NegHints {
                hint_name: Some("not_defined_in_RFC4178@please_ignore".into()),
                hint_address: None,
            }),
            mech_list_mic: Some(vec![1, 2, 3]),
        };
        let encoded = init.encode().unwrap();
        assert_eq!(NegotiationToken::decode(&encoded).unwrap(), NegotiationToken::Init(init));
    }

    #[test]
    fn rejects_truncated_and_foreign_tokens() {
        for len in 0..NTLM_INIT.len() {
            assert!(
                matches!(NegotiationToken::decode(&NTLM_INIT[..len]), Err(Error::MalformedToken(_))),
                "prefix of length {len} decoded"
            );
        }
        // Kerberos InitialContextToken instead of SPNEGO.
        let krb = hex!("600b 06092a864886f712010202");
        assert!(NegotiationToken::decode(&krb).is_err());
        assert!(NegotiationToken::decode(&hex!("a203 3001 00")).is_err());
    }

    #[test]
    fn rejects_empty_mech_list_and_bad_state() {
        assert!(NegotiationToken::decode(&hex!("a006 3004 a002 3000")).is_err());
        assert!(NegotiationToken::decode(&hex!("a107 3005 a003 0a01 07")).is_err());
    }

    fn mech() -> impl Strategy<Value = MechanismIdentifier> {
        prop_oneof![
            Just(MechanismIdentifier::KERBEROS),
            Just(MechanismIdentifier::MS_KERBEROS),
            Just(MechanismIdentifier::NTLM),
            Just(MechanismIdentifier::NEGOEX),
            proptest::collection::vec(0u32..100_000, 1..6)
                .prop_map(|tail| {
                    let mut arcs = vec![1, 3];
                    arcs.extend(tail);
                    MechanismIdentifier::from_arcs(&arcs).unwrap()
                }),
        ]
    }

    fn bytes() -> impl Strategy<Value = Option<Vec<u8>>> {
        proptest::option::of(proptest::collection::vec(any::<u8>(), 0..300))
    }

    fn neg_state() -> impl Strategy<Value = NegState> {
        prop_oneof![
            Just(NegState::AcceptCompleted),
            Just(NegState::AcceptIncomplete),
            Just(NegState::Reject),
            Just(NegState::RequestMic),
        ]
    }

    fn token() -> impl Strategy<Value = NegotiationToken> {
        let hints = proptest::option::of(
            (proptest::option::of("[a-z@._]{0,40}"), bytes())
                .prop_map(|(hint_name, hint_address)| NegHints { hint_name, hint_address }),
        );
        let init = (proptest::collection::vec(mech(), 1..5), bytes(), hints, bytes()).prop_map(
            |(mech_types, mech_token, neg_hints, mech_list_mic)| {
                NegotiationToken::Init(NegTokenInit { mech_types, mech_token, neg_hints, mech_list_mic })
            },
        );
        let resp = (proptest::option::of(neg_state()), proptest::option::of(mech()), bytes(), bytes()).prop_map(
            |(neg_state, supported_mech, response_token, mech_list_mic)| {
                NegotiationToken::Response(NegTokenResp { neg_state, supported_mech, response_token, mech_list_mic })
            },
        );
        prop_oneof![init, resp]
    }

    proptest! {
        #[test]
        fn negotiation_tokens_round_trip(token in token()) {
            let encoded = token.encode().unwrap();
            prop_assert_eq!(NegotiationToken::decode(&encoded).unwrap(), token);
        }
    }
}
