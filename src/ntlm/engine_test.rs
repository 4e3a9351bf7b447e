#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryUserStore;
    use crate::ntlm::crypto::nt_hash;
    use hex_literal::hex;

    const SERVER_CHALLENGE: [u8; 8] = hex!("0123456789abcdef");
    const CLIENT_CHALLENGE: [u8; 8] = [0xaa; 8];
    const RANDOM_SESSION_KEY: [u8; 16] = [0x55; 16];

    fn fixed() -> FixedInputs {
        FixedInputs {
            client_challenge: Some(CLIENT_CHALLENGE),
            server_challenge: Some(SERVER_CHALLENGE),
            timestamp: Some(0),
            exported_session_key: Some(RANDOM_SESSION_KEY),
        }
    }

    fn client(password: &str) -> NtlmClient {
        let credential = NtlmCredential::with_password("User", "Domain", password);
        NtlmClient::new(credential, NtlmOptions::default(), false)
            .unwrap()
            .with_fixed_inputs(fixed())
    }

    fn server() -> NtlmServer {
        let users = InMemoryUserStore::new().with_password("user", "domain", "Password");
        NtlmServer::new(Arc::new(users), NtlmOptions::default(), false)
            .unwrap()
            .with_fixed_inputs(fixed())
    }

    /// Runs the exchange and returns the server result for the final message.
    fn exchange(client: &mut NtlmClient, server: &mut NtlmServer) -> Result<Vec<u8>> {
        let (negotiate, status) = client.step(None)?;
        assert_eq!(status, ContextStatus::Continue);
        let (challenge, _) = server.step(negotiate.as_deref())?;
        let (authenticate, status) = client.step(challenge.as_deref())?;
        assert_eq!(status, ContextStatus::Complete);
        let authenticate = authenticate.unwrap();
        let (out, status) = server.step(Some(&authenticate))?;
        assert_eq!((out, status), (None, ContextStatus::Complete));
        Ok(authenticate)
    }

    #[test]
    fn full_exchange_establishes_matching_keys() {
        let (mut client, mut server) = (client("Password"), server());
        let authenticate = exchange(&mut client, &mut server).unwrap();

        assert_eq!(client.state(), ClientState::Established);
        assert_eq!(server.state(), ServerState::Established);
        assert_eq!(server.peer(), Some(("User", "Domain")));
        assert_eq!(client.flags(), server.flags());

        let message = AuthenticateMessage::decode(&authenticate).unwrap();
        assert!(message.mic.is_some());
        assert_eq!(message.lm_challenge_response, vec![0u8; 24]);

        let mut client_keys = client.into_session_keys().unwrap();
        let mut server_keys = server.into_session_keys().unwrap();
        let (sealed, _) = client_keys.wrap(b"ping", true).unwrap();
        assert_eq!(server_keys.unwrap(&sealed).unwrap().0, b"ping");
        let (sealed, _) = server_keys.wrap(b"pong", true).unwrap();
        assert_eq!(client_keys.unwrap(&sealed).unwrap().0, b"pong");
    }

    #[test]
    fn responses_match_reference_values_without_timestamp() {
        let mut client = client("Password");
        client.step(None).unwrap();

        let challenge = ChallengeMessage {
            flags: NegotiateFlags::NEGOTIATE_UNICODE
                | NegotiateFlags::NEGOTIATE_NTLM
                | NegotiateFlags::NEGOTIATE_EXTENDED_SESSIONSECURITY
                | NegotiateFlags::NEGOTIATE_SIGN
                | NegotiateFlags::NEGOTIATE_SEAL
                | NegotiateFlags::NEGOTIATE_KEY_EXCH
                | NegotiateFlags::NEGOTIATE_128
                | NegotiateFlags::NEGOTIATE_TARGET_INFO
                | NegotiateFlags::TARGET_TYPE_SERVER,
            target_name: String::new(),
            server_challenge: SERVER_CHALLENGE,
            target_info: TargetInfo(vec![
                AvPair::NbDomainName("Domain".into()),
                AvPair::NbComputerName("Server".into()),
            ]),
            version: None,
        };
        let (authenticate, _) = client.step(Some(&challenge.encode().unwrap())).unwrap();
        let message = AuthenticateMessage::decode(&authenticate.unwrap()).unwrap();

        // [MS-NLMP] 4.2.4.2.1
        assert_eq!(
            message.lm_challenge_response,
            hex!("86c35097ac9cec102554764a57cccc19aaaaaaaaaaaaaaaa")
        );
        assert_eq!(message.mic, None);

        let blob = &message.nt_challenge_response[16..];
        assert_eq!(&blob[..8], &hex!("0101000000000000"));
        assert_eq!(&blob[8..16], &[0u8; 8]);
        assert_eq!(&blob[16..24], &CLIENT_CHALLENGE);
        let info = TargetInfo::decode(&blob[BLOB_HEADER_LEN..]).unwrap();
        assert_eq!(info.channel_bindings(), Some([0u8; 16]));

        let response_key = hex!("0c868a403bfd7a93a3001ef22ef02e3f");
        let mut proof = [0u8; 16];
        proof.copy_from_slice(&message.nt_challenge_response[..16]);
        assert_eq!(proof, nt_proof(&response_key, &SERVER_CHALLENGE, blob));
        let base_key = session_base_key(&response_key, &proof);
        assert_eq!(rc4(&base_key, &message.encrypted_random_session_key), RANDOM_SESSION_KEY);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let (mut client, mut server) = (client("password"), server());
        let err = exchange(&mut client, &mut server).unwrap_err();
        assert!(matches!(err, Error::AuthenticationRejected(_)), "{err}");
        assert!(server.session_keys().is_none());
    }

    #[test]
    fn unknown_user_is_rejected() {
        let credential = NtlmCredential::with_password("Mallory", "Domain", "Password");
        let mut client = NtlmClient::new(credential, NtlmOptions::default(), false).unwrap();
        let err = exchange(&mut client, &mut server()).unwrap_err();
        assert!(matches!(err, Error::AuthenticationRejected(_)), "{err}");
    }

    #[test]
    fn channel_bindings_must_match() {
        let bindings = |data: &[u8]| Some(data.to_vec());

        let mut initiator = client("Password").with_channel_bindings(bindings(b"tls-server-end-point:aa"));
        let mut acceptor = server().with_channel_bindings(bindings(b"tls-server-end-point:bb"));
        assert!(matches!(exchange(&mut initiator, &mut acceptor), Err(Error::BadBindings)));

        let mut initiator = client("Password").with_channel_bindings(bindings(b"tls-server-end-point:aa"));
        let mut acceptor = server().with_channel_bindings(bindings(b"tls-server-end-point:aa"));
        exchange(&mut initiator, &mut acceptor).unwrap();

        // A client without bindings sends the zero placeholder.
        let mut initiator = client("Password");
        let mut acceptor = server().with_channel_bindings(bindings(b"tls-server-end-point:aa"));
        assert!(matches!(exchange(&mut initiator, &mut acceptor), Err(Error::BadBindings)));
    }

    #[test]
    fn tampered_mic_is_detected() {
        let (mut client, mut server) = (client("Password"), server());
        let (negotiate, _) = client.step(None).unwrap();
        let (challenge, _) = server.step(negotiate.as_deref()).unwrap();
        let (authenticate, _) = client.step(challenge.as_deref()).unwrap();
        let mut authenticate = authenticate.unwrap();
        authenticate[MIC_OFFSET] ^= 0xff;
        assert!(matches!(server.step(Some(&authenticate)), Err(Error::IntegrityCheckFailed(_))));
    }

    #[test]
    fn ntlmv1_negotiate_is_refused() {
        let negotiate = NegotiateMessage {
            flags: NegotiateFlags::NEGOTIATE_UNICODE | NegotiateFlags::NEGOTIATE_NTLM | NegotiateFlags::NEGOTIATE_SIGN,
            domain_name: String::new(),
            workstation: String::new(),
            version: None,
        };
        let err = server().step(Some(&negotiate.encode().unwrap())).unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfiguration(_)));
    }

    #[test]
    fn challenge_with_unoffered_flags_is_malformed() {
        let mut client = client("Password");
        client.step(None).unwrap();
        let challenge = ChallengeMessage {
            flags: NegotiateFlags::NEGOTIATE_UNICODE
                | NegotiateFlags::NEGOTIATE_EXTENDED_SESSIONSECURITY
                | NegotiateFlags::NEGOTIATE_LM_KEY,
            target_name: String::new(),
            server_challenge: SERVER_CHALLENGE,
            target_info: TargetInfo::default(),
            version: None,
        };
        let err = client.step(Some(&challenge.encode().unwrap())).unwrap_err();
        assert!(matches!(err, Error::MalformedToken(_)));
    }

    #[test]
    fn authenticate_without_key_exchange_uses_base_key() {
        let (mut client, mut server) = (client("Password"), server());
        let (negotiate, _) = client.step(None).unwrap();
        let negotiate = negotiate.unwrap();
        let (challenge, _) = server.step(Some(&negotiate)).unwrap();
        let challenge = challenge.unwrap();
        let (authenticate, _) = client.step(Some(&challenge)).unwrap();

        let mut message = AuthenticateMessage::decode(&authenticate.unwrap()).unwrap();
        message.flags.remove(NegotiateFlags::NEGOTIATE_KEY_EXCH);
        message.encrypted_random_session_key.clear();
        message.mic = Some([0u8; MIC_LEN]);

        let response_key = ntowfv2(&nt_hash("Password"), "User", "Domain");
        let mut proof = [0u8; NT_PROOF_LEN];
        proof.copy_from_slice(&message.nt_challenge_response[..NT_PROOF_LEN]);
        let base_key = session_base_key(&response_key, &proof);
        let mut bytes = message.encode().unwrap();
        let mic = message_mic(&base_key, &negotiate, &challenge, &bytes);
        bytes[MIC_OFFSET..MIC_OFFSET + MIC_LEN].copy_from_slice(&mic);

        server.step(Some(&bytes)).unwrap();
        assert_eq!(server.flags(), Some(message.flags));
        let mut server_keys = server.into_session_keys().unwrap();
        let mut client_keys = SessionKeys::new(&base_key, message.flags, true);
        let (sealed, _) = client_keys.wrap(b"ping", true).unwrap();
        assert_eq!(server_keys.unwrap(&sealed).unwrap().0, b"ping");
    }

    #[test]
    fn confidentiality_needs_a_key_length() {
        let options = NtlmOptions { allow_128_bit: false, allow_56_bit: false, ..NtlmOptions::default() };
        let credential = NtlmCredential::with_password("User", "Domain", "Password");
        assert!(matches!(
            NtlmClient::new(credential, options, true),
            Err(Error::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn messages_out_of_order_are_malformed() {
        let mut client = client("Password");
        assert!(client.step(Some(b"NTLMSSP\0")).is_err());
        let mut server = server();
        assert!(matches!(server.step(None), Err(Error::MalformedToken(_))));
    }
}
