//! NTLM client and server state machines.
//!
//! Neither side does I/O. Each `step` consumes the peer's last message and
//! returns the next one; once established the [`SessionKeys`] can be taken
//! for message protection.

use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use super::crypto::{
    channel_bindings_hash, filetime, hmac_md5, lmv2_response, nt_proof, ntlmv2_blob, ntowfv2, rc4, session_base_key,
};
use super::messages::{
    AuthenticateMessage, ChallengeMessage, NegotiateFlags, NegotiateMessage, MIC_LEN, MIC_OFFSET,
};
use super::session::SessionKeys;
use super::target_info::{AvPair, TargetInfo, AV_FLAG_MIC_PRESENT};
use crate::config::{NtlmCredential, NtlmOptions, UserStore};
use crate::error::{Error, Result};
use crate::mech::ContextStatus;

const NT_PROOF_LEN: usize = 16;
/// Fixed part of the NTLMv2 blob before the AV pairs.
const BLOB_HEADER_LEN: usize = 28;
const LM_RESPONSE_LEN: usize = 24;

/// Bits a server sets on its own without them being offered.
const INFORMATIONAL_FLAGS: NegotiateFlags = NegotiateFlags::TARGET_TYPE_DOMAIN
    .union(NegotiateFlags::TARGET_TYPE_SERVER)
    .union(NegotiateFlags::NEGOTIATE_TARGET_INFO)
    .union(NegotiateFlags::NEGOTIATE_VERSION);

/// Values normally drawn from the clock or the RNG. Set them to make an
/// exchange reproducible.
#[derive(Debug, Clone, Default)]
pub struct FixedInputs {
    pub client_challenge: Option<[u8; 8]>,
    pub server_challenge: Option<[u8; 8]>,
    /// FILETIME used when the server supplies no `MsvAvTimestamp`, and by the
    /// server for its own.
    pub timestamp: Option<u64>,
    pub exported_session_key: Option<[u8; 16]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Start,
    NegotiateSent,
    ChallengeReceived,
    AuthenticateSent,
    Established,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Start,
    NegotiateReceived,
    ChallengeSent,
    AuthenticateReceived,
    Established,
}

fn random<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn check_key_strength(options: &NtlmOptions, require_confidentiality: bool) -> Result<()> {
    if require_confidentiality && !options.allow_128_bit && !options.allow_56_bit {
        return Err(Error::UnsupportedConfiguration(
            "confidentiality requires 128-bit or 56-bit NTLM keys".into(),
        ));
    }
    Ok(())
}

/// Everything this implementation is willing to negotiate.
fn supported_flags(options: &NtlmOptions) -> NegotiateFlags {
    let mut flags = NegotiateFlags::NEGOTIATE_UNICODE
        | NegotiateFlags::REQUEST_TARGET
        | NegotiateFlags::NEGOTIATE_NTLM
        | NegotiateFlags::NEGOTIATE_ALWAYS_SIGN
        | NegotiateFlags::NEGOTIATE_EXTENDED_SESSIONSECURITY
        | NegotiateFlags::NEGOTIATE_TARGET_INFO
        | NegotiateFlags::NEGOTIATE_SIGN
        | NegotiateFlags::NEGOTIATE_SEAL
        | NegotiateFlags::NEGOTIATE_KEY_EXCH;
    if options.allow_128_bit {
        flags |= NegotiateFlags::NEGOTIATE_128;
    }
    if options.allow_56_bit {
        flags |= NegotiateFlags::NEGOTIATE_56;
    }
    if options.version.is_some() {
        flags |= NegotiateFlags::NEGOTIATE_VERSION;
    }
    flags
}

fn check_subset(flags: NegotiateFlags, offered: NegotiateFlags, message: &str) -> Result<()> {
    let extra = flags.difference(offered).difference(INFORMATIONAL_FLAGS);
    if extra.is_empty() {
        Ok(())
    } else {
        Err(Error::malformed(format!("{message} message negotiated flags that were not offered: {extra:?}")))
    }
}

/// HMAC-MD5 over the three handshake messages, the Authenticate one with a
/// zeroed MIC field.
fn message_mic(exported_session_key: &[u8; 16], negotiate: &[u8], challenge: &[u8], authenticate: &[u8]) -> [u8; 16] {
    let mut input = Vec::with_capacity(negotiate.len() + challenge.len() + authenticate.len());
    input.extend_from_slice(negotiate);
    input.extend_from_slice(challenge);
    input.extend_from_slice(authenticate);
    hmac_md5(exported_session_key, &input)
}

/// Initiator side of NTLM.
pub struct NtlmClient {
    state: ClientState,
    credential: NtlmCredential,
    options: NtlmOptions,
    require_confidentiality: bool,
    channel_bindings: Option<Vec<u8>>,
    target_name: Option<String>,
    fixed: FixedInputs,
    offered: NegotiateFlags,
    negotiate: Vec<u8>,
    flags: Option<NegotiateFlags>,
    keys: Option<SessionKeys>,
}

impl NtlmClient {
    pub fn new(credential: NtlmCredential, options: NtlmOptions, require_confidentiality: bool) -> Result<Self> {
        check_key_strength(&options, require_confidentiality)?;
        Ok(Self {
            state: ClientState::Start,
            offered: supported_flags(&options),
            credential,
            options,
            require_confidentiality,
            channel_bindings: None,
            target_name: None,
            fixed: FixedInputs::default(),
            negotiate: Vec::new(),
            flags: None,
            keys: None,
        })
    }

    #[must_use]
    pub fn with_channel_bindings(self, application_data: Option<Vec<u8>>) -> Self {
        Self { channel_bindings: application_data, ..self }
    }

    /// SPN recorded in `MsvAvTargetName`.
    #[must_use]
    pub fn with_target_name(self, target_name: Option<String>) -> Self {
        Self { target_name, ..self }
    }

    #[must_use]
    pub fn with_fixed_inputs(self, fixed: FixedInputs) -> Self {
        Self { fixed, ..self }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Flags agreed with the server, known once the Challenge was processed.
    pub fn flags(&self) -> Option<NegotiateFlags> {
        self.flags
    }

    pub fn session_keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    pub fn into_session_keys(self) -> Option<SessionKeys> {
        self.keys
    }

    pub fn step(&mut self, input: Option<&[u8]>) -> Result<(Option<Vec<u8>>, ContextStatus)> {
        match (self.state, input) {
            (ClientState::Start, None) => Ok((Some(self.negotiate()?), ContextStatus::Continue)),
            (ClientState::NegotiateSent, Some(challenge)) => {
                Ok((Some(self.authenticate(challenge)?), ContextStatus::Complete))
            }
            (state, Some(_)) => Err(Error::malformed(format!("unexpected NTLM message in client state {state:?}"))),
            (state, None) => Err(Error::malformed(format!("NTLM client in state {state:?} needs a server message"))),
        }
    }

    fn negotiate(&mut self) -> Result<Vec<u8>> {
        let message = NegotiateMessage {
            flags: self.offered,
            domain_name: String::new(),
            workstation: String::new(),
            version: self.options.version,
        };
        self.negotiate = message.encode()?;
        self.state = ClientState::NegotiateSent;
        debug!(flags = ?self.offered, "NTLM negotiate sent");
        Ok(self.negotiate.clone())
    }

    fn authenticate(&mut self, challenge_bytes: &[u8]) -> Result<Vec<u8>> {
        let challenge = ChallengeMessage::decode(challenge_bytes)?;
        self.state = ClientState::ChallengeReceived;

        let flags = challenge.flags;
        check_subset(flags, self.offered, "challenge")?;
        if !flags.contains(NegotiateFlags::NEGOTIATE_EXTENDED_SESSIONSECURITY) {
            return Err(Error::UnsupportedConfiguration(
                "server did not agree to extended session security".into(),
            ));
        }
        if self.require_confidentiality && !flags.contains(NegotiateFlags::NEGOTIATE_SEAL) {
            return Err(Error::UnsupportedConfiguration("server did not agree to sealing".into()));
        }

        let server_timestamp = challenge.target_info.timestamp();
        let timestamp = server_timestamp
            .or(self.fixed.timestamp)
            .unwrap_or_else(|| filetime(Utc::now()));

        let mut target_info = challenge.target_info.clone();
        if server_timestamp.is_some() {
            target_info.set(AvPair::Flags(target_info.flags() | AV_FLAG_MIC_PRESENT));
        }
        let bindings = self
            .channel_bindings
            .as_deref()
            .map(channel_bindings_hash)
            .unwrap_or([0u8; 16]);
        target_info.set(AvPair::ChannelBindings(bindings));
        if let Some(spn) = &self.target_name {
            target_info.set(AvPair::TargetName(spn.clone()));
        }

        let client_challenge = self.fixed.client_challenge.unwrap_or_else(random);
        let credential = &self.credential;
        let response_key = ntowfv2(credential.nt_hash(), &credential.username, &credential.domain);
        let blob = ntlmv2_blob(timestamp, &client_challenge, &target_info.encode());
        let proof = nt_proof(&response_key, &challenge.server_challenge, &blob);
        let mut nt_response = proof.to_vec();
        nt_response.extend_from_slice(&blob);

        // With a server timestamp the LMv2 response is replaced by zeros.
        let lm_response = match server_timestamp {
            Some(_) => vec![0u8; LM_RESPONSE_LEN],
            None => lmv2_response(&response_key, &challenge.server_challenge, &client_challenge),
        };

        let base_key = session_base_key(&response_key, &proof);
        let (exported, encrypted_key) = if flags.contains(NegotiateFlags::NEGOTIATE_KEY_EXCH) {
            let exported = self.fixed.exported_session_key.unwrap_or_else(random);
            (exported, rc4(&base_key, &exported))
        } else {
            (base_key, Vec::new())
        };

        let message = AuthenticateMessage {
            flags,
            lm_challenge_response: lm_response,
            nt_challenge_response: nt_response,
            domain_name: credential.domain.clone(),
            user_name: credential.username.clone(),
            workstation: self.options.workstation.clone().unwrap_or_default(),
            encrypted_random_session_key: encrypted_key,
            version: flags
                .contains(NegotiateFlags::NEGOTIATE_VERSION)
                .then(|| self.options.version.unwrap_or_default()),
            mic: server_timestamp.map(|_| [0u8; MIC_LEN]),
        };
        let mut bytes = message.encode()?;
        if message.mic.is_some() {
            let mic = message_mic(&exported, &self.negotiate, challenge_bytes, &bytes);
            bytes[MIC_OFFSET..MIC_OFFSET + MIC_LEN].copy_from_slice(&mic);
        }
        self.state = ClientState::AuthenticateSent;

        debug!(
            user = %credential.username,
            domain = %credential.domain,
            flags = ?flags,
            mic = message.mic.is_some(),
            "NTLM authenticate sent"
        );
        self.keys = Some(SessionKeys::new(&exported, flags, true));
        self.flags = Some(flags);
        self.state = ClientState::Established;
        Ok(bytes)
    }
}

/// Acceptor side of NTLM, validating against a [`UserStore`].
pub struct NtlmServer {
    state: ServerState,
    users: Arc<dyn UserStore>,
    options: NtlmOptions,
    require_confidentiality: bool,
    channel_bindings: Option<Vec<u8>>,
    fixed: FixedInputs,
    negotiate: Vec<u8>,
    challenge: Vec<u8>,
    server_challenge: [u8; 8],
    timestamp: u64,
    flags: NegotiateFlags,
    keys: Option<SessionKeys>,
    peer: Option<(String, String)>,
}

impl NtlmServer {
    pub fn new(users: Arc<dyn UserStore>, options: NtlmOptions, require_confidentiality: bool) -> Result<Self> {
        check_key_strength(&options, require_confidentiality)?;
        Ok(Self {
            state: ServerState::Start,
            users,
            options,
            require_confidentiality,
            channel_bindings: None,
            fixed: FixedInputs::default(),
            negotiate: Vec::new(),
            challenge: Vec::new(),
            server_challenge: [0u8; 8],
            timestamp: 0,
            flags: NegotiateFlags::empty(),
            keys: None,
            peer: None,
        })
    }

    /// Application data the client's `MsvAvChannelBindings` must hash to.
    #[must_use]
    pub fn with_channel_bindings(self, application_data: Option<Vec<u8>>) -> Self {
        Self { channel_bindings: application_data, ..self }
    }

    #[must_use]
    pub fn with_fixed_inputs(self, fixed: FixedInputs) -> Self {
        Self { fixed, ..self }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn flags(&self) -> Option<NegotiateFlags> {
        (self.state != ServerState::Start).then_some(self.flags)
    }

    /// `(user, domain)` as authenticated.
    pub fn peer(&self) -> Option<(&str, &str)> {
        self.peer.as_ref().map(|(user, domain)| (user.as_str(), domain.as_str()))
    }

    pub fn session_keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    pub fn into_session_keys(self) -> Option<SessionKeys> {
        self.keys
    }

    pub fn step(&mut self, input: Option<&[u8]>) -> Result<(Option<Vec<u8>>, ContextStatus)> {
        match (self.state, input) {
            (ServerState::Start, Some(negotiate)) => Ok((Some(self.challenge(negotiate)?), ContextStatus::Continue)),
            (ServerState::ChallengeSent, Some(authenticate)) => {
                self.authenticate(authenticate)?;
                Ok((None, ContextStatus::Complete))
            }
            (state, _) => Err(Error::malformed(format!("unexpected NTLM input in server state {state:?}"))),
        }
    }

    fn challenge(&mut self, negotiate_bytes: &[u8]) -> Result<Vec<u8>> {
        let negotiate = NegotiateMessage::decode(negotiate_bytes)?;
        self.state = ServerState::NegotiateReceived;

        let offered = negotiate.flags;
        if !offered.contains(NegotiateFlags::NEGOTIATE_EXTENDED_SESSIONSECURITY) {
            return Err(Error::UnsupportedConfiguration("client offered only NTLMv1 session security".into()));
        }
        let supported = supported_flags(&self.options) | NegotiateFlags::NEGOTIATE_OEM;
        let mut flags = (offered & supported) | NegotiateFlags::TARGET_TYPE_SERVER | NegotiateFlags::NEGOTIATE_TARGET_INFO;
        if flags.contains(NegotiateFlags::NEGOTIATE_UNICODE) {
            flags.remove(NegotiateFlags::NEGOTIATE_OEM);
        }
        if self.require_confidentiality && !flags.contains(NegotiateFlags::NEGOTIATE_SEAL) {
            return Err(Error::UnsupportedConfiguration("client did not offer sealing".into()));
        }

        self.server_challenge = self.fixed.server_challenge.unwrap_or_else(random);
        self.timestamp = self.fixed.timestamp.unwrap_or_else(|| filetime(Utc::now()));

        let options = &self.options;
        let mut pairs = vec![
            AvPair::NbDomainName(options.server_domain.clone()),
            AvPair::NbComputerName(options.server_name.clone()),
        ];
        if let Some(name) = &options.dns_domain_name {
            pairs.push(AvPair::DnsDomainName(name.clone()));
        }
        if let Some(name) = &options.dns_computer_name {
            pairs.push(AvPair::DnsComputerName(name.clone()));
        }
        pairs.push(AvPair::Timestamp(self.timestamp));

        let message = ChallengeMessage {
            flags,
            target_name: if flags.contains(NegotiateFlags::REQUEST_TARGET) {
                options.server_domain.clone()
            } else {
                String::new()
            },
            server_challenge: self.server_challenge,
            target_info: TargetInfo(pairs),
            version: flags
                .contains(NegotiateFlags::NEGOTIATE_VERSION)
                .then(|| options.version.unwrap_or_default()),
        };
        self.challenge = message.encode()?;
        self.negotiate = negotiate_bytes.to_vec();
        self.flags = flags;
        self.state = ServerState::ChallengeSent;
        debug!(flags = ?flags, "NTLM challenge sent");
        Ok(self.challenge.clone())
    }

    fn authenticate(&mut self, token: &[u8]) -> Result<()> {
        let message = AuthenticateMessage::decode(token)?;
        self.state = ServerState::AuthenticateReceived;
        check_subset(message.flags, self.flags, "authenticate")?;

        if message.user_name.is_empty() && message.nt_challenge_response.is_empty() {
            return Err(Error::AuthenticationRejected("anonymous logons are not accepted".into()));
        }
        if message.nt_challenge_response.len() < NT_PROOF_LEN + BLOB_HEADER_LEN {
            return Err(Error::AuthenticationRejected("only NTLMv2 responses are accepted".into()));
        }

        let user = &message.user_name;
        let domain = &message.domain_name;
        let Some(nt_hash) = self.users.nt_hash(user, domain) else {
            warn!(%user, %domain, "NTLM logon for unknown user");
            return Err(Error::AuthenticationRejected(format!("unknown user {domain}\\{user}")));
        };
        let response_key = ntowfv2(&nt_hash, user, domain);
        let (proof, blob) = message.nt_challenge_response.split_at(NT_PROOF_LEN);
        let expected_proof = nt_proof(&response_key, &self.server_challenge, blob);
        if !bool::from(expected_proof[..].ct_eq(proof)) {
            warn!(%user, %domain, "NTLMv2 proof mismatch");
            return Err(Error::AuthenticationRejected(format!("bad credentials for {domain}\\{user}")));
        }

        let client_info = TargetInfo::decode(&blob[BLOB_HEADER_LEN..])?;
        if client_info.timestamp() != Some(self.timestamp) {
            return Err(Error::AuthenticationRejected("challenge timestamp was not echoed".into()));
        }
        if let Some(application_data) = &self.channel_bindings {
            let expected = channel_bindings_hash(application_data);
            match client_info.channel_bindings() {
                Some(hash) if bool::from(hash[..].ct_eq(&expected[..])) => {}
                _ => {
                    warn!(%user, %domain, "NTLM channel bindings mismatch");
                    return Err(Error::BadBindings);
                }
            }
        }

        let base_key = session_base_key(&response_key, &expected_proof);
        // The client may drop offered bits; its Authenticate flags are final.
        let flags = message.flags;
        let exported: [u8; 16] = if flags.contains(NegotiateFlags::NEGOTIATE_KEY_EXCH) {
            rc4(&base_key, &message.encrypted_random_session_key)
                .try_into()
                .map_err(|_| Error::malformed("encrypted session key must be 16 bytes"))?
        } else {
            base_key
        };

        if client_info.flags() & AV_FLAG_MIC_PRESENT != 0 {
            let mic = message
                .mic
                .ok_or_else(|| Error::IntegrityCheckFailed("NTLM MIC announced but missing".into()))?;
            let mut zeroed = token.to_vec();
            zeroed[MIC_OFFSET..MIC_OFFSET + MIC_LEN].fill(0);
            let expected_mic = message_mic(&exported, &self.negotiate, &self.challenge, &zeroed);
            if !bool::from(expected_mic[..].ct_eq(&mic[..])) {
                return Err(Error::IntegrityCheckFailed("NTLM message MIC mismatch".into()));
            }
        }

        debug!(%user, %domain, flags = ?flags, "NTLM logon accepted");
        self.keys = Some(SessionKeys::new(&exported, flags, false));
        self.flags = flags;
        self.peer = Some((user.clone(), domain.clone()));
        self.state = ServerState::Established;
        Ok(())
    }
}

include!("engine_test.rs");
