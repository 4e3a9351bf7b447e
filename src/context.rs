//! SPNEGO negotiation ([RFC 4178]) and the established security context.
//!
//! A [`PendingContext`] is stepped with each token from the peer until it
//! turns into a [`SecurityContext`]. Every step consumes the pending context,
//! so a failed negotiation cannot be resumed and an established context
//! cannot be negotiated again.
//!
//! The initiator's preference order always wins. When the acceptor picks
//! anything other than the initiator's optimistic mechanism, both sides must
//! exchange a mechListMIC over the initiator's mechanism list, and a
//! mechanism without integrity cannot be negotiated that way. MICs are
//! exchanged for every mechanism that supports integrity.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::{Config, Credentials, UserStore};
use crate::error::{Error, Result};
use crate::mech::{
    Adapter, Capabilities, ContextStatus, IovBuffer, NativeProvider, Protection, Providers, Role, Setup, Unwrapped, Wrapped,
};
use crate::ntlm::{NegotiateFlags, NtlmMessage};
use crate::oid::{self, MechanismIdentifier};
use crate::spnego::{NegHints, NegState, NegTokenInit, NegTokenResp, NegotiationToken};

/// The hintName Windows acceptors send in NegTokenInit2.
const HINT_NAME: &str = "not_defined_in_RFC4178@please_ignore";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    /// Initiator: NegTokenInit sent, no response yet.
    InitSent,
    /// Acceptor: first response sent, mechanism not started or just started.
    ResponsePending,
    MechanismInProgress,
}

/// Collects what a context needs before the first step.
#[must_use]
pub struct ContextBuilder {
    role: Role,
    config: Config,
    credentials: Credentials,
    users: Option<Arc<dyn UserStore>>,
    providers: Providers,
}

impl ContextBuilder {
    pub fn initiator() -> Self {
        Self::new(Role::Initiator)
    }

    pub fn acceptor() -> Self {
        Self::new(Role::Acceptor)
    }

    fn new(role: Role) -> Self {
        Self {
            role,
            config: Config::default(),
            credentials: Credentials::default(),
            users: None,
            providers: Providers::default(),
        }
    }

    pub fn config(self, config: Config) -> Self {
        Self { config, ..self }
    }

    pub fn credentials(self, credentials: Credentials) -> Self {
        Self { credentials, ..self }
    }

    /// Accounts an NTLM acceptor validates against.
    pub fn user_store(self, users: Arc<dyn UserStore>) -> Self {
        Self { users: Some(users), ..self }
    }

    pub fn platform_provider(mut self, provider: Arc<dyn NativeProvider>) -> Self {
        self.providers.platform = Some(provider);
        self
    }

    pub fn kerberos_provider(mut self, provider: Arc<dyn NativeProvider>) -> Self {
        self.providers.kerberos = Some(provider);
        self
    }

    pub fn build(self) -> Result<PendingContext> {
        let context = PendingContext {
            role: self.role,
            config: self.config,
            credentials: self.credentials,
            users: self.users,
            providers: self.providers,
            state: NegotiationState::Idle,
            rounds: 0,
            offered: Vec::new(),
            mech_types: Vec::new(),
            selected: None,
            adapter: None,
            mic_required: false,
            mic_sent: false,
            peer_mic_verified: false,
        };
        let eligible = context.setup().eligible();
        if eligible.is_empty() {
            return Err(Error::UnsupportedConfiguration(
                "no configured mechanism is available with these settings".into(),
            ));
        }
        debug!(role = ?context.role, mechanisms = %display_list(&eligible), "security context created");
        Ok(context)
    }
}

/// Result of one negotiation step.
#[derive(Debug)]
pub enum StepOut {
    /// Send the token and step again with the peer's answer.
    Pending(PendingContext, Vec<u8>),
    /// Negotiation is done. A token, if present, still has to reach the peer.
    Finished(SecurityContext, Option<Vec<u8>>),
}

/// A context still negotiating.
pub struct PendingContext {
    role: Role,
    config: Config,
    credentials: Credentials,
    users: Option<Arc<dyn UserStore>>,
    providers: Providers,
    state: NegotiationState,
    rounds: usize,
    /// Initiator's list as sent.
    offered: Vec<MechanismIdentifier>,
    /// DER of the initiator's MechTypeList, the mechListMIC input.
    mech_types: Vec<u8>,
    selected: Option<MechanismIdentifier>,
    adapter: Option<Adapter>,
    mic_required: bool,
    mic_sent: bool,
    peer_mic_verified: bool,
}

fn same_mechanism(a: &MechanismIdentifier, b: &MechanismIdentifier) -> bool {
    a == b || (a.is_kerberos() && b.is_kerberos())
}

fn display_list(mechs: &[MechanismIdentifier]) -> String {
    mechs.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

/// The first of the initiator's mechanisms the acceptor also supports.
pub(crate) fn select_mechanism(
    initiator: &[MechanismIdentifier],
    acceptor: &[MechanismIdentifier],
) -> Result<MechanismIdentifier> {
    initiator
        .iter()
        .find(|mech| acceptor.iter().any(|own| same_mechanism(own, mech)))
        .cloned()
        .ok_or(Error::NoCommonMechanism)
}

fn encode(resp: NegTokenResp) -> Result<Vec<u8>> {
    NegotiationToken::Response(resp).encode()
}

impl PendingContext {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Mechanism currently being run, if one was chosen.
    pub fn selected_mechanism(&self) -> Option<&MechanismIdentifier> {
        self.selected.as_ref()
    }

    fn setup(&self) -> Setup<'_> {
        Setup {
            role: self.role,
            config: &self.config,
            credentials: &self.credentials,
            users: self.users.as_ref(),
            providers: &self.providers,
        }
    }

    /// Feeds the peer's last token (`None` to start) and produces the next one.
    pub fn step(mut self, input: Option<&[u8]>) -> Result<StepOut> {
        self.rounds += 1;
        if self.rounds > self.config.max_rounds {
            warn!(role = ?self.role, max_rounds = self.config.max_rounds, "negotiation abandoned");
            return Err(Error::NegotiationExceededRounds(self.config.max_rounds));
        }
        trace!(
            role = ?self.role,
            state = ?self.state,
            round = self.rounds,
            input_len = input.map_or(0, <[u8]>::len),
            "negotiation step"
        );

        if !self.config.embed_in_spnego {
            return self.step_raw(input);
        }
        match (self.role, self.state, input) {
            (Role::Initiator, NegotiationState::Idle, None) => {
                let mechs = self.setup().eligible();
                self.send_init(mechs)
            }
            (Role::Initiator, NegotiationState::Idle, Some(token)) => self.answer_hints(token),
            (Role::Initiator, _, Some(token)) => self.initiator_response(token),
            (Role::Acceptor, NegotiationState::Idle, None) => self.send_hints(),
            (Role::Acceptor, NegotiationState::Idle, Some(token)) => self.accept_init(token),
            (Role::Acceptor, _, Some(token)) => self.acceptor_response(token),
            (_, state, None) => Err(Error::malformed(format!("negotiation in state {state:?} needs a peer token"))),
        }
    }

    /// Mechanism tokens without SPNEGO framing.
    fn step_raw(mut self, input: Option<&[u8]>) -> Result<StepOut> {
        let mut adapter = match self.adapter.take() {
            Some(adapter) => adapter,
            None => {
                let eligible = self.setup().eligible();
                let mech = match (self.role, input) {
                    (Role::Acceptor, Some(token)) if NtlmMessage::is_ntlm(token) => {
                        eligible.into_iter().find(|mech| *mech == MechanismIdentifier::NTLM)
                    }
                    (Role::Acceptor, Some(_)) => eligible.into_iter().find(|mech| *mech != MechanismIdentifier::NTLM),
                    _ => eligible.into_iter().next(),
                }
                .ok_or(Error::NoCommonMechanism)?;
                let adapter = Adapter::new(&mech, &self.setup())?;
                self.selected = Some(mech);
                self.state = NegotiationState::MechanismInProgress;
                adapter
            }
        };
        let (token, status) = adapter.step(input)?;
        self.adapter = Some(adapter);
        match status {
            ContextStatus::Complete => self.establish(token),
            ContextStatus::Continue => {
                let token = token.ok_or_else(|| Error::malformed("mechanism produced no token"))?;
                Ok(StepOut::Pending(self, token))
            }
        }
    }

    fn send_init(mut self, mechs: Vec<MechanismIdentifier>) -> Result<StepOut> {
        let first = mechs.first().cloned().ok_or(Error::NoCommonMechanism)?;
        let mut adapter = Adapter::new(&first, &self.setup())?;
        let (mech_token, _) = adapter.step(None)?;

        debug!(mechanisms = %display_list(&mechs), optimistic = %first, "sending NegTokenInit");
        self.mech_types = oid::encode_mech_list(&mechs)?;
        self.offered = mechs;
        self.selected = Some(first);
        self.adapter = Some(adapter);
        self.state = NegotiationState::InitSent;

        let init = NegTokenInit {
            mech_types: self.offered.clone(),
            mech_token,
            neg_hints: None,
            mech_list_mic: None,
        };
        let token = NegotiationToken::Init(init).encode()?;
        Ok(StepOut::Pending(self, token))
    }

    /// The acceptor spoke first with a NegTokenInit2; only offer what it lists.
    fn answer_hints(self, token: &[u8]) -> Result<StepOut> {
        let NegotiationToken::Init(hints) = NegotiationToken::decode(token)? else {
            return Err(Error::malformed("expected NegTokenInit from the acceptor"));
        };
        let mechs: Vec<_> = self
            .setup()
            .eligible()
            .into_iter()
            .filter(|mech| hints.mech_types.iter().any(|theirs| same_mechanism(theirs, mech)))
            .collect();
        if mechs.is_empty() {
            return Err(Error::NoCommonMechanism);
        }
        self.send_init(mechs)
    }

    fn send_hints(self) -> Result<StepOut> {
        let init = NegTokenInit {
            mech_types: self.setup().eligible(),
            mech_token: None,
            neg_hints: Some(NegHints { hint_name: Some(HINT_NAME.into()), hint_address: None }),
            mech_list_mic: None,
        };
        debug!(mechanisms = %display_list(&init.mech_types), "sending NegTokenInit2");
        let token = NegotiationToken::Init(init).encode()?;
        Ok(StepOut::Pending(self, token))
    }

    fn accept_init(mut self, token: &[u8]) -> Result<StepOut> {
        let init = match NegotiationToken::decode(token)? {
            NegotiationToken::Init(init) => init,
            NegotiationToken::Response(_) => return Err(Error::malformed("expected NegTokenInit")),
        };
        let selected = select_mechanism(&init.mech_types, &self.setup().eligible()).map_err(|err| {
            warn!(offered = %display_list(&init.mech_types), "no common mechanism");
            err
        })?;
        let optimistic = init.mech_types.first() == Some(&selected);
        debug!(mechanism = %selected, optimistic, "mechanism selected");

        self.mech_types = oid::encode_mech_list(&init.mech_types)?;
        self.selected = Some(selected.clone());
        self.state = NegotiationState::ResponsePending;
        let mut out = NegTokenResp { supported_mech: Some(selected.clone()), ..Default::default() };

        match init.mech_token {
            Some(mech_token) if optimistic => {
                let mut adapter = Adapter::new(&selected, &self.setup())?;
                let (response, _) = adapter.step(Some(&mech_token))?;
                self.adapter = Some(adapter);
                out.response_token = response;
                self.acceptor_reply(out, init.mech_list_mic.as_deref())
            }
            None if optimistic => {
                out.neg_state = Some(NegState::AcceptIncomplete);
                Ok(StepOut::Pending(self, encode(out)?))
            }
            _ => {
                // The optimistic token, if any, was for another mechanism.
                self.mic_required = true;
                out.neg_state = Some(NegState::RequestMic);
                Ok(StepOut::Pending(self, encode(out)?))
            }
        }
    }

    fn acceptor_response(mut self, token: &[u8]) -> Result<StepOut> {
        let resp = self.decode_response(token)?;
        let mut out = NegTokenResp::default();
        if let Some(mech_token) = resp.response_token.as_deref() {
            if self.adapter_complete() {
                return Err(Error::malformed("mechanism token after the mechanism completed"));
            }
            if self.adapter.is_none() {
                let selected = self.selected.clone().ok_or_else(|| Error::malformed("no mechanism selected"))?;
                self.adapter = Some(Adapter::new(&selected, &self.setup())?);
            }
            let (response, _) = self.adapter_mut()?.step(Some(mech_token))?;
            out.response_token = response;
        }
        self.state = NegotiationState::MechanismInProgress;
        self.acceptor_reply(out, resp.mech_list_mic.as_deref())
    }

    fn acceptor_reply(mut self, mut out: NegTokenResp, peer_mic: Option<&[u8]>) -> Result<StepOut> {
        if !self.adapter_complete() {
            if out.response_token.is_none() {
                return Err(Error::malformed("mechanism produced no token"));
            }
            out.neg_state = Some(NegState::AcceptIncomplete);
            return Ok(StepOut::Pending(self, encode(out)?));
        }
        if !self.has_integrity() {
            if self.mic_required {
                return Err(Error::IntegrityCheckFailed(
                    "negotiated mechanism cannot protect the mechanism list".into(),
                ));
            }
            out.neg_state = Some(NegState::AcceptCompleted);
            return self.establish(Some(encode(out)?));
        }

        match peer_mic {
            Some(mic) => self.verify_peer_mic(mic)?,
            None if self.mic_sent => {
                return Err(Error::IntegrityCheckFailed("initiator did not send a mechListMIC".into()));
            }
            None => {}
        }
        if !self.mic_sent {
            self.attach_mic(&mut out)?;
        }
        if self.peer_mic_verified {
            out.neg_state = Some(NegState::AcceptCompleted);
            self.establish(Some(encode(out)?))
        } else {
            out.neg_state = Some(NegState::AcceptIncomplete);
            Ok(StepOut::Pending(self, encode(out)?))
        }
    }

    fn initiator_response(mut self, token: &[u8]) -> Result<StepOut> {
        let resp = self.decode_response(token)?;
        let mut out = NegTokenResp::default();

        if self.state == NegotiationState::InitSent {
            self.state = NegotiationState::MechanismInProgress;
            let chosen = resp
                .supported_mech
                .clone()
                .ok_or_else(|| Error::malformed("first NegTokenResp names no mechanism"))?;
            if !self.offered.contains(&chosen) {
                return Err(Error::malformed(format!("acceptor selected {chosen}, which was not offered")));
            }
            if resp.neg_state == Some(NegState::RequestMic) {
                self.mic_required = true;
            }
            if self.selected.as_ref() != Some(&chosen) {
                debug!(mechanism = %chosen, "acceptor selected a later mechanism");
                let mut adapter = Adapter::new(&chosen, &self.setup())?;
                if !adapter.capabilities().contains(Capabilities::INTEGRITY) {
                    return Err(Error::IntegrityCheckFailed(format!(
                        "{chosen} cannot protect the mechanism list after a downgrade"
                    )));
                }
                let (mech_token, _) = adapter.step(None)?;
                self.adapter = Some(adapter);
                self.selected = Some(chosen);
                self.mic_required = true;
                out.response_token = mech_token;
                return self.initiator_reply(out, resp.neg_state, None);
            }
        }

        if let Some(mech_token) = resp.response_token.as_deref() {
            if self.adapter_complete() {
                return Err(Error::malformed("mechanism token after the mechanism completed"));
            }
            let (response, _) = self.adapter_mut()?.step(Some(mech_token))?;
            out.response_token = response;
        }
        self.initiator_reply(out, resp.neg_state, resp.mech_list_mic.as_deref())
    }

    fn initiator_reply(
        mut self,
        mut out: NegTokenResp,
        neg_state: Option<NegState>,
        peer_mic: Option<&[u8]>,
    ) -> Result<StepOut> {
        let accepted = neg_state == Some(NegState::AcceptCompleted);
        if !self.adapter_complete() {
            if accepted {
                return Err(Error::malformed("acceptor completed before the mechanism did"));
            }
            if out.response_token.is_none() {
                return Err(Error::malformed("mechanism produced no token"));
            }
            return Ok(StepOut::Pending(self, encode(out)?));
        }

        if !self.has_integrity() {
            if self.mic_required {
                return Err(Error::IntegrityCheckFailed(
                    "negotiated mechanism cannot protect the mechanism list".into(),
                ));
            }
            let token = out.response_token.is_some().then(|| encode(out)).transpose()?;
            return match (accepted, token) {
                (true, token) => self.establish(token),
                (false, Some(token)) => Ok(StepOut::Pending(self, token)),
                (false, None) => Err(Error::malformed("negotiation stalled")),
            };
        }

        if let Some(mic) = peer_mic {
            self.verify_peer_mic(mic)?;
        }
        if accepted {
            if !self.peer_mic_verified {
                return Err(Error::IntegrityCheckFailed("acceptor completed without a mechListMIC".into()));
            }
            let token = out.response_token.is_some().then(|| encode(out)).transpose()?;
            return self.establish(token);
        }
        if !self.mic_sent {
            self.attach_mic(&mut out)?;
        }
        if out.response_token.is_none() && out.mech_list_mic.is_none() {
            return Err(Error::malformed("negotiation stalled"));
        }
        Ok(StepOut::Pending(self, encode(out)?))
    }

    fn decode_response(&self, token: &[u8]) -> Result<NegTokenResp> {
        let resp = match NegotiationToken::decode(token)? {
            NegotiationToken::Response(resp) => resp,
            NegotiationToken::Init(_) => return Err(Error::malformed("expected NegTokenResp")),
        };
        if resp.neg_state == Some(NegState::Reject) {
            warn!(role = ?self.role, "peer rejected the negotiation");
            return Err(Error::AuthenticationRejected("peer rejected the negotiation".into()));
        }
        if let (Some(named), Some(selected)) = (&resp.supported_mech, &self.selected) {
            if self.state != NegotiationState::InitSent && named != selected {
                return Err(Error::malformed(format!("peer switched mechanism from {selected} to {named}")));
            }
        }
        Ok(resp)
    }

    fn adapter_mut(&mut self) -> Result<&mut Adapter> {
        self.adapter.as_mut().ok_or_else(|| Error::malformed("no mechanism selected"))
    }

    fn adapter_complete(&self) -> bool {
        self.adapter.as_ref().is_some_and(Adapter::is_complete)
    }

    fn has_integrity(&self) -> bool {
        self.adapter
            .as_ref()
            .is_some_and(|adapter| adapter.capabilities().contains(Capabilities::INTEGRITY))
    }

    fn verify_peer_mic(&mut self, mic: &[u8]) -> Result<()> {
        let adapter = self.adapter.as_mut().ok_or_else(|| Error::malformed("mechListMIC without a mechanism"))?;
        adapter.verify_mic(&self.mech_types, mic).map_err(|err| {
            warn!(role = ?self.role, %err, "mechListMIC rejected");
            match err {
                Error::IntegrityCheckFailed(msg) => Error::IntegrityCheckFailed(msg),
                other => Error::IntegrityCheckFailed(other.to_string()),
            }
        })?;
        self.peer_mic_verified = true;
        Ok(())
    }

    fn attach_mic(&mut self, out: &mut NegTokenResp) -> Result<()> {
        let adapter = self.adapter.as_mut().ok_or_else(|| Error::malformed("mechListMIC without a mechanism"))?;
        out.mech_list_mic = Some(adapter.get_mic(&self.mech_types)?);
        self.mic_sent = true;
        Ok(())
    }

    fn establish(self, token: Option<Vec<u8>>) -> Result<StepOut> {
        let adapter = self.adapter.ok_or_else(|| Error::malformed("negotiation finished without a mechanism"))?;
        let mechanism = adapter.mechanism();
        let protection = adapter.into_protection()?;
        debug!(role = ?self.role, %mechanism, rounds = self.rounds, "security context established");
        Ok(StepOut::Finished(SecurityContext { role: self.role, mechanism, protection }, token))
    }
}

impl fmt::Debug for PendingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingContext")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("rounds", &self.rounds)
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

/// An established context bound to one mechanism and its keys.
pub struct SecurityContext {
    role: Role,
    mechanism: MechanismIdentifier,
    protection: Protection,
}

impl SecurityContext {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mechanism(&self) -> &MechanismIdentifier {
        &self.mechanism
    }

    /// Negotiated NTLM flags, when NTLM was negotiated.
    pub fn ntlm_flags(&self) -> Option<NegotiateFlags> {
        self.protection.ntlm_flags()
    }

    /// `(user, domain)` of the authenticated initiator. Known to NTLM acceptors only.
    pub fn peer(&self) -> Option<(&str, &str)> {
        match &self.protection {
            Protection::Ntlm { peer: Some((user, domain)), .. } => Some((user.as_str(), domain.as_str())),
            _ => None,
        }
    }

    pub fn wrap(&mut self, data: &[u8], confidential: bool) -> Result<Wrapped> {
        match &mut self.protection {
            Protection::Ntlm { keys, .. } => {
                let (data, encrypted) = keys.wrap(data, confidential)?;
                Ok(Wrapped { data, encrypted })
            }
            Protection::Native(native) => native.wrap(data, confidential),
        }
    }

    pub fn unwrap(&mut self, data: &[u8]) -> Result<Unwrapped> {
        match &mut self.protection {
            Protection::Ntlm { keys, .. } => {
                let (data, encrypted) = keys.unwrap(data)?;
                Ok(Unwrapped { data, encrypted })
            }
            Protection::Native(native) => native.unwrap(data),
        }
    }

    /// Wraps scattered buffers in place; see [`crate::IovKind`] for the buffer roles.
    pub fn wrap_iov(&mut self, buffers: &mut [IovBuffer], confidential: bool) -> Result<bool> {
        match &mut self.protection {
            Protection::Ntlm { keys, .. } => keys.wrap_iov(buffers, confidential),
            Protection::Native(native) => native.wrap_iov(buffers, confidential),
        }
    }

    pub fn unwrap_iov(&mut self, buffers: &mut [IovBuffer]) -> Result<bool> {
        match &mut self.protection {
            Protection::Ntlm { keys, .. } => keys.unwrap_iov(buffers),
            Protection::Native(native) => native.unwrap_iov(buffers),
        }
    }

    /// Detached MIC over `data`.
    pub fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match &mut self.protection {
            Protection::Ntlm { keys, .. } => Ok(keys.sign(data)?.to_vec()),
            Protection::Native(native) => native.sign(data),
        }
    }

    pub fn verify(&mut self, data: &[u8], signature: &[u8]) -> Result<()> {
        match &mut self.protection {
            Protection::Ntlm { keys, .. } => keys.verify(data, signature),
            Protection::Native(native) => native.verify(data, signature),
        }
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("role", &self.role)
            .field("mechanism", &self.mechanism)
            .finish_non_exhaustive()
    }
}

include!("context_test.rs");
