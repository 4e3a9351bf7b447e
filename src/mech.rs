//! Mechanism adapters.
//!
//! The negotiator drives every mechanism through [`Adapter`]: the built-in
//! NTLM engine, or a security context created by a native provider (a
//! system Kerberos library, the platform's SSP). Native providers are reached
//! only through [`NativeProvider`] and [`NativeContext`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use tracing::debug;

use crate::config::{Config, Credentials, UserStore};
use crate::error::{Error, ErrorCode, Result};
use crate::ntlm::{NegotiateFlags, NtlmClient, NtlmServer, SessionKeys};
use crate::oid::MechanismIdentifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Outcome of one mechanism step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    Continue,
    Complete,
}

bitflags! {
    /// What a mechanism can provide once established.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const INTEGRITY = 0x01;
        const CONFIDENTIALITY = 0x02;
        const MUTUAL_AUTH = 0x04;
        const CHANNEL_BINDINGS = 0x08;
    }
}

/// Output of a wrap operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wrapped {
    pub data: Vec<u8>,
    pub encrypted: bool,
}

/// Output of an unwrap operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwrapped {
    pub data: Vec<u8>,
    pub encrypted: bool,
}

/// Role of one buffer in an IOV wrap or unwrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IovKind {
    /// Receives the signature on wrap, supplies it on unwrap.
    Header,
    /// Signed, and encrypted when confidentiality is requested.
    Data,
    /// Covered by the signature but never encrypted.
    SignOnly,
    /// Block-cipher padding. Left empty by stream ciphers.
    Padding,
    /// A complete wrapped message, split into header and data on unwrap.
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IovBuffer {
    pub kind: IovKind,
    pub data: Vec<u8>,
}

impl IovBuffer {
    pub fn new(kind: IovKind, data: impl Into<Vec<u8>>) -> Self {
        Self { kind, data: data.into() }
    }

    /// An empty buffer of `kind`, filled in by the operation.
    pub fn empty(kind: IovKind) -> Self {
        Self { kind, data: Vec::new() }
    }
}

/// Credential acquired from a native provider. Never inspected here.
pub struct CredentialHandle(Box<dyn Any + Send + Sync>);

impl CredentialHandle {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Box::new(inner))
    }

    /// For providers to recover their own handle type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialHandle(..)")
    }
}

/// A source of native security contexts.
pub trait NativeProvider: Send + Sync {
    fn name(&self) -> &str;

    fn mechanisms(&self) -> Vec<MechanismIdentifier>;

    fn capabilities(&self, mech: &MechanismIdentifier) -> Capabilities;

    fn acquire_credential(&self, principal: Option<&str>, lifetime: Option<Duration>, role: Role)
        -> Result<CredentialHandle>;

    fn new_context(&self, mech: &MechanismIdentifier, role: Role) -> Result<Box<dyn NativeContext>>;

    /// Whether this provider can run `mech`. The two Kerberos OIDs are
    /// interchangeable.
    fn supports(&self, mech: &MechanismIdentifier) -> bool {
        self.mechanisms()
            .iter()
            .any(|own| own == mech || (own.is_kerberos() && mech.is_kerberos()))
    }
}

/// One native security context, mirroring the GSS-API calls.
pub trait NativeContext: Send {
    fn init_sec_context(
        &mut self,
        credential: &CredentialHandle,
        target: Option<&str>,
        channel_bindings: Option<&[u8]>,
        input: Option<&[u8]>,
    ) -> Result<(Option<Vec<u8>>, ContextStatus)>;

    fn accept_sec_context(
        &mut self,
        credential: &CredentialHandle,
        channel_bindings: Option<&[u8]>,
        input: &[u8],
    ) -> Result<(Option<Vec<u8>>, ContextStatus)>;

    fn wrap_message(&mut self, data: &[u8], confidential: bool) -> Result<Wrapped>;

    fn unwrap_message(&mut self, data: &[u8]) -> Result<Unwrapped>;

    fn get_mic(&mut self, data: &[u8]) -> Result<Vec<u8>>;

    fn verify_mic(&mut self, data: &[u8], mic: &[u8]) -> Result<()>;

    /// Wraps `buffers` in place. Returns whether the data was encrypted.
    fn wrap_iov(&mut self, _buffers: &mut [IovBuffer], _confidential: bool) -> Result<bool> {
        Err(Error::Provider { code: ErrorCode::Unavailable, message: "IOV wrapping is not supported".into() })
    }

    fn unwrap_iov(&mut self, _buffers: &mut [IovBuffer]) -> Result<bool> {
        Err(Error::Provider { code: ErrorCode::Unavailable, message: "IOV unwrapping is not supported".into() })
    }
}

/// Native providers available to a context.
#[derive(Clone, Default)]
pub struct Providers {
    /// Consulted first for every mechanism it lists.
    pub platform: Option<Arc<dyn NativeProvider>>,
    pub kerberos: Option<Arc<dyn NativeProvider>>,
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Providers")
            .field("platform", &self.platform.as_ref().map(|p| p.name().to_owned()))
            .field("kerberos", &self.kerberos.as_ref().map(|p| p.name().to_owned()))
            .finish()
    }
}

/// What an adapter is created from.
pub(crate) struct Setup<'a> {
    pub role: Role,
    pub config: &'a Config,
    pub credentials: &'a Credentials,
    pub users: Option<&'a Arc<dyn UserStore>>,
    pub providers: &'a Providers,
}

enum Backend<'a> {
    Platform(&'a Arc<dyn NativeProvider>),
    Kerberos(&'a Arc<dyn NativeProvider>),
    Ntlm,
}

impl Setup<'_> {
    fn backend(&self, mech: &MechanismIdentifier) -> Option<Backend<'_>> {
        if let Some(platform) = self.providers.platform.as_ref().filter(|p| p.supports(mech)) {
            return Some(Backend::Platform(platform));
        }
        if let Some(kerberos) = self.providers.kerberos.as_ref().filter(|p| p.supports(mech)) {
            return Some(Backend::Kerberos(kerberos));
        }
        let ntlm_ready = match self.role {
            Role::Initiator => self.credentials.ntlm.is_some(),
            Role::Acceptor => self.users.is_some(),
        };
        (*mech == MechanismIdentifier::NTLM && ntlm_ready).then_some(Backend::Ntlm)
    }

    fn capabilities(&self, mech: &MechanismIdentifier) -> Option<Capabilities> {
        Some(match self.backend(mech)? {
            Backend::Platform(provider) | Backend::Kerberos(provider) => provider.capabilities(mech),
            Backend::Ntlm => Capabilities::INTEGRITY | Capabilities::CONFIDENTIALITY | Capabilities::CHANNEL_BINDINGS,
        })
    }

    /// Configured mechanisms that have a backend and meet the configuration,
    /// in preference order.
    pub fn eligible(&self) -> Vec<MechanismIdentifier> {
        self.config
            .preferred_mechanisms
            .iter()
            .filter(|mech| {
                let Some(caps) = self.capabilities(mech) else {
                    return false;
                };
                if self.config.require_mutual_authentication && !caps.contains(Capabilities::MUTUAL_AUTH) {
                    return false;
                }
                !(self.config.require_confidentiality && !caps.contains(Capabilities::CONFIDENTIALITY))
            })
            .cloned()
            .collect()
    }
}

/// A native context together with its credential.
pub struct NativeMechanism {
    mech: MechanismIdentifier,
    role: Role,
    capabilities: Capabilities,
    credential: CredentialHandle,
    context: Box<dyn NativeContext>,
    target: Option<String>,
    channel_bindings: Option<Vec<u8>>,
    complete: bool,
}

impl NativeMechanism {
    fn new(provider: &Arc<dyn NativeProvider>, mech: &MechanismIdentifier, setup: &Setup<'_>) -> Result<Self> {
        let credential = provider.acquire_credential(
            setup.credentials.principal.as_deref(),
            setup.credentials.lifetime,
            setup.role,
        )?;
        Ok(Self {
            mech: mech.clone(),
            role: setup.role,
            capabilities: provider.capabilities(mech),
            credential,
            context: provider.new_context(mech, setup.role)?,
            target: setup.config.target_name.clone(),
            channel_bindings: setup.config.channel_bindings.clone(),
            complete: false,
        })
    }

    fn step(&mut self, input: Option<&[u8]>) -> Result<(Option<Vec<u8>>, ContextStatus)> {
        let bindings = self.channel_bindings.as_deref();
        let (output, status) = match self.role {
            Role::Initiator => self.context.init_sec_context(&self.credential, self.target.as_deref(), bindings, input)?,
            Role::Acceptor => {
                let input = input.ok_or_else(|| Error::malformed("acceptor needs an initiator token"))?;
                self.context.accept_sec_context(&self.credential, bindings, input)?
            }
        };
        self.complete = status == ContextStatus::Complete;
        Ok((output, status))
    }

    pub fn wrap(&mut self, data: &[u8], confidential: bool) -> Result<Wrapped> {
        if confidential && !self.capabilities.contains(Capabilities::CONFIDENTIALITY) {
            return Err(Error::UnsupportedQop(format!("{} cannot encrypt", self.mech)));
        }
        self.context.wrap_message(data, confidential)
    }

    pub fn unwrap(&mut self, data: &[u8]) -> Result<Unwrapped> {
        self.context.unwrap_message(data)
    }

    pub fn wrap_iov(&mut self, buffers: &mut [IovBuffer], confidential: bool) -> Result<bool> {
        if confidential && !self.capabilities.contains(Capabilities::CONFIDENTIALITY) {
            return Err(Error::UnsupportedQop(format!("{} cannot encrypt", self.mech)));
        }
        self.context.wrap_iov(buffers, confidential)
    }

    pub fn unwrap_iov(&mut self, buffers: &mut [IovBuffer]) -> Result<bool> {
        self.context.unwrap_iov(buffers)
    }

    pub fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.context.get_mic(data)
    }

    pub fn verify(&mut self, data: &[u8], mic: &[u8]) -> Result<()> {
        self.context.verify_mic(data, mic)
    }
}

/// Built-in NTLM, one side of it.
pub enum NtlmMechanism {
    Client(NtlmClient),
    Server(NtlmServer),
}

impl NtlmMechanism {
    fn new(setup: &Setup<'_>) -> Result<Self> {
        let config = setup.config;
        Ok(match setup.role {
            Role::Initiator => {
                let credential = setup
                    .credentials
                    .ntlm
                    .clone()
                    .ok_or_else(|| Error::NoCredential("no NTLM credential".into()))?;
                let client = NtlmClient::new(credential, config.ntlm.clone(), config.require_confidentiality)?
                    .with_channel_bindings(config.channel_bindings.clone())
                    .with_target_name(config.target_name.clone());
                NtlmMechanism::Client(client)
            }
            Role::Acceptor => {
                let users = setup
                    .users
                    .cloned()
                    .ok_or_else(|| Error::NoCredential("no user store for NTLM".into()))?;
                let server = NtlmServer::new(users, config.ntlm.clone(), config.require_confidentiality)?
                    .with_channel_bindings(config.channel_bindings.clone());
                NtlmMechanism::Server(server)
            }
        })
    }

    fn keys(&self) -> Result<&SessionKeys> {
        match self {
            NtlmMechanism::Client(client) => client.session_keys(),
            NtlmMechanism::Server(server) => server.session_keys(),
        }
        .ok_or_else(|| Error::IntegrityCheckFailed("NTLM has no session keys yet".into()))
    }
}

/// One mechanism being negotiated. Never changes mechanism: the negotiator
/// drops it and creates a new one instead.
pub enum Adapter {
    Ntlm(NtlmMechanism),
    Kerberos(NativeMechanism),
    Platform(NativeMechanism),
}

impl Adapter {
    /// Picks the backend for `mech`: the platform provider if it lists the
    /// mechanism, then the Kerberos provider, then the built-in NTLM engine.
    pub(crate) fn new(mech: &MechanismIdentifier, setup: &Setup<'_>) -> Result<Self> {
        let adapter = match setup.backend(mech) {
            Some(Backend::Platform(provider)) => Adapter::Platform(NativeMechanism::new(provider, mech, setup)?),
            Some(Backend::Kerberos(provider)) => Adapter::Kerberos(NativeMechanism::new(provider, mech, setup)?),
            Some(Backend::Ntlm) => Adapter::Ntlm(NtlmMechanism::new(setup)?),
            None => {
                return Err(Error::UnsupportedConfiguration(format!("no backend for mechanism {mech}")));
            }
        };
        debug!(%mech, backend = adapter.backend_name(), "mechanism adapter created");
        Ok(adapter)
    }

    fn backend_name(&self) -> &'static str {
        match self {
            Adapter::Ntlm(_) => "ntlm",
            Adapter::Kerberos(_) => "kerberos",
            Adapter::Platform(_) => "platform",
        }
    }

    pub fn mechanism(&self) -> MechanismIdentifier {
        match self {
            Adapter::Ntlm(_) => MechanismIdentifier::NTLM,
            Adapter::Kerberos(native) | Adapter::Platform(native) => native.mech.clone(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Adapter::Ntlm(_) => Capabilities::INTEGRITY | Capabilities::CONFIDENTIALITY | Capabilities::CHANNEL_BINDINGS,
            Adapter::Kerberos(native) | Adapter::Platform(native) => native.capabilities,
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            Adapter::Ntlm(NtlmMechanism::Client(client)) => client.session_keys().is_some(),
            Adapter::Ntlm(NtlmMechanism::Server(server)) => server.session_keys().is_some(),
            Adapter::Kerberos(native) | Adapter::Platform(native) => native.complete,
        }
    }

    pub fn step(&mut self, input: Option<&[u8]>) -> Result<(Option<Vec<u8>>, ContextStatus)> {
        match self {
            Adapter::Ntlm(NtlmMechanism::Client(client)) => client.step(input),
            Adapter::Ntlm(NtlmMechanism::Server(server)) => server.step(input),
            Adapter::Kerberos(native) | Adapter::Platform(native) => native.step(input),
        }
    }

    /// MIC over `data` for the negotiation exchange.
    pub fn get_mic(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Adapter::Ntlm(ntlm) => Ok(ntlm.keys()?.negotiation_mic(data).to_vec()),
            Adapter::Kerberos(native) | Adapter::Platform(native) => native.sign(data),
        }
    }

    pub fn verify_mic(&mut self, data: &[u8], mic: &[u8]) -> Result<()> {
        match self {
            Adapter::Ntlm(ntlm) => ntlm.keys()?.verify_negotiation_mic(data, mic),
            Adapter::Kerberos(native) | Adapter::Platform(native) => native.verify(data, mic),
        }
    }

    pub(crate) fn into_protection(self) -> Result<Protection> {
        match self {
            Adapter::Ntlm(NtlmMechanism::Client(client)) => {
                let peer = None;
                let keys = client.into_session_keys();
                keys.map(|keys| Protection::Ntlm { keys, peer })
            }
            Adapter::Ntlm(NtlmMechanism::Server(server)) => {
                let peer = server.peer().map(|(user, domain)| (user.to_owned(), domain.to_owned()));
                let keys = server.into_session_keys();
                keys.map(|keys| Protection::Ntlm { keys, peer })
            }
            Adapter::Kerberos(native) | Adapter::Platform(native) => Some(Protection::Native(native)),
        }
        .ok_or_else(|| Error::malformed("mechanism finished without establishing keys"))
    }
}

/// Message protection state of an established context.
pub(crate) enum Protection {
    Ntlm { keys: SessionKeys, peer: Option<(String, String)> },
    Native(NativeMechanism),
}

impl Protection {
    pub fn ntlm_flags(&self) -> Option<NegotiateFlags> {
        match self {
            Protection::Ntlm { keys, .. } => Some(keys.flags()),
            Protection::Native(_) => None,
        }
    }
}
