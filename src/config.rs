//! Negotiation settings and credentials.
//!
//! Everything here is resolved by the caller: this crate never reads the
//! environment, keytabs or ticket caches on its own.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::ntlm::crypto::nt_hash;
use crate::ntlm::Version;
use crate::oid::MechanismIdentifier;

/// Settings for one negotiation, shared by both roles.
#[derive(Debug, Clone)]
pub struct Config {
    /// Mechanisms in preference order. Only the initiator's order decides.
    pub preferred_mechanisms: Vec<MechanismIdentifier>,
    pub require_confidentiality: bool,
    /// Excludes NTLM, which cannot authenticate the acceptor.
    pub require_mutual_authentication: bool,
    /// Application data of the GSS channel bindings, e.g. `tls-server-end-point:<hash>`.
    pub channel_bindings: Option<Vec<u8>>,
    /// When false the first eligible mechanism's tokens are exchanged raw.
    pub embed_in_spnego: bool,
    /// Upper bound on `step` calls before negotiation is abandoned.
    pub max_rounds: usize,
    /// Service principal name of the acceptor, e.g. `HTTP/host.example.com`.
    pub target_name: Option<String>,
    pub ntlm: NtlmOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preferred_mechanisms: vec![MechanismIdentifier::KERBEROS, MechanismIdentifier::NTLM],
            require_confidentiality: false,
            require_mutual_authentication: false,
            channel_bindings: None,
            embed_in_spnego: true,
            max_rounds: 8,
            target_name: None,
            ntlm: NtlmOptions::default(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn preferred_mechanisms(self, mechanisms: impl Into<Vec<MechanismIdentifier>>) -> Self {
        Self { preferred_mechanisms: mechanisms.into(), ..self }
    }
    #[must_use]
    pub fn require_confidentiality(self, required: bool) -> Self {
        Self { require_confidentiality: required, ..self }
    }
    #[must_use]
    pub fn require_mutual_authentication(self, required: bool) -> Self {
        Self { require_mutual_authentication: required, ..self }
    }
    #[must_use]
    pub fn channel_bindings(self, application_data: impl Into<Vec<u8>>) -> Self {
        Self { channel_bindings: Some(application_data.into()), ..self }
    }
    #[must_use]
    pub fn embed_in_spnego(self, embed: bool) -> Self {
        Self { embed_in_spnego: embed, ..self }
    }
    #[must_use]
    pub fn max_rounds(self, rounds: usize) -> Self {
        Self { max_rounds: rounds, ..self }
    }
    #[must_use]
    pub fn target_name(self, spn: impl Into<String>) -> Self {
        Self { target_name: Some(spn.into()), ..self }
    }
    #[must_use]
    pub fn ntlm(self, ntlm: NtlmOptions) -> Self {
        Self { ntlm, ..self }
    }
}

/// NTLM-specific knobs.
#[derive(Debug, Clone)]
pub struct NtlmOptions {
    pub allow_128_bit: bool,
    pub allow_56_bit: bool,
    /// Client workstation name sent in the Authenticate message.
    pub workstation: Option<String>,
    /// NetBIOS computer name the acceptor advertises in its Challenge.
    pub server_name: String,
    /// NetBIOS domain name the acceptor advertises in its Challenge.
    pub server_domain: String,
    /// DNS names the acceptor advertises, if any.
    pub dns_computer_name: Option<String>,
    pub dns_domain_name: Option<String>,
    /// Version block to send. `None` stops NEGOTIATE_VERSION from being offered.
    pub version: Option<Version>,
}

impl Default for NtlmOptions {
    fn default() -> Self {
        Self {
            allow_128_bit: true,
            allow_56_bit: true,
            workstation: None,
            server_name: "SERVER".into(),
            server_domain: "WORKGROUP".into(),
            dns_computer_name: None,
            dns_domain_name: None,
            version: Some(Version::default()),
        }
    }
}

/// A user's NTLM secret. Only the NT hash is kept; the password is dropped
/// as soon as it has been hashed.
#[derive(Clone)]
pub struct NtlmCredential {
    pub username: String,
    pub domain: String,
    nt_hash: [u8; 16],
}

impl NtlmCredential {
    pub fn with_password(username: impl Into<String>, domain: impl Into<String>, password: &str) -> Self {
        Self { username: username.into(), domain: domain.into(), nt_hash: nt_hash(password) }
    }

    pub fn with_nt_hash(username: impl Into<String>, domain: impl Into<String>, nt_hash: [u8; 16]) -> Self {
        Self { username: username.into(), domain: domain.into(), nt_hash }
    }

    /// Splits `DOMAIN\user`; a UPN (`user@realm`) or a bare name is kept whole
    /// with an empty domain.
    pub fn from_principal(principal: &str, password: &str) -> Self {
        match principal.split_once('\\') {
            Some((domain, user)) => Self::with_password(user, domain, password),
            None => Self::with_password(principal, "", password),
        }
    }

    pub fn nt_hash(&self) -> &[u8; 16] {
        &self.nt_hash
    }
}

impl fmt::Debug for NtlmCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NtlmCredential")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Initiator credentials. The NTLM secret drives the built-in engine; the
/// principal and lifetime are handed to native providers untouched.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub ntlm: Option<NtlmCredential>,
    pub principal: Option<String>,
    pub lifetime: Option<Duration>,
}

impl Credentials {
    pub fn ntlm(credential: NtlmCredential) -> Self {
        Self { principal: Some(credential.username.clone()), ntlm: Some(credential), lifetime: None }
    }

    #[must_use]
    pub fn principal(self, principal: impl Into<String>) -> Self {
        Self { principal: Some(principal.into()), ..self }
    }

    #[must_use]
    pub fn lifetime(self, lifetime: Duration) -> Self {
        Self { lifetime: Some(lifetime), ..self }
    }
}

/// Acceptor-side lookup of NT hashes.
pub trait UserStore: Send + Sync {
    /// The NT hash for `user` in `domain`, as named by the client.
    fn nt_hash(&self, user: &str, domain: &str) -> Option<[u8; 16]>;
}

/// A [`UserStore`] kept in memory. Names compare case-insensitively and an
/// entry added with an empty domain matches any domain.
#[derive(Debug, Default, Clone)]
pub struct InMemoryUserStore {
    users: HashMap<(String, String), [u8; 16]>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_password(mut self, user: &str, domain: &str, password: &str) -> Self {
        self.insert(user, domain, nt_hash(password));
        self
    }

    pub fn insert(&mut self, user: &str, domain: &str, nt_hash: [u8; 16]) {
        self.users.insert((user.to_uppercase(), domain.to_uppercase()), nt_hash);
    }
}

impl UserStore for InMemoryUserStore {
    fn nt_hash(&self, user: &str, domain: &str) -> Option<[u8; 16]> {
        let user = user.to_uppercase();
        self.users
            .get(&(user.clone(), domain.to_uppercase()))
            .or_else(|| self.users.get(&(user, String::new())))
            .copied()
    }
}

include!("config_test.rs");
