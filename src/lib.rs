//! SPNEGO security-context negotiation with a built-in NTLMv2 mechanism and
//! pluggable native providers for Kerberos and the platform's SSP.
//!
//! ```no_run
//! use std::sync::Arc;
//! use spnego::{Config, ContextBuilder, Credentials, InMemoryUserStore, NtlmCredential, StepOut};
//!
//! # fn main() -> spnego::Result<()> {
//! let credential = NtlmCredential::with_password("alice", "EXAMPLE", "secret");
//! let client = ContextBuilder::initiator()
//!     .config(Config::default())
//!     .credentials(Credentials::ntlm(credential))
//!     .build()?;
//! let users = InMemoryUserStore::new().with_password("alice", "EXAMPLE", "secret");
//! let server = ContextBuilder::acceptor().user_store(Arc::new(users)).build()?;
//!
//! let StepOut::Pending(_client, token) = client.step(None)? else { unreachable!() };
//! let _reply = server.step(Some(&token))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod mech;
pub mod ntlm;
pub mod oid;
pub mod spnego;

pub use config::{Config, Credentials, InMemoryUserStore, NtlmCredential, NtlmOptions, UserStore};
pub use context::{ContextBuilder, NegotiationState, PendingContext, SecurityContext, StepOut};
pub use error::{Disposition, Error, ErrorCode, Result};
pub use mech::{
    Capabilities, ContextStatus, CredentialHandle, IovBuffer, IovKind, NativeContext, NativeProvider, Role, Unwrapped,
    Wrapped,
};
pub use oid::MechanismIdentifier;
pub use spnego::{NegState, NegTokenInit, NegTokenResp, NegotiationToken};
