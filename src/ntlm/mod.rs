//! Built-in NTLMv2 mechanism ([MS-NLMP]).
//!
//! [`NtlmClient`] and [`NtlmServer`] drive the three-message exchange and
//! hand over a [`SessionKeys`] for message protection once established.

pub mod crypto;
mod engine;
mod messages;
mod session;
mod target_info;

pub use engine::{ClientState, FixedInputs, NtlmClient, NtlmServer, ServerState};
pub use messages::{
    AuthenticateMessage, ChallengeMessage, NegotiateFlags, NegotiateMessage, NtlmMessage, Version, MIC_LEN,
    MIC_OFFSET, NTLMSSP_SIGNATURE,
};
pub use session::{SessionKeys, SIGNATURE_LEN};
pub use target_info::{AvPair, TargetInfo, AV_FLAG_MIC_PRESENT};
