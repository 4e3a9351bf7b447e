//! Error type shared by the codec, the NTLM engine, the mechanism adapters and
//! the negotiator.
//!
//! Every failure is returned to the caller; nothing in this crate retries a
//! handshake step. [`Error::disposition`] tells the caller whether another
//! mechanism is worth trying or whether the peer should be abandoned.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error codes. The discriminants are the GSS-API routine error
/// numbers of RFC 2744, so `code << 16` is the matching major status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    BadMech = 1,
    BadName = 2,
    BadNameType = 3,
    BadBindings = 4,
    BadStatus = 5,
    BadMic = 6,
    NoCred = 7,
    NoContext = 8,
    InvalidToken = 9,
    InvalidCredential = 10,
    CredentialsExpired = 11,
    ContextExpired = 12,
    Failure = 13,
    BadQop = 14,
    Unauthorized = 15,
    Unavailable = 16,
    DuplicateElement = 17,
    NameNotMn = 18,
}

const ROUTINE_ERROR_SHIFT: u32 = 16;

// SSPI SECURITY_STATUS values.
const SEC_E_UNSUPPORTED_FUNCTION: u32 = 0x8009_0302;
const SEC_E_INVALID_HANDLE: u32 = 0x8009_0301;
const SEC_E_TARGET_UNKNOWN: u32 = 0x8009_0303;
const SEC_E_INTERNAL_ERROR: u32 = 0x8009_0304;
const SEC_E_SECPKG_NOT_FOUND: u32 = 0x8009_0305;
const SEC_E_INVALID_TOKEN: u32 = 0x8009_0308;
const SEC_E_QOP_NOT_SUPPORTED: u32 = 0x8009_030A;
const SEC_E_LOGON_DENIED: u32 = 0x8009_030C;
const SEC_E_NO_CREDENTIALS: u32 = 0x8009_030E;
const SEC_E_MESSAGE_ALTERED: u32 = 0x8009_030F;
const SEC_E_CONTEXT_EXPIRED: u32 = 0x8009_0317;
const SEC_E_WRONG_PRINCIPAL: u32 = 0x8009_0322;
const SEC_E_BAD_BINDINGS: u32 = 0x8009_0346;

impl ErrorCode {
    /// Maps a GSS-API major status to its routine error, ignoring the
    /// calling-error and supplementary-information bits.
    pub fn from_gssapi(major: u32) -> Option<Self> {
        let code = match (major >> ROUTINE_ERROR_SHIFT) & 0xff {
            1 => Self::BadMech,
            2 => Self::BadName,
            3 => Self::BadNameType,
            4 => Self::BadBindings,
            5 => Self::BadStatus,
            6 => Self::BadMic,
            7 => Self::NoCred,
            8 => Self::NoContext,
            9 => Self::InvalidToken,
            10 => Self::InvalidCredential,
            11 => Self::CredentialsExpired,
            12 => Self::ContextExpired,
            13 => Self::Failure,
            14 => Self::BadQop,
            15 => Self::Unauthorized,
            16 => Self::Unavailable,
            17 => Self::DuplicateElement,
            18 => Self::NameNotMn,
            _ => return None,
        };
        Some(code)
    }

    /// Maps an SSPI `SECURITY_STATUS` (an HRESULT) to the closest code.
    pub fn from_sspi(status: i32) -> Option<Self> {
        let code = match status as u32 {
            SEC_E_SECPKG_NOT_FOUND => Self::BadMech,
            SEC_E_TARGET_UNKNOWN | SEC_E_WRONG_PRINCIPAL => Self::BadName,
            SEC_E_BAD_BINDINGS => Self::BadBindings,
            SEC_E_MESSAGE_ALTERED => Self::BadMic,
            SEC_E_NO_CREDENTIALS => Self::NoCred,
            SEC_E_INVALID_HANDLE => Self::NoContext,
            SEC_E_INVALID_TOKEN => Self::InvalidToken,
            SEC_E_CONTEXT_EXPIRED => Self::ContextExpired,
            SEC_E_INTERNAL_ERROR => Self::Failure,
            SEC_E_QOP_NOT_SUPPORTED => Self::BadQop,
            SEC_E_LOGON_DENIED => Self::Unauthorized,
            SEC_E_UNSUPPORTED_FUNCTION => Self::Unavailable,
            _ => return None,
        };
        Some(code)
    }

    /// The GSS-API major status carrying this routine error.
    pub fn gssapi_major(self) -> u32 {
        (self as u32) << ROUTINE_ERROR_SHIFT
    }
}

/// What a caller should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// This mechanism or configuration cannot work; another mechanism might.
    TryOtherMechanism,
    /// The peer misbehaved or failed authentication. Do not continue with it.
    AbandonPeer,
    /// Only the current message is bad; the context stays usable.
    DiscardMessage,
}

/// Errors produced while negotiating or using a security context.
#[derive(Error, Debug)]
pub enum Error {
    /// A token or message is truncated, corrupt or uses an unsupported encoding.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// No mechanism or flag combination satisfies the configuration.
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// The peer's credentials did not verify, or the peer rejected ours.
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("No common mechanism between initiator and acceptor")]
    NoCommonMechanism,

    #[error("Negotiation exceeded {0} rounds")]
    NegotiationExceededRounds(usize),

    /// A negotiation MIC or message signature did not verify.
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    /// A message carried a sequence number older than the next expected one.
    #[error("Replay detected: expected sequence number {expected}, got {received}")]
    ReplayDetected { expected: u32, received: u32 },

    #[error("Channel bindings do not match")]
    BadBindings,

    #[error("No credential available: {0}")]
    NoCredential(String),

    /// The requested quality of protection cannot be provided by the context.
    #[error("Unsupported quality of protection: {0}")]
    UnsupportedQop(String),

    /// The sequence space of the context is exhausted.
    #[error("Security context has expired")]
    ContextExpired,

    /// Failure reported by a native mechanism provider.
    #[error("Provider error ({code:?}): {message}")]
    Provider { code: ErrorCode, message: String },

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// Error during hexadecimal decoding of a token given on the command line.
    #[error("Hex decoding failed: {0}")]
    HexDecoding(#[from] hex::FromHexError),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // Cursor reads only fail by running off the end of the buffer.
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::MalformedToken("truncated buffer".into())
        } else {
            Error::Io(err)
        }
    }
}

impl From<der::Error> for Error {
    fn from(err: der::Error) -> Self {
        Error::MalformedToken(format!("DER: {err}"))
    }
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedToken(msg.into())
    }

    /// The GSS-style error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::MalformedToken(_) | Error::HexDecoding(_) => ErrorCode::InvalidToken,
            Error::UnsupportedConfiguration(_) => ErrorCode::Unavailable,
            Error::AuthenticationRejected(_) => ErrorCode::Unauthorized,
            Error::NoCommonMechanism => ErrorCode::BadMech,
            Error::NegotiationExceededRounds(_) => ErrorCode::Failure,
            Error::IntegrityCheckFailed(_) => ErrorCode::BadMic,
            Error::ReplayDetected { .. } => ErrorCode::BadMic,
            Error::BadBindings => ErrorCode::BadBindings,
            Error::NoCredential(_) => ErrorCode::NoCred,
            Error::UnsupportedQop(_) => ErrorCode::BadQop,
            Error::ContextExpired => ErrorCode::ContextExpired,
            Error::Provider { code, .. } => *code,
            Error::Io(_) => ErrorCode::Failure,
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            Error::NoCommonMechanism
            | Error::UnsupportedConfiguration(_)
            | Error::NoCredential(_) => Disposition::TryOtherMechanism,
            Error::ReplayDetected { .. } | Error::UnsupportedQop(_) => Disposition::DiscardMessage,
            Error::Provider { code, .. } => match code {
                ErrorCode::BadMech
                | ErrorCode::NoCred
                | ErrorCode::InvalidCredential
                | ErrorCode::CredentialsExpired
                | ErrorCode::Unavailable => {
                    Disposition::TryOtherMechanism
                }
                _ => Disposition::AbandonPeer,
            },
            _ => Disposition::AbandonPeer,
        }
    }
}

include!("error_test.rs");
