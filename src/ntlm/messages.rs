//! NTLM message layouts ([MS-NLMP] 2.2.1).
//!
//! All integers are little-endian. Variable-length fields are referenced by
//! 8-byte descriptors (length, max-length, offset) relative to the message
//! start. Optional version blocks and the Authenticate MIC are detected from
//! the lowest payload offset, the same way Windows does.

use std::io::{self, Read, Write};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::target_info::TargetInfo;
use crate::error::{Error, Result};

/// NTLM signature - "NTLMSSP\0"
pub const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_HEADER_LEN: usize = 32;
const CHALLENGE_HEADER_LEN: usize = 48;
const AUTHENTICATE_HEADER_LEN: usize = 64;
const VERSION_LEN: usize = 8;
pub const MIC_LEN: usize = 16;
/// Offset of the MIC inside an Authenticate message.
pub const MIC_OFFSET: usize = AUTHENTICATE_HEADER_LEN + VERSION_LEN;

bitflags! {
    /// NTLM negotiation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NegotiateFlags: u32 {
        const NEGOTIATE_UNICODE = 0x0000_0001;
        const NEGOTIATE_OEM = 0x0000_0002;
        const REQUEST_TARGET = 0x0000_0004;
        const NEGOTIATE_SIGN = 0x0000_0010;
        const NEGOTIATE_SEAL = 0x0000_0020;
        const NEGOTIATE_DATAGRAM = 0x0000_0040;
        const NEGOTIATE_LM_KEY = 0x0000_0080;
        const NEGOTIATE_NTLM = 0x0000_0200;
        const ANONYMOUS = 0x0000_0800;
        const NEGOTIATE_DOMAIN_SUPPLIED = 0x0000_1000;
        const NEGOTIATE_WORKSTATION_SUPPLIED = 0x0000_2000;
        const NEGOTIATE_ALWAYS_SIGN = 0x0000_8000;
        const TARGET_TYPE_DOMAIN = 0x0001_0000;
        const TARGET_TYPE_SERVER = 0x0002_0000;
        const NEGOTIATE_EXTENDED_SESSIONSECURITY = 0x0008_0000;
        const NEGOTIATE_IDENTIFY = 0x0010_0000;
        const REQUEST_NON_NT_SESSION_KEY = 0x0040_0000;
        const NEGOTIATE_TARGET_INFO = 0x0080_0000;
        const NEGOTIATE_VERSION = 0x0200_0000;
        const NEGOTIATE_128 = 0x2000_0000;
        const NEGOTIATE_KEY_EXCH = 0x4000_0000;
        const NEGOTIATE_56 = 0x8000_0000;
    }
}

/// Product version block. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
    /// NTLM revision, 15 for current implementations.
    pub revision: u8,
}

impl Default for Version {
    fn default() -> Self {
        Self { major: 10, minor: 0, build: 17763, revision: 15 }
    }
}

impl Version {
    fn read(cursor: &mut io::Cursor<&[u8]>) -> Result<Self> {
        let major = cursor.read_u8()?;
        let minor = cursor.read_u8()?;
        let build = cursor.read_u16::<LittleEndian>()?;
        let mut reserved = [0u8; 3];
        cursor.read_exact(&mut reserved)?;
        let revision = cursor.read_u8()?;
        Ok(Self { major, minor, build, revision })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u8(self.major)?;
        buf.write_u8(self.minor)?;
        buf.write_u16::<LittleEndian>(self.build)?;
        buf.write_all(&[0u8; 3])?;
        buf.write_u8(self.revision)?;
        Ok(())
    }
}

/// NTLM Type 1 Message - Negotiate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateMessage {
    pub flags: NegotiateFlags,
    /// OEM domain name, only meaningful with NEGOTIATE_DOMAIN_SUPPLIED.
    /// Empty when not supplied.
    pub domain_name: String,
    pub workstation: String,
    /// Present exactly when `flags` contains NEGOTIATE_VERSION.
    pub version: Option<Version>,
}

/// NTLM Type 2 Message - Challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeMessage {
    pub flags: NegotiateFlags,
    /// Empty unless REQUEST_TARGET was set.
    pub target_name: String,
    pub server_challenge: [u8; 8],
    pub target_info: TargetInfo,
    /// Present exactly when `flags` contains NEGOTIATE_VERSION.
    pub version: Option<Version>,
}

/// NTLM Type 3 Message - Authenticate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateMessage {
    pub flags: NegotiateFlags,
    pub lm_challenge_response: Vec<u8>,
    pub nt_challenge_response: Vec<u8>,
    pub domain_name: String,
    pub user_name: String,
    pub workstation: String,
    /// Empty unless NEGOTIATE_KEY_EXCH was negotiated.
    pub encrypted_random_session_key: Vec<u8>,
    /// Present exactly when `flags` contains NEGOTIATE_VERSION. A MIC without
    /// a version still reserves the version block, written as zeros.
    pub version: Option<Version>,
    pub mic: Option<[u8; MIC_LEN]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NtlmMessage {
    Negotiate(NegotiateMessage),
    Challenge(ChallengeMessage),
    Authenticate(AuthenticateMessage),
}

/// Collects variable-length fields behind a fixed header.
struct Payload {
    header_len: usize,
    data: Vec<u8>,
}

impl Payload {
    fn new(header_len: usize) -> Self {
        Self { header_len, data: Vec::new() }
    }

    /// Writes the descriptor for `bytes` into `header` and queues the bytes.
    fn field(&mut self, header: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
        let len = u16::try_from(bytes.len())
            .map_err(|_| Error::malformed(format!("NTLM field of {} bytes is too long", bytes.len())))?;
        let offset = (self.header_len + self.data.len()) as u32;
        header.write_u16::<LittleEndian>(len)?;
        header.write_u16::<LittleEndian>(len)?;
        header.write_u32::<LittleEndian>(offset)?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    fn finish(self, mut header: Vec<u8>) -> Vec<u8> {
        debug_assert_eq!(header.len(), self.header_len);
        header.extend_from_slice(&self.data);
        header
    }
}

/// Reads a field descriptor and returns the referenced bytes and their offset.
fn read_field<'a>(cursor: &mut io::Cursor<&[u8]>, message: &'a [u8]) -> Result<(&'a [u8], usize)> {
    let length = cursor.read_u16::<LittleEndian>()? as usize;
    let _max_length = cursor.read_u16::<LittleEndian>()?;
    let offset = cursor.read_u32::<LittleEndian>()? as usize;
    let end = offset
        .checked_add(length)
        .filter(|end| *end <= message.len())
        .ok_or_else(|| Error::malformed("NTLM field extends beyond message"))?;
    Ok((&message[offset..end], offset))
}

fn encode_string(value: &str, unicode: bool) -> Vec<u8> {
    if unicode {
        super::crypto::utf16le(value)
    } else {
        value.as_bytes().to_vec()
    }
}

fn decode_string(bytes: &[u8], unicode: bool) -> Result<String> {
    if unicode {
        if bytes.len() % 2 != 0 {
            return Err(Error::malformed("odd-length UTF-16 string"));
        }
        let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        String::from_utf16(&units).map_err(|_| Error::malformed("invalid UTF-16 string"))
    } else {
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::malformed("invalid OEM string"))
    }
}

/// The version block and the NEGOTIATE_VERSION flag must agree, otherwise
/// the message would not decode to itself.
fn check_version(flags: NegotiateFlags, version: &Option<Version>) -> Result<()> {
    if flags.contains(NegotiateFlags::NEGOTIATE_VERSION) == version.is_some() {
        Ok(())
    } else {
        Err(Error::malformed("version block present without NEGOTIATE_VERSION, or missing with it"))
    }
}

fn write_preamble(buf: &mut Vec<u8>, message_type: u32) -> Result<()> {
    buf.write_all(NTLMSSP_SIGNATURE)?;
    buf.write_u32::<LittleEndian>(message_type)?;
    Ok(())
}

/// Checks the signature and returns the message type.
fn read_preamble(cursor: &mut io::Cursor<&[u8]>) -> Result<u32> {
    let mut signature = [0u8; 8];
    cursor.read_exact(&mut signature)?;
    if &signature != NTLMSSP_SIGNATURE {
        return Err(Error::malformed("invalid NTLM signature"));
    }
    Ok(cursor.read_u32::<LittleEndian>()?)
}

impl NegotiateMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        check_version(self.flags, &self.version)?;
        let header_len = NEGOTIATE_HEADER_LEN + if self.version.is_some() { VERSION_LEN } else { 0 };
        let mut header = Vec::with_capacity(header_len);
        let mut payload = Payload::new(header_len);

        write_preamble(&mut header, 1)?;
        header.write_u32::<LittleEndian>(self.flags.bits())?;
        payload.field(&mut header, self.domain_name.as_bytes())?;
        payload.field(&mut header, self.workstation.as_bytes())?;
        if let Some(version) = &self.version {
            version.write(&mut header)?;
        }
        Ok(payload.finish(header))
    }

    fn decode_body(data: &[u8], cursor: &mut io::Cursor<&[u8]>) -> Result<Self> {
        let flags = NegotiateFlags::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let (domain, domain_offset) = read_field(cursor, data)?;
        let (workstation, workstation_offset) = read_field(cursor, data)?;
        let payload_start = domain_offset.min(workstation_offset);
        let version = if flags.contains(NegotiateFlags::NEGOTIATE_VERSION)
            && payload_start >= NEGOTIATE_HEADER_LEN + VERSION_LEN
        {
            Some(Version::read(cursor)?)
        } else {
            None
        };
        Ok(Self {
            flags,
            domain_name: decode_string(domain, false)?,
            workstation: decode_string(workstation, false)?,
            version,
        })
    }
}

impl ChallengeMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        check_version(self.flags, &self.version)?;
        let unicode = self.flags.contains(NegotiateFlags::NEGOTIATE_UNICODE);
        let header_len = CHALLENGE_HEADER_LEN + if self.version.is_some() { VERSION_LEN } else { 0 };
        let mut header = Vec::with_capacity(header_len);
        let mut payload = Payload::new(header_len);

        write_preamble(&mut header, 2)?;
        let target_name = encode_string(&self.target_name, unicode);
        payload.field(&mut header, &target_name)?;
        header.write_u32::<LittleEndian>(self.flags.bits())?;
        header.write_all(&self.server_challenge)?;
        header.write_all(&[0u8; 8])?;
        payload.field(&mut header, &self.target_info.encode())?;
        if let Some(version) = &self.version {
            version.write(&mut header)?;
        }
        Ok(payload.finish(header))
    }

    fn decode_body(data: &[u8], cursor: &mut io::Cursor<&[u8]>) -> Result<Self> {
        let (target_name, name_offset) = read_field(cursor, data)?;
        let flags = NegotiateFlags::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let mut server_challenge = [0u8; 8];
        cursor.read_exact(&mut server_challenge)?;
        let _reserved = cursor.read_u64::<LittleEndian>()?;
        let (target_info, info_offset) = read_field(cursor, data)?;
        let version = if flags.contains(NegotiateFlags::NEGOTIATE_VERSION)
            && name_offset.min(info_offset) >= CHALLENGE_HEADER_LEN + VERSION_LEN
        {
            Some(Version::read(cursor)?)
        } else {
            None
        };
        Ok(Self {
            flags,
            target_name: decode_string(target_name, flags.contains(NegotiateFlags::NEGOTIATE_UNICODE))?,
            server_challenge,
            target_info: TargetInfo::decode(target_info)?,
            version,
        })
    }
}

impl AuthenticateMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        check_version(self.flags, &self.version)?;
        let unicode = self.flags.contains(NegotiateFlags::NEGOTIATE_UNICODE);
        let header_len = if self.mic.is_some() {
            MIC_OFFSET + MIC_LEN
        } else if self.version.is_some() {
            MIC_OFFSET
        } else {
            AUTHENTICATE_HEADER_LEN
        };
        let mut header = Vec::with_capacity(header_len);
        let mut payload = Payload::new(header_len);

        write_preamble(&mut header, 3)?;
        payload.field(&mut header, &self.lm_challenge_response)?;
        payload.field(&mut header, &self.nt_challenge_response)?;
        payload.field(&mut header, &encode_string(&self.domain_name, unicode))?;
        payload.field(&mut header, &encode_string(&self.user_name, unicode))?;
        payload.field(&mut header, &encode_string(&self.workstation, unicode))?;
        payload.field(&mut header, &self.encrypted_random_session_key)?;
        header.write_u32::<LittleEndian>(self.flags.bits())?;
        if header_len > AUTHENTICATE_HEADER_LEN {
            self.version.unwrap_or(Version { major: 0, minor: 0, build: 0, revision: 0 }).write(&mut header)?;
        }
        if let Some(mic) = &self.mic {
            header.write_all(mic)?;
        }
        Ok(payload.finish(header))
    }

    fn decode_body(data: &[u8], cursor: &mut io::Cursor<&[u8]>) -> Result<Self> {
        let (lm, lm_offset) = read_field(cursor, data)?;
        let (nt, nt_offset) = read_field(cursor, data)?;
        let (domain, domain_offset) = read_field(cursor, data)?;
        let (user, user_offset) = read_field(cursor, data)?;
        let (workstation, workstation_offset) = read_field(cursor, data)?;
        let (session_key, key_offset) = read_field(cursor, data)?;
        let flags = NegotiateFlags::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let payload_start = [lm_offset, nt_offset, domain_offset, user_offset, workstation_offset, key_offset]
            .into_iter()
            .min()
            .unwrap_or(AUTHENTICATE_HEADER_LEN);

        let version = if payload_start >= MIC_OFFSET {
            let version = Version::read(cursor)?;
            flags.contains(NegotiateFlags::NEGOTIATE_VERSION).then_some(version)
        } else {
            None
        };
        let mic = if payload_start >= MIC_OFFSET + MIC_LEN {
            let mut mic = [0u8; MIC_LEN];
            cursor.read_exact(&mut mic)?;
            Some(mic)
        } else {
            None
        };

        let unicode = flags.contains(NegotiateFlags::NEGOTIATE_UNICODE);
        Ok(Self {
            flags,
            lm_challenge_response: lm.to_vec(),
            nt_challenge_response: nt.to_vec(),
            domain_name: decode_string(domain, unicode)?,
            user_name: decode_string(user, unicode)?,
            workstation: decode_string(workstation, unicode)?,
            encrypted_random_session_key: session_key.to_vec(),
            version,
            mic,
        })
    }
}

impl NtlmMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            NtlmMessage::Negotiate(msg) => msg.encode(),
            NtlmMessage::Challenge(msg) => msg.encode(),
            NtlmMessage::Authenticate(msg) => msg.encode(),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = io::Cursor::new(data);
        match read_preamble(&mut cursor)? {
            1 => NegotiateMessage::decode_body(data, &mut cursor).map(NtlmMessage::Negotiate),
            2 => ChallengeMessage::decode_body(data, &mut cursor).map(NtlmMessage::Challenge),
            3 => AuthenticateMessage::decode_body(data, &mut cursor).map(NtlmMessage::Authenticate),
            other => Err(Error::malformed(format!("invalid NTLM message type {other}"))),
        }
    }

    /// Whether `data` starts with the NTLMSSP signature.
    pub fn is_ntlm(data: &[u8]) -> bool {
        data.starts_with(NTLMSSP_SIGNATURE)
    }
}

impl NegotiateMessage {
    pub fn decode(data: &[u8]) -> Result<Self> {
        match NtlmMessage::decode(data)? {
            NtlmMessage::Negotiate(msg) => Ok(msg),
            _ => Err(Error::malformed("expected NTLM negotiate message")),
        }
    }
}

impl ChallengeMessage {
    pub fn decode(data: &[u8]) -> Result<Self> {
        match NtlmMessage::decode(data)? {
            NtlmMessage::Challenge(msg) => Ok(msg),
            _ => Err(Error::malformed("expected NTLM challenge message")),
        }
    }
}

impl AuthenticateMessage {
    pub fn decode(data: &[u8]) -> Result<Self> {
        match NtlmMessage::decode(data)? {
            NtlmMessage::Authenticate(msg) => Ok(msg),
            _ => Err(Error::malformed("expected NTLM authenticate message")),
        }
    }
}

include!("messages_test.rs");
