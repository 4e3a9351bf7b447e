//! AV_PAIR target information ([MS-NLMP] 2.2.2.1).
//!
//! Attribute IDs this crate does not understand are kept as opaque pairs and
//! written back unchanged.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::crypto::utf16le;
use crate::error::{Error, Result};

const MSV_AV_EOL: u16 = 0x0000;
const MSV_AV_NB_COMPUTER_NAME: u16 = 0x0001;
const MSV_AV_NB_DOMAIN_NAME: u16 = 0x0002;
const MSV_AV_DNS_COMPUTER_NAME: u16 = 0x0003;
const MSV_AV_DNS_DOMAIN_NAME: u16 = 0x0004;
const MSV_AV_DNS_TREE_NAME: u16 = 0x0005;
const MSV_AV_FLAGS: u16 = 0x0006;
const MSV_AV_TIMESTAMP: u16 = 0x0007;
const MSV_AV_SINGLE_HOST: u16 = 0x0008;
const MSV_AV_TARGET_NAME: u16 = 0x0009;
const MSV_AV_CHANNEL_BINDINGS: u16 = 0x000a;

/// `MsvAvFlags` bit: the Authenticate message carries a MIC.
pub const AV_FLAG_MIC_PRESENT: u32 = 0x0000_0002;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvPair {
    NbComputerName(String),
    NbDomainName(String),
    DnsComputerName(String),
    DnsDomainName(String),
    DnsTreeName(String),
    Flags(u32),
    /// FILETIME, 100ns intervals since 1601-01-01.
    Timestamp(u64),
    SingleHost(Vec<u8>),
    TargetName(String),
    /// MD5 of the channel-binding structure.
    ChannelBindings([u8; 16]),
    Unknown { id: u16, value: Vec<u8> },
}

/// Ordered AV pair list. An empty list encodes to zero bytes; a non-empty
/// list is terminated by `MsvAvEOL`, which is not stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetInfo(pub Vec<AvPair>);

fn utf16_value(value: &[u8]) -> Result<String> {
    if value.len() % 2 != 0 {
        return Err(Error::malformed("odd-length AV pair string"));
    }
    let units: Vec<u16> = value.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16(&units).map_err(|_| Error::malformed("invalid UTF-16 in AV pair"))
}

fn fixed<const N: usize>(value: &[u8]) -> Result<[u8; N]> {
    value
        .try_into()
        .map_err(|_| Error::malformed(format!("AV pair value must be {N} bytes")))
}

impl AvPair {
    fn id_and_value(&self) -> (u16, Vec<u8>) {
        match self {
            AvPair::NbComputerName(s) => (MSV_AV_NB_COMPUTER_NAME, utf16le(s)),
            AvPair::NbDomainName(s) => (MSV_AV_NB_DOMAIN_NAME, utf16le(s)),
            AvPair::DnsComputerName(s) => (MSV_AV_DNS_COMPUTER_NAME, utf16le(s)),
            AvPair::DnsDomainName(s) => (MSV_AV_DNS_DOMAIN_NAME, utf16le(s)),
            AvPair::DnsTreeName(s) => (MSV_AV_DNS_TREE_NAME, utf16le(s)),
            AvPair::Flags(flags) => (MSV_AV_FLAGS, flags.to_le_bytes().to_vec()),
            AvPair::Timestamp(ts) => (MSV_AV_TIMESTAMP, ts.to_le_bytes().to_vec()),
            AvPair::SingleHost(data) => (MSV_AV_SINGLE_HOST, data.clone()),
            AvPair::TargetName(s) => (MSV_AV_TARGET_NAME, utf16le(s)),
            AvPair::ChannelBindings(hash) => (MSV_AV_CHANNEL_BINDINGS, hash.to_vec()),
            AvPair::Unknown { id, value } => (*id, value.clone()),
        }
    }

    fn parse(id: u16, value: &[u8]) -> Result<Self> {
        Ok(match id {
            MSV_AV_NB_COMPUTER_NAME => AvPair::NbComputerName(utf16_value(value)?),
            MSV_AV_NB_DOMAIN_NAME => AvPair::NbDomainName(utf16_value(value)?),
            MSV_AV_DNS_COMPUTER_NAME => AvPair::DnsComputerName(utf16_value(value)?),
            MSV_AV_DNS_DOMAIN_NAME => AvPair::DnsDomainName(utf16_value(value)?),
            MSV_AV_DNS_TREE_NAME => AvPair::DnsTreeName(utf16_value(value)?),
            MSV_AV_FLAGS => AvPair::Flags(u32::from_le_bytes(fixed(value)?)),
            MSV_AV_TIMESTAMP => AvPair::Timestamp(u64::from_le_bytes(fixed(value)?)),
            MSV_AV_SINGLE_HOST => AvPair::SingleHost(value.to_vec()),
            MSV_AV_TARGET_NAME => AvPair::TargetName(utf16_value(value)?),
            MSV_AV_CHANNEL_BINDINGS => AvPair::ChannelBindings(fixed(value)?),
            id => AvPair::Unknown { id, value: value.to_vec() },
        })
    }
}

impl TargetInfo {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        if self.0.is_empty() {
            return Vec::new();
        }
        let mut buf = Vec::new();
        for pair in &self.0 {
            let (id, value) = pair.id_and_value();
            // Writes into a Vec cannot fail.
            let _ = buf.write_u16::<LittleEndian>(id);
            let _ = buf.write_u16::<LittleEndian>(value.len() as u16);
            let _ = buf.write_all(&value);
        }
        buf.extend_from_slice(&[0u8; 4]);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut pairs = Vec::new();
        if data.is_empty() {
            return Ok(Self(pairs));
        }
        let mut cursor = io::Cursor::new(data);
        loop {
            let id = cursor.read_u16::<LittleEndian>()?;
            let len = cursor.read_u16::<LittleEndian>()? as usize;
            if id == MSV_AV_EOL {
                break;
            }
            let remaining = data.len() - cursor.position() as usize;
            if len > remaining {
                return Err(Error::malformed("AV pair extends beyond target info"));
            }
            let mut value = vec![0u8; len];
            cursor.read_exact(&mut value)?;
            pairs.push(AvPair::parse(id, &value)?);
        }
        Ok(Self(pairs))
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.0.iter().find_map(|pair| match pair {
            AvPair::Timestamp(ts) => Some(*ts),
            _ => None,
        })
    }

    pub fn flags(&self) -> u32 {
        self.0
            .iter()
            .find_map(|pair| match pair {
                AvPair::Flags(flags) => Some(*flags),
                _ => None,
            })
            .unwrap_or(0)
    }

    pub fn channel_bindings(&self) -> Option<[u8; 16]> {
        self.0.iter().find_map(|pair| match pair {
            AvPair::ChannelBindings(hash) => Some(*hash),
            _ => None,
        })
    }

    /// Replaces the first pair with the same kind as `pair`, or appends it.
    pub fn set(&mut self, pair: AvPair) {
        let same_kind = |existing: &AvPair| existing.id_and_value().0 == pair.id_and_value().0;
        match self.0.iter_mut().find(|existing| same_kind(existing)) {
            Some(slot) => *slot = pair,
            None => self.0.push(pair),
        }
    }
}

include!("target_info_test.rs");
