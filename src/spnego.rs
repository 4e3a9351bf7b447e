//! SPNEGO negotiation tokens (RFC 4178, MS-SPNG) and their DER encoding.
//!
//! ```text
//! InitialContextToken ::= [APPLICATION 0] IMPLICIT SEQUENCE {
//!     thisMech            MechType,                 -- 1.3.6.1.5.5.2
//!     innerContextToken   NegotiationToken }
//!
//! NegotiationToken ::= CHOICE {
//!     negTokenInit    [0] NegTokenInit,
//!     negTokenResp    [1] NegTokenResp }
//! ```
//!
//! Init tokens are emitted inside the InitialContextToken framing; response
//! tokens are emitted bare. Both forms of an init token are accepted.
//!
//! The public token types own their data. Decoding goes through borrowed
//! `der` structures that mirror the ASN.1 module one to one.

use der::asn1::{AnyRef, BitString, ObjectIdentifier, OctetStringRef};
use der::{
    Choice, Decode, DecodeValue, Encode, EncodeValue, Enumerated, FixedTag, Header, Length, Reader, Sequence,
    SliceReader, Tag, TagNumber, Tagged, Writer,
};

use crate::error::{Error, Result};
use crate::oid::MechanismIdentifier;

/// `negState` of a NegTokenResp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enumerated)]
#[asn1(type = "ENUMERATED")]
#[repr(u8)]
pub enum NegState {
    AcceptCompleted = 0,
    AcceptIncomplete = 1,
    Reject = 2,
    RequestMic = 3,
}

/// NegTokenInit2 hints (MS-SPNG 2.2.1).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NegHints {
    pub hint_name: Option<String>,
    pub hint_address: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegTokenInit {
    /// Mechanisms in the sender's order of preference. Never empty.
    pub mech_types: Vec<MechanismIdentifier>,
    /// Optimistic token for `mech_types[0]`.
    pub mech_token: Option<Vec<u8>>,
    pub neg_hints: Option<NegHints>,
    pub mech_list_mic: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NegTokenResp {
    pub neg_state: Option<NegState>,
    pub supported_mech: Option<MechanismIdentifier>,
    pub response_token: Option<Vec<u8>>,
    pub mech_list_mic: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationToken {
    Init(NegTokenInit),
    Response(NegTokenResp),
}

const INITIAL_CONTEXT_TOKEN_TAG: u8 = 0x60;
const GENERAL_STRING_TAG: u8 = 0x1b;

/// The [APPLICATION 0] framing around an init token.
#[derive(Clone, Debug, Eq, PartialEq)]
struct InitialContextToken<'a> {
    this_mech: ObjectIdentifier,
    inner: NegotiationTokenRef<'a>,
}

impl FixedTag for InitialContextToken<'_> {
    const TAG: Tag = Tag::Application { constructed: true, number: TagNumber::N0 };
}

impl<'a> DecodeValue<'a> for InitialContextToken<'a> {
    fn decode_value<R: Reader<'a>>(reader: &mut R, _header: Header) -> der::Result<Self> {
        Ok(Self { this_mech: reader.decode()?, inner: reader.decode()? })
    }
}

impl EncodeValue for InitialContextToken<'_> {
    fn value_len(&self) -> der::Result<Length> {
        self.this_mech.encoded_len()? + self.inner.encoded_len()?
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        self.this_mech.encode(writer)?;
        self.inner.encode(writer)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Choice)]
enum NegotiationTokenRef<'a> {
    #[asn1(context_specific = "0", constructed = "true", tag_mode = "EXPLICIT")]
    Init(NegTokenInitRef<'a>),
    #[asn1(context_specific = "1", constructed = "true", tag_mode = "EXPLICIT")]
    Response(NegTokenRespRef<'a>),
}

/// NegTokenInit and NegTokenInit2 share tags [0] to [2]. Field [3] is
/// `negHints` (a SEQUENCE) in the latter and `mechListMIC` (an OCTET STRING)
/// in the former, so it is kept undecoded until its tag is known.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct NegTokenInitRef<'a> {
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    mech_types: Option<Vec<ObjectIdentifier>>,
    /// reqFlags carries nothing acted on here.
    #[asn1(context_specific = "1", optional = "true", tag_mode = "EXPLICIT")]
    req_flags: Option<BitString>,
    #[asn1(context_specific = "2", optional = "true", tag_mode = "EXPLICIT")]
    mech_token: Option<OctetStringRef<'a>>,
    #[asn1(context_specific = "3", optional = "true", tag_mode = "EXPLICIT")]
    hints_or_mic: Option<AnyRef<'a>>,
    #[asn1(context_specific = "4", optional = "true", tag_mode = "EXPLICIT")]
    mech_list_mic: Option<OctetStringRef<'a>>,
}

/// `hintName` is an explicitly tagged GeneralString; the [0] wrapper is read
/// as an implicit constructed value holding the whole GeneralString TLV.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct NegHintsRef<'a> {
    #[asn1(context_specific = "0", optional = "true", tag_mode = "IMPLICIT", constructed = "true")]
    hint_name: Option<AnyRef<'a>>,
    #[asn1(context_specific = "1", optional = "true", tag_mode = "EXPLICIT")]
    hint_address: Option<OctetStringRef<'a>>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct NegTokenRespRef<'a> {
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    neg_state: Option<NegState>,
    #[asn1(context_specific = "1", optional = "true", tag_mode = "EXPLICIT")]
    supported_mech: Option<ObjectIdentifier>,
    #[asn1(context_specific = "2", optional = "true", tag_mode = "EXPLICIT")]
    response_token: Option<OctetStringRef<'a>>,
    #[asn1(context_specific = "3", optional = "true", tag_mode = "EXPLICIT")]
    mech_list_mic: Option<OctetStringRef<'a>>,
}

fn octets(value: Option<&[u8]>) -> Result<Option<OctetStringRef<'_>>> {
    Ok(value.map(OctetStringRef::new).transpose()?)
}

fn owned(value: Option<OctetStringRef<'_>>) -> Option<Vec<u8>> {
    value.map(|octets| octets.as_bytes().to_vec())
}

fn encode_general_string(value: &str) -> Result<Vec<u8>> {
    let mut tlv = vec![GENERAL_STRING_TAG];
    tlv.extend(Length::try_from(value.len())?.to_der()?);
    tlv.extend_from_slice(value.as_bytes());
    Ok(tlv)
}

fn decode_general_string(tlv: &[u8]) -> Result<String> {
    let Some((&GENERAL_STRING_TAG, rest)) = tlv.split_first() else {
        return Err(Error::malformed("hintName is not a GeneralString"));
    };
    let mut reader = SliceReader::new(rest)?;
    let len = Length::decode(&mut reader)?;
    let value = reader.read_slice(len)?;
    reader.finish(())?;
    String::from_utf8(value.to_vec()).map_err(|_| Error::malformed("hintName is not text"))
}

impl NegHints {
    fn to_der(&self) -> Result<Vec<u8>> {
        let name = self.hint_name.as_deref().map(encode_general_string).transpose()?;
        let hint_name_tag = Tag::ContextSpecific { constructed: true, number: TagNumber::N0 };
        let hints = NegHintsRef {
            hint_name: name.as_deref().map(|tlv| AnyRef::new(hint_name_tag, tlv)).transpose()?,
            hint_address: octets(self.hint_address.as_deref())?,
        };
        Ok(hints.to_der()?)
    }

    fn from_der(der: &[u8]) -> Result<Self> {
        let hints = NegHintsRef::from_der(der)?;
        Ok(Self {
            hint_name: hints.hint_name.map(|name| decode_general_string(name.value())).transpose()?,
            hint_address: owned(hints.hint_address),
        })
    }
}

impl NegTokenInit {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let hints = self.neg_hints.as_ref().map(NegHints::to_der).transpose()?;
        // NegTokenInit2 moves the MIC from [3] to [4] when hints are present.
        let (hints_or_mic, mech_list_mic) = match (&hints, &self.mech_list_mic) {
            (Some(hints), mic) => (Some(AnyRef::from_der(hints)?), octets(mic.as_deref())?),
            (None, Some(mic)) => (Some(AnyRef::new(Tag::OctetString, mic)?), None),
            (None, None) => (None, None),
        };
        let init = NegTokenInitRef {
            mech_types: Some(self.mech_types.iter().map(MechanismIdentifier::as_oid).collect()),
            req_flags: None,
            mech_token: octets(self.mech_token.as_deref())?,
            hints_or_mic,
            mech_list_mic,
        };
        let token = InitialContextToken {
            this_mech: MechanismIdentifier::SPNEGO.as_oid(),
            inner: NegotiationTokenRef::Init(init),
        };
        Ok(token.to_der()?)
    }

    fn from_ref(init: NegTokenInitRef<'_>) -> Result<Self> {
        let mech_types: Vec<MechanismIdentifier> = init
            .mech_types
            .ok_or_else(|| Error::malformed("NegTokenInit without mechTypes"))?
            .into_iter()
            .map(MechanismIdentifier::from)
            .collect();
        if mech_types.is_empty() {
            return Err(Error::malformed("empty mechanism list"));
        }
        let (neg_hints, field_three_mic) = match init.hints_or_mic {
            Some(field) if field.tag() == Tag::Sequence => (Some(NegHints::from_der(&field.to_der()?)?), None),
            Some(field) if field.tag() == Tag::OctetString => (None, Some(field.value().to_vec())),
            Some(field) => return Err(Error::malformed(format!("unexpected {} in NegTokenInit field [3]", field.tag()))),
            None => (None, None),
        };
        Ok(Self {
            mech_types,
            mech_token: owned(init.mech_token),
            neg_hints,
            mech_list_mic: owned(init.mech_list_mic).or(field_three_mic),
        })
    }
}

impl NegTokenResp {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let resp = NegTokenRespRef {
            neg_state: self.neg_state,
            supported_mech: self.supported_mech.as_ref().map(MechanismIdentifier::as_oid),
            response_token: octets(self.response_token.as_deref())?,
            mech_list_mic: octets(self.mech_list_mic.as_deref())?,
        };
        Ok(NegotiationTokenRef::Response(resp).to_der()?)
    }

    fn from_ref(resp: NegTokenRespRef<'_>) -> Self {
        Self {
            neg_state: resp.neg_state,
            supported_mech: resp.supported_mech.map(MechanismIdentifier::from),
            response_token: owned(resp.response_token),
            mech_list_mic: owned(resp.mech_list_mic),
        }
    }
}

impl NegotiationToken {
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            NegotiationToken::Init(init) => init.encode(),
            NegotiationToken::Response(resp) => resp.encode(),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let token = if data.first() == Some(&INITIAL_CONTEXT_TOKEN_TAG) {
            let framed = InitialContextToken::from_der(data)?;
            let this_mech = MechanismIdentifier::from(framed.this_mech);
            if this_mech != MechanismIdentifier::SPNEGO {
                return Err(Error::malformed(format!("not a SPNEGO token (mechanism {this_mech})")));
            }
            framed.inner
        } else {
            NegotiationTokenRef::from_der(data)?
        };
        match token {
            NegotiationTokenRef::Init(init) => Ok(NegotiationToken::Init(NegTokenInit::from_ref(init)?)),
            NegotiationTokenRef::Response(resp) => Ok(NegotiationToken::Response(NegTokenResp::from_ref(resp))),
        }
    }
}

include!("spnego_test.rs");
