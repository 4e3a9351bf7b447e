//! Mechanism object identifiers.

use std::fmt;
use std::str::FromStr;

use der::asn1::ObjectIdentifier;
use der::{Decode, Encode};

use crate::error::{Error, Result};

/// An object identifier naming a GSS mechanism.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MechanismIdentifier(ObjectIdentifier);

impl MechanismIdentifier {
    /// Kerberos 5, `1.2.840.113554.1.2.2`.
    pub const KERBEROS: Self = Self(ObjectIdentifier::new_unwrap("1.2.840.113554.1.2.2"));
    /// Legacy Microsoft Kerberos 5, `1.2.840.48018.1.2.2`.
    pub const MS_KERBEROS: Self = Self(ObjectIdentifier::new_unwrap("1.2.840.48018.1.2.2"));
    /// NTLMSSP, `1.3.6.1.4.1.311.2.2.10`.
    pub const NTLM: Self = Self(ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.2.10"));
    /// NegoEx, `1.3.6.1.4.1.311.2.2.30`.
    pub const NEGOEX: Self = Self(ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.2.30"));
    /// SPNEGO itself, `1.3.6.1.5.5.2`.
    pub const SPNEGO: Self = Self(ObjectIdentifier::new_unwrap("1.3.6.1.5.5.2"));

    /// Builds an identifier from its arcs, e.g. `[1, 3, 6, 1, 5, 5, 2]`.
    pub fn from_arcs(arcs: &[u32]) -> Result<Self> {
        // The first two arcs share one subidentifier.
        let [first, second, ..] = arcs else {
            return Err(Error::malformed("object identifier needs at least two arcs"));
        };
        if first.checked_mul(40).and_then(|v| v.checked_add(*second)).is_none() {
            return Err(Error::malformed(format!("object identifier arcs {first}.{second} overflow")));
        }
        ObjectIdentifier::from_arcs(arcs.iter().copied())
            .map(Self)
            .map_err(|err| Error::malformed(format!("invalid object identifier: {err}")))
    }

    /// Wraps DER content octets after checking they form a valid OID.
    pub fn from_der_value(der: &[u8]) -> Result<Self> {
        ObjectIdentifier::from_bytes(der)
            .map(Self)
            .map_err(|err| Error::malformed(format!("invalid object identifier: {err}")))
    }

    pub fn as_der_value(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn as_oid(&self) -> ObjectIdentifier {
        self.0
    }

    pub fn arcs(&self) -> Vec<u32> {
        self.0.arcs().collect()
    }

    /// Human-readable name for the well-known mechanisms.
    pub fn name(&self) -> Option<&'static str> {
        if *self == Self::KERBEROS {
            Some("kerberos")
        } else if *self == Self::MS_KERBEROS {
            Some("ms-kerberos")
        } else if *self == Self::NTLM {
            Some("ntlm")
        } else if *self == Self::NEGOEX {
            Some("negoex")
        } else if *self == Self::SPNEGO {
            Some("spnego")
        } else {
            None
        }
    }

    pub fn is_kerberos(&self) -> bool {
        *self == Self::KERBEROS || *self == Self::MS_KERBEROS
    }
}

impl From<ObjectIdentifier> for MechanismIdentifier {
    fn from(oid: ObjectIdentifier) -> Self {
        Self(oid)
    }
}

/// DER `SEQUENCE OF OBJECT IDENTIFIER`, the MechTypeList the negotiation MIC covers.
pub fn encode_mech_list(mechs: &[MechanismIdentifier]) -> Result<Vec<u8>> {
    let list: Vec<ObjectIdentifier> = mechs.iter().map(MechanismIdentifier::as_oid).collect();
    Ok(list.to_der()?)
}

pub fn decode_mech_list(value: &[u8]) -> Result<Vec<MechanismIdentifier>> {
    let list = Vec::<ObjectIdentifier>::from_der(value)?;
    if list.is_empty() {
        return Err(Error::malformed("empty mechanism list"));
    }
    Ok(list.into_iter().map(MechanismIdentifier).collect())
}

impl fmt::Display for MechanismIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for MechanismIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}({self})"),
            None => write!(f, "Oid({self})"),
        }
    }
}

impl FromStr for MechanismIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kerberos" => return Ok(Self::KERBEROS),
            "ntlm" => return Ok(Self::NTLM),
            "negoex" => return Ok(Self::NEGOEX),
            _ => {}
        }
        let arcs = s
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::malformed(format!("invalid object identifier '{s}'")))?;
        Self::from_arcs(&arcs)
    }
}

include!("oid_test.rs");
