#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn well_known_oids_render_dotted() {
        assert_eq!(MechanismIdentifier::KERBEROS.to_string(), "1.2.840.113554.1.2.2");
        assert_eq!(MechanismIdentifier::MS_KERBEROS.to_string(), "1.2.840.48018.1.2.2");
        assert_eq!(MechanismIdentifier::NTLM.to_string(), "1.3.6.1.4.1.311.2.2.10");
        assert_eq!(MechanismIdentifier::NEGOEX.to_string(), "1.3.6.1.4.1.311.2.2.30");
        assert_eq!(MechanismIdentifier::SPNEGO.to_string(), "1.3.6.1.5.5.2");
    }

    #[test]
    fn content_octets_match_known_encodings() {
        assert_eq!(MechanismIdentifier::KERBEROS.as_der_value(), hex!("2a864886f712010202"));
        assert_eq!(MechanismIdentifier::MS_KERBEROS.as_der_value(), hex!("2a864882f712010202"));
        assert_eq!(MechanismIdentifier::NTLM.as_der_value(), hex!("2b06010401823702020a"));
        assert_eq!(MechanismIdentifier::SPNEGO.as_der_value(), hex!("2b0601050502"));
        assert_eq!(MechanismIdentifier::from_der_value(&hex!("2b06010401823702021e")).unwrap(), MechanismIdentifier::NEGOEX);
    }

    #[test]
    fn parses_dotted_form() {
        let oid: MechanismIdentifier = "1.2.840.113554.1.2.2".parse().unwrap();
        assert_eq!(oid, MechanismIdentifier::KERBEROS);
        assert_eq!("NTLM".parse::<MechanismIdentifier>().unwrap(), MechanismIdentifier::NTLM);
        assert!("1.2.x".parse::<MechanismIdentifier>().is_err());
        assert!("3.1".parse::<MechanismIdentifier>().is_err());
        assert!("1.3.6.99999999999".parse::<MechanismIdentifier>().is_err());
    }

    #[test]
    fn oversized_leading_arcs_are_rejected() {
        assert!(MechanismIdentifier::from_arcs(&[2, u32::MAX, 1]).is_err());
        assert!(MechanismIdentifier::from_arcs(&[u32::MAX, 1]).is_err());
        assert!(MechanismIdentifier::from_arcs(&[1]).is_err());
        assert!(MechanismIdentifier::from_arcs(&[1, 40]).is_err());
        let oid = MechanismIdentifier::from_arcs(&[1, 3, 6, 1, 5, 5, 2]).unwrap();
        assert_eq!(oid, MechanismIdentifier::SPNEGO);
        assert_eq!(oid.arcs(), vec![1, 3, 6, 1, 5, 5, 2]);
    }

    #[test]
    fn mech_list_rejects_empty_sequence() {
        assert!(decode_mech_list(&[0x30, 0x00]).is_err());
        let list = [MechanismIdentifier::NTLM, MechanismIdentifier::KERBEROS];
        let encoded = encode_mech_list(&list).unwrap();
        assert_eq!(encoded, hex!("3017 060a2b06010401823702020a 06092a864886f712010202"));
        assert_eq!(decode_mech_list(&encoded).unwrap(), list);
    }
}
