#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ErrorCode; 18] = [
        ErrorCode::BadMech,
        ErrorCode::BadName,
        ErrorCode::BadNameType,
        ErrorCode::BadBindings,
        ErrorCode::BadStatus,
        ErrorCode::BadMic,
        ErrorCode::NoCred,
        ErrorCode::NoContext,
        ErrorCode::InvalidToken,
        ErrorCode::InvalidCredential,
        ErrorCode::CredentialsExpired,
        ErrorCode::ContextExpired,
        ErrorCode::Failure,
        ErrorCode::BadQop,
        ErrorCode::Unauthorized,
        ErrorCode::Unavailable,
        ErrorCode::DuplicateElement,
        ErrorCode::NameNotMn,
    ];

    #[test]
    fn gssapi_major_codes_map_to_routine_errors() {
        let table = [
            (0x0001_0000, ErrorCode::BadMech),
            (0x0002_0000, ErrorCode::BadName),
            (0x0003_0000, ErrorCode::BadNameType),
            (0x0004_0000, ErrorCode::BadBindings),
            (0x0005_0000, ErrorCode::BadStatus),
            (0x0006_0000, ErrorCode::BadMic),
            (0x0007_0000, ErrorCode::NoCred),
            (0x0008_0000, ErrorCode::NoContext),
            (0x0009_0000, ErrorCode::InvalidToken),
            (0x000a_0000, ErrorCode::InvalidCredential),
            (0x000b_0000, ErrorCode::CredentialsExpired),
            (0x000c_0000, ErrorCode::ContextExpired),
            (0x000d_0000, ErrorCode::Failure),
            (0x000e_0000, ErrorCode::BadQop),
            (0x000f_0000, ErrorCode::Unauthorized),
            (0x0010_0000, ErrorCode::Unavailable),
            (0x0011_0000, ErrorCode::DuplicateElement),
            (0x0012_0000, ErrorCode::NameNotMn),
        ];
        for (major, code) in table {
            assert_eq!(ErrorCode::from_gssapi(major), Some(code), "major {major:#010x}");
            assert_eq!(code.gssapi_major(), major);
        }
    }

    #[test]
    fn gssapi_supplementary_and_calling_bits_are_ignored() {
        // GSS_S_BAD_MIC with GSS_S_OLD_TOKEN, and a calling error on top.
        assert_eq!(ErrorCode::from_gssapi(0x0006_0004), Some(ErrorCode::BadMic));
        assert_eq!(ErrorCode::from_gssapi(0x0109_0000), Some(ErrorCode::InvalidToken));
        assert_eq!(ErrorCode::from_gssapi(0), None);
        assert_eq!(ErrorCode::from_gssapi(0x0000_0001), None);
        assert_eq!(ErrorCode::from_gssapi(0x0013_0000), None);
    }

    #[test]
    fn every_code_survives_the_gssapi_major_form() {
        for code in ALL {
            assert_eq!(ErrorCode::from_gssapi(code.gssapi_major()), Some(code));
        }
    }

    #[test]
    fn sspi_status_codes_map_to_common_codes() {
        let table = [
            (-2146893051, ErrorCode::BadMech),        // SEC_E_SECPKG_NOT_FOUND
            (-2146893053, ErrorCode::BadName),        // SEC_E_TARGET_UNKNOWN
            (-2146893022, ErrorCode::BadName),        // SEC_E_WRONG_PRINCIPAL
            (-2146892986, ErrorCode::BadBindings),    // SEC_E_BAD_BINDINGS
            (-2146893041, ErrorCode::BadMic),         // SEC_E_MESSAGE_ALTERED
            (-2146893042, ErrorCode::NoCred),         // SEC_E_NO_CREDENTIALS
            (-2146893055, ErrorCode::NoContext),      // SEC_E_INVALID_HANDLE
            (-2146893048, ErrorCode::InvalidToken),   // SEC_E_INVALID_TOKEN
            (-2146893033, ErrorCode::ContextExpired), // SEC_E_CONTEXT_EXPIRED
            (-2146893052, ErrorCode::Failure),        // SEC_E_INTERNAL_ERROR
            (-2146893046, ErrorCode::BadQop),         // SEC_E_QOP_NOT_SUPPORTED
            (-2146893044, ErrorCode::Unauthorized),   // SEC_E_LOGON_DENIED
            (-2146893054, ErrorCode::Unavailable),    // SEC_E_UNSUPPORTED_FUNCTION
        ];
        for (status, code) in table {
            assert_eq!(ErrorCode::from_sspi(status), Some(code), "status {status:#x}");
        }
        // SEC_E_OK and SEC_I_CONTINUE_NEEDED are not errors.
        assert_eq!(ErrorCode::from_sspi(0), None);
        assert_eq!(ErrorCode::from_sspi(0x0009_0312), None);
    }

    #[test]
    fn provider_codes_drive_disposition() {
        let provider = |code| Error::Provider { code, message: String::new() };
        assert_eq!(provider(ErrorCode::CredentialsExpired).disposition(), Disposition::TryOtherMechanism);
        assert_eq!(provider(ErrorCode::InvalidCredential).disposition(), Disposition::TryOtherMechanism);
        assert_eq!(provider(ErrorCode::DuplicateElement).disposition(), Disposition::AbandonPeer);
        assert_eq!(provider(ErrorCode::NameNotMn).code(), ErrorCode::NameNotMn);
    }

    #[test]
    fn der_failures_are_malformed_tokens() {
        let err = Error::from(der::Error::from(der::ErrorKind::Failed));
        assert!(matches!(err, Error::MalformedToken(_)));
        assert_eq!(err.code(), ErrorCode::InvalidToken);
    }
}
