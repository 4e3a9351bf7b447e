#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_forms() {
        let cred = NtlmCredential::from_principal("CORP\\alice", "pw");
        assert_eq!((cred.username.as_str(), cred.domain.as_str()), ("alice", "CORP"));
        let cred = NtlmCredential::from_principal("alice@corp.example", "pw");
        assert_eq!((cred.username.as_str(), cred.domain.as_str()), ("alice@corp.example", ""));
        assert!(!format!("{cred:?}").contains("nt_hash"));
    }

    #[test]
    fn store_lookup_is_case_insensitive_with_wildcard_domain() {
        let store = InMemoryUserStore::new()
            .with_password("Alice", "CORP", "one")
            .with_password("bob", "", "two");
        assert_eq!(store.nt_hash("ALICE", "corp"), Some(nt_hash("one")));
        assert_eq!(store.nt_hash("alice", "OTHER"), None);
        assert_eq!(store.nt_hash("Bob", "anything"), Some(nt_hash("two")));
    }
}
