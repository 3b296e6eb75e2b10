//! Mail address parsing
//!
//! Addresses have the form `user[-folder][@domain]`. The folder is the part
//! of the local part after the first `-`; the domain is everything after the
//! first `@`. Parsing is lenient: `user`, `user@`, `user-folder` and
//! `user-folder@domain` are all accepted.

use std::fmt;

/// A parsed mail address with owned components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    user: String,
    folder: Option<String>,
    domain: Option<String>,
}

impl Address {
    /// Parse an address string. Never fails; absent components come back
    /// empty.
    pub fn parse(input: &str) -> Self {
        let (local, domain) = match input.find('@') {
            Some(i) => (&input[..i], &input[i + 1..]),
            None => (input, ""),
        };
        let (user, folder) = match local.find('-') {
            Some(i) => (&local[..i], &local[i + 1..]),
            None => (local, ""),
        };
        Self {
            user: user.to_string(),
            folder: (!folder.is_empty()).then(|| folder.to_string()),
            domain: (!domain.is_empty()).then(|| domain.to_string()),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn folder(&self) -> &str {
        self.folder.as_deref().unwrap_or("")
    }

    pub fn domain(&self) -> &str {
        self.domain.as_deref().unwrap_or("")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user)?;
        if let Some(folder) = &self.folder {
            write!(f, "-{}", folder)?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "@{}", domain)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_full() {
        let addr = Address::parse("alice-inbox@example.com");
        assert_eq!(addr.user(), "alice");
        assert_eq!(addr.folder(), "inbox");
        assert_eq!(addr.domain(), "example.com");
    }

    #[test]
    fn test_parse_user_only() {
        let addr = Address::parse("alice");
        assert_eq!(addr.user(), "alice");
        assert_eq!(addr.folder(), "");
        assert_eq!(addr.domain(), "");
    }

    #[test]
    fn test_parse_empty_domain() {
        let addr = Address::parse("alice@");
        assert_eq!(addr.user(), "alice");
        assert_eq!(addr.domain(), "");
        assert_eq!(addr.to_string(), "alice");
    }

    #[test]
    fn test_parse_folder_no_domain() {
        let addr = Address::parse("alice-lists");
        assert_eq!(addr.user(), "alice");
        assert_eq!(addr.folder(), "lists");
        assert_eq!(addr.to_string(), "alice-lists");
    }

    #[test]
    fn test_folder_keeps_later_dashes() {
        let addr = Address::parse("bob-my-folder@example.com");
        assert_eq!(addr.user(), "bob");
        assert_eq!(addr.folder(), "my-folder");
    }

    #[test]
    fn test_display_round_trip() {
        for input in ["alice", "alice@example.com", "alice-f@d", "a-b-c@d.e"] {
            let addr = Address::parse(input);
            assert_eq!(addr.to_string(), input);
        }
    }

    proptest! {
        /// Re-parsing the canonical form is a fixed point for any input.
        #[test]
        fn prop_parse_canonical_fixed_point(input in "\\PC{0,40}") {
            let parsed = Address::parse(&input);
            let reparsed = Address::parse(&parsed.to_string());
            prop_assert_eq!(parsed, reparsed);
        }
    }
}
