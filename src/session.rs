//! Account credentials for the catalog API and pubsub service.
//!
//! A session is read from a small TOML secrets file:
//!
//! ```toml
//! user_key = "s1234"
//! authorization_key = "..."
//!
//! [cookies]
//! r = "..."
//! ```
//!
//! The `user_key` scopes pubsub channel names, the `authorization_key` is
//! sent with every catalog call and the cookies authenticate the HTTP
//! session. Everything but the user key is redacted from debug output.

use std::{collections::BTreeMap, fs, path::Path};

use serde::Deserialize;
use veil::Redact;

use crate::error::{Error, Result};

/// Credentials of the account this player runs for.
#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
pub struct Session {
    /// Key of the user, such as `s1234`.
    pub user_key: String,

    /// Authorization key sent as `_authorization_key` with catalog calls.
    #[redact]
    pub authorization_key: String,

    /// Cookies of an authenticated web session.
    #[serde(default)]
    #[redact]
    pub cookies: BTreeMap<String, String>,
}

impl Session {
    /// Secrets files larger than this are refused.
    const MAX_FILE_SIZE: u64 = 4096;

    /// Loads a session from a TOML secrets file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is larger than 4 KiB or
    /// does not hold a `user_key` and `authorization_key`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: secrets file should be small.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        contents.parse()
    }

    /// Cookies formatted as a `Cookie` request header value.
    #[must_use]
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl std::str::FromStr for Session {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let session: Self = toml::from_str(s)?;
        if session.user_key.is_empty() || session.authorization_key.is_empty() {
            return Err(Error::invalid_argument(
                "secrets should hold a non-empty user_key and authorization_key",
            ));
        }

        Ok(session)
    }
}

/// Generates a player id that is unique among the players of an account
/// with high probability.
#[must_use]
pub fn player_id() -> String {
    format!("_{}_{:06}", env!("CARGO_PKG_NAME"), fastrand::u32(0..1_000_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRETS: &str = r#"
        user_key = "s1234"
        authorization_key = "a-very-secret-key"

        [cookies]
        r = "abc"
        session = "def"
    "#;

    #[test]
    fn parses_secrets() {
        let session: Session = SECRETS.parse().unwrap();
        assert_eq!(session.user_key, "s1234");
        assert_eq!(session.cookie_header(), "r=abc; session=def");
    }

    #[test]
    fn redacts_secrets() {
        let session: Session = SECRETS.parse().unwrap();
        let debug = format!("{session:?}");
        assert!(debug.contains("s1234"));
        assert!(!debug.contains("a-very-secret-key"));
    }

    #[test]
    fn requires_keys() {
        assert!("user_key = \"s1\"".parse::<Session>().is_err());
        assert!("user_key = \"\"\nauthorization_key = \"x\"".parse::<Session>().is_err());
    }

    #[test]
    fn player_ids_have_fixed_shape() {
        let id = player_id();
        let (prefix, digits) = id.rsplit_once('_').unwrap();
        assert_eq!(prefix, "_remoteslave");
        assert_eq!(digits.len(), 6);
        assert!(digits.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn refuses_large_files() {
        let path = std::env::temp_dir().join(format!("remoteslave-{}.toml", fastrand::u64(..)));
        fs::write(&path, "#".repeat(5000)).unwrap();
        let result = Session::from_file(&path);
        fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }
}
