//! Client Credentials
//!
//! Reads `user=` and `password=` from a MySQL option file such as `~/.my.cnf`.

use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

/// Database login shared by every node in a run
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Load credentials from an option file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Credential(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content).map_err(|e| match e {
            Error::Credential(reason) => {
                Error::Credential(format!("{} in {}", reason, path.display()))
            }
            other => other,
        })
    }

    /// Parse option file content. Later assignments win, as with the mysql client.
    pub fn parse(content: &str) -> Result<Self> {
        let mut user = String::new();
        let mut password = String::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with(';')
                || line.starts_with('[')
            {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = unquote(value.trim());
            match key.trim() {
                "user" => user = value.to_string(),
                "password" => password = value.to_string(),
                _ => {}
            }
        }

        if user.is_empty() || password.is_empty() {
            return Err(Error::Credential("user and password not found".into()));
        }

        Ok(Self { user, password })
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_my_cnf() {
        let creds = Credentials::parse(
            "[client]\n# admin login\nuser = repl_admin\npassword=\"s3cr3t=1\"\nhost=db1\n",
        )
        .unwrap();
        assert_eq!(creds.user, "repl_admin");
        assert_eq!(creds.password, "s3cr3t=1");
    }

    #[test]
    fn test_missing_password_fails() {
        let err = Credentials::parse("[client]\nuser=root\n").unwrap_err();
        assert!(matches!(err, Error::Credential(_)));

        let err = Credentials::parse("user=root\npassword=\n").unwrap_err();
        assert!(matches!(err, Error::Credential(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client]\nuser=root\npassword=hunter2").unwrap();

        let creds = Credentials::from_file(file.path()).unwrap();
        assert_eq!(creds.user, "root");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Credentials::from_file(&dir.path().join("missing.cnf")).unwrap_err();
        assert!(matches!(err, Error::Credential(_)));
    }
}
