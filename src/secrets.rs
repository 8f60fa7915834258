//! Types for working with registry access secrets

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};

/// A method for authenticating to a registry
#[derive(Clone, Default, PartialEq, Eq)]
pub enum RegistryAuth {
    /// Access the registry anonymously. Bearer challenges are still answered
    /// with an anonymous token request.
    #[default]
    Anonymous,

    /// Access the registry with a username and password, sent as HTTP Basic
    /// credentials to the registry or to its token endpoint
    Basic(String, String),
}

impl RegistryAuth {
    /// Shorthand for [`RegistryAuth::Basic`]
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        RegistryAuth::Basic(username.into(), password.into())
    }

    /// The configured username, if any
    pub fn username(&self) -> Option<&str> {
        match self {
            RegistryAuth::Anonymous => None,
            RegistryAuth::Basic(username, _) => Some(username),
        }
    }

    /// `Basic <base64(username:password)>`, if credentials are configured
    pub(crate) fn basic_authorization(&self) -> Option<String> {
        match self {
            RegistryAuth::Anonymous => None,
            RegistryAuth::Basic(username, password) => Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", username, password))
            )),
        }
    }
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryAuth::Anonymous => write!(f, "Anonymous"),
            RegistryAuth::Basic(username, _) => f
                .debug_tuple("Basic")
                .field(username)
                .field(&"<redacted>")
                .finish(),
        }
    }
}

pub(crate) trait Authenticable {
    fn apply_authentication(self, auth: &RegistryAuth) -> Self;
}

impl Authenticable for reqwest::RequestBuilder {
    fn apply_authentication(self, auth: &RegistryAuth) -> Self {
        match auth {
            RegistryAuth::Anonymous => self,
            RegistryAuth::Basic(username, password) => self.basic_auth(username, Some(password)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_authorization_header() {
        let auth = RegistryAuth::basic("testuser", "testpassword");
        assert_eq!(
            auth.basic_authorization().unwrap(),
            "Basic dGVzdHVzZXI6dGVzdHBhc3N3b3Jk"
        );
        assert_eq!(auth.username(), Some("testuser"));
        assert!(RegistryAuth::Anonymous.basic_authorization().is_none());
    }

    #[test]
    fn debug_redacts_password() {
        let auth = RegistryAuth::basic("testuser", "hunter2");
        let printed = format!("{:?}", auth);
        assert!(printed.contains("testuser"));
        assert!(!printed.contains("hunter2"));
    }
}
