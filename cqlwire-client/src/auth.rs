//! SASL-style authenticators used during the handshake.

use crate::error::ClientError;
use std::fmt;

/// Authenticator classes a [`PasswordAuthenticator`] accepts by default.
pub const DEFAULT_APPROVED_AUTHENTICATORS: &[&str] = &[
    "org.apache.cassandra.auth.PasswordAuthenticator",
    "com.instaclustr.cassandra.auth.SharedSecretAuthenticator",
    "com.datastax.bdp.cassandra.auth.DseAuthenticator",
    "io.aiven.cassandra.auth.AivenAuthenticator",
    "com.ericsson.bss.cassandra.ecaudit.auth.AuditPasswordAuthenticator",
    "com.amazon.helenus.auth.HelenusAuthenticator",
    "com.ericsson.bss.cassandra.ecaudit.auth.AuditAuthenticator",
    "com.scylladb.auth.SaslauthdAuthenticator",
    "com.scylladb.auth.TransitionalAuthenticator",
    "com.instaclustr.cassandra.auth.InstaclustrPasswordAuthenticator",
];

/// Reply to an authentication challenge.
pub struct Challenge {
    /// Token to send in AUTH_RESPONSE.
    pub response: Vec<u8>,
    /// Handler for the next AUTH_CHALLENGE, if the exchange continues.
    pub next: Option<Box<dyn Authenticator>>,
}

/// Answers server authentication challenges.
///
/// The first call to [`Authenticator::challenge`] receives the server's
/// authenticator class name; later calls receive AUTH_CHALLENGE tokens.
pub trait Authenticator: Send + Sync + fmt::Debug {
    fn challenge(&self, challenge: &[u8]) -> Result<Challenge, ClientError>;

    /// Called with the final token from AUTH_SUCCESS.
    fn success(&self, _data: Option<&[u8]>) -> Result<(), ClientError> {
        Ok(())
    }
}

/// Username/password authentication (`\0user\0password`).
#[derive(Clone)]
pub struct PasswordAuthenticator {
    username: String,
    password: String,
    approved: Vec<String>,
}

impl PasswordAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            approved: Vec::new(),
        }
    }

    /// Restricts the accepted server authenticator classes. An empty list means the defaults.
    pub fn with_approved_authenticators(mut self, approved: Vec<String>) -> Self {
        self.approved = approved;
        self
    }

    fn approves(&self, class: &str) -> bool {
        if self.approved.is_empty() {
            DEFAULT_APPROVED_AUTHENTICATORS.contains(&class)
        } else {
            self.approved.iter().any(|a| a == class)
        }
    }
}

impl fmt::Debug for PasswordAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordAuthenticator")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("approved", &self.approved)
            .finish()
    }
}

impl Authenticator for PasswordAuthenticator {
    fn challenge(&self, challenge: &[u8]) -> Result<Challenge, ClientError> {
        let class = String::from_utf8_lossy(challenge);
        if !self.approves(&class) {
            return Err(ClientError::Auth(format!(
                "unexpected authenticator {class:?}"
            )));
        }

        let mut response = Vec::with_capacity(2 + self.username.len() + self.password.len());
        response.push(0);
        response.extend_from_slice(self.username.as_bytes());
        response.push(0);
        response.extend_from_slice(self.password.as_bytes());
        Ok(Challenge {
            response,
            next: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_token_layout() {
        let auth = PasswordAuthenticator::new("cassandra", "secret");
        let reply = auth
            .challenge(b"org.apache.cassandra.auth.PasswordAuthenticator")
            .unwrap();
        assert_eq!(reply.response, b"\0cassandra\0secret");
        assert!(reply.next.is_none());
    }

    #[test]
    fn test_unapproved_class_rejected() {
        let auth = PasswordAuthenticator::new("u", "p");
        let err = auth.challenge(b"com.example.KerberosAuthenticator").err().unwrap();
        assert!(matches!(err, ClientError::Auth(_)));
        assert!(err.to_string().contains("KerberosAuthenticator"));
    }

    #[test]
    fn test_custom_allow_list() {
        let auth = PasswordAuthenticator::new("u", "p")
            .with_approved_authenticators(vec!["com.example.Custom".to_string()]);
        assert!(auth.challenge(b"com.example.Custom").is_ok());
        assert!(auth
            .challenge(b"org.apache.cassandra.auth.PasswordAuthenticator")
            .is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let auth = PasswordAuthenticator::new("admin", "hunter2");
        let rendered = format!("{auth:?}");
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }
}
