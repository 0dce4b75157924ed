//! Relay authentication.
//!
//! The sender authenticates to a fixed relay with a username and password
//! using one of:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but still what most submission relays offer)
//! - CRAM-MD5 (RFC 2195)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{MailerError, MailerErrorKind, MailerResult};

/// Authentication mechanisms the session can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication.
    Login,
    /// CRAM-MD5 challenge-response.
    CramMd5,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
        }
    }

    /// Returns the priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::CramMd5 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses a mechanism token from the EHLO `AUTH` capability.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "CRAM-MD5" => Some(AuthMethod::CramMd5),
            _ => None,
        }
    }

    /// Returns true if the mechanism sends the password in the clear.
    pub fn requires_tls(&self) -> bool {
        matches!(self, AuthMethod::Plain | AuthMethod::Login)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mechanism_name())
    }
}

/// Relay login credentials.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates username/password credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the protected password.
    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Builds the client side of each SASL exchange.
pub struct Authenticator;

impl Authenticator {
    /// Generates the initial response for PLAIN authentication.
    pub fn plain_initial_response(credentials: &Credentials) -> String {
        // \0username\0password
        let response = format!(
            "\0{}\0{}",
            credentials.username(),
            credentials.password().expose_secret()
        );
        BASE64.encode(response)
    }

    /// Generates the LOGIN username line.
    pub fn login_username(credentials: &Credentials) -> String {
        BASE64.encode(credentials.username())
    }

    /// Generates the LOGIN password line.
    pub fn login_password(credentials: &Credentials) -> String {
        BASE64.encode(credentials.password().expose_secret())
    }

    /// Answers a base64 CRAM-MD5 challenge.
    pub fn cram_md5_response(challenge: &str, credentials: &Credentials) -> MailerResult<String> {
        let challenge_bytes = BASE64.decode(challenge.trim()).map_err(|e| {
            MailerError::protocol(format!("Invalid CRAM-MD5 challenge: {}", e)).with_cause(e)
        })?;

        type HmacMd5 = Hmac<Md5>;
        let mut mac = HmacMd5::new_from_slice(credentials.password().expose_secret().as_bytes())
            .map_err(|e| MailerError::authentication(format!("HMAC error: {}", e)))?;
        mac.update(&challenge_bytes);
        let digest = mac.finalize().into_bytes();

        let hex_digest: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        let response = format!("{} {}", credentials.username(), hex_digest);
        Ok(BASE64.encode(response))
    }

    /// Picks the mechanism to use from those the server advertises.
    ///
    /// A configured `preferred` mechanism wins when the server offers it.
    /// Cleartext mechanisms are only chosen over TLS.
    pub fn select_method(
        available: &[AuthMethod],
        preferred: Option<AuthMethod>,
        tls_enabled: bool,
    ) -> MailerResult<AuthMethod> {
        let usable = |m: &AuthMethod| !m.requires_tls() || tls_enabled;

        if let Some(method) = preferred {
            if available.contains(&method) && usable(&method) {
                return Ok(method);
            }
        }

        available
            .iter()
            .filter(|m| usable(m))
            .max_by_key(|m| m.priority())
            .copied()
            .ok_or_else(|| {
                MailerError::new(
                    MailerErrorKind::AuthMethodNotSupported,
                    "No compatible authentication method available",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_method_from_capability() {
        assert_eq!(AuthMethod::from_capability("PLAIN"), Some(AuthMethod::Plain));
        assert_eq!(AuthMethod::from_capability("login"), Some(AuthMethod::Login));
        assert_eq!(AuthMethod::from_capability("CRAM-MD5"), Some(AuthMethod::CramMd5));
        assert_eq!(AuthMethod::from_capability("XOAUTH2"), None);
    }

    #[test]
    fn test_plain_initial_response() {
        let creds = Credentials::new("user", "password");
        let response = Authenticator::plain_initial_response(&creds);
        let decoded = BASE64.decode(&response).unwrap();
        assert_eq!(decoded, b"\0user\0password");
    }

    #[test]
    fn test_login_lines() {
        let creds = Credentials::new("sender@gmail.com", "app-password");
        assert_eq!(
            BASE64.decode(Authenticator::login_username(&creds)).unwrap(),
            b"sender@gmail.com"
        );
        assert_eq!(
            BASE64.decode(Authenticator::login_password(&creds)).unwrap(),
            b"app-password"
        );
    }

    #[test]
    fn test_cram_md5_response() {
        // RFC 2195 example exchange
        let creds = Credentials::new("tim", "tanstaaftanstaaf");
        let challenge = BASE64.encode("<1896.697170952@postoffice.reston.mci.net>");
        let response = Authenticator::cram_md5_response(&challenge, &creds).unwrap();
        let decoded = String::from_utf8(BASE64.decode(response).unwrap()).unwrap();
        assert_eq!(decoded, "tim b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn test_cram_md5_rejects_bad_challenge() {
        let creds = Credentials::new("tim", "secret");
        assert!(Authenticator::cram_md5_response("not base64!", &creds).is_err());
    }

    #[test]
    fn test_select_method() {
        let available = vec![AuthMethod::Plain, AuthMethod::Login, AuthMethod::CramMd5];

        let method = Authenticator::select_method(&available, None, true).unwrap();
        assert_eq!(method, AuthMethod::CramMd5);

        let method =
            Authenticator::select_method(&available, Some(AuthMethod::Login), true).unwrap();
        assert_eq!(method, AuthMethod::Login);

        // Preference ignored without TLS
        let method =
            Authenticator::select_method(&available, Some(AuthMethod::Login), false).unwrap();
        assert_eq!(method, AuthMethod::CramMd5);

        let err = Authenticator::select_method(&[AuthMethod::Plain], None, false).unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::AuthMethodNotSupported);
    }

    #[test]
    fn test_credentials_debug() {
        let creds = Credentials::new("user", "secret_password");
        let debug_str = format!("{:?}", creds);
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("secret_password"));
    }
}
