//! SMTP wire model.
//!
//! Client commands and server replies of an RFC 5321 submission dialog,
//! plus the ESMTP capabilities this crate cares about.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{EnhancedStatusCode, MailerError, MailerResult, SmtpPhase};

/// Client commands.
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Begin a SASL exchange.
    Auth {
        /// Mechanism being used.
        method: AuthMethod,
        /// Base64 initial response.
        initial_response: Option<String>,
    },
    /// Continuation line within a SASL exchange (base64).
    AuthResponse(String),
    /// MAIL FROM with optional SIZE.
    MailFrom {
        /// Sender mailbox, already in `<addr>` form.
        address: String,
        /// Message size when the server advertises SIZE.
        size: Option<usize>,
    },
    /// RCPT TO.
    RcptTo(String),
    /// DATA.
    Data,
    /// Reset transaction.
    Rset,
    /// Quit connection.
    Quit,
}

impl Command {
    /// Formats the command as sent on the wire, without CRLF.
    pub fn to_wire(&self) -> String {
        match self {
            Command::Ehlo(domain) => format!("EHLO {}", domain),
            Command::Helo(domain) => format!("HELO {}", domain),
            Command::StartTls => "STARTTLS".to_string(),
            Command::Auth {
                method,
                initial_response: Some(response),
            } => format!("AUTH {} {}", method.mechanism_name(), response),
            Command::Auth {
                method,
                initial_response: None,
            } => format!("AUTH {}", method.mechanism_name()),
            Command::AuthResponse(line) => line.clone(),
            Command::MailFrom { address, size } => match size {
                Some(size) => format!("MAIL FROM:{} SIZE={}", address, size),
                None => format!("MAIL FROM:{}", address),
            },
            Command::RcptTo(address) => format!("RCPT TO:{}", address),
            Command::Data => "DATA".to_string(),
            Command::Rset => "RSET".to_string(),
            Command::Quit => "QUIT".to_string(),
        }
    }
}

// Display and Debug never show SASL payloads.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Auth { method, .. } => write!(f, "AUTH {} [REDACTED]", method),
            Command::AuthResponse(_) => write!(f, "[REDACTED]"),
            other => f.write_str(&other.to_wire()),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({})", self)
    }
}

/// Server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code from the first line, if present.
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Text of each reply line.
    pub lines: Vec<String>,
}

impl Reply {
    /// Creates a single-line reply.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            lines: vec![message.into()],
        }
    }

    /// Parses a reply from the raw lines read off the wire.
    pub fn parse(raw: &[String]) -> MailerResult<Self> {
        if raw.is_empty() {
            return Err(MailerError::protocol("Empty response"));
        }

        let mut lines = Vec::with_capacity(raw.len());
        let mut code = 0u16;
        let mut enhanced_code = None;

        for (i, line) in raw.iter().enumerate() {
            let parsed = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .filter(|c| (200..600).contains(c))
                .ok_or_else(|| MailerError::protocol(format!("Invalid reply line: {:?}", line)))?;

            if i == 0 {
                code = parsed;
            } else if parsed != code {
                return Err(MailerError::protocol(
                    "Inconsistent status codes in multiline response",
                ));
            }

            let text = line.get(4..).unwrap_or("");
            if i == 0 {
                if let Some((esc, rest)) = Self::split_enhanced_code(text) {
                    enhanced_code = Some(esc);
                    lines.push(rest.trim().to_string());
                    continue;
                }
            }
            lines.push(text.to_string());
        }

        Ok(Self {
            code,
            enhanced_code,
            lines,
        })
    }

    fn split_enhanced_code(text: &str) -> Option<(EnhancedStatusCode, &str)> {
        let (head, rest) = text.split_once(' ').unwrap_or((text, ""));
        EnhancedStatusCode::parse(head).map(|code| (code, rest))
    }

    /// Returns true for 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true for 3xx.
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Returns true for 4xx.
    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// Returns the first line of text.
    pub fn first_line(&self) -> &str {
        self.lines.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all lines joined with spaces.
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    /// Converts a negative reply received in `phase` into an error.
    pub fn to_error(&self, phase: SmtpPhase) -> MailerError {
        let err = MailerError::from_smtp_reply(phase, self.code, self.text());
        match &self.enhanced_code {
            Some(enhanced) => err.with_enhanced_code(enhanced.clone()),
            None => err,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_line())
    }
}

/// ESMTP capabilities advertised in an EHLO reply.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Maximum message size the server accepts.
    pub size: Option<usize>,
    /// Advertised authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS offered.
    pub starttls: bool,
    /// 8BITMIME offered.
    pub eight_bit_mime: bool,
    /// Keywords as received, uppercased.
    pub raw: Vec<String>,
}

impl Capabilities {
    /// Parses capabilities from an EHLO reply.
    ///
    /// The first line is the server's greeting text and never a keyword.
    pub fn from_ehlo_reply(reply: &Reply) -> Self {
        let mut caps = Self::default();

        for line in reply.lines.iter().skip(1) {
            let line = line.trim().to_uppercase();
            let (keyword, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            match keyword {
                "SIZE" => caps.size = params.trim().parse().ok().filter(|s| *s > 0),
                "AUTH" => {
                    caps.auth_mechanisms
                        .extend(params.split_whitespace().filter_map(AuthMethod::from_capability));
                }
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                _ => {}
            }
            caps.raw.push(line);
        }

        caps
    }

    /// Returns true if authentication is offered.
    pub fn has_auth(&self) -> bool {
        !self.auth_mechanisms.is_empty()
    }

    /// Returns the advertised mechanisms as a list.
    pub fn auth_methods(&self) -> Vec<AuthMethod> {
        self.auth_mechanisms.iter().copied().collect()
    }
}

/// Session dialog state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Greeting received.
    Connected,
    /// EHLO/HELO accepted.
    Greeted,
    /// Authenticated, or no authentication needed.
    Ready,
    /// Inside a mail transaction.
    InTransaction,
    /// Connection broken or closed; no further commands.
    Closed,
}

impl SessionState {
    /// Returns true if a new mail transaction may start.
    pub fn can_start_mail(&self) -> bool {
        matches!(self, SessionState::Ready)
    }
}

/// Reply codes used by the client dialog.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// User not local, will forward.
    pub const WILL_FORWARD: u16 = 251;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Service unavailable.
    pub const SERVICE_UNAVAILABLE: u16 = 421;
    /// Command not implemented.
    pub const NOT_IMPLEMENTED: u16 = 502;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_formatting() {
        assert_eq!(Command::Ehlo("localhost".into()).to_wire(), "EHLO localhost");
        assert_eq!(Command::StartTls.to_wire(), "STARTTLS");
        assert_eq!(
            Command::MailFrom {
                address: "<test@example.com>".into(),
                size: Some(1024),
            }
            .to_wire(),
            "MAIL FROM:<test@example.com> SIZE=1024"
        );
        assert_eq!(
            Command::RcptTo("<bob@example.com>".into()).to_wire(),
            "RCPT TO:<bob@example.com>"
        );
    }

    #[test]
    fn test_auth_command_redacted() {
        let cmd = Command::Auth {
            method: AuthMethod::Plain,
            initial_response: Some("AHVzZXIAcGFzcw==".into()),
        };
        assert_eq!(cmd.to_wire(), "AUTH PLAIN AHVzZXIAcGFzcw==");
        assert!(!cmd.to_string().contains("AHVzZXIAcGFzcw=="));
        assert!(!format!("{:?}", Command::AuthResponse("c2VjcmV0".into())).contains("c2VjcmV0"));
    }

    #[test]
    fn test_reply_parse() {
        let reply = Reply::parse(&["250 OK".to_string()]).unwrap();
        assert_eq!(reply.code, 250);
        assert!(reply.is_success());
        assert_eq!(reply.first_line(), "OK");

        let raw = vec![
            "250-smtp.example.com Hello".to_string(),
            "250-SIZE 10485760".to_string(),
            "250 STARTTLS".to_string(),
        ];
        let reply = Reply::parse(&raw).unwrap();
        assert_eq!(reply.lines.len(), 3);

        assert!(Reply::parse(&["abc".to_string()]).is_err());
        assert!(Reply::parse(&["250-a".to_string(), "251 b".to_string()]).is_err());
    }

    #[test]
    fn test_reply_with_enhanced_code() {
        let reply = Reply::parse(&["550 5.1.1 User unknown".to_string()]).unwrap();
        let esc = reply.enhanced_code.clone().unwrap();
        assert_eq!(esc.to_string(), "5.1.1");
        assert_eq!(reply.first_line(), "User unknown");

        let err = reply.to_error(SmtpPhase::Recipient);
        assert_eq!(err.kind(), crate::errors::MailerErrorKind::RecipientRejected);
        assert_eq!(err.enhanced_code(), Some(&esc));
    }

    #[test]
    fn test_capabilities_skip_greeting_line() {
        let reply = Reply {
            code: 250,
            enhanced_code: None,
            lines: vec![
                "smtp.example.com STARTTLS hello".to_string(),
                "SIZE 35882577".to_string(),
                "AUTH LOGIN PLAIN XOAUTH2".to_string(),
                "8BITMIME".to_string(),
            ],
        };

        let caps = Capabilities::from_ehlo_reply(&reply);
        assert_eq!(caps.size, Some(35882577));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Plain));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Login));
        assert_eq!(caps.auth_mechanisms.len(), 2);
        assert!(!caps.starttls);
        assert!(caps.eight_bit_mime);
    }
}
