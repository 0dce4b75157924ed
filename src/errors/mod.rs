//! Error types for campaign delivery.
//!
//! Every failure in the crate is a [`MailerError`]. The [`MailerErrorKind`]
//! carries the precise cause and maps onto the coarse [`ErrorCategory`]
//! taxonomy used in campaign reports: validation, template, resolution and
//! transport failures (plus configuration errors raised before a campaign).

use std::fmt;
use thiserror::Error;

/// Result type for mailer operations.
pub type MailerResult<T> = Result<T, MailerError>;

/// Coarse error taxonomy reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed campaign or recipient input.
    Validation,
    /// Template could not be rendered.
    Template,
    /// Recipient domain could not be routed.
    Resolution,
    /// Session establishment or message submission failed.
    Transport,
    /// Mailer configuration is invalid.
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "ValidationError"),
            ErrorCategory::Template => write!(f, "TemplateError"),
            ErrorCategory::Resolution => write!(f, "ResolutionError"),
            ErrorCategory::Transport => write!(f, "TransportError"),
            ErrorCategory::Configuration => write!(f, "ConfigurationError"),
        }
    }
}

/// Error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailerErrorKind {
    // Validation errors
    /// A required contact column is absent.
    MissingField,
    /// Contact data could not be parsed.
    MalformedContacts,
    /// Subject or body template is empty.
    EmptyTemplate,
    /// Email address is syntactically invalid.
    InvalidAddress,
    /// Header value contains forbidden characters.
    InvalidHeader,
    /// Encoded message exceeds the configured size limit.
    MessageTooLarge,
    /// Template catalog has no such entry.
    UnknownTemplate,

    // Template errors
    /// Template references a variable that was not supplied.
    MissingVariable,
    /// Template has unbalanced or empty braces.
    MalformedTemplate,

    // Resolution errors
    /// Address has no domain part.
    MissingDomain,
    /// Domain advertises no mail exchanger.
    NoMxRecords,
    /// DNS query failed.
    DnsLookupFailed,

    // Transport errors
    /// Connection was refused.
    ConnectionRefused,
    /// Connection was reset or closed by the server.
    ConnectionReset,
    /// Connect timed out.
    ConnectTimeout,
    /// Read timed out.
    ReadTimeout,
    /// Write timed out.
    WriteTimeout,
    /// TLS handshake failed.
    TlsHandshakeFailed,
    /// STARTTLS required but not offered.
    StarttlsNotSupported,
    /// Credentials were rejected.
    CredentialsInvalid,
    /// No usable authentication mechanism.
    AuthMethodNotSupported,
    /// Server requires authentication.
    AuthenticationRequired,
    /// Server sent a malformed reply.
    InvalidResponse,
    /// Server is shutting down (421).
    ServerShutdown,
    /// Server rejected the envelope sender.
    SenderRejected,
    /// Server rejected the recipient.
    RecipientRejected,
    /// Server rejected the message content.
    MessageRejected,
    /// Session was already closed or broken.
    SessionClosed,

    // Configuration
    /// Configuration is invalid.
    ConfigurationInvalid,

    /// Unknown or internal error.
    Unknown,
}

impl MailerErrorKind {
    /// Returns the taxonomy bucket for this kind.
    pub fn category(&self) -> ErrorCategory {
        use MailerErrorKind::*;
        match self {
            MissingField | MalformedContacts | EmptyTemplate | InvalidAddress | InvalidHeader
            | MessageTooLarge | UnknownTemplate => ErrorCategory::Validation,
            MissingVariable | MalformedTemplate => ErrorCategory::Template,
            MissingDomain | NoMxRecords | DnsLookupFailed => ErrorCategory::Resolution,
            ConfigurationInvalid => ErrorCategory::Configuration,
            ConnectionRefused | ConnectionReset | ConnectTimeout | ReadTimeout | WriteTimeout
            | TlsHandshakeFailed | StarttlsNotSupported | CredentialsInvalid
            | AuthMethodNotSupported | AuthenticationRequired | InvalidResponse
            | ServerShutdown | SenderRejected | RecipientRejected | MessageRejected
            | SessionClosed | Unknown => ErrorCategory::Transport,
        }
    }

    /// Returns true if a later attempt could plausibly succeed.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            MailerErrorKind::ConnectionReset
                | MailerErrorKind::ConnectTimeout
                | MailerErrorKind::ReadTimeout
                | MailerErrorKind::WriteTimeout
                | MailerErrorKind::ServerShutdown
                | MailerErrorKind::DnsLookupFailed
        )
    }

    /// Returns true if the session the error occurred on can no longer be used.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            MailerErrorKind::ConnectionReset
                | MailerErrorKind::ReadTimeout
                | MailerErrorKind::WriteTimeout
                | MailerErrorKind::ServerShutdown
                | MailerErrorKind::InvalidResponse
                | MailerErrorKind::SessionClosed
        )
    }
}

impl fmt::Display for MailerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MailerErrorKind::MissingField => "Missing required field",
            MailerErrorKind::MalformedContacts => "Malformed contact data",
            MailerErrorKind::EmptyTemplate => "Empty template",
            MailerErrorKind::InvalidAddress => "Invalid email address",
            MailerErrorKind::InvalidHeader => "Invalid header",
            MailerErrorKind::MessageTooLarge => "Message too large",
            MailerErrorKind::UnknownTemplate => "Unknown template",
            MailerErrorKind::MissingVariable => "Missing template variable",
            MailerErrorKind::MalformedTemplate => "Malformed template",
            MailerErrorKind::MissingDomain => "Missing domain",
            MailerErrorKind::NoMxRecords => "No MX records",
            MailerErrorKind::DnsLookupFailed => "DNS lookup failed",
            MailerErrorKind::ConnectionRefused => "Connection refused",
            MailerErrorKind::ConnectionReset => "Connection reset",
            MailerErrorKind::ConnectTimeout => "Connect timeout",
            MailerErrorKind::ReadTimeout => "Read timeout",
            MailerErrorKind::WriteTimeout => "Write timeout",
            MailerErrorKind::TlsHandshakeFailed => "TLS handshake failed",
            MailerErrorKind::StarttlsNotSupported => "STARTTLS not supported",
            MailerErrorKind::CredentialsInvalid => "Invalid credentials",
            MailerErrorKind::AuthMethodNotSupported => "Auth method not supported",
            MailerErrorKind::AuthenticationRequired => "Authentication required",
            MailerErrorKind::InvalidResponse => "Invalid server response",
            MailerErrorKind::ServerShutdown => "Server shutting down",
            MailerErrorKind::SenderRejected => "Sender rejected",
            MailerErrorKind::RecipientRejected => "Recipient rejected",
            MailerErrorKind::MessageRejected => "Message rejected",
            MailerErrorKind::SessionClosed => "Session closed",
            MailerErrorKind::ConfigurationInvalid => "Invalid configuration",
            MailerErrorKind::Unknown => "Unknown error",
        };
        f.write_str(text)
    }
}

/// Enhanced SMTP status code (RFC 2034).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Parses an enhanced status code such as `5.1.1`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !(2..=5).contains(&class) {
            return None;
        }
        Some(Self { class, subject, detail })
    }

    /// Returns true if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// SMTP dialog phase a reply was received in.
///
/// The same reply code means different things depending on the command it
/// answers, so reply-to-error conversion is phase aware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpPhase {
    /// Server greeting.
    Greeting,
    /// EHLO/HELO or STARTTLS.
    Handshake,
    /// AUTH exchange.
    Auth,
    /// MAIL FROM.
    Sender,
    /// RCPT TO.
    Recipient,
    /// DATA command or end of data.
    Data,
}

/// Mailer error with detailed information.
#[derive(Error, Debug)]
pub struct MailerError {
    kind: MailerErrorKind,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    missing_key: Option<String>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl MailerError {
    /// Creates a new error.
    pub fn new(kind: MailerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            missing_key: None,
            cause: None,
        }
    }

    /// Sets the SMTP reply code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> MailerErrorKind {
        self.kind
    }

    /// Returns the taxonomy bucket.
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP reply code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns the template key that was not supplied, for `MissingVariable`.
    pub fn missing_key(&self) -> Option<&str> {
        self.missing_key.as_deref()
    }

    /// Returns true if a later attempt could plausibly succeed.
    pub fn is_temporary(&self) -> bool {
        match self.smtp_code {
            Some(code) => (400..500).contains(&code),
            None => self.kind.is_temporary(),
        }
    }

    // Convenience constructors

    /// Creates a validation error.
    pub fn validation(kind: MailerErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates the error raised when a contact column is absent.
    pub fn missing_field(field: &str) -> Self {
        Self::new(
            MailerErrorKind::MissingField,
            format!("missing required field: {}", field),
        )
    }

    /// Creates an invalid address error.
    pub fn invalid_address(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::InvalidAddress, message)
    }

    /// Creates a missing template variable error.
    pub fn missing_variable(key: impl Into<String>) -> Self {
        let key = key.into();
        let mut err = Self::new(
            MailerErrorKind::MissingVariable,
            format!("template references unknown variable {{{}}}", key),
        );
        err.missing_key = Some(key);
        err
    }

    /// Creates a malformed template error.
    pub fn malformed_template(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::MalformedTemplate, message)
    }

    /// Creates a resolution error.
    pub fn resolution(kind: MailerErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::ConnectionRefused, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::CredentialsInvalid, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::InvalidResponse, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::ConfigurationInvalid, message)
    }

    /// Creates an error from a negative SMTP reply received in `phase`.
    pub fn from_smtp_reply(phase: SmtpPhase, code: u16, message: impl Into<String>) -> Self {
        let kind = match (phase, code) {
            (_, 421) => MailerErrorKind::ServerShutdown,
            (_, 530) => MailerErrorKind::AuthenticationRequired,
            (SmtpPhase::Auth, 504) => MailerErrorKind::AuthMethodNotSupported,
            (SmtpPhase::Auth, 454 | 534 | 535) => MailerErrorKind::CredentialsInvalid,
            (SmtpPhase::Auth, _) => MailerErrorKind::CredentialsInvalid,
            (SmtpPhase::Sender, _) => MailerErrorKind::SenderRejected,
            (SmtpPhase::Recipient, _) => MailerErrorKind::RecipientRejected,
            (SmtpPhase::Data, 552) => MailerErrorKind::MessageTooLarge,
            (SmtpPhase::Data, _) => MailerErrorKind::MessageRejected,
            (SmtpPhase::Greeting | SmtpPhase::Handshake, 554) => MailerErrorKind::ConnectionRefused,
            (SmtpPhase::Greeting | SmtpPhase::Handshake, _) => MailerErrorKind::InvalidResponse,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for MailerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}
